//! Subscriber initialization runs in its own test binary: it installs the
//! global default dispatcher.

use tracing::Level;
use waveguide_daq::config::Settings;
use waveguide_daq::logging::{self, OutputFormat, TracingConfig};

#[test]
fn test_init_is_idempotent() {
    let config = TracingConfig::new(Level::INFO)
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config).is_ok());
    assert!(logging::init_from_settings(&Settings::default()).is_ok());
}
