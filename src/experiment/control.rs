//! Pause/resume/stop signaling between the control surface and the worker.
//!
//! Two independent signals travel over one `tokio::sync::watch` channel:
//!
//! - a resumable **gate** (default open). `pause()` closes it; the worker
//!   blocks at its next [`ExecutionControl::checkpoint`] until `resume()`
//!   reopens it.
//! - a one-way **stop** flag (default unset). Once set it stays set for the
//!   life of the run and releases a worker blocked at a closed gate.
//!
//! All control methods are non-blocking and safe to call from any task. The
//! lifecycle state is published on a second watch channel:
//!
//! ```text
//! ┌──────┐ mark_running ┌─────────┐  pause()  ┌────────┐
//! │ Idle │─────────────▶│ Running │──────────▶│ Paused │
//! └──────┘              └────┬────┘◀──────────└───┬────┘
//!                            │       resume()     │
//!                 request_stop()          request_stop()
//!                            ▼                    │
//!                      ┌──────────┐◀──────────────┘
//!                      │ Stopping │
//!                      └────┬─────┘
//!                           │ mark_finished (also from Running)
//!                           ▼
//!                      ┌──────────┐
//!                      │ Finished │
//!                      └──────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{AppResult, DaqError};

/// Lifecycle of one run as seen by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Created, worker not started
    Idle,
    /// Worker executing
    Running,
    /// Gate closed; worker blocks at its next checkpoint
    Paused,
    /// Stop requested; worker unwinding
    Stopping,
    /// Worker done
    Finished,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Paused => write!(f, "paused"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Finished => write!(f, "finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gate {
    open: bool,
    stop: bool,
}

struct Inner {
    gate: watch::Sender<Gate>,
    state: watch::Sender<RunState>,
}

/// Shared pause gate and stop flag for one run.
///
/// Cloning yields another handle on the same signals.
#[derive(Clone)]
pub struct ExecutionControl {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionControl")
            .field("gate", &*self.inner.gate.borrow())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    /// Open gate, no stop, state `Idle`.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(Gate {
            open: true,
            stop: false,
        });
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(Inner { gate, state }),
        }
    }

    /// Close the gate. Ignored once a stop has been requested.
    pub fn pause(&self) {
        self.inner.gate.send_modify(|gate| gate.open = false);
        self.inner.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
        debug!("pause requested");
    }

    /// Reopen the gate.
    pub fn resume(&self) {
        self.inner.gate.send_modify(|gate| gate.open = true);
        self.inner.state.send_if_modified(|state| {
            if *state == RunState::Paused {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        debug!("resume requested");
    }

    /// Set the stop flag. Never cleared for this run.
    pub fn request_stop(&self) {
        self.inner.gate.send_modify(|gate| gate.stop = true);
        self.inner.state.send_if_modified(|state| match state {
            RunState::Finished | RunState::Stopping => false,
            _ => {
                *state = RunState::Stopping;
                true
            }
        });
        debug!("stop requested");
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.inner.gate.borrow().stop
    }

    /// Whether the gate is currently closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        !self.inner.gate.borrow().open
    }

    /// Latest lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    /// Watch the lifecycle state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Fail with [`DaqError::OperatorStop`] if a stop was requested.
    pub fn ensure_running(&self) -> AppResult<()> {
        if self.is_stop_requested() {
            Err(DaqError::OperatorStop)
        } else {
            Ok(())
        }
    }

    /// Honor pause and stop.
    ///
    /// Returns immediately with the gate open; otherwise waits until the gate
    /// reopens or a stop is requested. A stop yields [`DaqError::OperatorStop`].
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use waveguide_daq::experiment::ExecutionControl;
    ///
    /// let control = ExecutionControl::new();
    /// assert!(control.checkpoint().await.is_ok());
    ///
    /// control.request_stop();
    /// assert!(control.checkpoint().await.unwrap_err().is_stop());
    /// # });
    /// ```
    pub async fn checkpoint(&self) -> AppResult<()> {
        self.ensure_running()?;
        let mut rx = self.inner.gate.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let gate = rx
            .wait_for(|gate| gate.open || gate.stop)
            .await
            .map(|gate| *gate)
            .unwrap_or(Gate {
                open: true,
                stop: true,
            });
        if gate.stop {
            Err(DaqError::OperatorStop)
        } else {
            Ok(())
        }
    }

    /// Close the gate and wait at a checkpoint for the operator.
    pub async fn hold(&self) -> AppResult<()> {
        self.pause();
        self.checkpoint().await
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.inner.gate.subscribe();
        let _ = rx.wait_for(|gate| gate.stop).await;
    }

    /// Worker started.
    pub fn mark_running(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = if self.inner.gate.borrow().open {
                    RunState::Running
                } else {
                    RunState::Paused
                };
                true
            } else {
                false
            }
        });
    }

    /// Worker finished (normally or after a stop).
    pub fn mark_finished(&self) {
        self.inner.state.send_replace(RunState::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn checkpoint_passes_when_open() {
        let control = ExecutionControl::new();
        assert!(control.checkpoint().await.is_ok());
        assert!(!control.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_until_resume() {
        let control = ExecutionControl::new();
        control.mark_running();
        control.pause();
        assert_eq!(control.state(), RunState::Paused);

        let worker = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!worker.is_finished());

        control.resume();
        assert!(worker.await.unwrap().is_ok());
        assert_eq!(control.state(), RunState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_a_paused_worker() {
        let control = ExecutionControl::new();
        control.mark_running();
        let worker = {
            let control = control.clone();
            tokio::spawn(async move { control.hold().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!worker.is_finished());

        control.request_stop();
        let result = worker.await.unwrap();
        assert!(matches!(result, Err(DaqError::OperatorStop)));
        assert_eq!(control.state(), RunState::Stopping);
    }

    #[tokio::test]
    async fn stop_is_sticky() {
        let control = ExecutionControl::new();
        control.request_stop();
        control.resume();
        assert!(control.is_stop_requested());
        assert!(control.ensure_running().is_err());
        assert!(control.checkpoint().await.is_err());
        control.stopped().await;
    }

    #[test]
    fn finished_is_terminal() {
        let control = ExecutionControl::new();
        control.mark_running();
        control.mark_finished();
        control.request_stop();
        control.pause();
        assert_eq!(control.state(), RunState::Finished);
    }
}
