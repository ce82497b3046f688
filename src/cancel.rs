//! Interrupt-driven cancellation of every in-flight stage and task.

use crate::error::SyncError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that can be told to stop.
#[derive(Debug)]
enum Unit {
    /// A worker pool that stops cooperatively at its next suspension point.
    Stage(CancellationToken),
    /// A producer task that holds no store state and can be aborted outright.
    Task(AbortHandle),
}

impl Unit {
    fn cancel(&self) {
        match self {
            Unit::Stage(token) => token.cancel(),
            Unit::Task(handle) => handle.abort(),
        }
    }
}

/// What an interrupt signal should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    /// Cancel every registered unit and let the run wind down.
    Shutdown,
    /// Shutdown is already running; stop waiting for it.
    Force,
}

/// Collects cancellable units and cancels them together.
///
/// Every stage registers before starting long-running work. The first call to
/// [`cancel_all`](Self::cancel_all) cancels everything registered so far, and
/// from then on any new registration is cancelled on the spot and refused with
/// [`SyncError::Cancelled`].
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    units: Mutex<Vec<(String, Unit)>>,
    triggered: AtomicBool,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a token for a cooperative stage.
    pub fn stage_token(&self, name: &str) -> Result<CancellationToken, SyncError> {
        let token = CancellationToken::new();
        self.register(name, Unit::Stage(token.clone()))?;
        Ok(token)
    }

    /// Registers a spawned task to be aborted on cancellation.
    pub fn track_task<T>(&self, name: &str, handle: &JoinHandle<T>) -> Result<(), SyncError> {
        self.register(name, Unit::Task(handle.abort_handle()))
    }

    fn register(&self, name: &str, unit: Unit) -> Result<(), SyncError> {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock so a concurrent cancel_all cannot miss this unit.
        if self.triggered.load(Ordering::SeqCst) {
            drop(units);
            warn!("Refusing late registration of {} during shutdown", name);
            unit.cancel();
            return Err(SyncError::Cancelled);
        }
        debug!("Registered {} for cancellation", name);
        units.push((name.to_string(), unit));
        Ok(())
    }

    /// Cancels every registered unit. Only the first call has an effect.
    ///
    /// Returns the number of units cancelled by this call.
    pub fn cancel_all(&self) -> usize {
        let units = {
            let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
            if self.triggered.swap(true, Ordering::SeqCst) {
                return 0;
            }
            std::mem::take(&mut *units)
        };

        for (name, unit) in &units {
            debug!("Cancelling {}", name);
            unit.cancel();
        }
        info!("Cancelled {} running jobs and channels", units.len());
        units.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Spawns a task that calls [`cancel_all`](Self::cancel_all) on Ctrl-C.
    ///
    /// A second Ctrl-C while shutdown is still running exits the process
    /// with status 130.
    pub fn cancel_on_interrupt(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Unable to listen for interrupt signal: {}", e);
                    return;
                }
                if registry.on_interrupt() == Interrupt::Force {
                    warn!("Second interrupt received, exiting without waiting for shutdown");
                    std::process::exit(130);
                }
                warn!("Interrupt received, shutting down (press Ctrl-C again to force)");
            }
        })
    }

    /// Reacts to one interrupt: the first starts shutdown, any later one forces exit.
    fn on_interrupt(&self) -> Interrupt {
        if self.is_cancelled() {
            Interrupt::Force
        } else {
            self.cancel_all();
            Interrupt::Shutdown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_all_reaches_every_unit_once() {
        let registry = CancellationRegistry::new();
        let first = registry.stage_token("first").unwrap();
        let second = registry.stage_token("second").unwrap();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        registry.track_task("sleeper", &task).unwrap();

        assert_eq!(registry.cancel_all(), 3);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(registry.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_late_registration_is_refused_and_cancelled() {
        let registry = CancellationRegistry::new();
        registry.cancel_all();
        assert!(registry.is_cancelled());

        assert!(matches!(
            registry.stage_token("late"),
            Err(SyncError::Cancelled)
        ));

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(registry.track_task("late task", &task).is_err());
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_second_interrupt_forces_exit() {
        let registry = CancellationRegistry::new();
        let token = registry.stage_token("stage").unwrap();

        assert_eq!(registry.on_interrupt(), Interrupt::Shutdown);
        assert!(token.is_cancelled());
        assert_eq!(registry.on_interrupt(), Interrupt::Force);
        assert_eq!(registry.on_interrupt(), Interrupt::Force);
    }

    #[test]
    fn test_nothing_cancelled_before_trigger() {
        let registry = CancellationRegistry::new();
        let token = registry.stage_token("stage").unwrap();
        assert!(!token.is_cancelled());
        assert!(!registry.is_cancelled());
    }
}
