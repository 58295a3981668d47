//! TTL expiry sweep.
//!
//! One recurring task per handler. Each pass closes every tracked node whose
//! expiry has passed, then sleeps for what is left of the interval so the
//! sweep keeps a fixed period regardless of how long the pass took.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DialogError, Result};
use crate::handler::{DialogHandler, Shared};
use crate::node::NodeStatus;
use crate::{HANDLER_TARGET, REPORTING_TARGET};

/// Handle to the outstanding sweep chain.
pub(crate) struct CleanupTask {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl CleanupTask {
    fn is_running(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    /// Invalidate the chain. A pass already running finishes; nothing is
    /// scheduled after it.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl DialogHandler {
    fn cleanup_slot(&self) -> MutexGuard<'_, Option<CleanupTask>> {
        self.shared
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the recurring sweep with the given period.
    ///
    /// Replaces any chain already running. Must be called from within a
    /// tokio runtime.
    pub fn start_cleanup(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(DialogError::Cleanup(
                "sweep interval must be positive".to_string(),
            ));
        }
        let runtime = Handle::try_current()
            .map_err(|e| DialogError::Cleanup(format!("no tokio runtime: {e}")))?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = runtime.spawn(sweep_loop(
            Arc::downgrade(&self.shared),
            interval,
            cancelled.clone(),
        ));
        let previous = self.cleanup_slot().replace(CleanupTask {
            cancelled,
            handle,
            interval,
        });
        if let Some(previous) = previous {
            previous.cancel();
            debug!(
                target: HANDLER_TARGET,
                interval_ms = previous.interval.as_millis() as u64,
                "replaced running cleanup chain"
            );
        }
        info!(
            target: HANDLER_TARGET,
            interval_ms = interval.as_millis() as u64,
            "cleanup started"
        );
        Ok(())
    }

    /// Start the recurring sweep with the configured `clean_interval_seconds`.
    pub fn start_configured_cleanup(&self) -> Result<()> {
        self.start_cleanup(self.config().clean_interval())
    }

    /// Stop the recurring sweep. Returns whether a chain was running.
    pub fn stop_cleanup(&self) -> bool {
        let Some(task) = self.cleanup_slot().take() else {
            return false;
        };
        let was_running = task.is_running();
        task.cancel();
        info!(target: HANDLER_TARGET, "cleanup stopped");
        was_running
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleanup_slot()
            .as_ref()
            .is_some_and(CleanupTask::is_running)
    }

    /// Close every expired node once. Returns how many nodes this pass
    /// removed from the registry.
    ///
    /// A node whose close actions fail or panic is removed without them, so
    /// one bad close never keeps the rest from being reclaimed. A node still
    /// `Closing` a full clean interval past its expiry is removed the same way.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired = self.registry().expired(now);
        if expired.is_empty() {
            return 0;
        }
        debug!(
            target: HANDLER_TARGET,
            nodes = expired.len(),
            "sweeping expired nodes"
        );
        let grace = self.config().clean_interval();
        let mut reclaimed = 0;
        for node in expired {
            if node.status() == NodeStatus::Closing {
                let stale = node.expiry().is_some_and(|expiry| expiry + grace < now);
                if stale {
                    warn!(
                        target: REPORTING_TARGET,
                        node = %node.id(),
                        template = node.template_id(),
                        "node stuck closing past its expiry, removing it"
                    );
                    self.emergency_remove(&node);
                    reclaimed += 1;
                }
                continue;
            }
            info!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                "node timed out"
            );
            let fault = match AssertUnwindSafe(self.try_close(node.clone(), true))
                .catch_unwind()
                .await
            {
                Ok(Ok(true)) => {
                    reclaimed += 1;
                    continue;
                }
                Ok(Ok(false)) => continue,
                Ok(Err(fault)) => fault.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                error = %fault,
                "close of expired node failed, removing it"
            );
            self.emergency_remove(&node);
            reclaimed += 1;
        }
        reclaimed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("close panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("close panicked: {message}")
    } else {
        "close panicked".to_string()
    }
}

async fn sweep_loop(shared: Weak<Shared>, interval: Duration, cancelled: Arc<AtomicBool>) {
    let mut delay = interval;
    loop {
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        tokio::time::sleep(delay).await;
        if cancelled.load(Ordering::Acquire) {
            debug!(target: HANDLER_TARGET, "cleanup chain invalidated while sleeping");
            break;
        }
        let Some(shared) = shared.upgrade() else {
            debug!(target: HANDLER_TARGET, "handler dropped, ending cleanup chain");
            break;
        };
        let handler = DialogHandler::from_shared(shared);

        let started = Instant::now();
        let reclaimed = handler.sweep().await;
        let elapsed = started.elapsed();
        delay = interval.saturating_sub(elapsed);
        debug!(
            target: HANDLER_TARGET,
            reclaimed,
            elapsed_ms = elapsed.as_millis() as u64,
            next_in_ms = delay.as_millis() as u64,
            "cleanup pass finished"
        );
    }
}
