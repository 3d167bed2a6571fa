//! Background pump thread driving the transport's event loop.
//!
//! ```text
//! loop until shutdown:
//!     completed = transport.drive_once()
//!     registry.expire_overdue(now, slack)
//!     if completed == 0: transport.wait_for_activity(idle_interval)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::Transport;
use crate::error::CommError;
use crate::registry::OperationRegistry;

const PUMP_THREAD_NAME: &str = "shardcomm-pump";

/// Owns the pump thread. Shuts it down on drop.
pub(crate) struct BackgroundPump {
    shutdown: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundPump {
    pub(crate) fn spawn(
        transport: Arc<dyn Transport>,
        registry: Arc<OperationRegistry>,
        idle_interval: Duration,
        timeout_slack: Duration,
    ) -> Result<Self, CommError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = shutdown.clone();
            let transport = transport.clone();
            std::thread::Builder::new()
                .name(PUMP_THREAD_NAME.to_string())
                .spawn(move || run(&*transport, &registry, &shutdown, idle_interval, timeout_slack))
                .map_err(CommError::PumpSpawn)?
        };
        tracing::debug!(?idle_interval, "pump started");

        Ok(Self {
            shutdown,
            transport,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        self.transport.wake();
        if handle.join().is_err() {
            tracing::error!("pump thread panicked");
        } else {
            tracing::debug!("pump stopped");
        }
    }
}

impl Drop for BackgroundPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    transport: &dyn Transport,
    registry: &OperationRegistry,
    shutdown: &AtomicBool,
    idle_interval: Duration,
    timeout_slack: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        let completed = transport.drive_once();
        let expired = registry.expire_overdue(Instant::now(), timeout_slack);
        if expired > 0 {
            tracing::debug!(expired, "timed out overdue operations");
        }
        if completed == 0 && !shutdown.load(Ordering::Acquire) {
            transport.wait_for_activity(idle_interval);
        }
    }
}
