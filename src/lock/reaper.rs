use super::manager::LockManager;
use crate::core::{DbError, Result};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background worker that periodically reclaims expired leases.
pub struct LockReaper {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LockReaper {
    /// Starts sweeping `manager` every `interval` (at least 10 ms).
    pub fn spawn(manager: LockManager, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(10));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = sleep(interval) => {
                        let reclaimed = manager.reap_expired();
                        if reclaimed > 0 {
                            event!(Level::INFO, reclaimed, "expired leases reclaimed");
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| DbError::ExecutionError(format!("lock reaper join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for LockReaper {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
