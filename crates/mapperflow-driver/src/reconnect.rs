/*!
 * Reconnect supervision.
 *
 * Status moves through `Connected -> Disconnected -> Reconnecting(n)` and
 * back to `Connected`, or ends in `Disconnected` once the retry budget is
 * spent. At most one connect/reconnect task exists per device: the task's
 * cancellation token is stored in the device record and a link-down signal
 * observed while a token is present is ignored.
 */
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mapperflow_core::logging::operation_span;
use mapperflow_core::utils::spawn_in_span;

use crate::device::{DeviceEntry, DeviceStatus};
use crate::hardware::{open_blocking, CameraAbi};

type Entry<A> = Arc<DeviceEntry<<A as CameraAbi>::Handle>>;

/// Drives connection and bounded reconnection of devices
pub struct ReconnectSupervisor<A: CameraAbi> {
    abi: Arc<A>,
    interval: Duration,
}

impl<A: CameraAbi> Clone for ReconnectSupervisor<A> {
    fn clone(&self) -> Self {
        Self {
            abi: Arc::clone(&self.abi),
            interval: self.interval,
        }
    }
}

impl<A: CameraAbi> ReconnectSupervisor<A> {
    /// Create a supervisor that waits `interval` before each reconnect attempt
    pub fn new(abi: Arc<A>, interval: Duration) -> Self {
        Self { abi, interval }
    }

    /// Delay between reconnect attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Open a device that has no usable handle.
    ///
    /// Does nothing when the device is connected or a connect/reconnect task
    /// is already in flight. When the open fails the device is left
    /// `Disconnected` and a reconnect loop takes over.
    pub async fn connect(&self, entry: &Entry<A>) -> DeviceStatus {
        let token = {
            let mut record = entry.lock();
            if record.link_task.is_some() || entry.status().is_connected() {
                return entry.status();
            }
            let token = CancellationToken::new();
            record.link_task = Some(token.clone());
            token
        };

        let opened = open_blocking(&self.abi, entry.id()).await;

        let mut record = entry.lock();
        if token.is_cancelled() {
            drop(record);
            if let Ok(handle) = opened {
                self.abi.close(handle);
            }
            return entry.status();
        }
        match opened {
            Ok(handle) => {
                if let Some(stale) = record.install_handle(handle) {
                    self.abi.close(stale);
                }
                record.link_task = None;
                record.retry_count = 0;
                entry.set_status(&record, DeviceStatus::Connected);
                info!("Device {} connected", entry.id());
            }
            Err(e) => {
                error!("Failed to open device {}: {}", entry.id(), e.message);
                entry.set_status(&record, DeviceStatus::Disconnected);
                record.reconnect_loops += 1;
                self.spawn_loop(entry, token);
            }
        }
        entry.status()
    }

    /// Report that the link to a device is down.
    ///
    /// `epoch` is the record's `link_epoch` at the time of the failing call.
    /// A failure seen on a handle that has since been replaced is stale and
    /// ignored. Returns `true` if this call started a reconnect loop.
    pub fn link_down(&self, entry: &Entry<A>, epoch: u64) -> bool {
        let mut record = entry.lock();
        if record.link_task.is_some() {
            debug!("Reconnect of device {} already in flight", entry.id());
            return false;
        }
        if record.link_epoch != epoch {
            debug!(
                "Ignoring link failure of device {} from connection {}, now on {}",
                entry.id(),
                epoch,
                record.link_epoch
            );
            return false;
        }
        let token = CancellationToken::new();
        record.link_task = Some(token.clone());
        record.retry_count = 0;
        record.reconnect_loops += 1;
        entry.set_status(&record, DeviceStatus::Disconnected);
        warn!("Device {} link down, scheduling reconnect", entry.id());
        self.spawn_loop(entry, token);
        true
    }

    /// Cancel any connect/reconnect task and release the handle
    pub fn stop(&self, entry: &Entry<A>) {
        let handle = {
            let mut record = entry.lock();
            if let Some(token) = record.link_task.take() {
                token.cancel();
            }
            record.retry_count = 0;
            entry.set_status(&record, DeviceStatus::Disconnected);
            record.handle.take()
        };
        if let Some(handle) = handle {
            self.abi.close(handle);
            debug!("Closed device {}", entry.id());
        }
    }

    fn spawn_loop(&self, entry: &Entry<A>, token: CancellationToken) {
        let supervisor = self.clone();
        let entry = Arc::clone(entry);
        let span = operation_span("reconnect", entry.id().as_str());
        spawn_in_span(span, async move { supervisor.run(entry, token).await });
    }

    async fn run(self, entry: Entry<A>, token: CancellationToken) {
        let max_retry = {
            let mut record = entry.lock();
            if let Some(stale) = record.handle.take() {
                self.abi.close(stale);
            }
            record.max_retry
        };

        let mut attempt = 0;
        while attempt < max_retry {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reconnect of device {} cancelled", entry.id());
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            attempt += 1;

            {
                let record = entry.lock();
                if token.is_cancelled() {
                    return;
                }
                entry.set_status(&record, DeviceStatus::Reconnecting { attempt });
            }

            let opened = open_blocking(&self.abi, entry.id()).await;

            let mut record = entry.lock();
            if token.is_cancelled() {
                drop(record);
                if let Ok(handle) = opened {
                    self.abi.close(handle);
                }
                return;
            }
            match opened {
                Ok(handle) => {
                    if let Some(stale) = record.install_handle(handle) {
                        self.abi.close(stale);
                    }
                    record.retry_count = 0;
                    record.link_task = None;
                    entry.set_status(&record, DeviceStatus::Connected);
                    info!("Device {} reconnected after {} attempt(s)", entry.id(), attempt);
                    return;
                }
                Err(e) => {
                    record.retry_count = attempt;
                    warn!(
                        "Failed to reconnect device {} (attempt {}/{}): {}",
                        entry.id(),
                        attempt,
                        max_retry,
                        e.message
                    );
                }
            }
        }

        let mut record = entry.lock();
        if token.is_cancelled() {
            return;
        }
        record.link_task = None;
        entry.set_status(&record, DeviceStatus::Disconnected);
        error!(
            "Giving up on device {} after {} attempt(s); re-initialize to retry",
            entry.id(),
            max_retry
        );
    }
}
