/*!
 * Capture-and-report pipeline.
 *
 * A trigger grabs one frame from the device while the caller holds the
 * device lock, marks the device busy and hands the frame to a background
 * task that encodes it and posts it to the configured endpoint. The busy
 * flag and the foreign frame are released by guards, so every exit path of
 * the task cleans up.
 */
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use mapperflow_core::logging::operation_span;
use mapperflow_core::utils::{spawn_in_span, with_timeout};

use crate::device::{DeviceEntry, DeviceRecord, TriggerMode};
use crate::error::{DriverError, Result};
use crate::hardware::{call_blocking, CameraAbi, ForeignFrame, HardwareError};

type Entry<A> = Arc<DeviceEntry<<A as CameraAbi>::Handle>>;

/// Content type sent with every image upload. Receivers in the field match
/// on it even though the body is JSON.
pub const IMAGE_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; param=value";

/// What a trigger did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A frame was captured and its upload started
    Started,
    /// An upload is already in flight; the trigger was dropped
    Busy,
    /// No endpoint is configured; nothing was captured
    NoEndpoint,
}

/// Body of an image upload
#[derive(Debug, Serialize)]
struct ImageEnvelope {
    size: usize,
    value: String,
}

impl ImageEnvelope {
    fn encode(bytes: &[u8]) -> Self {
        Self {
            size: bytes.len(),
            value: STANDARD.encode(bytes),
        }
    }
}

/// Clears the busy flag of a device when dropped
struct BusyGuard<H> {
    entry: Arc<DeviceEntry<H>>,
}

impl<H> Drop for BusyGuard<H> {
    fn drop(&mut self) {
        self.entry.lock().publish_busy = false;
    }
}

/// Uploads captured frames to the device's report endpoint
pub struct AsyncPublisher<A: CameraAbi> {
    abi: Arc<A>,
    http: reqwest::Client,
    timeout: Duration,
}

impl<A: CameraAbi> Clone for AsyncPublisher<A> {
    fn clone(&self) -> Self {
        Self {
            abi: Arc::clone(&self.abi),
            http: self.http.clone(),
            timeout: self.timeout,
        }
    }
}

impl<A: CameraAbi> AsyncPublisher<A> {
    /// Create a publisher whose uploads give up after `timeout`
    pub fn new(abi: Arc<A>, http: reqwest::Client, timeout: Duration) -> Self {
        Self { abi, http, timeout }
    }

    /// Upload deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Capture a frame and start uploading it.
    ///
    /// `record` is the locked record of `entry`. The frame is grabbed before
    /// the lock is released; a capture failure is returned and leaves the
    /// device idle. On a 2xx answer the background task stores `mode` as the
    /// device's trigger mode, unless another trigger write took effect while
    /// the upload was in flight.
    pub fn trigger(
        &self,
        entry: &Entry<A>,
        record: &mut DeviceRecord<A::Handle>,
        mode: TriggerMode,
    ) -> std::result::Result<PublishOutcome, HardwareError> {
        let Some(endpoint) = record.capture.endpoint.clone() else {
            debug!("Device {} has no image URL, not posting the image", entry.id());
            return Ok(PublishOutcome::NoEndpoint);
        };
        if record.publish_busy {
            info!("Image post of device {} is in progress, trigger ignored", entry.id());
            return Ok(PublishOutcome::Busy);
        }
        let Some(handle) = record.handle.as_ref() else {
            return Err(HardwareError::soft("device is not open"));
        };

        let format = record.capture.format.as_str();
        let frame = call_blocking(|| self.abi.get_image(handle, format))?;
        let frame = ForeignFrame::new(Arc::clone(&self.abi), frame);
        let generation = record.next_trigger_generation();
        record.publish_busy = true;
        let busy = BusyGuard {
            entry: Arc::clone(entry),
        };

        let publisher = self.clone();
        let span = operation_span("publish", entry.id().as_str());
        spawn_in_span(span, async move {
            publisher.run(busy, frame, endpoint, mode, generation).await;
        });
        Ok(PublishOutcome::Started)
    }

    async fn run(
        self,
        busy: BusyGuard<A::Handle>,
        frame: ForeignFrame<A>,
        endpoint: Url,
        mode: TriggerMode,
        generation: u64,
    ) {
        let id = busy.entry.id().clone();
        let envelope = ImageEnvelope::encode(frame.bytes());
        drop(frame);

        match self.post(&endpoint, &envelope).await {
            Ok(()) => {
                let mut record = busy.entry.lock();
                if record.trigger_generation == generation {
                    record.capture.trigger = mode;
                } else {
                    debug!(
                        "Trigger of device {} changed during upload, keeping {}",
                        id,
                        record.capture.trigger.as_str()
                    );
                }
                drop(record);
                info!("Posted image of device {} ({} bytes) to {}", id, envelope.size, endpoint);
            }
            Err(e) => warn!("Failed to post image of device {}: {}", id, e),
        }
    }

    async fn post(&self, endpoint: &Url, envelope: &ImageEnvelope) -> Result<()> {
        let body = serde_json::to_vec(envelope).map_err(|e| DriverError::Publish(e.to_string()))?;
        let send = self
            .http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, IMAGE_CONTENT_TYPE)
            .body(body)
            .send();

        let response = with_timeout(self.timeout, send)
            .await
            .map_err(|e| DriverError::Publish(e.to_string()))?
            .map_err(|e| DriverError::Publish(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DriverError::Publish(format!("{} answered {}", endpoint, status)));
        }
        debug!("Image endpoint {} answered {}", endpoint, status);
        Ok(())
    }
}
