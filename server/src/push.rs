//! Push transport boundary
//!
//! A push is only a wake-up hint asking a device to check in; the command
//! queue is the delivery channel of record.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::debug;

/// Per-device outcome of a push
#[derive(Debug, Default)]
pub struct PushResponse {
    /// Transport-assigned notification id
    pub push_id: Option<String>,
    pub error: Option<anyhow::Error>,
}

impl PushResponse {
    pub fn delivered(push_id: impl Into<String>) -> Self {
        Self {
            push_id: Some(push_id.into()),
            error: None,
        }
    }

    pub fn failed(error: anyhow::Error) -> Self {
        Self {
            push_id: None,
            error: Some(error),
        }
    }
}

/// Sends wake notifications to a batch of devices
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Push to every device, returning one response per device id.
    ///
    /// An `Err` means the whole batch failed before any device was reached.
    async fn push(&self, device_ids: &[String]) -> Result<HashMap<String, PushResponse>>;
}

/// Sends a wake notification to one device
#[async_trait]
pub trait DevicePusher: Send + Sync {
    /// Returns the transport's notification id
    async fn push_device(&self, device_id: &str) -> Result<String>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Batch pusher that pushes each device concurrently
pub struct FanoutPusher<P> {
    inner: P,
    concurrency: usize,
}

impl<P: DevicePusher> FanoutPusher<P> {
    pub fn new(inner: P, concurrency: usize) -> Self {
        Self {
            inner,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl<P: DevicePusher> Pusher for FanoutPusher<P> {
    async fn push(&self, device_ids: &[String]) -> Result<HashMap<String, PushResponse>> {
        debug!(
            "Pushing to {} device(s) via {} (concurrency={})",
            device_ids.len(),
            self.inner.name(),
            self.concurrency
        );

        let responses = stream::iter(device_ids.iter().cloned())
            .map(|device_id| async move {
                let response = match self.inner.push_device(&device_id).await {
                    Ok(push_id) => PushResponse::delivered(push_id),
                    Err(e) => PushResponse::failed(e),
                };
                (device_id, response)
            })
            .buffer_unordered(self.concurrency)
            .collect::<HashMap<_, _>>()
            .await;

        Ok(responses)
    }
}

/// Development transport that only logs the wake-up
#[derive(Debug, Default)]
pub struct LoggingPusher;

#[async_trait]
impl DevicePusher for LoggingPusher {
    async fn push_device(&self, device_id: &str) -> Result<String> {
        let push_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("[PUSH] wake {} (push_id={})", device_id, push_id);
        Ok(push_id)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
