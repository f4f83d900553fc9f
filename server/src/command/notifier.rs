//! Push fan-out after a successful enqueue

use crate::push::Pusher;
use anyhow::anyhow;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// HTTP-style classification for upstream error mapping
pub const BAD_GATEWAY: u16 = 502;

/// Some devices could not be woken up
///
/// The command is still enqueued for every target; the listed devices will
/// pick it up on their next regular check-in.
#[derive(Error, Debug)]
#[error("push delivery failed for {} device(s) {failed_devices:?}: {source}", .failed_devices.len())]
pub struct DeliveryError {
    /// Device ids whose push failed, in target order
    pub failed_devices: Vec<String>,
    /// Transport error of the first failed device
    #[source]
    pub source: anyhow::Error,
}

impl DeliveryError {
    pub fn status_code(&self) -> u16 {
        BAD_GATEWAY
    }
}

/// Wakes devices that have new work queued
pub struct PushNotifier {
    pusher: Arc<dyn Pusher>,
}

impl PushNotifier {
    pub fn new(pusher: Arc<dyn Pusher>) -> Self {
        Self { pusher }
    }

    /// Push to every device and collect the ones that could not be reached
    pub async fn notify(&self, device_ids: &[String]) -> Result<(), DeliveryError> {
        if device_ids.is_empty() {
            return Ok(());
        }

        let mut responses = match self.pusher.push(device_ids).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!("Push fan-out to {} device(s) failed: {}", device_ids.len(), e);
                return Err(DeliveryError {
                    failed_devices: dedup(device_ids),
                    source: e.context("commander push"),
                });
            }
        };

        // Even if the batch went out, individual devices may have failed
        let mut failures = Vec::new();
        for device_id in dedup(device_ids) {
            match responses.remove(&device_id) {
                Some(response) => {
                    if let Some(e) = response.error {
                        warn!("Push to {} failed: {}", device_id, e);
                        failures.push((device_id, e));
                    }
                }
                None => {
                    warn!("No push response for {}", device_id);
                    let e = anyhow!("no push response for device {}", device_id);
                    failures.push((device_id, e));
                }
            }
        }

        let mut failures = failures.into_iter();
        let Some((first_id, source)) = failures.next() else {
            return Ok(());
        };

        let mut failed_devices = vec![first_id];
        failed_devices.extend(failures.map(|(id, _)| id));

        Err(DeliveryError {
            failed_devices,
            source,
        })
    }
}

fn dedup(device_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    device_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
