//! In-process command store

use super::{CommandStore, QueuedCommand};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fleet_shared::DeviceLockSecret;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Keeps per-device queues in memory
#[derive(Default)]
pub struct MemoryCommandStore {
    /// Map of device_id -> commands in enqueue order
    queues: RwLock<HashMap<String, Vec<QueuedCommand>>>,
    /// Map of command_uuid -> lock/erase PIN
    secrets: RwLock<HashMap<String, DeviceLockSecret>>,
    /// Map of profile identifier -> creating user id
    profile_owners: RwLock<HashMap<String, u32>>,
    fail_enqueue: AtomicBool,
    enqueue_calls: AtomicUsize,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record who created a profile (0 for server-owned)
    pub async fn set_profile_owner(&self, profile_identifier: &str, user_id: u32) {
        self.profile_owners
            .write()
            .await
            .insert(profile_identifier.to_string(), user_id);
    }

    /// Make every following enqueue fail
    pub fn fail_enqueues(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Number of enqueue attempts, successful or not
    pub fn enqueue_calls(&self) -> usize {
        self.enqueue_calls.load(Ordering::SeqCst)
    }

    /// Commands waiting for a device, oldest first
    pub async fn pending_for(&self, device_id: &str) -> Vec<QueuedCommand> {
        self.queues
            .read()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Recover the PIN of a lock/erase command
    pub async fn secret_for(&self, command_uuid: &str) -> Option<DeviceLockSecret> {
        self.secrets.read().await.get(command_uuid).cloned()
    }

    fn check_enqueue(&self) -> Result<()> {
        self.enqueue_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(anyhow!("command store unavailable"));
        }
        Ok(())
    }

    async fn push_queued(&self, device_ids: &[String], queued: QueuedCommand) {
        let mut queues = self.queues.write().await;
        for device_id in device_ids {
            let queue = queues.entry(device_id.clone()).or_default();
            if queue
                .iter()
                .any(|q| q.command.command_uuid == queued.command.command_uuid)
            {
                continue;
            }
            queue.push(queued.clone());
        }
    }

    async fn enqueue_with_secret(
        &self,
        device_id: &str,
        queued: QueuedCommand,
        pin: DeviceLockSecret,
    ) -> Result<()> {
        self.check_enqueue()?;

        // Stored PIN must match the queued command; hold both locks
        let mut queues = self.queues.write().await;
        let mut secrets = self.secrets.write().await;
        let uuid = &queued.command.command_uuid;

        let queue = queues.entry(device_id.to_string()).or_default();
        if secrets.contains_key(uuid) || queue.iter().any(|q| &q.command.command_uuid == uuid) {
            // Already queued with its first PIN
            return Ok(());
        }

        secrets.insert(uuid.clone(), pin);
        queue.push(queued);
        Ok(())
    }
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn enqueue_command(&self, device_ids: &[String], queued: QueuedCommand) -> Result<()> {
        self.check_enqueue()?;
        self.push_queued(device_ids, queued).await;
        Ok(())
    }

    async fn enqueue_device_lock_command(
        &self,
        device_id: &str,
        queued: QueuedCommand,
        pin: DeviceLockSecret,
    ) -> Result<()> {
        self.enqueue_with_secret(device_id, queued, pin).await
    }

    async fn enqueue_device_wipe_command(
        &self,
        device_id: &str,
        queued: QueuedCommand,
        pin: DeviceLockSecret,
    ) -> Result<()> {
        self.enqueue_with_secret(device_id, queued, pin).await
    }

    async fn profile_owner(&self, profile_identifier: &str) -> Result<u32> {
        self.profile_owners
            .read()
            .await
            .get(profile_identifier)
            .copied()
            .ok_or_else(|| anyhow!("profile not found: {}", profile_identifier))
    }
}
