//! Command queue storage boundary
//!
//! The queue is the channel of record: a device receives every command
//! enqueued for it on its next check-in, whether or not a push reached it.

mod memory;

pub use memory::MemoryCommandStore;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use fleet_shared::{Attribution, Command, DeviceLockSecret};

/// A command as persisted against its target devices
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    /// The rendered plist document served to devices
    pub raw: Bytes,
    pub attribution: Attribution,
    pub created_at_ms: u64,
}

/// Persistence for queued commands and the lookups the commander needs
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Persist one command against every target device
    async fn enqueue_command(&self, device_ids: &[String], queued: QueuedCommand) -> Result<()>;

    /// Persist a DeviceLock along with its PIN
    async fn enqueue_device_lock_command(
        &self,
        device_id: &str,
        queued: QueuedCommand,
        pin: DeviceLockSecret,
    ) -> Result<()>;

    /// Persist an EraseDevice along with its PIN
    async fn enqueue_device_wipe_command(
        &self,
        device_id: &str,
        queued: QueuedCommand,
        pin: DeviceLockSecret,
    ) -> Result<()>;

    /// User id that created the profile; zero when the server owns it
    async fn profile_owner(&self, profile_identifier: &str) -> Result<u32>;
}
