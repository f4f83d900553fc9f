//! Builds MDM commands, queues them and wakes the target devices
//!
//! The commander does no authentication or permission checks; callers
//! (API handlers, crons) are expected to have done that already.

use super::notifier::{DeliveryError, PushNotifier};
use crate::push::Pusher;
use crate::storage::{CommandStore, QueuedCommand};
use bytes::Bytes;
use fleet_shared::codec::{self, CodecError};
use fleet_shared::{
    now_ms, Attribution, Command, CommandPayload, DeviceLockSecret, ObliterationBehavior,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Why issuing a command failed
#[derive(Error, Debug)]
pub enum CommanderError {
    /// The command could not be rendered or did not decode back
    #[error("Building command: {0}")]
    Build(#[from] CodecError),

    #[error("Command has no target devices")]
    NoTargets,

    #[error("Resolving owner of profile {profile}: {source}")]
    Attribution {
        profile: String,
        #[source]
        source: anyhow::Error,
    },

    /// Nothing was persisted and no push was attempted
    #[error("Enqueuing command {command_uuid}: {source}")]
    Enqueue {
        command_uuid: String,
        #[source]
        source: anyhow::Error,
    },

    /// The command is queued, but some devices were not woken up
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl CommanderError {
    /// Delivery failures still mean the command was issued
    pub fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    pub fn delivery(&self) -> Option<&DeliveryError> {
        match self {
            Self::Delivery(e) => Some(e),
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Build(_) | Self::NoTargets => 400,
            Self::Attribution { .. } | Self::Enqueue { .. } => 500,
            Self::Delivery(e) => e.status_code(),
        }
    }
}

/// Enqueues commands and sends push notifications to devices
pub struct Commander {
    store: Arc<dyn CommandStore>,
    notifier: PushNotifier,
}

impl Commander {
    /// Create a new commander
    pub fn new(store: Arc<dyn CommandStore>, pusher: Arc<dyn Pusher>) -> Self {
        Self {
            store,
            notifier: PushNotifier::new(pusher),
        }
    }

    /// Install a configuration profile; the bytes are base64-encoded on the wire
    pub async fn install_profile(
        &self,
        device_ids: &[String],
        profile: Bytes,
        command_uuid: &str,
        profile_identifier: &str,
    ) -> Result<(), CommanderError> {
        let raw = codec::encode(&Command::new(
            command_uuid,
            CommandPayload::InstallProfile { payload: profile },
        ))?;
        let attribution = self.profile_attribution(profile_identifier).await?;
        info!(
            "Creating InstallProfile {} for {} ({:?})",
            command_uuid, profile_identifier, attribution
        );
        self.enqueue_command(device_ids, raw, attribution).await
    }

    pub async fn remove_profile(
        &self,
        device_ids: &[String],
        profile_identifier: &str,
        command_uuid: &str,
    ) -> Result<(), CommanderError> {
        let raw = codec::encode(&Command::new(
            command_uuid,
            CommandPayload::RemoveProfile {
                identifier: profile_identifier.to_string(),
            },
        ))?;
        let attribution = self.profile_attribution(profile_identifier).await?;
        self.enqueue_command(device_ids, raw, attribution).await
    }

    /// Lock a device behind a freshly generated PIN, stored with the command
    pub async fn device_lock(
        &self,
        device_id: &str,
        command_uuid: &str,
        attribution: Attribution,
    ) -> Result<(), CommanderError> {
        let pin = DeviceLockSecret::generate();
        let (queued, pin) = self.render_with_secret(
            Command::new(command_uuid, CommandPayload::DeviceLock { pin }),
            attribution,
        )?;

        self.store
            .enqueue_device_lock_command(device_id, queued, pin)
            .await
            .map_err(|source| CommanderError::Enqueue {
                command_uuid: command_uuid.to_string(),
                source: source.context("enqueuing for DeviceLock"),
            })?;
        info!("Enqueued DeviceLock {} for {}", command_uuid, device_id);

        self.notifier.notify(&[device_id.to_string()]).await?;
        Ok(())
    }

    /// Erase a device; its PIN is stored like a lock PIN
    pub async fn erase_device(
        &self,
        device_id: &str,
        command_uuid: &str,
        attribution: Attribution,
        obliteration: ObliterationBehavior,
    ) -> Result<(), CommanderError> {
        let pin = DeviceLockSecret::generate();
        let (queued, pin) = self.render_with_secret(
            Command::new(command_uuid, CommandPayload::EraseDevice { pin, obliteration }),
            attribution,
        )?;

        self.store
            .enqueue_device_wipe_command(device_id, queued, pin)
            .await
            .map_err(|source| CommanderError::Enqueue {
                command_uuid: command_uuid.to_string(),
                source: source.context("enqueuing for DeviceWipe"),
            })?;
        info!("Enqueued EraseDevice {} for {}", command_uuid, device_id);

        self.notifier.notify(&[device_id.to_string()]).await?;
        Ok(())
    }

    /// Always server-owned
    pub async fn install_enterprise_application(
        &self,
        device_ids: &[String],
        command_uuid: &str,
        manifest_url: &str,
    ) -> Result<(), CommanderError> {
        let raw = codec::encode(&Command::new(
            command_uuid,
            CommandPayload::InstallEnterpriseApplication {
                manifest_url: manifest_url.to_string(),
            },
        ))?;
        self.enqueue_command(device_ids, raw, Attribution::System).await
    }

    /// Always server-owned
    pub async fn account_configuration(
        &self,
        device_ids: &[String],
        command_uuid: &str,
        full_name: &str,
        user_name: &str,
    ) -> Result<(), CommanderError> {
        let raw = codec::encode(&Command::new(
            command_uuid,
            CommandPayload::AccountConfiguration {
                full_name: full_name.to_string(),
                user_name: user_name.to_string(),
                lock_primary_account_info: true,
            },
        ))?;
        self.enqueue_command(device_ids, raw, Attribution::System).await
    }

    /// Queue a rendered command for every device, then push to all of them
    ///
    /// The push is always attempted after a successful enqueue. A failed
    /// push is reported as [`CommanderError::Delivery`] and never undoes the
    /// enqueue.
    pub async fn enqueue_command(
        &self,
        device_ids: &[String],
        raw: Bytes,
        attribution: Attribution,
    ) -> Result<(), CommanderError> {
        let command = codec::decode(&raw)?;
        if device_ids.is_empty() {
            return Err(CommanderError::NoTargets);
        }

        let command_uuid = command.command_uuid.clone();
        let request_type = command.request_type();
        let queued = QueuedCommand {
            command,
            raw,
            attribution,
            created_at_ms: now_ms(),
        };

        self.store
            .enqueue_command(device_ids, queued)
            .await
            .map_err(|source| CommanderError::Enqueue {
                command_uuid: command_uuid.clone(),
                source,
            })?;

        info!(
            "Enqueued {} {} for {} device(s)",
            request_type,
            command_uuid,
            device_ids.len()
        );

        self.notifier.notify(device_ids).await?;
        Ok(())
    }

    /// A zero owner id makes the command server-owned
    async fn profile_attribution(&self, profile_identifier: &str) -> Result<Attribution, CommanderError> {
        let owner = self
            .store
            .profile_owner(profile_identifier)
            .await
            .map_err(|source| CommanderError::Attribution {
                profile: profile_identifier.to_string(),
                source,
            })?;
        Ok(Attribution::from_profile_owner(owner))
    }

    /// Render, decode back, and pull the PIN out of the decoded command
    fn render_with_secret(
        &self,
        command: Command,
        attribution: Attribution,
    ) -> Result<(QueuedCommand, DeviceLockSecret), CommanderError> {
        let raw = codec::encode(&command)?;
        let decoded = codec::decode(&raw)?;
        let pin = decoded
            .payload
            .secret()
            .cloned()
            .ok_or(CodecError::MissingKey("PIN"))?;

        Ok((
            QueuedCommand {
                command: decoded,
                raw,
                attribution,
                created_at_ms: now_ms(),
            },
            pin,
        ))
    }
}
