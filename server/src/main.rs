mod command;
mod push;
mod settings;
mod storage;

use bytes::Bytes;
use command::{Commander, CommanderError};
use fleet_shared::{Attribution, ObliterationBehavior};
use push::{FanoutPusher, LoggingPusher};
use settings::ServerSettings;
use std::fmt;
use std::sync::Arc;
use storage::MemoryCommandStore;
use uuid::Uuid;

use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Server-owned profile used by the profile actions
const DEMO_PROFILE: &str = "com.example.demo.wifi";
const DEMO_PROFILE_BODY: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>PayloadIdentifier</key><string>com.example.demo.wifi</string></dict></plist>"#;

const USAGE: &str =
    "usage: mdm-server <install-app|account|install-profile|remove-profile|lock|erase> <device-uuid>...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    InstallApp,
    Account,
    InstallProfile,
    RemoveProfile,
    Lock,
    Erase,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "install-app" => Some(Action::InstallApp),
            "account" => Some(Action::Account),
            "install-profile" => Some(Action::InstallProfile),
            "remove-profile" => Some(Action::RemoveProfile),
            "lock" => Some(Action::Lock),
            "erase" => Some(Action::Erase),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::InstallApp => "install-app",
            Action::Account => "account",
            Action::InstallProfile => "install-profile",
            Action::RemoveProfile => "remove-profile",
            Action::Lock => "lock",
            Action::Erase => "erase",
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let settings = ServerSettings::from_env();
    let mut args = std::env::args().skip(1);
    let raw_action = args.next().unwrap_or_default();
    let Some(action) = Action::parse(&raw_action) else {
        anyhow::bail!("unknown action {:?}\n{}", raw_action, USAGE);
    };
    let device_ids: Vec<String> = args.collect();
    if device_ids.is_empty() {
        anyhow::bail!(USAGE);
    }

    info!("MDM server starting for {} device(s)", device_ids.len());
    info!("  Manifest: {}", settings.manifest_url);

    let store = Arc::new(MemoryCommandStore::new());
    store.set_profile_owner(DEMO_PROFILE, 0).await;
    let pusher = Arc::new(FanoutPusher::new(LoggingPusher, settings.push_concurrency));
    let commander = Commander::new(store.clone(), pusher);

    match issue(&commander, action, &device_ids, &settings).await {
        Ok(()) => info!("Issued {} to {} device(s)", action, device_ids.len()),
        // Queued anyway; devices pick it up on their next check-in
        Err(e) if e.is_delivery() => warn!("Issued {} with delivery failures: {}", action, e),
        Err(e) => {
            error!("Failed to issue {}: {}", action, e);
            return Err(e.into());
        }
    }

    for device_id in &device_ids {
        let pending = store.pending_for(device_id).await;
        info!("{}: {} pending command(s)", device_id, pending.len());
        for queued in pending {
            let owner = match queued.attribution {
                Attribution::User(id) => format!("user {id}"),
                Attribution::System => "system".to_string(),
            };
            info!(
                "  {} {} ({}) at {}",
                queued.command.request_type(),
                queued.command.command_uuid,
                owner,
                queued.created_at_ms
            );
        }
    }

    Ok(())
}

async fn issue(
    commander: &Commander,
    action: Action,
    device_ids: &[String],
    settings: &ServerSettings,
) -> Result<(), CommanderError> {
    match action {
        Action::InstallApp => {
            let command_uuid = Uuid::new_v4().to_string();
            commander
                .install_enterprise_application(device_ids, &command_uuid, &settings.manifest_url)
                .await
        }
        Action::Account => {
            let command_uuid = Uuid::new_v4().to_string();
            commander
                .account_configuration(device_ids, &command_uuid, "Fleet User", "fleetuser")
                .await
        }
        Action::InstallProfile => {
            let command_uuid = Uuid::new_v4().to_string();
            commander
                .install_profile(
                    device_ids,
                    Bytes::from_static(DEMO_PROFILE_BODY),
                    &command_uuid,
                    DEMO_PROFILE,
                )
                .await
        }
        Action::RemoveProfile => {
            let command_uuid = Uuid::new_v4().to_string();
            commander
                .remove_profile(device_ids, DEMO_PROFILE, &command_uuid)
                .await
        }
        // Lock and erase address one device per command
        Action::Lock | Action::Erase => {
            let mut delivery_failure = None;
            for device_id in device_ids {
                let command_uuid = Uuid::new_v4().to_string();
                let result = if action == Action::Lock {
                    commander
                        .device_lock(device_id, &command_uuid, Attribution::System)
                        .await
                } else {
                    commander
                        .erase_device(
                            device_id,
                            &command_uuid,
                            Attribution::System,
                            ObliterationBehavior::Default,
                        )
                        .await
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_delivery() => delivery_failure = Some(e),
                    Err(e) => return Err(e),
                }
            }
            delivery_failure.map_or(Ok(()), Err)
        }
    }
}
