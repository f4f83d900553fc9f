//! Fleet Shared Protocol Types
//!
//! This crate provides the command envelope types, the plist codec and the
//! agent-side job documents exchanged between the MDM server and the
//! device agent.

pub mod codec;
pub mod command;
pub mod secret;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use command::{Attribution, Command, CommandPayload, ObliterationBehavior, RequestType};
pub use secret::{DeviceLockSecret, SecretError};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and sizing parameters shared by server and agent
pub mod defaults {
    /// How long a fetched agent config is served before refreshing
    pub const CONFIG_CACHE_TTL_MS: u64 = 3_000;

    /// Interval of the agent's background refresh loop
    pub const CONFIG_REFRESH_INTERVAL_MS: u64 = 30_000;

    /// Upper bound for a single receiver run
    pub const RECEIVER_TIMEOUT_MS: u64 = 10 * 60 * 1000;

    /// Upper bound for a single install or post-install script
    pub const SCRIPT_TIMEOUT_MS: u64 = 5 * 60 * 1000;

    /// Only the tail of a script's output is reported
    pub const MAX_SCRIPT_OUTPUT_BYTES: usize = 10_000;

    /// Digits in a device lock / erase PIN
    pub const DEVICE_LOCK_PIN_LEN: usize = 6;

    /// Concurrent in-flight push notifications per fan-out
    pub const PUSH_CONCURRENCY: usize = 32;
}

/// Configuration document fetched by the agent on each check-in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Opaque flags for other agent subsystems
    #[serde(default)]
    pub flags: serde_json::Value,
    /// Software installs the server wants this device to run
    #[serde(default)]
    pub pending_installs: Vec<InstallationJob>,
}

/// A software installation created server-side and run by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationJob {
    pub execution_id: String,
    pub installer_id: String,
    /// Inventory query gating the install; empty or absent means "always"
    #[serde(default)]
    pub pre_install_condition: Option<String>,
    pub install_script: String,
    #[serde(default)]
    pub post_install_script: Option<String>,
}

impl InstallationJob {
    /// The precondition query, if one is actually set
    pub fn precondition(&self) -> Option<&str> {
        self.pre_install_condition
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// The post-install script reference, if one is actually set
    pub fn post_install(&self) -> Option<&str> {
        self.post_install_script
            .as_deref()
            .filter(|s| !s.is_empty())
    }
}

/// A script body as served by the fetch boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostScript {
    pub execution_id: String,
    pub script_contents: String,
}

/// Outcome of one script execution attempt, reported to the server
///
/// A nonzero `exit_code` is data: the script ran and this is what it said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub execution_id: String,
    pub output: String,
    pub exit_code: i32,
    pub runtime_seconds: u64,
    pub completed_at_ms: u64,
}

impl ScriptResult {
    /// Whether the script reported success by exit code
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}
