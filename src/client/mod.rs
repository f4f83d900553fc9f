//! Boundaries between the agent and the outside world
//!
//! The server API, the inventory agent and the config endpoint are all
//! injected through these traits so the agent core can be driven by local
//! or test implementations.

mod local;
mod osquery;

pub use local::{FileConfigFetcher, LocalDirClient};
pub use osquery::OsqueryiClient;

use anyhow::Result;
use async_trait::async_trait;
use fleet_shared::{HostScript, ScriptResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Fetches the device's configuration document
#[async_trait]
pub trait ConfigFetcher<C>: Send + Sync {
    async fn fetch_config(&self) -> Result<C>;
}

/// Status of an inventory query; nonzero `code` means the query failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStatus {
    pub code: i32,
    pub message: String,
}

/// Result of an inventory query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResponse {
    pub status: QueryStatus,
    pub rows: Vec<HashMap<String, String>>,
}

/// Runs read-only queries against the local inventory agent
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, sql: &str) -> Result<QueryResponse>;
}

/// Server-side calls the installer needs
#[async_trait]
pub trait InstallerClient: Send + Sync {
    /// Fetch the body of a script by execution id
    async fn get_host_script(&self, execution_id: &str) -> Result<HostScript>;

    /// Download an installer into `download_dir`, returning its local path
    async fn get_installer(&self, installer_id: &str, download_dir: &Path) -> Result<PathBuf>;

    /// Report a script's outcome
    async fn save_script_result(&self, result: &ScriptResult) -> Result<()>;
}
