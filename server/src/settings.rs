//! Server settings

use fleet_shared::defaults;
use std::env;
use tracing::warn;

/// Configuration for the MDM server
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Manifest served to devices for the agent package install
    pub manifest_url: String,
    /// Maximum pushes in flight during one fan-out
    pub push_concurrency: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            manifest_url: "https://localhost:8080/api/mdm/apple/manifest".into(),
            push_concurrency: defaults::PUSH_CONCURRENCY,
        }
    }
}

impl ServerSettings {
    /// Defaults overridden by `MDM_SERVER_*` environment variables
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(url) = env::var("MDM_SERVER_MANIFEST_URL") {
            settings.manifest_url = url;
        }
        if let Ok(raw) = env::var("MDM_SERVER_PUSH_CONCURRENCY") {
            match raw.parse() {
                Ok(n) => settings.push_concurrency = n,
                Err(_) => warn!("Ignoring invalid MDM_SERVER_PUSH_CONCURRENCY: {}", raw),
            }
        }

        settings
    }
}
