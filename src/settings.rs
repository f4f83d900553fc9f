//! Agent settings

use fleet_shared::defaults;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Configuration for the fleet agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub device_id: String,
    /// JSON config document polled by the refresh loop
    pub config_path: PathBuf,
    pub scripts_dir: PathBuf,
    pub installers_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Job working directories are created under this
    pub work_root: PathBuf,
    pub config_ttl: Duration,
    pub refresh_interval: Duration,
    pub receiver_timeout: Duration,
    pub script_timeout: Duration,
    pub osquery_binary: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let state = PathBuf::from("/var/lib/fleet-agent");
        Self {
            device_id: "agent-001".into(),
            config_path: state.join("config.json"),
            scripts_dir: state.join("scripts"),
            installers_dir: state.join("installers"),
            results_dir: state.join("results"),
            work_root: env::temp_dir().join("fleet-agent"),
            config_ttl: Duration::from_millis(defaults::CONFIG_CACHE_TTL_MS),
            refresh_interval: Duration::from_millis(defaults::CONFIG_REFRESH_INTERVAL_MS),
            receiver_timeout: Duration::from_millis(defaults::RECEIVER_TIMEOUT_MS),
            script_timeout: Duration::from_millis(defaults::SCRIPT_TIMEOUT_MS),
            osquery_binary: "osqueryi".into(),
        }
    }
}

impl AgentSettings {
    /// Defaults overridden by `FLEET_AGENT_*` environment variables
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(id) = env::var("FLEET_AGENT_DEVICE_ID") {
            settings.device_id = id;
        }
        for (name, field) in [
            ("FLEET_AGENT_CONFIG_PATH", &mut settings.config_path),
            ("FLEET_AGENT_SCRIPTS_DIR", &mut settings.scripts_dir),
            ("FLEET_AGENT_INSTALLERS_DIR", &mut settings.installers_dir),
            ("FLEET_AGENT_RESULTS_DIR", &mut settings.results_dir),
            ("FLEET_AGENT_WORK_ROOT", &mut settings.work_root),
            ("FLEET_AGENT_OSQUERY_BINARY", &mut settings.osquery_binary),
        ] {
            if let Some(path) = env::var_os(name) {
                *field = PathBuf::from(path);
            }
        }
        for (name, field) in [
            ("FLEET_AGENT_CONFIG_TTL_MS", &mut settings.config_ttl),
            ("FLEET_AGENT_REFRESH_INTERVAL_MS", &mut settings.refresh_interval),
            ("FLEET_AGENT_RECEIVER_TIMEOUT_MS", &mut settings.receiver_timeout),
            ("FLEET_AGENT_SCRIPT_TIMEOUT_MS", &mut settings.script_timeout),
        ] {
            if let Ok(raw) = env::var(name) {
                match parse_millis(&raw) {
                    Some(d) => *field = d,
                    None => warn!("Ignoring invalid {}: {}", name, raw),
                }
            }
        }

        settings
    }
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.trim().parse().ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AgentSettings::default();
        assert_eq!(settings.config_ttl, Duration::from_secs(3));
        assert_eq!(settings.refresh_interval, Duration::from_secs(30));
        assert_eq!(settings.receiver_timeout, Duration::from_secs(600));
        assert_eq!(settings.script_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_millis() {
        assert_eq!(parse_millis(" 1500 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_millis("3s"), None);
        assert_eq!(parse_millis("-1"), None);
    }
}
