//! Filesystem-backed boundary implementations for local operation

use super::{ConfigFetcher, InstallerClient};
use crate::exec::is_plain_file_name;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fleet_shared::{HostScript, ScriptResult};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Reads the configuration document from a JSON file
pub struct FileConfigFetcher<C> {
    path: PathBuf,
    _config: PhantomData<fn() -> C>,
}

impl<C> FileConfigFetcher<C> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _config: PhantomData,
        }
    }
}

#[async_trait]
impl<C: DeserializeOwned + Send + 'static> ConfigFetcher<C> for FileConfigFetcher<C> {
    async fn fetch_config(&self) -> Result<C> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading config {}", self.path.display()))?;
        let config = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config {}", self.path.display()))?;
        Ok(config)
    }
}

/// Serves scripts and installers from directories and appends results to a file
pub struct LocalDirClient {
    scripts_dir: PathBuf,
    installers_dir: PathBuf,
    results_path: PathBuf,
    /// Serializes appends to the results file
    results_lock: Mutex<()>,
}

impl LocalDirClient {
    pub fn new(
        scripts_dir: impl Into<PathBuf>,
        installers_dir: impl Into<PathBuf>,
        results_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            installers_dir: installers_dir.into(),
            results_path: results_dir.as_ref().join("results.jsonl"),
            results_lock: Mutex::new(()),
        }
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }
}

#[async_trait]
impl InstallerClient for LocalDirClient {
    async fn get_host_script(&self, execution_id: &str) -> Result<HostScript> {
        if !is_plain_file_name(execution_id) {
            bail!("invalid script id {:?}", execution_id);
        }
        let path = self.scripts_dir.join(execution_id);
        let script_contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading script {}", path.display()))?;
        Ok(HostScript {
            execution_id: execution_id.to_string(),
            script_contents,
        })
    }

    async fn get_installer(&self, installer_id: &str, download_dir: &Path) -> Result<PathBuf> {
        if !is_plain_file_name(installer_id) {
            bail!("invalid installer id {:?}", installer_id);
        }
        let source = self.installers_dir.join(installer_id);
        let dest = download_dir.join(installer_id);
        tokio::fs::copy(&source, &dest)
            .await
            .with_context(|| format!("copying installer {}", source.display()))?;
        debug!("Installer {} staged at {}", installer_id, dest.display());
        Ok(dest)
    }

    async fn save_script_result(&self, result: &ScriptResult) -> Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');

        let _guard = self.results_lock.lock().await;
        if let Some(parent) = self.results_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.results_path)
            .await
            .with_context(|| format!("opening {}", self.results_path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::{now_ms, AgentConfig};

    #[tokio::test]
    async fn test_file_config_fetcher() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"flags": {"verbose": true}, "pending_installs": []}"#,
        )
        .expect("write config");

        let fetcher = FileConfigFetcher::<AgentConfig>::new(&path);
        let config = fetcher.fetch_config().await.expect("fetch failed");
        assert_eq!(config.flags["verbose"], serde_json::Value::Bool(true));

        let missing = FileConfigFetcher::<AgentConfig>::new(dir.path().join("nope.json"));
        assert!(missing.fetch_config().await.is_err());
    }

    #[tokio::test]
    async fn test_local_dir_client() {
        let root = tempfile::tempdir().expect("tempdir");
        let scripts = root.path().join("scripts");
        let installers = root.path().join("installers");
        let download = root.path().join("download");
        for dir in [&scripts, &installers, &download] {
            std::fs::create_dir_all(dir).expect("mkdir");
        }
        std::fs::write(scripts.join("exec-1"), "echo hi").expect("write script");
        std::fs::write(installers.join("pkg-1"), b"\x00binary").expect("write installer");

        let client = LocalDirClient::new(&scripts, &installers, root.path().join("results"));

        let script = client.get_host_script("exec-1").await.expect("script");
        assert_eq!(script.script_contents, "echo hi");

        let installer = client.get_installer("pkg-1", &download).await.expect("installer");
        assert_eq!(installer, download.join("pkg-1"));
        assert!(installer.exists());

        let result = ScriptResult {
            execution_id: "exec-1".into(),
            output: "hi\n".into(),
            exit_code: 0,
            runtime_seconds: 1,
            completed_at_ms: now_ms(),
        };
        client.save_script_result(&result).await.expect("save");
        client.save_script_result(&result).await.expect("save");

        let saved = std::fs::read_to_string(client.results_path()).expect("read results");
        let lines: Vec<ScriptResult> = saved
            .lines()
            .map(|l| serde_json::from_str(l).expect("parse line"))
            .collect();
        assert_eq!(lines, vec![result.clone(), result]);
    }

    #[tokio::test]
    async fn test_ids_must_stay_inside_their_dirs() {
        let root = tempfile::tempdir().expect("tempdir");
        let download = root.path().join("download");
        std::fs::create_dir_all(&download).expect("mkdir");
        std::fs::write(root.path().join("outside"), "secret").expect("write");

        let client = LocalDirClient::new(
            root.path().join("scripts"),
            root.path().join("installers"),
            root.path().join("results"),
        );

        assert!(client.get_host_script("../outside").await.is_err());
        assert!(client.get_installer("../outside", &download).await.is_err());
        assert!(client.get_installer("../../escaped", &download).await.is_err());
        assert!(!root.path().join("escaped").exists());
    }
}
