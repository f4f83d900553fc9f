use super::{run_command, ExecError, ExecOutput, ScriptExecutor};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs scripts with Windows PowerShell
pub struct PowerShellExecutor {
    program: String,
}

impl Default for PowerShellExecutor {
    fn default() -> Self {
        Self {
            program: "powershell.exe".into(),
        }
    }
}

#[async_trait]
impl ScriptExecutor for PowerShellExecutor {
    fn extension(&self) -> &'static str {
        ".ps1"
    }

    async fn execute(
        &self,
        script: &Path,
        env: &[(String, String)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        debug!("{} -File {}", self.program, script.display());

        let mut command = Command::new(&self.program);
        command
            .args(["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-File"])
            .arg(script)
            .envs(env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        run_command(command, &self.program, timeout, cancel).await
    }
}
