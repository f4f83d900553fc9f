use super::{run_command, ExecError, ExecOutput, ScriptExecutor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs scripts with a POSIX shell
pub struct ShellExecutor {
    shell: PathBuf,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl ScriptExecutor for ShellExecutor {
    fn extension(&self) -> &'static str {
        ".sh"
    }

    async fn execute(
        &self,
        script: &Path,
        env: &[(String, String)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        debug!("{} {}", self.shell.display(), script.display());

        let mut command = Command::new(&self.shell);
        command.arg(script).envs(env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        run_command(command, &self.shell.display().to_string(), timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::write_script;

    async fn run(
        contents: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "script", ".sh", contents)
            .await
            .expect("write failed");
        ShellExecutor::default()
            .execute(&path, env, timeout, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_stdout_then_stderr() {
        let out = run("echo out\necho err >&2\nexit 3\n", &[], Duration::from_secs(10))
            .await
            .expect("execute failed");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.output, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_env_passed_to_script() {
        let env = vec![("INSTALLER_PATH".to_string(), "/tmp/pkg-1".to_string())];
        let out = run("printf %s \"$INSTALLER_PATH\"\n", &env, Duration::from_secs(10))
            .await
            .expect("execute failed");
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output, "/tmp/pkg-1");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run("sleep 5\n", &[], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "script", ".sh", "sleep 5\n")
            .await
            .expect("write failed");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ShellExecutor::default()
            .execute(&path, &[], Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_shell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_script(dir.path(), "script", ".sh", "true\n")
            .await
            .expect("write failed");
        let err = ShellExecutor::new("/nonexistent/sh")
            .execute(&path, &[], Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }
}
