//! Platform script execution
//!
//! The runner writes a script to disk and hands its path to a
//! [`ScriptExecutor`]; which interpreter runs it depends on the platform.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::ShellExecutor;
#[cfg(windows)]
pub use windows::PowerShellExecutor;

use async_trait::async_trait;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("writing script {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("launching {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("waiting for script: {0}")]
    Wait(#[source] io::Error),

    #[error("script timed out after {0:?}")]
    TimedOut(Duration),

    #[error("script cancelled")]
    Cancelled,
}

/// What a finished script reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code; -1 when the process was killed by a signal
    pub exit_code: i32,
    /// stdout followed by stderr
    pub output: String,
}

/// Runs a script file already written to disk
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// File extension scripts must carry, including the dot
    fn extension(&self) -> &'static str;

    async fn execute(
        &self,
        script: &Path,
        env: &[(String, String)],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError>;
}

/// The executor for the platform this agent was built for
pub fn default_executor() -> Arc<dyn ScriptExecutor> {
    #[cfg(unix)]
    return Arc::new(ShellExecutor::default());
    #[cfg(windows)]
    return Arc::new(PowerShellExecutor::default());
}

/// Whether `name` is exactly one path component that stays inside its parent
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name() == Some(OsStr::new(name))
}

/// Write `contents` to `<dir>/<name><extension>`, executable by the owner only
pub async fn write_script(
    dir: &Path,
    name: &str,
    extension: &str,
    contents: &str,
) -> Result<PathBuf, ExecError> {
    let file_name = format!("{}{}", name, extension);
    let path = dir.join(&file_name);
    let write_err = |source| ExecError::Write {
        path: path.clone(),
        source,
    };

    if !is_plain_file_name(name) || !is_plain_file_name(&file_name) {
        return Err(write_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("script name {:?} is not a plain file name", name),
        )));
    }

    tokio::fs::write(&path, contents).await.map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(write_err)?;
    }

    Ok(path)
}

/// Spawn `command`, wait for it within `timeout`, kill it on cancel
pub(crate) async fn run_command(
    mut command: Command,
    program: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExecOutput, ExecError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ExecError::Launch {
        program: program.to_string(),
        source,
    })?;

    // Dropping the wait future drops the child, which kills it
    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output.map_err(ExecError::Wait)?,
            Err(_) => return Err(ExecError::TimedOut(timeout)),
        },
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        output: combined,
    })
}

/// Keep at most the last `max` bytes of `s`, cut on a char boundary
pub fn truncate_tail(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
