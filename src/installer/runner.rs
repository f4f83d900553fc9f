//! Runs one installation job end to end

use crate::client::{InstallerClient, QueryClient};
use crate::exec::{truncate_tail, write_script, ExecError, ExecOutput, ScriptExecutor};
use fleet_shared::{defaults, now_ms, HostScript, InstallationJob, ScriptResult};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Environment variable holding the downloaded installer's path
pub const INSTALLER_PATH_ENV: &str = "INSTALLER_PATH";

/// Stage of a job, for errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Precondition,
    Install,
    PostInstall,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Precondition => "precondition",
            Step::Install => "install",
            Step::PostInstall => "post-install",
        })
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("precondition query failed: {0:#}")]
    PreconditionQuery(#[source] anyhow::Error),

    #[error("precondition query returned status {code}: {message}")]
    PreconditionStatus { code: i32, message: String },

    #[error("creating working directory: {0}")]
    WorkDir(#[source] io::Error),

    #[error("fetching {what}: {source:#}")]
    Fetch {
        what: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} script: {source}")]
    Exec {
        step: Step,
        #[source]
        source: ExecError,
    },

    #[error("reporting {step} result {execution_id}: {source:#}")]
    Report {
        step: Step,
        execution_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} script timed out after {after:?}")]
    TimedOut { step: Step, after: Duration },

    #[error("cancelled during {step}")]
    Cancelled { step: Step },
}

/// How a job ended when no hard error occurred
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Precondition returned no rows; nothing ran and nothing was reported
    Skipped,
    Completed {
        install: ScriptResult,
        post_install: Option<ScriptResult>,
    },
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Parent of every job's working directory
    pub work_root: PathBuf,
    pub script_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir(),
            script_timeout: Duration::from_millis(defaults::SCRIPT_TIMEOUT_MS),
        }
    }
}

/// Precondition check, fetch, install script, post-install script
///
/// Holds no per-job state; one runner can serve any number of jobs.
pub struct InstallerRunner {
    installer_client: Arc<dyn InstallerClient>,
    query_client: Arc<dyn QueryClient>,
    executor: Arc<dyn ScriptExecutor>,
    options: RunnerOptions,
}

impl InstallerRunner {
    pub fn new(
        installer_client: Arc<dyn InstallerClient>,
        query_client: Arc<dyn QueryClient>,
        executor: Arc<dyn ScriptExecutor>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            installer_client,
            query_client,
            executor,
            options,
        }
    }

    pub async fn run(
        &self,
        job: &InstallationJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, RunnerError> {
        info!("Installation {}: starting", job.execution_id);

        if !self.precondition_met(job, cancel).await? {
            info!("Installation {}: precondition not met, skipping", job.execution_id);
            return Ok(JobOutcome::Skipped);
        }

        tokio::fs::create_dir_all(&self.options.work_root)
            .await
            .map_err(RunnerError::WorkDir)?;
        let workdir = tempfile::Builder::new()
            .prefix("fleet-install-")
            .tempdir_in(&self.options.work_root)
            .map_err(RunnerError::WorkDir)?;
        debug!("Installation {}: working in {}", job.execution_id, workdir.path().display());

        let outcome = self.install(job, workdir.path(), cancel).await;

        // Dropping the TempDir would also remove it; close() surfaces the error
        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!("Failed to remove {}: {}", path.display(), e);
        }

        match &outcome {
            Ok(_) => info!("Installation {}: done", job.execution_id),
            Err(e) => warn!("Installation {}: failed: {}", job.execution_id, e),
        }
        outcome
    }

    async fn precondition_met(
        &self,
        job: &InstallationJob,
        cancel: &CancellationToken,
    ) -> Result<bool, RunnerError> {
        let Some(query) = job.precondition() else {
            return Ok(true);
        };

        let response = tokio::select! {
            result = self.query_client.query(query) => result.map_err(RunnerError::PreconditionQuery)?,
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled { step: Step::Precondition }),
        };

        if response.status.code != 0 {
            return Err(RunnerError::PreconditionStatus {
                code: response.status.code,
                message: response.status.message,
            });
        }

        debug!(
            "Installation {}: precondition returned {} row(s)",
            job.execution_id,
            response.rows.len()
        );
        Ok(!response.rows.is_empty())
    }

    async fn install(
        &self,
        job: &InstallationJob,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, RunnerError> {
        let install_script = self.fetch_script(&job.install_script).await?;
        let post_install_script = match job.post_install() {
            Some(id) => Some(self.fetch_script(id).await?),
            None => None,
        };

        let installer_path = self
            .installer_client
            .get_installer(&job.installer_id, workdir)
            .await
            .map_err(|source| RunnerError::Fetch {
                what: format!("installer {}", job.installer_id),
                source,
            })?;

        let env = vec![(
            INSTALLER_PATH_ENV.to_string(),
            installer_path.display().to_string(),
        )];

        let install = self
            .run_script(Step::Install, &install_script, workdir, &env, cancel)
            .await?;

        let post_install = match &post_install_script {
            Some(script) => Some(
                self.run_script(Step::PostInstall, script, workdir, &env, cancel)
                    .await?,
            ),
            None => None,
        };

        Ok(JobOutcome::Completed {
            install,
            post_install,
        })
    }

    async fn fetch_script(&self, execution_id: &str) -> Result<HostScript, RunnerError> {
        self.installer_client
            .get_host_script(execution_id)
            .await
            .map_err(|source| RunnerError::Fetch {
                what: format!("script {}", execution_id),
                source,
            })
    }

    /// Write, execute and report one script
    ///
    /// A timed out or cancelled script is still reported, with exit code -1.
    async fn run_script(
        &self,
        step: Step,
        script: &HostScript,
        workdir: &Path,
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ScriptResult, RunnerError> {
        let path = write_script(
            workdir,
            &script.execution_id,
            self.executor.extension(),
            &script.script_contents,
        )
        .await
        .map_err(|source| RunnerError::Exec { step, source })?;

        let started = Instant::now();
        let executed = self
            .executor
            .execute(&path, env, self.options.script_timeout, cancel)
            .await;
        let runtime_seconds = started.elapsed().as_secs();

        let (output, abort) = match executed {
            Ok(output) => (output, None),
            Err(ExecError::TimedOut(after)) => (
                ExecOutput {
                    exit_code: -1,
                    output: format!("script timed out after {}s", after.as_secs()),
                },
                Some(RunnerError::TimedOut { step, after }),
            ),
            Err(ExecError::Cancelled) => (
                ExecOutput {
                    exit_code: -1,
                    output: "script cancelled".into(),
                },
                Some(RunnerError::Cancelled { step }),
            ),
            Err(source) => return Err(RunnerError::Exec { step, source }),
        };

        let result = ScriptResult {
            execution_id: script.execution_id.clone(),
            output: truncate_tail(output.output, defaults::MAX_SCRIPT_OUTPUT_BYTES),
            exit_code: output.exit_code,
            runtime_seconds,
            completed_at_ms: now_ms(),
        };

        info!(
            "Installation {} {}: exit code {} after {}s",
            script.execution_id, step, result.exit_code, runtime_seconds
        );

        if let Err(source) = self.installer_client.save_script_result(&result).await {
            return Err(RunnerError::Report {
                step,
                execution_id: result.execution_id,
                source,
            });
        }

        match abort {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{QueryResponse, QueryStatus};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockQuery {
        response: Result<QueryResponse, String>,
        calls: AtomicUsize,
    }

    impl MockQuery {
        fn rows(n: usize) -> Self {
            let row: HashMap<String, String> = [("name".to_string(), "Safari".to_string())].into();
            Self {
                response: Ok(QueryResponse {
                    status: QueryStatus::default(),
                    rows: vec![row; n],
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn status(code: i32) -> Self {
            Self {
                response: Ok(QueryResponse {
                    status: QueryStatus {
                        code,
                        message: "no such table".into(),
                    },
                    rows: Vec::new(),
                }),
                calls: AtomicUsize::new(0),
            }
        }

        fn transport_error() -> Self {
            Self {
                response: Err("socket closed".into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueryClient for MockQuery {
        async fn query(&self, _sql: &str) -> Result<QueryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone().map_err(|e| anyhow!(e))
        }
    }

    #[derive(Default)]
    struct MockInstaller {
        saved: Mutex<Vec<ScriptResult>>,
        fail_save: AtomicBool,
        fail_installer: AtomicBool,
        /// Where get_installer was asked to download
        download_dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl InstallerClient for MockInstaller {
        async fn get_host_script(&self, execution_id: &str) -> Result<HostScript> {
            if execution_id == "missing" {
                return Err(anyhow!("script not found"));
            }
            Ok(HostScript {
                execution_id: execution_id.to_string(),
                script_contents: format!("run {}", execution_id),
            })
        }

        async fn get_installer(&self, installer_id: &str, download_dir: &Path) -> Result<PathBuf> {
            self.download_dirs
                .lock()
                .expect("lock")
                .push(download_dir.to_path_buf());
            if self.fail_installer.load(Ordering::SeqCst) {
                return Err(anyhow!("download interrupted"));
            }
            let path = download_dir.join(installer_id);
            std::fs::write(&path, b"pkg")?;
            Ok(path)
        }

        async fn save_script_result(&self, result: &ScriptResult) -> Result<()> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(anyhow!("server returned 500"));
            }
            self.saved.lock().expect("lock").push(result.clone());
            Ok(())
        }
    }

    /// Exit codes by script file stem; records what ran and with which env
    #[derive(Default)]
    struct MockExecutor {
        exit_codes: HashMap<String, i32>,
        ran: Mutex<Vec<(String, String)>>,
        block: bool,
        /// Fail to start the interpreter for this script stem
        launch_fails: Option<String>,
    }

    #[async_trait]
    impl ScriptExecutor for MockExecutor {
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
            let stem = script
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let contents = std::fs::read_to_string(script).map_err(ExecError::Wait)?;
            let installer = env
                .iter()
                .find(|(k, _)| k == INSTALLER_PATH_ENV)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            if self.launch_fails.as_deref() == Some(stem.as_str()) {
                return Err(ExecError::Launch {
                    program: "/bin/sh".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            self.ran.lock().expect("lock").push((stem.clone(), installer));

            if self.block {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => return Err(ExecError::TimedOut(timeout)),
                    _ = cancel.cancelled() => return Err(ExecError::Cancelled),
                }
            }

            Ok(ExecOutput {
                exit_code: self.exit_codes.get(&stem).copied().unwrap_or(0),
                output: format!("{}\n", contents),
            })
        }
    }

    struct Harness {
        root: tempfile::TempDir,
        query: Arc<MockQuery>,
        installer: Arc<MockInstaller>,
        executor: Arc<MockExecutor>,
        runner: InstallerRunner,
    }

    impl Harness {
        fn new(query: MockQuery, executor: MockExecutor) -> Self {
            let root = tempfile::tempdir().expect("tempdir");
            let query = Arc::new(query);
            let installer = Arc::new(MockInstaller::default());
            let executor = Arc::new(executor);
            let runner = InstallerRunner::new(
                installer.clone(),
                query.clone(),
                executor.clone(),
                RunnerOptions {
                    work_root: root.path().join("work"),
                    script_timeout: Duration::from_secs(5),
                },
            );
            Self {
                root,
                query,
                installer,
                executor,
                runner,
            }
        }

        fn saved(&self) -> Vec<ScriptResult> {
            self.installer.saved.lock().expect("lock").clone()
        }

        fn ran(&self) -> Vec<String> {
            self.executor
                .ran
                .lock()
                .expect("lock")
                .iter()
                .map(|(stem, _)| stem.clone())
                .collect()
        }

        /// No job working directory is left under the root
        fn assert_cleaned_up(&self) {
            let work = self.root.path().join("work");
            if work.exists() {
                let left: Vec<_> = std::fs::read_dir(&work).expect("read_dir").collect();
                assert!(left.is_empty(), "leftover working dirs: {:?}", left);
            }
            for dir in self.installer.download_dirs.lock().expect("lock").iter() {
                assert!(!dir.exists(), "{} still exists", dir.display());
            }
        }
    }

    fn job(precondition: Option<&str>, post_install: Option<&str>) -> InstallationJob {
        InstallationJob {
            execution_id: "job-1".into(),
            installer_id: "pkg-1".into(),
            pre_install_condition: precondition.map(String::from),
            install_script: "install-1".into(),
            post_install_script: post_install.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_zero_rows_skips() {
        let h = Harness::new(MockQuery::rows(0), MockExecutor::default());
        let outcome = h
            .runner
            .run(&job(Some("SELECT 1 FROM apps"), Some("post-1")), &CancellationToken::new())
            .await
            .expect("skip is not an error");

        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(h.query.calls.load(Ordering::SeqCst), 1);
        assert!(h.ran().is_empty());
        assert!(h.saved().is_empty());
        assert!(h.installer.download_dirs.lock().expect("lock").is_empty());
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_nonzero_install_still_reported_and_post_install_runs() {
        let executor = MockExecutor {
            exit_codes: [("install-1".to_string(), 2)].into(),
            ..Default::default()
        };
        let h = Harness::new(MockQuery::rows(1), executor);

        let outcome = h
            .runner
            .run(&job(Some("SELECT 1"), Some("post-1")), &CancellationToken::new())
            .await
            .expect("nonzero exit is not an error");

        let JobOutcome::Completed {
            install,
            post_install,
        } = outcome
        else {
            panic!("expected completed outcome");
        };
        assert_eq!(install.exit_code, 2);
        assert!(!install.succeeded());
        assert_eq!(install.output, "run install-1\n");
        assert_eq!(post_install.map(|r| r.exit_code), Some(0));

        assert_eq!(h.ran(), vec!["install-1", "post-1"]);
        let saved = h.saved();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].execution_id, "install-1");
        assert_eq!(saved[0].exit_code, 2);
        assert_eq!(saved[1].execution_id, "post-1");
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_installer_path_exported() {
        let h = Harness::new(MockQuery::rows(1), MockExecutor::default());
        h.runner
            .run(&job(None, None), &CancellationToken::new())
            .await
            .expect("run failed");

        let ran = h.executor.ran.lock().expect("lock").clone();
        assert_eq!(ran.len(), 1);
        assert!(ran[0].1.ends_with("pkg-1"));
    }

    #[tokio::test]
    async fn test_absent_precondition_skips_query() {
        let h = Harness::new(MockQuery::rows(0), MockExecutor::default());
        let outcome = h
            .runner
            .run(&job(Some("  "), None), &CancellationToken::new())
            .await
            .expect("run failed");

        assert!(matches!(
            outcome,
            JobOutcome::Completed {
                post_install: None,
                ..
            }
        ));
        assert_eq!(h.query.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.ran(), vec!["install-1"]);
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_report_failure_stops_post_install() {
        let h = Harness::new(MockQuery::rows(1), MockExecutor::default());
        h.installer.fail_save.store(true, Ordering::SeqCst);

        let err = h
            .runner
            .run(&job(None, Some("post-1")), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunnerError::Report {
                step: Step::Install,
                ..
            }
        ));
        assert_eq!(h.ran(), vec!["install-1"]);
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_query_status_is_hard_error() {
        let h = Harness::new(MockQuery::status(1), MockExecutor::default());
        let err = h
            .runner
            .run(&job(Some("SELECT * FROM nope"), None), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::PreconditionStatus { code: 1, .. }));
        assert!(h.ran().is_empty());
        assert!(h.saved().is_empty());
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_query_transport_error_is_hard_error() {
        let h = Harness::new(MockQuery::transport_error(), MockExecutor::default());
        let err = h
            .runner
            .run(&job(Some("SELECT 1"), None), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::PreconditionQuery(_)));
        assert!(h.ran().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_errors_run_nothing() {
        let h = Harness::new(MockQuery::rows(1), MockExecutor::default());
        let err = h
            .runner
            .run(&job(None, Some("missing")), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Fetch { .. }));
        assert!(h.ran().is_empty());
        h.assert_cleaned_up();

        h.installer.fail_installer.store(true, Ordering::SeqCst);
        let err = h
            .runner
            .run(&job(None, None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("installer pkg-1"));
        assert!(h.ran().is_empty());
        assert!(h.saved().is_empty());
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_launch_error_reports_nothing() {
        let executor = MockExecutor {
            launch_fails: Some("install-1".into()),
            ..Default::default()
        };
        let h = Harness::new(MockQuery::rows(1), executor);

        let err = h
            .runner
            .run(&job(None, Some("post-1")), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunnerError::Exec {
                step: Step::Install,
                source: ExecError::Launch { .. },
            }
        ));
        assert!(h.saved().is_empty());
        assert!(!h.ran().contains(&"post-1".to_string()));
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_escaping_script_id_is_not_written() {
        let h = Harness::new(MockQuery::rows(1), MockExecutor::default());
        let mut job = job(None, None);
        job.install_script = "../escaped".into();

        let err = h
            .runner
            .run(&job, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunnerError::Exec {
                step: Step::Install,
                source: ExecError::Write { .. },
            }
        ));
        assert!(h.ran().is_empty());
        assert!(h.saved().is_empty());
        assert!(!h.root.path().join("work").join("escaped.sh").exists());
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_cancelled_script_reported_then_fails() {
        let executor = MockExecutor {
            block: true,
            ..Default::default()
        };
        let h = Harness::new(MockQuery::rows(1), executor);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = h
            .runner
            .run(&job(None, Some("post-1")), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunnerError::Cancelled {
                step: Step::Install
            }
        ));
        let saved = h.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].exit_code, -1);
        assert_eq!(h.ran(), vec!["install-1"]);
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_cancel_before_precondition() {
        let h = Harness::new(MockQuery::rows(1), MockExecutor::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // The query mock answers immediately, so either branch may win;
        // a cancelled precondition must never be reported as a skip
        match h.runner.run(&job(Some("SELECT 1"), None), &cancel).await {
            Err(RunnerError::Cancelled { step }) => assert_eq!(step, Step::Precondition),
            Ok(JobOutcome::Completed { .. }) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
        h.assert_cleaned_up();
    }

    #[tokio::test]
    async fn test_output_truncated_to_tail() {
        struct Noisy;

        #[async_trait]
        impl ScriptExecutor for Noisy {
            fn extension(&self) -> &'static str {
                ".sh"
            }

            async fn execute(
                &self,
                _script: &Path,
                _env: &[(String, String)],
                _timeout: Duration,
                _cancel: &CancellationToken,
            ) -> Result<ExecOutput, ExecError> {
                let mut output = "x".repeat(defaults::MAX_SCRIPT_OUTPUT_BYTES);
                output.push_str("tail");
                Ok(ExecOutput {
                    exit_code: 0,
                    output,
                })
            }
        }

        let root = tempfile::tempdir().expect("tempdir");
        let installer = Arc::new(MockInstaller::default());
        let runner = InstallerRunner::new(
            installer.clone(),
            Arc::new(MockQuery::rows(1)),
            Arc::new(Noisy),
            RunnerOptions {
                work_root: root.path().to_path_buf(),
                ..Default::default()
            },
        );

        runner
            .run(&job(None, None), &CancellationToken::new())
            .await
            .expect("run failed");

        let saved = installer.saved.lock().expect("lock").clone();
        assert_eq!(saved[0].output.len(), defaults::MAX_SCRIPT_OUTPUT_BYTES);
        assert!(saved[0].output.ends_with("tail"));
    }
}
