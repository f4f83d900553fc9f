use super::runner::{InstallerRunner, JobOutcome};
use crate::config::ConfigReceiver;
use anyhow::Result;
use async_trait::async_trait;
use fleet_shared::AgentConfig;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Some jobs in one delivery failed; each was already logged
#[derive(Error, Debug)]
#[error("{failed} of {attempted} installation(s) failed")]
pub struct InstallFailures {
    pub failed: usize,
    pub attempted: usize,
}

/// Runs each pending installation from the config once, in order
pub struct InstallerReceiver {
    runner: InstallerRunner,
    /// Execution ids already attempted by this process
    attempted: Mutex<HashSet<String>>,
}

impl InstallerReceiver {
    pub fn new(runner: InstallerRunner) -> Self {
        Self {
            runner,
            attempted: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ConfigReceiver<AgentConfig> for InstallerReceiver {
    fn name(&self) -> &str {
        "installer"
    }

    async fn run(&self, config: &AgentConfig, cancel: &CancellationToken) -> Result<()> {
        // Held for the whole delivery so overlapping deliveries never run a job twice
        let mut attempted = self.attempted.lock().await;
        let mut ran = 0;
        let mut failed = 0;

        for job in &config.pending_installs {
            if cancel.is_cancelled() {
                break;
            }
            if !attempted.insert(job.execution_id.clone()) {
                debug!("Installation {} already attempted", job.execution_id);
                continue;
            }

            ran += 1;
            match self.runner.run(job, cancel).await {
                Ok(JobOutcome::Skipped) => {}
                Ok(JobOutcome::Completed { install, .. }) => {
                    info!(
                        "Installation {} finished with exit code {}",
                        job.execution_id, install.exit_code
                    );
                }
                Err(e) => {
                    error!("Installation {} failed: {}", job.execution_id, e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(InstallFailures {
                failed,
                attempted: ran,
            }
            .into());
        }
        Ok(())
    }
}
