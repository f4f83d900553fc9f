//! Software installation jobs delivered through the agent config

mod receiver;
mod runner;

pub use receiver::{InstallFailures, InstallerReceiver};
pub use runner::{
    InstallerRunner, JobOutcome, RunnerError, RunnerOptions, Step, INSTALLER_PATH_ENV,
};
