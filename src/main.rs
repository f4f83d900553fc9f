mod client;
mod config;
mod exec;
mod installer;
mod settings;

use client::{FileConfigFetcher, LocalDirClient, OsqueryiClient};
use config::ConfigClient;
use fleet_shared::AgentConfig;
use installer::{InstallerReceiver, InstallerRunner, RunnerOptions};
use settings::AgentSettings;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let settings = AgentSettings::from_env();

    info!("Fleet agent starting: {}", settings.device_id);
    info!("  Config: {}", settings.config_path.display());
    info!("  Refresh every {:?}", settings.refresh_interval);

    let fetcher = Arc::new(FileConfigFetcher::<AgentConfig>::new(&settings.config_path));
    let config_client = Arc::new(
        ConfigClient::<AgentConfig>::new(fetcher, settings.config_ttl)
            .with_receiver_timeout(settings.receiver_timeout),
    );

    let runner = InstallerRunner::new(
        Arc::new(LocalDirClient::new(
            &settings.scripts_dir,
            &settings.installers_dir,
            &settings.results_dir,
        )),
        Arc::new(OsqueryiClient::new(&settings.osquery_binary)),
        exec::default_executor(),
        RunnerOptions {
            work_root: settings.work_root.clone(),
            script_timeout: settings.script_timeout,
        },
    );
    config_client
        .register_receiver(Arc::new(InstallerReceiver::new(runner)))
        .await;

    let cancel = CancellationToken::new();
    let refresh = {
        let config_client = config_client.clone();
        let cancel = cancel.clone();
        let period = settings.refresh_interval;
        tokio::spawn(async move { config_client.run(period, &cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    if let Err(e) = refresh.await {
        error!("Refresh loop panicked: {}", e);
    }
    Ok(())
}
