use rating_warden::enforcement::persist::YamlFile;
use rating_warden::enforcement::{
    AppliedRestriction, AppliedStateTracker, Bypass, BypassStore, EnforcementService,
    PlexRestrictionClient, YamlActivityLog,
};
use rating_warden::{DAEMON_NAME, DaemonConfig, Data, Error, logging};
use std::sync::Arc;
use tracing::{error, info};

/// Main function to run the daemon
async fn async_main() -> Result<(), Error> {
    let config = DaemonConfig::load().await?;

    // Initialize logging
    let _log_guard = logging::init(&config.log_dir)?;
    logging::log_console(format!("Starting {DAEMON_NAME}"));
    info!(
        data_dir = %config.data_dir.display(),
        interval_secs = config.tick_interval_secs,
        max_concurrency = config.max_concurrency,
        "Configuration loaded"
    );

    // Set up the shared data and enforcement state
    let data = Data::load(&config.data_dir).await?;
    let tracker = AppliedStateTracker::load(Arc::new(YamlFile::<AppliedRestriction>::new(
        config.applied_restrictions_path(),
    )))
    .await?;
    let bypasses =
        BypassStore::load(Arc::new(YamlFile::<Bypass>::new(config.bypasses_path()))).await?;
    let activity = Arc::new(YamlActivityLog::new(config.activity_path()));
    let client = Arc::new(PlexRestrictionClient::new(
        config.api_base_url.clone(),
        config.request_timeout(),
    )?);

    let service = EnforcementService::new(data, client, activity)
        .with_tracker(tracker)
        .with_bypasses(bypasses)
        .with_max_concurrency(config.max_concurrency);

    let handle = service.start(config.tick_interval());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await?;

    info!("{DAEMON_NAME} stopped");
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            std::process::exit(1);
        }
    };

    // Handle any errors that occurred during execution
    if let Err(err) = runtime.block_on(async_main()) {
        error!(error = %err, "Daemon exited with error");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
