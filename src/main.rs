use color_eyre::{eyre::eyre, Result};
use padremap::config::config_root;
use padremap::controller::controller_handle::{ControllerHandle, ControllerSettings};
use padremap::controller::report::MappedState;
use padremap::mapping::special_action::LoggingLauncher;
use padremap::mapping::synthetic::TracingSink;
use padremap::mapping::{
    ManagerCommand, MapperDeps, MappingEngineManager, SyntheticStateCommitter,
};
use padremap::persistence::config_portal::{ConfigPortal, ConfigResult, PortalAction};
use padremap::persistence::repository::ConfigRepository;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const REPORT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let repository = Arc::new(ConfigRepository::new(config_root()));
    let app_config = repository.load_app_config().await?;
    setup(app_config.level())?;
    info!("Using configuration root {}", repository.root().display());

    let portal = Arc::new(repository.load_portal().await?);
    let _autosave_handle = repository
        .clone()
        .start_autosave_task(portal.clone(), app_config.autosave_interval_secs);

    let deps = MapperDeps {
        committer: Arc::new(SyntheticStateCommitter::new(Box::new(TracingSink))),
        profiles: portal.clone(),
        calibrations: portal.clone(),
        launcher: Arc::new(LoggingLauncher),
    };

    let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (mapped_tx, mapped_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let mut manager = MappingEngineManager::new(
        report_rx,
        command_rx,
        mapped_tx,
        deps,
        app_config.default_profile.clone(),
        cancel.clone(),
    );
    for (device, profile) in app_config.device_overrides() {
        info!("{} uses profile '{}'", device, profile);
        manager.assign_profile(device, profile);
    }

    info!("Initializing controller");
    let mut controller = ControllerHandle::spawn(
        Some(ControllerSettings {
            poll_interval_ms: app_config.poll_interval_ms,
        }),
        report_tx,
        command_tx.clone(),
    )
    .map_err(|e| eyre!("Failed to spawn controller: {}", e))?;

    let manager_handle = tokio::spawn(manager.run());
    let output_handle = tokio::spawn(log_virtual_output(mapped_rx));

    wait_for_shutdown(&repository, &portal, &command_tx).await?;

    info!("Shutting down");
    cancel.cancel();
    tokio::task::spawn_blocking(move || controller.shutdown())
        .await
        .map_err(|e| eyre!("Controller shutdown panicked: {}", e))?;

    match manager_handle.await {
        Ok(Ok(())) => info!("Mapping manager stopped"),
        Ok(Err(e)) => error!("Mapping manager stopped with error: {}", e),
        Err(e) => error!("Mapping manager task failed: {}", e),
    }
    if let Err(e) = output_handle.await {
        warn!("Output task failed: {}", e);
    }

    repository.flush_calibrations(&portal).await?;
    info!("Shutdown complete");
    Ok(())
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env(level);
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Stand-in for the virtual output device
async fn log_virtual_output(mut mapped_rx: mpsc::Receiver<MappedState>) {
    let mut last = None;
    while let Some(state) = mapped_rx.recv().await {
        if last != Some(state) {
            debug!("Virtual output {}: {:?}", state.device, state);
            last = Some(state);
        }
    }
    debug!("Virtual output channel closed");
}

/// Waits for ctrl-c; on unix SIGHUP reloads every profile from disk
async fn wait_for_shutdown(
    repository: &ConfigRepository,
    portal: &ConfigPortal,
    command_tx: &mpsc::Sender<ManagerCommand>,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup =
            signal(SignalKind::hangup()).map_err(|e| eyre!("Failed to watch SIGHUP: {}", e))?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    return result.map_err(|e| eyre!("Failed to wait for ctrl-c: {}", e));
                }
                _ = hangup.recv() => {
                    if let Err(e) = reload_profiles(repository, portal, command_tx).await {
                        error!("Profile reload failed: {}", e);
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (repository, portal, command_tx);
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| eyre!("Failed to wait for ctrl-c: {}", e))
    }
}

async fn reload_profiles(
    repository: &ConfigRepository,
    portal: &ConfigPortal,
    command_tx: &mpsc::Sender<ManagerCommand>,
) -> Result<()> {
    let profiles = repository.load_profiles().await?;
    info!("Reloading {} profiles", profiles.len());
    for profile in profiles {
        let name = profile.name.clone();
        if let ConfigResult::Failed(e) =
            portal.execute_portal_action(PortalAction::WriteProfile(profile))
        {
            warn!("Failed to update profile '{}': {}", name, e);
        }
    }
    command_tx
        .send(ManagerCommand::ReloadAll)
        .await
        .map_err(|e| eyre!("Failed to request reload: {}", e))
}
