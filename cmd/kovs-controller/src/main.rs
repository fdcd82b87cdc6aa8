use clap::Parser;
use pkg_constants::controller::{DEFAULT_API_SERVER, GROUP_ID_BASE, SERVICE_DEBOUNCE_MS, WATCH_RETRY_SECS};
use pkg_constants::ovs::DEFAULT_BRIDGE;
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_CONTROLLER_LOG};
use pkg_controllers::ServiceController;
use pkg_controllers::watch::connect;
use pkg_exec::SystemRunner;
use pkg_ovs::Switch;
use pkg_types::config::{ControllerConfigFile, load_config_or_default};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kovs-controller", about = "kovs service load-balancing controller")]
struct Cli {
    /// Cluster API base URL
    api_server: Option<String>,

    /// Path to YAML config file
    #[arg(long, short, env = "KOVS_CONTROLLER_CONFIG", default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (defaults if missing or unreadable)
    let (file_cfg, cfg_err) = load_config_or_default::<ControllerConfigFile>(&cli.config);
    let log_file = file_cfg
        .log_file
        .clone()
        .unwrap_or_else(|| DEFAULT_CONTROLLER_LOG.to_string());
    pkg_logging::init(&log_file)?;
    if let Some(e) = cfg_err {
        error!("Config file {} ignored, using defaults: {:#}", cli.config, e);
    }
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let api_server = cli
        .api_server
        .or(file_cfg.api_server)
        .unwrap_or_else(|| DEFAULT_API_SERVER.to_string());
    let bridge = file_cfg
        .bridge
        .unwrap_or_else(|| DEFAULT_BRIDGE.to_string());
    let group_base = file_cfg.group_base.unwrap_or(GROUP_ID_BASE);
    let debounce = Duration::from_millis(file_cfg.debounce_ms.unwrap_or(SERVICE_DEBOUNCE_MS));
    let retry = Duration::from_secs(file_cfg.watch_retry_secs.unwrap_or(WATCH_RETRY_SECS));

    info!("Starting kovs-controller");
    info!("  API server: {}", api_server);
    info!(
        "  Namespace:  {}",
        file_cfg.namespace.as_deref().unwrap_or("(all)")
    );
    info!("  Bridge:     {}", bridge);
    info!("  Group base: {}", group_base);

    let client = match connect(&api_server) {
        Ok(client) => client,
        Err(e) => {
            error!("Invalid API server {}: {:#}", api_server, e);
            return Err(e);
        }
    };
    let controller = ServiceController::new(Switch::new(Arc::new(SystemRunner), bridge))
        .with_group_base(group_base)
        .with_debounce(debounce)
        .with_watch_retry(retry);

    if let Err(e) = controller.start(client, file_cfg.namespace).await {
        error!("ServiceController task ended: {}", e);
    }
    Ok(())
}
