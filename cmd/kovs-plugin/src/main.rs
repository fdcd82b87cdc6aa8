use clap::{Args, Parser, Subcommand};
use pkg_constants::network::{DOCKER_BRIDGE, UPLINK_POOL_SIZE, UPLINK_PREFIX};
use pkg_constants::ovs::DEFAULT_BRIDGE;
use pkg_constants::paths::{DEFAULT_PLUGIN_CONFIG, DEFAULT_PLUGIN_LOCK, DEFAULT_PLUGIN_LOG};
use pkg_exec::{StepReport, SystemRunner};
use pkg_network::{AttachConfig, Attacher, PodRef};
use pkg_types::config::{PluginConfigFile, load_config_or_default};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kovs-plugin", about = "kovs pod network attachment plugin")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, env = "KOVS_PLUGIN_CONFIG", default_value = DEFAULT_PLUGIN_CONFIG)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recreate the switch pipeline (or the ipvlan taps)
    Init,
    /// Log the request; nothing else
    Status(PodArgs),
    /// Attach a pod to a free uplink
    Setup(PodArgs),
    /// Release a pod's uplink
    Teardown(PodArgs),
}

#[derive(Args, Debug)]
struct PodArgs {
    namespace: String,
    pod: String,
    container_id: String,
}

impl From<PodArgs> for PodRef {
    fn from(args: PodArgs) -> Self {
        PodRef {
            namespace: args.namespace,
            name: args.pod,
            container_id: args.container_id,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (defaults if missing or unreadable)
    let (file_cfg, cfg_err) = load_config_or_default::<PluginConfigFile>(&cli.config);
    let log_file = file_cfg
        .log_file
        .clone()
        .unwrap_or_else(|| DEFAULT_PLUGIN_LOG.to_string());
    pkg_logging::init(&log_file)?;
    if let Some(e) = cfg_err {
        error!("Config file {} ignored, using defaults: {:#}", cli.config, e);
    }

    // Merge: config file > defaults
    let config = AttachConfig {
        bridge: file_cfg.bridge.unwrap_or_else(|| DEFAULT_BRIDGE.to_string()),
        docker_bridge: file_cfg
            .docker_bridge
            .unwrap_or_else(|| DOCKER_BRIDGE.to_string()),
        uplink_count: file_cfg.uplink_count.unwrap_or(UPLINK_POOL_SIZE),
        uplink_prefix: file_cfg
            .uplink_prefix
            .unwrap_or_else(|| UPLINK_PREFIX.to_string()),
        mode: file_cfg.mode.unwrap_or_default(),
        lock_file: PathBuf::from(
            file_cfg
                .lock_file
                .unwrap_or_else(|| DEFAULT_PLUGIN_LOCK.to_string()),
        ),
    };
    let strict_exit = file_cfg.strict_exit.unwrap_or(false);

    let attacher = Attacher::new(config, Arc::new(SystemRunner));
    let outcome: anyhow::Result<StepReport> = match cli.command {
        Command::Init => Ok(attacher.init().await),
        Command::Status(args) => Ok(attacher.status(&args.into())),
        Command::Setup(args) => attacher.setup(&args.into()).await.map(|(attachment, report)| {
            info!(
                "Pod {} attached: veth={:?} port={:?} uplink={}",
                attachment.container_id,
                attachment.host_veth,
                attachment.veth_ofport,
                attachment.uplink
            );
            report
        }),
        Command::Teardown(args) => attacher.teardown(&args.into()).await,
    };

    let failed = match outcome {
        Ok(report) if report.is_clean() => {
            info!("Done: {} commands succeeded", report.attempted);
            false
        }
        Ok(report) => {
            error!(
                "Done with errors: {} of {} commands failed",
                report.failed, report.attempted
            );
            true
        }
        Err(e) => {
            error!("Aborted: {:#}", e);
            true
        }
    };

    if failed && strict_exit {
        std::process::exit(1);
    }
    Ok(())
}
