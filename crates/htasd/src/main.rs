use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use htas_cloud::CommandProvider;
use htas_cluster::{Checkpointer, DisabledCheckpointer};
use htas_core::{HtasConfig, PoolPolicy};
use htas_kube::KubeOrchestrator;
use htas_state::StateStore;
use htasd::simulate::{self, Seed};
use htasd::{Collaborators, ControlPlane};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "htasd", about = "Heterogeneity-aware task scheduler and autoscaler daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "htas.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run against Kubernetes and the configured cloud commands.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/htas")]
        data_dir: PathBuf,

        /// API port (overrides `[api] port`).
        #[arg(long)]
        api_port: Option<u16>,
    },
    /// Run every loop against an in-memory simulated cluster.
    Simulate {
        /// API port (overrides `[api] port`).
        #[arg(long)]
        api_port: Option<u16>,

        /// Batch jobs submitted at start.
        #[arg(long, default_value = "0")]
        batch_jobs: u32,

        /// Long-running services submitted at start.
        #[arg(long, default_value = "0")]
        services: u32,
    },
    /// Validate the configuration and print the resolved policy.
    CheckConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,htasd=debug,htas=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = HtasConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Run { data_dir, api_port } => run(config, data_dir, api_port).await,
        Command::Simulate {
            api_port,
            batch_jobs,
            services,
        } => {
            let port = api_port.unwrap_or(config.api.port);
            info!(batch_jobs, services, "HTAS daemon starting in simulation mode");
            let (plane, _sim) = simulate::build(&config, Seed { batch_jobs, services }).await?;
            plane.serve(port).await
        }
        Command::CheckConfig => check_config(&config),
    }
}

async fn run(config: HtasConfig, data_dir: PathBuf, api_port: Option<u16>) -> anyhow::Result<()> {
    info!("HTAS daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("htas.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let orchestrator = Arc::new(KubeOrchestrator::connect(config.kube.clone()).await?);
    let provider = Arc::new(CommandProvider::new(&config.cloud));
    let checkpointer: Arc<dyn Checkpointer> = if provider.can_checkpoint() {
        provider.clone()
    } else {
        warn!("no checkpoint/restore commands configured, migrations fall back to eviction");
        Arc::new(DisabledCheckpointer)
    };

    let plane = ControlPlane::new(
        store,
        &config,
        Collaborators {
            orchestrator,
            cloud: provider,
            checkpointer,
        },
    );
    plane.serve(api_port.unwrap_or(config.api.port)).await
}

fn check_config(config: &HtasConfig) -> anyhow::Result<()> {
    let policy = PoolPolicy::from_config(config);
    println!("{}", config.to_toml_string()?);
    println!("# resolved pools");
    for pool in policy.pools() {
        println!(
            "# {:<20} {:<13} nodes {}..={}",
            pool.name,
            pool.workload.as_str(),
            pool.min_nodes,
            pool.max_nodes
        );
        for t in policy.instance_types_for(&pool.name) {
            println!(
                "#   {:<18} {:>12} ${:.4}/h  {:.4} per unit",
                t.name,
                t.capacity.to_string(),
                t.hourly_cost,
                policy.cost_per_unit(t)
            );
        }
    }
    println!(
        "# drain below {:.0}% for {} samples, keep remaining nodes under {:.0}%",
        policy.drain_low_water * 100.0,
        policy.sustained_samples,
        policy.autoscale_high_water * 100.0
    );
    Ok(())
}
