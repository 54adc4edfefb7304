use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use granel_gateway::db::{self, JobRepo};
use granel_gateway::devices::DeviceRegistry;
use granel_gateway::orders::{self, OrderPayload};
use granel_gateway::queue::{ALL_QUEUES, INTAKE_QUEUE, JobQueue};
use granel_gateway::{Config, Daemon};

/// Granel - backend for bulk-material dispensing machines
#[derive(Parser)]
#[command(name = "granel", version, about)]
struct Cli {
    /// Configuration file (defaults to ~/.config/granel/config.toml)
    #[arg(short, long, env = "GRANEL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backend (default)
    Run,
    /// Queue an order for a running backend
    Order {
        /// Product identifier
        #[arg(short, long)]
        product: String,
        /// Target weight in grams
        #[arg(short, long)]
        weight: f64,
        /// Hopper identifier ending in its slot number (defaults to hopper-<product>)
        #[arg(long)]
        hopper: Option<String>,
    },
    /// List known devices
    Devices,
    /// List retained jobs
    Jobs {
        /// Only jobs of this queue
        #[arg(short, long)]
        queue: Option<String>,
        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,granel_gateway=info",
        1 => "info,granel_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(broker = %config.mqtt.host, "starting granel backend");
            Daemon::new(config)?.run().await?;
        }
        Command::Order {
            product,
            weight,
            hopper,
        } => cmd_order(&config, &product, weight, hopper.as_deref())?,
        Command::Devices => cmd_devices(&config)?,
        Command::Jobs { queue, limit } => cmd_jobs(&config, queue.as_deref(), limit)?,
    }

    Ok(())
}

fn cmd_order(
    config: &Config,
    product: &str,
    weight: f64,
    hopper: Option<&str>,
) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path)?;
    let order = OrderPayload::new(product, weight, hopper);
    let receipt = orders::enqueue_order(&JobQueue::new(INTAKE_QUEUE, pool), &order)?;

    println!("Order enqueued");
    let summary = serde_json::json!({
        "queue": receipt.queue,
        "jobId": receipt.job_id,
        "payload": order,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_devices(config: &Config) -> anyhow::Result<()> {
    let registry = DeviceRegistry::new(db::init(&config.db_path)?);
    let devices = registry.list()?;

    if devices.is_empty() {
        println!("No devices have been seen yet");
        return Ok(());
    }

    for device in devices {
        let rtt = device
            .last_ping_rtt_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        println!(
            "{:<38} {:<8} {:<16} {:<12} fw {:<10} rtt {:<6} seen {}",
            device.uuid,
            if device.online { "online" } else { "offline" },
            device.ip.as_deref().unwrap_or("-"),
            device.board_name,
            device.firmware_version,
            rtt,
            device.last_seen_online_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn cmd_jobs(config: &Config, queue: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let repo = JobRepo::new(db::init(&config.db_path)?);
    let names = queue.map_or_else(|| ALL_QUEUES.to_vec(), |q| vec![q]);
    for name in names {
        let counts = repo.counts(name)?;
        println!(
            "{name:<20} waiting {} | active {} | completed {} | failed {}",
            counts.waiting, counts.active, counts.completed, counts.failed
        );
    }
    println!();

    for job in repo.list(queue, limit)? {
        println!(
            "#{:<6} {:<20} {:<18} {:<10} attempts {} {}",
            job.id,
            job.queue,
            job.name,
            job.status,
            job.attempts,
            job.error.as_deref().unwrap_or_default(),
        );
    }
    Ok(())
}
