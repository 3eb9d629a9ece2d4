mod collectives;
mod common;
mod cycles;
mod events;
mod output;
mod recovery;
mod volume;

use clap::{Parser, Subcommand, ValueEnum};
use cohort_communicator::{Family, RunConfig, TransportConfig};
use common::Launch;
use events::{emit, EventStarted};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "cohort-stress", about = "Stress and soak tests for the Cohort communicator")]
struct Cli {
    /// Players to start in this process.
    #[arg(short, long, default_value = "3")]
    players: usize,

    /// Join a group described by COHORT_* variables as a single player
    /// instead of starting all players here.
    #[arg(long)]
    from_env: bool,

    /// Socket family for in-process groups.
    #[arg(long, value_enum, default_value = "tcp")]
    family: FamilyArg,

    /// Operation timeout in seconds for in-process groups
    /// (COHORT_TIMEOUT applies with --from-env).
    #[arg(long, default_value = "10")]
    timeout: f64,

    /// Max frame payload in bytes.
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Also write JSONL events to a file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    Tcp,
    File,
}

#[derive(Subcommand)]
enum Command {
    /// Form and stop a group repeatedly.
    Cycles {
        #[arg(long, default_value = "100")]
        count: u32,
    },

    /// Send N messages between every ordered pair and verify counts and
    /// order.
    Volume {
        /// Messages per ordered pair.
        #[arg(long, default_value = "1000")]
        messages: u32,
        /// Payload size in bytes.
        #[arg(long, default_value = "64")]
        payload_size: usize,
    },

    /// Run every collective for a number of timed rounds.
    Collectives {
        #[arg(long, default_value = "10")]
        rounds: u32,
    },

    /// One player goes silent; the rest revoke and shrink.
    Recovery {
        /// Rank that goes silent (default: the last rank).
        #[arg(long)]
        silent: Option<usize>,
        /// Failure detection timeout in seconds.
        #[arg(long, default_value = "2")]
        detect_timeout: f64,
    },
}

impl Command {
    fn mode(&self) -> &'static str {
        match self {
            Command::Cycles { .. } => "cycles",
            Command::Volume { .. } => "volume",
            Command::Collectives { .. } => "collectives",
            Command::Recovery { .. } => "recovery",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let mode = cli.command.mode();

    let rank = if cli.from_env {
        std::env::var("COHORT_RANK").ok().and_then(|r| r.parse().ok())
    } else {
        None
    };
    if let Some(dir) = &cli.output_dir {
        let path = output::event_file_path(dir, mode, rank)?;
        output::open_event_file(&path)?;
        eprintln!("Events: {}", path.display());
    }

    let launch_mode = if cli.from_env {
        Launch::FromEnv
    } else {
        let mut transport = TransportConfig::new();
        if let Some(max) = cli.max_frame_size {
            transport = transport.max_frame_size(max);
        }
        let family = match cli.family {
            FamilyArg::Tcp => Family::Tcp,
            FamilyArg::File => Family::File,
        };
        Launch::Local(
            RunConfig::new(cli.players)
                .name(format!("stress-{mode}"))
                .timeout(seconds(cli.timeout)?)
                .family(family)
                .transport(transport),
        )
    };

    eprintln!("cohort-stress v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(mode, launch = launch_mode.label(), players = cli.players, "starting");
    emit(&EventStarted::new(mode, launch_mode.label(), cli.players));

    let failed = match cli.command {
        Command::Cycles { count } => {
            cycles::run(launch_mode, cycles::CyclesConfig { count }, start).await?
        }
        Command::Volume {
            messages,
            payload_size,
        } => {
            volume::run(
                launch_mode,
                volume::VolumeConfig {
                    messages,
                    payload_size,
                },
                start,
            )
            .await?
        }
        Command::Collectives { rounds } => {
            collectives::run(launch_mode, collectives::CollectivesConfig { rounds }, start).await?
        }
        Command::Recovery {
            silent,
            detect_timeout,
        } => {
            recovery::run(
                launch_mode,
                recovery::RecoveryConfig {
                    silent,
                    detect_timeout: seconds(detect_timeout)?,
                },
                start,
            )
            .await?
        }
    };

    tracing::info!(mode, failed, elapsed_s = start.elapsed().as_secs_f64(), "finished");
    if failed > 0 {
        anyhow::bail!("{mode}: {failed} failed");
    }
    Ok(())
}

fn seconds(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow::anyhow!("invalid duration {value}: {e}"))
}
