//! pgasctl - Node Wrapper for the PGAS Runtime
//!
//! Brings up one node from a cluster configuration file and exercises the
//! runtime: configuration inspection, a local self-test, an ensemble
//! barrier, and the tuning profile table.
//!
//! Exit codes: 0 on success, 1 on configuration or initialization failure,
//! 2 when peer bring-up yields zero connections.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pgas::PgasError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// pgasctl - bring up and exercise a PGAS node
#[derive(Parser, Debug)]
#[command(name = "pgasctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Node wrapper for the PGAS runtime", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, env = "PGASCTL_VERBOSE")]
    verbose: bool,

    /// Path to the cluster configuration file
    #[arg(short, long, global = true, env = "PGAS_CONFIG")]
    config: Option<PathBuf>,

    /// Disable color output
    #[arg(long, global = true, env = "PGASCTL_NO_COLOR")]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the parsed node table without bringing up the ensemble
    Info,

    /// Bring up the node, run a local round-trip check, and dump statistics
    Selftest(SelftestCommand),

    /// Bring up the node and synchronize with every active peer
    Barrier,

    /// Measure local bandwidth and small-op latency
    Bench(BenchCommand),

    /// Print the named tuning profiles
    Profiles {
        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },
}

/// Arguments for the selftest subcommand.
#[derive(Parser, Debug)]
struct SelftestCommand {
    /// Bytes to allocate and round-trip
    #[arg(short, long, default_value_t = 4096)]
    size: usize,

    /// Participate in a closing barrier (multi-node runs)
    #[arg(long)]
    barrier: bool,
}

/// Arguments for the bench subcommand.
#[derive(Parser, Debug)]
struct BenchCommand {
    /// Tuning profile to install before measuring
    #[arg(short, long)]
    profile: Option<String>,

    /// Megabytes transferred for the bandwidth phase
    #[arg(long, default_value_t = 64)]
    size_mb: usize,

    /// Put/get pairs for the latency phase
    #[arg(long, default_value_t = 10_000)]
    iterations: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.no_color) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_logging(verbose: bool, no_color: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = fmt::layer()
        .with_ansi(!no_color)
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Info => commands::run_info(require_config(cli.config)?),
        Commands::Selftest(args) => {
            commands::run_selftest(require_config(cli.config)?, args.size, args.barrier)
        }
        Commands::Barrier => commands::run_barrier(require_config(cli.config)?),
        Commands::Bench(args) => {
            let profile = args
                .profile
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            commands::run_bench(
                require_config(cli.config)?,
                profile,
                args.size_mb,
                args.iterations,
            )
        }
        Commands::Profiles { json } => commands::run_profiles(json),
    }
}

fn require_config(config: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    config.ok_or_else(|| {
        anyhow::anyhow!(PgasError::Config(
            "no configuration file given (use --config or PGAS_CONFIG)".to_string()
        ))
    })
}

/// Map failure kinds onto wrapper exit codes
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PgasError>() {
        Some(PgasError::ConnectIncomplete { .. }) => 2,
        _ => 1,
    }
}
