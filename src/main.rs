//! capstan - coordination agent for multi-container build jobs.
//!
//! The same binary serves both sides of the coordination protocol:
//! `capstan runner` hosts the in-workload coordination server, and
//! `capstan exec` wraps a container payload as a coordinated participant.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use capstan::agent::SHUTDOWN_EXIT_CODE;
use capstan::agent::exec::{self, ExecConfig};
use capstan::runner::{DEFAULT_SOCKET_PATH, Runner, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "capstan", about = "Coordination agent for multi-container build jobs")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the in-workload coordination server.
    Runner(RunnerArgs),

    /// Run a payload as a coordinated participant (inside a container).
    Exec(ExecArgs),
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Socket path to listen on.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Number of expected participants.
    #[arg(short, long)]
    participants: usize,

    /// Environment variable holding the access token handed to participants.
    #[arg(long, default_value = "BUILDKITE_AGENT_TOKEN")]
    access_token_env: String,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Participant ID assigned at workload construction.
    #[arg(long, env = "BUILDKITE_CONTAINER_ID")]
    id: u32,

    /// Coordination socket path.
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Payload command to run once cleared.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "capstan=debug" } else { "capstan=info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(command: Command) -> Result<i32> {
    match command {
        Command::Runner(args) => run_runner(args).await,
        Command::Exec(args) => run_exec(args).await,
    }
}

async fn run_runner(args: RunnerArgs) -> Result<i32> {
    let access_token = std::env::var(&args.access_token_env).unwrap_or_default();
    let runner = Arc::new(Runner::new(
        RunnerConfig {
            socket_path: args
                .socket
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            participant_count: args.participants,
            access_token,
        },
        Box::new(tokio::io::stdout()),
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    Arc::clone(&runner).run(shutdown.clone()).await?;

    let status = runner.wait_status().await;
    Ok(if status.exit_code != 0 {
        status.exit_code
    } else if shutdown.is_cancelled() {
        SHUTDOWN_EXIT_CODE
    } else {
        0
    })
}

async fn run_exec(args: ExecArgs) -> Result<i32> {
    let conf = ExecConfig {
        id: args.id,
        socket_path: args
            .socket
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
        command: args.command,
    };
    let status = exec::run(conf).await?;
    Ok(status.exit_code)
}
