//! Entry point tying the reconciler and guardian to a config file and a
//! live Board (spec §6).
//!
//! Grounded on `agentor-cli/src/main.rs`'s `Cli`/`Commands` derive and its
//! read-config-then-dispatch `main`, trimmed to this system's two
//! long-running roles instead of a gateway server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use kb_board::client::JsonRpcBoard;
use kb_core::clock::SystemClock;
use kb_core::config::Config;
use kb_guardian::Guardian;
use kb_orchestrator::{Reconciler, TickOutcome};

#[derive(Parser)]
#[command(name = "kb", about = "Deterministic kanban reconciler")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "kb.toml")]
    config: PathBuf,

    /// Emit newline-delimited JSON logs instead of the default text format.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single tick and exit.
    Tick {
        /// Override the config's dry-run posture for this one tick.
        #[arg(long)]
        dry_run: Option<bool>,
    },
    /// Run the reconciler forever, ticking every `tickSeconds`.
    Run {
        #[arg(long)]
        dry_run: Option<bool>,
    },
    /// Run the guardian's heartbeat watch loop forever.
    Guardian,
    /// Print the persisted state document.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Pretty-print the current state document.
    Show,
}

const EXIT_OK: i32 = 0;
const EXIT_LOCK_CONTENTION: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.json_logs {
        kb_core::logging::init_json();
    } else {
        kb_core::logging::init();
    }

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "failed to load config");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let exit_code = match cli.command {
        Commands::Tick { dry_run } => run_single_tick(&config, dry_run).await,
        Commands::Run { dry_run } => run_forever(&config, dry_run).await,
        Commands::Guardian => run_guardian(&config).await,
        Commands::State { action } => match action {
            StateAction::Show => show_state(&config),
        },
    };

    std::process::exit(exit_code);
}

fn build_board(config: &Config) -> anyhow::Result<Arc<JsonRpcBoard>> {
    let password = config.board_password()?;
    Ok(Arc::new(JsonRpcBoard::with_timing(
        config.board_url.clone(),
        config.board_user.clone(),
        password,
        Duration::from_millis(config.board_call_timeout_ms),
        config.board_call_retries,
    )))
}

async fn run_single_tick(config: &Config, dry_run: Option<bool>) -> i32 {
    let board = match build_board(config) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to construct board client");
            return EXIT_CONFIG_ERROR;
        }
    };
    let reconciler = Reconciler::new(board, config.clone(), Arc::new(SystemClock));
    match reconciler.tick(dry_run).await {
        Ok(TickOutcome::LockContention) => {
            warn!("tick aborted: lock held by another process");
            EXIT_LOCK_CONTENTION
        }
        Ok(TickOutcome::Applied { actions_applied, errors }) => {
            info!(actions_applied, errors, "tick finished");
            EXIT_OK
        }
        Err(e) => {
            error!(error = %e, "tick failed");
            EXIT_OK
        }
    }
}

async fn run_forever(config: &Config, dry_run: Option<bool>) -> i32 {
    let board = match build_board(config) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to construct board client");
            return EXIT_CONFIG_ERROR;
        }
    };
    let reconciler = Reconciler::new(board, config.clone(), Arc::new(SystemClock));
    let period = Duration::from_secs(config.tick_seconds);

    loop {
        match reconciler.tick(dry_run).await {
            Ok(TickOutcome::LockContention) => {
                warn!("tick aborted: lock held by another process");
            }
            Ok(TickOutcome::Applied { actions_applied, errors }) => {
                info!(actions_applied, errors, "tick finished");
            }
            Err(e) => {
                error!(error = %e, "tick failed");
            }
        }
        tokio::time::sleep(period).await;
    }
}

async fn run_guardian(config: &Config) -> i32 {
    let guardian = Guardian::new(config);
    info!(check_ms = config.guardian_check_ms, "guardian watch loop starting");
    if let Err(e) = guardian.spawn_watch_loop().await {
        error!(error = %e, "guardian watch loop exited unexpectedly");
        return EXIT_CONFIG_ERROR;
    }
    EXIT_OK
}

fn show_state(config: &Config) -> i32 {
    let store = kb_orchestrator::StateStore::new(config.state_root.join("state.json"));
    let state = store.load();
    match serde_json::to_string_pretty(&state) {
        Ok(json) => {
            println!("{json}");
            EXIT_OK
        }
        Err(e) => {
            error!(error = %e, "failed to serialize state document");
            EXIT_CONFIG_ERROR
        }
    }
}
