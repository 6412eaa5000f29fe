//! mailferry: Microsoft 365 to IMAP mailbox migration
//!
//! Migrates full mailbox contents from an Exchange Online tenant (via the
//! Graph mail API) to a Dovecot-style IMAP server in two resumable stages:
//! `download` streams raw MIME into a local tree, `upload` replays that
//! tree over IMAP with per-message deduplication. A file-backed state
//! store makes both stages idempotent across interruptions.
//!
//! # Architecture
//!
//! - [`config`]: YAML configuration, layout, and permission enforcement
//! - [`errors`]: application error model and exit-code mapping
//! - [`state`]: counters, message-state cache, markers, advisory locks
//! - [`graph`]: Graph REST source client with pagination and throttling
//! - [`imap`]: IMAP target client over TLS
//! - [`message`]: identity keys and integrity checks
//! - [`walker`]: depth-capped source and local folder traversal
//! - [`pipeline`]: per-message upload state machine
//! - [`scheduler`]: bounded parallel work dispatch
//! - [`driver`]: stage orchestration and summaries

mod config;
mod driver;
mod errors;
mod graph;
mod imap;
mod message;
mod pipeline;
mod scheduler;
mod state;
mod walker;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{AccountsFile, Layout, SystemConfig};
use driver::{Driver, Stage};

#[derive(Parser)]
#[command(name = "mailferry", version)]
#[command(about = "Migrate Microsoft 365 mailboxes to an IMAP server")]
struct Args {
    /// Directory holding system_config.yaml and accounts.yaml
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Skip messages whose local copy already exists (download)
    #[arg(long)]
    resume: bool,

    /// Transfer regardless of local copies and dedup caches
    #[arg(long)]
    force: bool,

    /// Clear all migration state before the stage runs
    #[arg(long)]
    reset: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check configuration permissions and both server logins
    Verify,
    /// Download all folders and messages from the source mailboxes
    Download,
    /// Upload the local message tree to the target server
    Upload,
    /// Show counters and per-folder progress
    Status,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let layout = Layout::from_config_dir(&args.config);
    let log_guard = init_tracing(&layout);

    let code = run(args, layout).await;
    drop(log_guard);
    std::process::exit(code);
}

async fn run(args: Args, layout: Layout) -> i32 {
    // reject loose permissions before any credential is read
    if let Err(err) = config::check_config_permissions(&layout) {
        error!("{err}");
        return err.exit_code();
    }
    let system = match SystemConfig::load(&layout.system_config_path()) {
        Ok(system) => system,
        Err(err) => {
            error!("{err}");
            return err.exit_code();
        }
    };
    let accounts = match AccountsFile::load(&layout.accounts_path()) {
        Ok(accounts) => accounts,
        Err(err) => {
            error!("{err}");
            return err.exit_code();
        }
    };

    let stage = match args.command {
        Command::Verify => Stage::Verify,
        Command::Download => Stage::Download,
        Command::Upload => Stage::Upload,
        Command::Status => Stage::Status,
    };
    Driver::new(layout, system, accounts, args.resume, args.force)
        .run(stage, args.reset)
        .await
}

/// Console layer on stderr plus a non-blocking file layer in `logs/`
///
/// The returned guard flushes the file writer on drop; hold it for the
/// process lifetime.
fn init_tracing(layout: &Layout) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let logs_dir = layout.logs_dir();

    if std::fs::create_dir_all(&logs_dir).is_ok() {
        let file = tracing_appender::rolling::never(&logs_dir, "migration.log");
        let (writer, guard) = tracing_appender::non_blocking(file);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}
