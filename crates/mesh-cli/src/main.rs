//! mesh: ops CLI for the DuckMesh pipeline.
//!
//! Exit codes: 0 success, 2 usage (clap), 3 transient (retry is reasonable),
//! 4 poison / integrity failure (human required).

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "mesh")]
#[command(about = "DuckMesh ops CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands (relational bus backend)
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Queue lag for one tenant
    Lag {
        #[arg(long)]
        tenant: String,
    },

    /// Requeue expired claims (lease reaper pass)
    RequeueExpired,

    /// Integrity run for one tenant: per-table checksums under a pinned
    /// snapshot, verified against the checksum ledger
    Integrity {
        #[arg(long)]
        tenant: String,
        /// Checksum ledger file (created on the first run)
        #[arg(long, default_value = "mesh_ledger.jsonl")]
        ledger: String,
    },

    /// Verify a checksum ledger's hash chain
    LedgerVerify {
        #[arg(long)]
        path: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status => commands::db::status().await,
            DbCmd::Migrate => commands::db::migrate().await,
        },
        Commands::ConfigHash { paths } => commands::ops::config_hash(&paths),
        Commands::Lag { tenant } => commands::ops::lag(&tenant).await,
        Commands::RequeueExpired => commands::ops::requeue_expired().await,
        Commands::Integrity { tenant, ledger } => {
            commands::ops::integrity(&tenant, &ledger).await
        }
        Commands::LedgerVerify { path } => commands::ops::ledger_verify(&path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::exit_code_for(&e))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
