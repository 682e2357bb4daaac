#![forbid(unsafe_code)]

//! `adt-locksmith-ctl` — inspect and clean up local session and lock
//! bookkeeping.
//!
//! Never talks to the remote server. Removing a lock record here does not
//! release the lock on the server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};

use adt_locksmith::config::GlobalConfig;
use adt_locksmith::logging::{init_tracing, LogFormat};
use adt_locksmith::models::lock::{truncate_handle, LockKey, LockRecord, ObjectKind};
use adt_locksmith::persistence::db;
use adt_locksmith::persistence::lock_registry::LockRegistry;
use adt_locksmith::persistence::session_store::SessionStore;
use adt_locksmith::persistence::sweeper::Sweeper;
use adt_locksmith::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "adt-locksmith-ctl",
    about = "Inspect and clean up adt-locksmith sessions and lock records",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the session directory.
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Override the lock registry directory.
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Override the staleness threshold in seconds.
    #[arg(long)]
    stale_after_seconds: Option<u64>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Session records.
    #[command(subcommand)]
    Sessions(SessionCommand),

    /// Lock records.
    #[command(subcommand)]
    Locks(LockCommand),
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// List session ids with age and owner.
    List,

    /// Show one session record (credentials redacted).
    Inspect {
        /// Session id.
        id: String,
    },

    /// Remove sessions that are stale or whose owning process has exited.
    Cleanup {
        /// Only remove sessions whose owning process has exited.
        #[arg(long, conflicts_with = "stale_only")]
        dead_only: bool,
        /// Only remove sessions older than the threshold.
        #[arg(long)]
        stale_only: bool,
    },

    /// Remove every session record.
    Clear,
}

#[derive(Debug, Subcommand)]
enum LockCommand {
    /// List recorded locks.
    List,

    /// Forget one lock record without unlocking remotely.
    Forget {
        /// Object kind.
        kind: ObjectKind,
        /// Object name.
        name: String,
        /// Parent container (function group for function modules).
        #[arg(long)]
        sub_key: Option<String>,
    },

    /// Forget lock records that are stale or whose session is gone.
    Cleanup,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(dir) = args.session_dir {
        config.storage.session_dir = Some(dir);
    }
    if let Some(dir) = args.lock_dir {
        config.storage.lock_dir = Some(dir);
    }
    if let Some(seconds) = args.stale_after_seconds {
        if seconds == 0 {
            return Err(AppError::Config(
                "stale_after_seconds must be greater than zero".into(),
            ));
        }
        config.storage.stale_after_seconds = seconds;
    }

    let store = SessionStore::new(config.session_dir());
    let registry = LockRegistry::new(Arc::new(db::connect(&config.lock_db_path()).await?));
    let sweeper = Sweeper::new(store.clone(), registry.clone(), config.stale_after());

    match args.command {
        Command::Sessions(command) => sessions(command, &store, &sweeper),
        Command::Locks(command) => locks(command, &registry, &sweeper).await,
    }
}

fn sessions(command: SessionCommand, store: &SessionStore, sweeper: &Sweeper) -> Result<()> {
    match command {
        SessionCommand::List => {
            for id in store.list()? {
                match store.metadata(&id) {
                    Ok(Some(meta)) => println!(
                        "{id}\tpid {}\tage {}s\tcreated {}",
                        meta.owner_pid,
                        meta.age_millis / 1000,
                        meta.created_at.to_rfc3339()
                    ),
                    Ok(None) => {}
                    Err(err) => println!("{id}\tunreadable: {err}"),
                }
            }
        }
        SessionCommand::Inspect { id } => {
            let session = store
                .load(&id)?
                .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
            let view = serde_json::json!({
                "session_id": session.session_id,
                "created_at": session.created_at.to_rfc3339(),
                "updated_at": session.updated_at.to_rfc3339(),
                "owner_pid": session.owner_pid,
                "age_millis": session.age_millis(Utc::now()),
                "cookie_names": session.cookie_store.keys().collect::<Vec<_>>(),
                "has_csrf_token": session.csrf_token.is_some(),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        SessionCommand::Cleanup {
            dead_only,
            stale_only,
        } => {
            let mut removed = Vec::new();
            if !stale_only {
                removed.extend(sweeper.sweep_dead_process_sessions()?);
            }
            if !dead_only {
                removed.extend(sweeper.sweep_stale_sessions()?);
            }
            println!("removed {} session(s)", removed.len());
            for id in removed {
                println!("  {id}");
            }
        }
        SessionCommand::Clear => {
            let removed = store.clear()?;
            println!("removed {removed} session(s)");
        }
    }
    Ok(())
}

async fn locks(command: LockCommand, registry: &LockRegistry, sweeper: &Sweeper) -> Result<()> {
    match command {
        LockCommand::List => {
            for record in registry.list_locks().await? {
                print_lock(&record);
            }
        }
        LockCommand::Forget {
            kind,
            name,
            sub_key,
        } => {
            let key = LockKey::new(kind, &name, sub_key.as_deref());
            if registry.get(&key).await?.is_none() {
                return Err(AppError::NotFound(format!("no lock recorded for {key}")));
            }
            registry.remove(&key).await?;
            println!("forgot {key}; the server may still hold the lock");
        }
        LockCommand::Cleanup => {
            let mut removed = sweeper.sweep_stale_locks().await?;
            removed.extend(sweeper.sweep_orphaned_locks().await?);
            println!("forgot {} lock record(s)", removed.len());
            for record in &removed {
                print_lock(record);
            }
        }
    }
    Ok(())
}

fn print_lock(record: &LockRecord) {
    println!(
        "{}\tsession {}\thandle {}\tacquired {}",
        record.key(),
        record.session_id,
        truncate_handle(&record.lock_handle),
        record.acquired_at.to_rfc3339()
    );
}
