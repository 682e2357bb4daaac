#![forbid(unsafe_code)]

//! `adt-locksmith` — run lock-safe edit chains against an ADT server.
//!
//! Each invocation binds to one persisted session (`--session`, generated
//! when omitted) so that a lock acquired here can be written through and
//! released by a later invocation.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use adt_locksmith::config::GlobalConfig;
use adt_locksmith::connection::http::HttpConnection;
use adt_locksmith::logging::{init_tracing, LogFormat};
use adt_locksmith::models::lock::ObjectKind;
use adt_locksmith::models::session::Session;
use adt_locksmith::objects::adt::AdtObjectOps;
use adt_locksmith::objects::ObjectRef;
use adt_locksmith::orchestrator::state::Step;
use adt_locksmith::orchestrator::{ChainOptions, ForceUnlockOutcome, Orchestrator};
use adt_locksmith::persistence::db;
use adt_locksmith::persistence::lock_registry::LockRegistry;
use adt_locksmith::persistence::session_store::SessionStore;
use adt_locksmith::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "adt-locksmith",
    about = "Lock-safe object edit chains against an ADT server",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session to bind to; a new one is generated when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Override the session directory.
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Override the lock registry directory.
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

/// Object addressed by a command.
#[derive(Debug, Args)]
struct ObjectArgs {
    /// Object kind, e.g. `class`, `program`, `function_module`.
    kind: ObjectKind,

    /// Object name.
    name: String,

    /// Parent container (function group for function modules).
    #[arg(long)]
    sub_key: Option<String>,
}

impl ObjectArgs {
    fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, &self.name).with_sub_key(self.sub_key.as_deref())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Acquire and record the edit lock, leaving it held.
    Lock {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Release a lock recorded earlier by this session.
    Unlock {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Write source under a lock recorded earlier by this session.
    Write {
        #[command(flatten)]
        object: ObjectArgs,
        /// File containing the new source.
        #[arg(long)]
        source: PathBuf,
    },

    /// Lock, write, unlock and activate in one chain.
    #[command(alias = "edit")]
    Update {
        #[command(flatten)]
        object: ObjectArgs,
        /// File containing the new source.
        #[arg(long)]
        source: PathBuf,
        /// Skip activation.
        #[arg(long)]
        no_activate: bool,
    },

    /// Create the object, then write and activate its source.
    Create {
        #[command(flatten)]
        object: ObjectArgs,
        /// Package to create the object in.
        #[arg(long)]
        package: Option<String>,
        /// Short description.
        #[arg(long)]
        description: Option<String>,
        /// File containing the object description sent on create.
        #[arg(long)]
        definition: Option<PathBuf>,
        /// File containing the initial source.
        #[arg(long)]
        source: PathBuf,
        /// Skip activation.
        #[arg(long)]
        no_activate: bool,
        /// Delete the object again if a later step fails.
        #[arg(long)]
        delete_on_failure: bool,
    },

    /// Check and delete the object.
    Delete {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Activate the object.
    Activate {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Release any known lock on the object and clear its bookkeeping.
    ForceUnlock {
        #[command(flatten)]
        object: ObjectArgs,
    },
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
            if let Some(status) = err.http_status() {
                eprintln!("remote status: {status}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default_for(None),
    };
    config.apply_env();
    if let Some(dir) = args.session_dir {
        config.storage.session_dir = Some(dir);
    }
    if let Some(dir) = args.lock_dir {
        config.storage.lock_dir = Some(dir);
    }
    config.require_base_url()?;
    config.load_credentials().await?;

    // ── Bind session and registry ───────────────────────
    let store = SessionStore::new(config.session_dir());
    let session_id = args.session.unwrap_or_else(Session::generate_id);
    let session = store.open_or_create(&session_id)?;
    let registry = LockRegistry::new(Arc::new(db::connect(&config.lock_db_path()).await?));
    let conn = Arc::new(HttpConnection::new(&config, store, session)?);
    info!(%session_id, "session bound");

    let base_options = ChainOptions::from_config(&config);
    let orchestrator = |object: ObjectRef, options: ChainOptions| -> Result<_> {
        Ok(Orchestrator::new(
            Arc::clone(&conn),
            AdtObjectOps::new()?,
            registry.clone(),
            object,
        )
        .with_options(options))
    };

    match args.command {
        Command::Lock { object } => {
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            let handle = chain
                .lock()
                .await
                .map_err(|err| chain.step_failure(Step::Lock, err))?;
            println!("locked {} (session {session_id}, handle {handle})", chain.object());
        }
        Command::Unlock { object } => {
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            chain
                .resume_lock()
                .await
                .map_err(|err| chain.step_failure(Step::Lock, err))?;
            chain
                .unlock()
                .await
                .map_err(|err| chain.step_failure(Step::Unlock, err))?;
            println!("unlocked {}", chain.object());
        }
        Command::Write { object, source } => {
            let source = read_file(&source)?;
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            chain.run_write(&source).await?;
            println!("wrote {} (lock still held by session {session_id})", chain.object());
        }
        Command::Update {
            object,
            source,
            no_activate,
        } => {
            let source = read_file(&source)?;
            let options = ChainOptions {
                activate: base_options.activate && !no_activate,
                ..base_options
            };
            let mut chain = orchestrator(object.object_ref(), options)?;
            chain.run_update(&source).await?;
            report_warnings(&chain.state().warnings);
            println!("updated {}", chain.object());
        }
        Command::Create {
            object,
            package,
            description,
            definition,
            source,
            no_activate,
            delete_on_failure,
        } => {
            let definition = definition.as_deref().map(read_file).transpose()?;
            let source = read_file(&source)?;
            let options = ChainOptions {
                activate: base_options.activate && !no_activate,
                delete_on_failure: base_options.delete_on_failure || delete_on_failure,
                ..base_options
            };
            let object = object
                .object_ref()
                .with_package(package.as_deref())
                .with_description(description.as_deref());
            let mut chain = orchestrator(object, options)?;
            chain.run_create(definition.as_deref(), &source).await?;
            report_warnings(&chain.state().warnings);
            println!("created {}", chain.object());
        }
        Command::Delete { object } => {
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            chain.run_delete().await?;
            println!("deleted {}", chain.object());
        }
        Command::Activate { object } => {
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            chain
                .activate()
                .await
                .map_err(|err| chain.step_failure(Step::Activate, err))?;
            println!("activated {}", chain.object());
        }
        Command::ForceUnlock { object } => {
            let mut chain = orchestrator(object.object_ref(), base_options)?;
            match chain.force_unlock().await? {
                ForceUnlockOutcome::NothingHeld => println!("no lock known for {}", chain.object()),
                ForceUnlockOutcome::Unlocked => println!("unlocked {}", chain.object()),
                ForceUnlockOutcome::UnlockFailed(reason) => println!(
                    "remote unlock of {} failed ({reason}); local bookkeeping cleared",
                    chain.object()
                ),
            }
        }
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

fn report_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}
