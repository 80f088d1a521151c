use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use songbird_core::config::{resolve_settings, SongbirdConfig};
use songbird_core::lock::{lock_path, CheckpointLock};
use songbird_core::{task_id, CheckpointError, CheckpointManager, RegisterPolicy, TaskStatus};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FAILURE_MESSAGE: &str = "Unknown error";

#[derive(Parser)]
#[command(
    name = "songbird-checkpoint",
    version,
    about = "Checkpointed task tracking for resumable recording sessions"
)]
struct Cli {
    /// Fail instead of starting empty when the checkpoint is malformed
    #[arg(long, global = true)]
    strict: bool,
    /// Hold an exclusive lock on <checkpoint>.lock while the command runs
    #[arg(long, global = true)]
    lock: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or load a checkpoint and persist it
    Init { checkpoint: PathBuf },
    /// Print true/false; exit 0 only when the task is COMPLETED
    #[command(name = "is_completed", alias = "is-completed")]
    IsCompleted {
        checkpoint: PathBuf,
        subject: String,
        variant: String,
        source: String,
    },
    /// Register a task as PENDING and print its id
    Register {
        checkpoint: PathBuf,
        subject: String,
        variant: String,
        source: String,
        output: String,
        /// Return the existing id untouched if the task is already registered
        #[arg(long, conflicts_with = "replace")]
        keep_existing: bool,
        /// Reset an already registered task to PENDING
        #[arg(long)]
        replace: bool,
    },
    /// Mark a task IN_PROGRESS
    Start { checkpoint: PathBuf, task_id: String },
    /// Mark a task COMPLETED
    Complete {
        checkpoint: PathBuf,
        task_id: String,
        /// Validator output to attach, as JSON
        #[arg(long)]
        validation: Option<String>,
    },
    /// Mark a task FAILED
    Fail {
        checkpoint: PathBuf,
        task_id: String,
        #[arg(default_value = DEFAULT_FAILURE_MESSAGE, allow_hyphen_values = true)]
        message: String,
    },
    /// Mark a task SKIPPED
    Skip { checkpoint: PathBuf, task_id: String },
    /// Print session statistics as JSON
    Summary {
        checkpoint: PathBuf,
        /// Print a human-readable summary instead of JSON
        #[arg(long)]
        text: bool,
    },
    /// Print one task record as JSON; exit 1 when it is not registered
    Show {
        checkpoint: PathBuf,
        subject: String,
        variant: String,
        source: String,
    },
    /// List FAILED tasks, one per line
    Failed { checkpoint: PathBuf },
    /// Return every FAILED task to PENDING and print how many changed
    #[command(name = "reset_failed", alias = "reset-failed")]
    ResetFailed { checkpoint: PathBuf },
    /// Write the pipe-delimited legacy progress file
    #[command(name = "export_legacy", alias = "export-legacy")]
    ExportLegacy { checkpoint: PathBuf, legacy: PathBuf },
    /// Print the id a task would get, without touching any checkpoint
    #[command(name = "task_id", alias = "task-id")]
    TaskId {
        subject: String,
        variant: String,
        source: String,
    },
}

struct Session {
    manager: CheckpointManager,
    _lock: Option<CheckpointLock>,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return usage_error(err),
    };
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SONGBIRD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .init();
}

/// Driver scripts read usage from stdout, so parse failures go there too.
fn usage_error(err: clap::Error) -> ExitCode {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
            ExitCode::SUCCESS
        }
        ErrorKind::InvalidSubcommand
        | ErrorKind::MissingSubcommand
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
            if err.kind() == ErrorKind::InvalidSubcommand {
                print!("{}", err.render());
            }
            println!("{}", Cli::command().render_help());
            ExitCode::FAILURE
        }
        _ => {
            print!("{}", err.render());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut flags = SongbirdConfig {
        strict_load: cli.strict.then_some(true),
        lock: cli.lock.then_some(true),
        ..SongbirdConfig::default()
    };

    match cli.command {
        Command::Init { checkpoint } => {
            let mut session = open_session(&checkpoint, flags)?;
            session.manager.save().context("save checkpoint")?;
            println!("Checkpoint initialized");
            Ok(ExitCode::SUCCESS)
        }
        Command::IsCompleted {
            checkpoint,
            subject,
            variant,
            source,
        } => {
            let session = open_session(&checkpoint, flags)?;
            let completed = session.manager.is_completed(&subject, &variant, &source);
            println!("{}", completed);
            Ok(exit_flag(completed))
        }
        Command::Register {
            checkpoint,
            subject,
            variant,
            source,
            output,
            keep_existing,
            replace,
        } => {
            if keep_existing {
                flags.register_policy = Some(RegisterPolicy::KeepExisting);
            } else if replace {
                flags.register_policy = Some(RegisterPolicy::Replace);
            }
            let mut session = open_session(&checkpoint, flags)?;
            let id = session
                .manager
                .register_task(&subject, &variant, &source, &output)
                .context("register task")?;
            println!("{}", id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Start {
            checkpoint,
            task_id,
        } => {
            let mut session = open_session(&checkpoint, flags)?;
            set_status(&mut session, &task_id, TaskStatus::InProgress, None, None)
        }
        Command::Complete {
            checkpoint,
            task_id,
            validation,
        } => {
            let validation = validation
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .context("parse --validation as JSON")?;
            let mut session = open_session(&checkpoint, flags)?;
            set_status(
                &mut session,
                &task_id,
                TaskStatus::Completed,
                None,
                validation,
            )
        }
        Command::Fail {
            checkpoint,
            task_id,
            message,
        } => {
            let mut session = open_session(&checkpoint, flags)?;
            set_status(
                &mut session,
                &task_id,
                TaskStatus::Failed,
                Some(&message),
                None,
            )
        }
        Command::Skip {
            checkpoint,
            task_id,
        } => {
            let mut session = open_session(&checkpoint, flags)?;
            set_status(&mut session, &task_id, TaskStatus::Skipped, None, None)
        }
        Command::Summary { checkpoint, text } => {
            let session = open_session(&checkpoint, flags)?;
            let summary = session.manager.summary();
            if text {
                println!("{}", summary.render());
            } else {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Show {
            checkpoint,
            subject,
            variant,
            source,
        } => {
            let session = open_session(&checkpoint, flags)?;
            let Some(task) = session.manager.get_task(&subject, &variant, &source) else {
                eprintln!("error: task not registered");
                return Ok(ExitCode::FAILURE);
            };
            let mut value = serde_json::to_value(task)?;
            if let Value::Object(map) = &mut value {
                map.insert("task_id".to_string(), Value::String(task.task_id()));
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Failed { checkpoint } => {
            let session = open_session(&checkpoint, flags)?;
            for task in session.manager.failed_tasks() {
                println!(
                    "{}|{}|{}|{}|{}",
                    task.task_id(),
                    task.subject,
                    task.variant,
                    task.source_filename,
                    task.error_message.as_deref().unwrap_or("")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ResetFailed { checkpoint } => {
            let mut session = open_session(&checkpoint, flags)?;
            let count = session
                .manager
                .reset_failed_tasks()
                .context("reset failed tasks")?;
            println!("{}", count);
            Ok(ExitCode::SUCCESS)
        }
        Command::ExportLegacy { checkpoint, legacy } => {
            let session = open_session(&checkpoint, flags)?;
            session
                .manager
                .export_legacy(&legacy)
                .with_context(|| format!("export legacy format to {}", legacy.display()))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::TaskId {
            subject,
            variant,
            source,
        } => {
            println!("{}", task_id(&subject, &variant, &source));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_session(checkpoint: &Path, flags: SongbirdConfig) -> Result<Session> {
    let settings = resolve_settings(checkpoint, flags);
    let lock = if settings.lock {
        let lock = acquire_lock(checkpoint)
            .with_context(|| format!("lock checkpoint {}", checkpoint.display()))?;
        debug!(path = %lock.path().display(), "holding checkpoint lock");
        Some(lock)
    } else {
        None
    };
    let manager = CheckpointManager::open_with(checkpoint, settings.options)
        .with_context(|| format!("load checkpoint {}", checkpoint.display()))?;
    Ok(Session {
        manager,
        _lock: lock,
    })
}

fn acquire_lock(checkpoint: &Path) -> Result<CheckpointLock, CheckpointError> {
    if let Some(lock) = CheckpointLock::try_acquire(checkpoint)? {
        return Ok(lock);
    }
    warn!(
        path = %lock_path(checkpoint).display(),
        "checkpoint is locked by another invocation; waiting"
    );
    CheckpointLock::acquire(checkpoint)
}

fn set_status(
    session: &mut Session,
    task_id: &str,
    status: TaskStatus,
    error_message: Option<&str>,
    validation_result: Option<Value>,
) -> Result<ExitCode> {
    let updated = session
        .manager
        .update_status(task_id, status, error_message, validation_result)
        .with_context(|| format!("mark {} as {}", task_id, status))?;
    if !updated {
        eprintln!("error: unknown task id {}", task_id);
    }
    Ok(exit_flag(updated))
}

fn exit_flag(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
