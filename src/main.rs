use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

mod config;
mod integrations;
mod logging;
mod models;
mod store;
mod sync;
mod translate;

use crate::config::{Config, ConfigError};
use crate::integrations::gemini::GeminiTranslator;
use crate::integrations::google::{self, AuthError, GoogleTasks};
use crate::integrations::things::{ThingsSink, ThingsSource};
use crate::models::SyncScope;
use crate::store::{MappingStore, RunLock, StoreError, SyncStateStore};
use crate::sync::purge::purge_remote;
use crate::sync::{canon_title, RemoteError, RemoteTasks, SyncEngine, SyncError};
use crate::translate::TitlePipeline;

#[derive(Parser)]
#[command(name = "tasksync", version, about = "Two-way sync between Things 3 and Google Tasks")]
struct Cli {
    /// Config file. Defaults to the platform config directory.
    #[arg(long, global = true, env = "TASKSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync cycle.
    Sync {
        /// all, today, upcoming, anytime or someday.
        #[arg(default_value = "all")]
        scope: SyncScope,
    },
    /// Authorize access to Google Tasks in the browser.
    Auth,
    /// Show what the local stores know.
    Status,
    /// Delete the mapping and state stores to force a clean resync.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Report tasks with the same title in Google Tasks.
    Duplicates,
    /// Delete every Google task and every non-default list, then reset.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Google Tasks: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to {0} without --yes")]
    NotConfirmed(&'static str),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let loaded = match cli.config.as_deref() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = logging::init(&config);

    let result = match cli.command {
        Command::Sync { scope } => run_sync(&config, scope),
        Command::Auth => run_auth(&config).map(|()| true),
        Command::Status => run_status(&config).map(|()| true),
        Command::Reset { yes } => run_reset(&config, yes).map(|()| true),
        Command::Duplicates => run_duplicates(&config).map(|()| true),
        Command::Purge { yes } => run_purge(&config, yes),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %err, "tasksync failed");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the cycle finished without skipped tasks or failed lists.
fn run_sync(config: &Config, scope: SyncScope) -> Result<bool, CliError> {
    let _lock = RunLock::acquire(&config.lock_path())?;
    let mut remote = GoogleTasks::connect(&config.google, &config.token_path())?;
    let source = ThingsSource::new(&config.things);
    let sink = ThingsSink::spawn(&config.things);
    let titles = title_pipeline(config);

    tracing::info!(scope = %scope, "starting sync");
    let outcome = SyncEngine::new(&mut remote, &source, &sink, &titles, config.sync_settings())
        .run_from_disk(scope, &config.mapping_path(), &config.state_path());
    sink.finish();

    let report = outcome?;
    if report.changes() == 0 && report.is_success() {
        tracing::info!("everything already in sync");
    }
    println!("{}", report.summary());
    Ok(report.is_success())
}

fn title_pipeline(config: &Config) -> TitlePipeline {
    let translation = &config.translation;
    if !translation.enabled {
        return TitlePipeline::disabled();
    }
    match GeminiTranslator::from_config(translation) {
        Ok(translator) => {
            TitlePipeline::new(Box::new(translator), translation.outgoing, translation.incoming)
        }
        Err(err) => {
            tracing::warn!(error = %err, "translation disabled for this run");
            TitlePipeline::disabled()
        }
    }
}

fn run_auth(config: &Config) -> Result<(), CliError> {
    let session = google::start_local_oauth_flow(&config.google)?;
    println!("Open this URL to authorize Google Tasks:\n\n{}\n", session.auth_url);
    println!("Waiting for the redirect on {} ...", session.listen_addr);
    if let Err(err) = open::that(&session.auth_url) {
        tracing::debug!(error = %err, "could not open browser");
    }
    google::wait_for_authorization(&config.google, session, &config.token_path())?;
    println!("Google Tasks authorized.");
    Ok(())
}

fn run_status(config: &Config) -> Result<(), CliError> {
    let mappings = MappingStore::load(&config.mapping_path())?;
    let states = SyncStateStore::load(&config.state_path())?;
    let detached = states.records().filter(|r| r.detached).count();
    let completed = states.records().filter(|r| r.last_completed).count();

    println!("Data directory: {}", config.data.dir.display());
    if mappings.is_empty() && states.is_empty() {
        println!("No sync has run yet.");
        return Ok(());
    }
    match states.last_sync() {
        Some(at) => println!("Last sync: {}", at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")),
        None => println!("Last sync: never"),
    }
    println!("Linked tasks: {}", mappings.len());
    println!(
        "Tracked tasks: {} ({} completed, {} detached)",
        states.len(),
        completed,
        detached
    );
    let pending: Vec<_> = mappings.pending_imports().collect();
    println!("Pending imports: {}", pending.len());
    for import in pending {
        println!(
            "  {} -> {} (sent {}, attempts {})",
            import.expected_title,
            import.list,
            import.requested_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            import.attempts
        );
    }
    Ok(())
}

fn run_reset(config: &Config, confirmed: bool) -> Result<(), CliError> {
    if !confirmed {
        eprintln!("This deletes all task links; the next sync relinks by title. Re-run with --yes.");
        return Err(CliError::NotConfirmed("reset"));
    }
    let _lock = RunLock::acquire(&config.lock_path())?;
    remove_stores(config)?;
    println!("Stores removed. The next sync starts fresh.");
    Ok(())
}

fn remove_stores(config: &Config) -> Result<(), CliError> {
    for path in [config.mapping_path(), config.state_path()] {
        remove_if_present(&path)?;
    }
    tracing::info!("stores reset");
    Ok(())
}

/// Returns whether every task and list was removed.
fn run_purge(config: &Config, confirmed: bool) -> Result<bool, CliError> {
    if !confirmed {
        eprintln!("This deletes every task in Google Tasks and every list but the default one. Re-run with --yes.");
        return Err(CliError::NotConfirmed("purge"));
    }
    let _lock = RunLock::acquire(&config.lock_path())?;
    let mut remote = GoogleTasks::connect(&config.google, &config.token_path())?;
    let report = purge_remote(&mut remote, &config.sync_settings().retry)?;
    // Every link now points at a deleted task.
    remove_stores(config)?;
    println!("{}", report.summary());
    Ok(report.is_success())
}

fn remove_if_present(path: &Path) -> Result<(), CliError> {
    match fs::remove_file(path) {
        Ok(()) => {
            println!("Removed {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CliError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn run_duplicates(config: &Config) -> Result<(), CliError> {
    let mut remote = GoogleTasks::connect(&config.google, &config.token_path())?;
    let mut groups: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for list in remote.task_lists()? {
        for task in remote.list(&list.id)? {
            if task.completed || task.title.trim().is_empty() {
                continue;
            }
            groups
                .entry(canon_title(&task.title))
                .or_default()
                .push((list.title.clone(), task.title));
        }
    }

    let duplicates: Vec<_> = groups.iter().filter(|(_, tasks)| tasks.len() > 1).collect();
    if duplicates.is_empty() {
        println!("No duplicate titles found.");
        return Ok(());
    }
    for (key, tasks) in duplicates {
        let mut lists: Vec<&str> = tasks.iter().map(|(list, _)| list.as_str()).collect();
        lists.sort_unstable();
        lists.dedup();
        let scope = if lists.len() == 1 { "within" } else { "across" };
        println!("\"{key}\" x{} ({scope} {})", tasks.len(), lists.join(", "));
    }
    Ok(())
}
