use crate::config::Config;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber: stderr always, plus `tasksync.log` in the
/// data directory when `log.file` is set. `RUST_LOG` overrides `log.level`.
///
/// The returned guard flushes the file writer on drop; hold it until exit.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));

    let (file_layer, guard) = match file_writer(config) {
        Some((writer, guard)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init();
    if let Err(err) = result {
        eprintln!("Warning: logging already initialized: {err}");
    }
    guard
}

fn file_writer(
    config: &Config,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if !config.log.file {
        return None;
    }
    let log_path = config.log_path();
    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("Warning: cannot create {}: {err}", log_dir.display());
        return None;
    }
    let appender = tracing_appender::rolling::never(log_dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
