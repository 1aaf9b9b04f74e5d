use crate::models::ListName;
use crate::sync::{RetryPolicy, SyncSettings};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meghendra", "tasksync")
}

fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("TASKSYNC_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tasksync")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TASKSYNC_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tasksync-config.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub google: GoogleConfig,
    pub lists: ListsConfig,
    pub things: ThingsConfig,
    pub translation: TranslationConfig,
    pub sync: SyncConfig,
    pub data: DataConfig,
    pub log: LogConfig,
}

/// OAuth client of type "Desktop app" from the Google Cloud console.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub timeout_seconds: u64,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            timeout_seconds: 30,
        }
    }
}

/// Google task list title used for each Things list.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListsConfig {
    pub today: String,
    pub upcoming: String,
    pub anytime: String,
    pub someday: String,
    pub create_missing: bool,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            today: "Today".to_string(),
            upcoming: "Upcoming".to_string(),
            anytime: "Anytime".to_string(),
            someday: "Someday".to_string(),
            create_missing: true,
        }
    }
}

impl ListsConfig {
    pub fn titles(&self) -> BTreeMap<ListName, String> {
        ListName::all()
            .into_iter()
            .map(|list| {
                let title = match list {
                    ListName::Today => &self.today,
                    ListName::Upcoming => &self.upcoming,
                    ListName::Anytime => &self.anytime,
                    ListName::Someday => &self.someday,
                };
                let title = if title.trim().is_empty() {
                    list.as_str().to_string()
                } else {
                    title.trim().to_string()
                };
                (list, title)
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ThingsConfig {
    /// Needed by `things:///update`. Falls back to `THINGS_AUTH_TOKEN`.
    pub auth_token: String,
    pub command_delay_ms: u64,
    pub osascript: String,
}

impl Default for ThingsConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            command_delay_ms: 500,
            osascript: "osascript".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    /// Translate titles of tasks created in Google.
    pub outgoing: bool,
    /// Translate titles of tasks created in Things.
    pub incoming: bool,
    pub target_language: String,
    pub add_emojis: bool,
    pub model: String,
    /// Falls back to `GEMINI_API_KEY`.
    pub api_key: String,
    pub timeout_seconds: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outgoing: false,
            incoming: true,
            target_language: "Hebrew".to_string(),
            add_emojis: true,
            model: "gemini-2.5-flash".to_string(),
            api_key: String::new(),
            timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub request_delay_ms: u64,
    pub import_retry_minutes: i64,
    pub max_import_attempts: u32,
    pub recency_window_minutes: i64,
    pub completed_lookback_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            request_delay_ms: 100,
            import_retry_minutes: 60,
            max_import_attempts: 3,
            recency_window_minutes: 60,
            completed_lookback_days: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Reads `path`, filling gaps with defaults. The file is written back
    /// only when it was missing or its data dir had to be normalized; a
    /// partial file keeps the user's layout and comments. Secrets from the
    /// environment are applied after the write-back.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let existing = match fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut config = match existing.as_deref() {
            Some(content) => toml::from_str::<Config>(content).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            None => Config::default(),
        };

        let changed = config.normalize_paths();
        if changed || existing.is_none() {
            config.save_to_path(path)?;
        }

        config.apply_env();
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_err)
    }

    fn normalize_paths(&mut self) -> bool {
        let mut changed = false;

        if self.data.dir.as_os_str().is_empty() {
            self.data.dir = default_data_dir();
            changed = true;
        }

        if self.data.dir.is_relative() {
            self.data.dir = default_data_dir().join(&self.data.dir);
            changed = true;
        }

        changed
    }

    fn apply_env(&mut self) {
        if self.things.auth_token.trim().is_empty() {
            if let Ok(token) = std::env::var("THINGS_AUTH_TOKEN") {
                self.things.auth_token = token.trim().to_string();
            }
        }
        if self.translation.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var("GEMINI_API_KEY") {
                self.translation.api_key = key.trim().to_string();
            }
        }
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.data.dir.join("task_mapping.json")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data.dir.join("sync_state.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.data.dir.join("google_token.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data.dir.join("tasksync.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data.dir.join("tasksync.log")
    }

    pub fn sync_settings(&self) -> SyncSettings {
        let sync = &self.sync;
        SyncSettings {
            list_titles: self.lists.titles(),
            create_missing_lists: self.lists.create_missing,
            retry: RetryPolicy {
                max_attempts: sync.max_attempts.max(1),
                base_backoff_ms: sync.backoff_base_ms,
            },
            request_delay: Duration::from_millis(sync.request_delay_ms),
            import_retry_after: chrono::Duration::minutes(sync.import_retry_minutes.max(1)),
            max_import_attempts: sync.max_import_attempts.max(1),
            recency_window: chrono::Duration::minutes(sync.recency_window_minutes.max(0)),
            completed_lookback: chrono::Duration::days(sync.completed_lookback_days.max(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_written_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.lists.today, "Today");
        assert_eq!(config.things.command_delay_ms, 500);

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[translation]"));
        assert!(!written.contains("GEMINI"));
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let content = format!(
            "# my lists\n[lists]\nanytime = \"Next Actions\"\n\n[sync]\nmax_attempts = 5\n\n[data]\ndir = {:?}\n",
            dir.path().join("data")
        );
        fs::write(&path, &content).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
        assert_eq!(config.lists.anytime, "Next Actions");
        assert_eq!(config.lists.someday, "Someday");
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.request_delay_ms, 100);

        let titles = config.lists.titles();
        assert_eq!(titles[&ListName::Anytime], "Next Actions");
        assert_eq!(config.sync_settings().retry.max_attempts, 5);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sync\nmax_attempts = ").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn store_paths_live_in_data_dir() {
        let mut config = Config::default();
        config.data.dir = PathBuf::from("/tmp/tasksync-test");
        assert_eq!(
            config.mapping_path(),
            PathBuf::from("/tmp/tasksync-test/task_mapping.json")
        );
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/tmp/tasksync-test/tasksync.lock")
        );
    }
}
