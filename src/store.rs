use crate::models::ListName;
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file exists but cannot be parsed. Running on a blind state would
    /// re-create every task, so callers must stop here.
    #[error("store {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("another sync run holds {0}")]
    Locked(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MappingOrigin {
    #[default]
    Local,
    Remote,
}

/// Durable link asserting a local task and a remote task are the same task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Mapping {
    pub local_id: String,
    pub remote_id: String,
    pub remote_list_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_remote_due: Option<NaiveDate>,
    #[serde(default)]
    pub origin: MappingOrigin,
}

/// Provisional marker for a local create command that has not been confirmed
/// by a snapshot yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PendingImport {
    pub remote_id: String,
    pub remote_list_id: String,
    pub list: ListName,
    pub expected_title: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct MappingFile {
    #[serde(default)]
    mappings: Vec<Mapping>,
    #[serde(default)]
    pending: Vec<PendingImport>,
}

/// Mapping table with lookups by local id and by remote id.
///
/// `by_local` is the backing map; `by_remote` only indexes it, so the
/// one-mapping-per-id rule is enforced in `insert` alone. Every mutation is
/// written to disk before it returns.
pub struct MappingStore {
    path: Option<PathBuf>,
    by_local: BTreeMap<String, Mapping>,
    by_remote: HashMap<String, String>,
    pending: BTreeMap<String, PendingImport>,
}

impl MappingStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            by_local: BTreeMap::new(),
            by_remote: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::in_memory();
        store.path = Some(path.to_path_buf());
        let Some(content) = read_optional(path)? else {
            return Ok(store);
        };
        let file: MappingFile = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        for mapping in file.mappings {
            if store.by_remote.contains_key(&mapping.remote_id)
                || store.by_local.contains_key(&mapping.local_id)
            {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    message: format!(
                        "duplicate mapping for {} / {}",
                        mapping.local_id, mapping.remote_id
                    ),
                });
            }
            store.index(mapping);
        }
        for pending in file.pending {
            if !store.by_remote.contains_key(&pending.remote_id) {
                store.pending.insert(pending.remote_id.clone(), pending);
            }
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    pub fn by_local(&self, local_id: &str) -> Option<&Mapping> {
        self.by_local.get(local_id)
    }

    pub fn by_remote(&self, remote_id: &str) -> Option<&Mapping> {
        self.by_remote
            .get(remote_id)
            .and_then(|local_id| self.by_local.get(local_id))
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.by_local.values()
    }

    /// Records a mapping, displacing any mapping that shares either id and any
    /// pending marker for the remote id.
    pub fn insert(&mut self, mapping: Mapping) -> Result<(), StoreError> {
        if let Some(old) = self.unindex_local(&mapping.local_id) {
            if old.remote_id != mapping.remote_id {
                tracing::warn!(
                    local_id = %old.local_id,
                    old_remote = %old.remote_id,
                    new_remote = %mapping.remote_id,
                    "replacing mapping for local task"
                );
            }
        }
        if let Some(local_id) = self.by_remote.get(&mapping.remote_id).cloned() {
            tracing::warn!(
                remote_id = %mapping.remote_id,
                old_local = %local_id,
                new_local = %mapping.local_id,
                "replacing mapping for remote task"
            );
            self.unindex_local(&local_id);
        }
        self.pending.remove(&mapping.remote_id);
        self.index(mapping);
        self.save()
    }

    pub fn remove_by_local(&mut self, local_id: &str) -> Result<Option<Mapping>, StoreError> {
        let removed = self.unindex_local(local_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn remove_by_remote(&mut self, remote_id: &str) -> Result<Option<Mapping>, StoreError> {
        let Some(local_id) = self.by_remote.get(remote_id).cloned() else {
            return Ok(None);
        };
        self.remove_by_local(&local_id)
    }

    pub fn set_last_remote_due(
        &mut self,
        local_id: &str,
        due: Option<NaiveDate>,
    ) -> Result<(), StoreError> {
        let Some(mapping) = self.by_local.get_mut(local_id) else {
            return Ok(());
        };
        if mapping.last_remote_due == due {
            return Ok(());
        }
        mapping.last_remote_due = due;
        self.save()
    }

    pub fn pending(&self, remote_id: &str) -> Option<&PendingImport> {
        self.pending.get(remote_id)
    }

    pub fn pending_imports(&self) -> impl Iterator<Item = &PendingImport> {
        self.pending.values()
    }

    pub fn insert_pending(&mut self, pending: PendingImport) -> Result<(), StoreError> {
        if self.by_remote.contains_key(&pending.remote_id) {
            return Ok(());
        }
        self.pending.insert(pending.remote_id.clone(), pending);
        self.save()
    }

    pub fn remove_pending(&mut self, remote_id: &str) -> Result<Option<PendingImport>, StoreError> {
        let removed = self.pending.remove(remote_id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Marks a pending import as re-sent.
    pub fn touch_pending(&mut self, remote_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(pending) = self.pending.get_mut(remote_id) else {
            return Ok(());
        };
        pending.requested_at = now;
        pending.attempts = pending.attempts.saturating_add(1);
        self.save()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let file = MappingFile {
            mappings: self.by_local.values().cloned().collect(),
            pending: self.pending.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(path, &content)
    }

    fn index(&mut self, mapping: Mapping) {
        self.by_remote
            .insert(mapping.remote_id.clone(), mapping.local_id.clone());
        self.by_local.insert(mapping.local_id.clone(), mapping);
    }

    fn unindex_local(&mut self, local_id: &str) -> Option<Mapping> {
        let removed = self.by_local.remove(local_id)?;
        self.by_remote.remove(&removed.remote_id);
        Some(removed)
    }
}

/// Last observed sync-relevant attributes of a local task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStateRecord {
    pub local_id: String,
    #[serde(default)]
    pub last_due_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_completed: bool,
    #[serde(default)]
    pub last_seen_title: String,
    #[serde(default)]
    pub last_list: Option<ListName>,
    /// The remote copy was deleted by a user; never re-create it.
    #[serde(default)]
    pub detached: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct SyncStateFile {
    #[serde(default)]
    last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    records: BTreeMap<String, SyncStateRecord>,
}

impl SyncStateRecord {
    fn blank(local_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            local_id: local_id.to_string(),
            last_due_date: None,
            last_completed: false,
            last_seen_title: String::new(),
            last_list: None,
            detached: false,
            updated_at: now,
        }
    }
}

pub struct SyncStateStore {
    path: Option<PathBuf>,
    last_sync: Option<DateTime<Utc>>,
    records: BTreeMap<String, SyncStateRecord>,
}

impl SyncStateStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            last_sync: None,
            records: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::in_memory();
        store.path = Some(path.to_path_buf());
        let Some(content) = read_optional(path)? else {
            return Ok(store);
        };
        let file: SyncStateFile =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        store.last_sync = file.last_sync;
        store.records = file.records;
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn get(&self, local_id: &str) -> Option<&SyncStateRecord> {
        self.records.get(local_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &SyncStateRecord> {
        self.records.values()
    }

    pub fn upsert(&mut self, record: SyncStateRecord) -> Result<(), StoreError> {
        if self.records.get(&record.local_id).is_some_and(|old| same_observation(old, &record)) {
            return Ok(());
        }
        self.records.insert(record.local_id.clone(), record);
        self.save()
    }

    pub fn detach(&mut self, local_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let record = self
            .records
            .entry(local_id.to_string())
            .or_insert_with(|| SyncStateRecord::blank(local_id, now));
        if record.detached {
            return Ok(());
        }
        record.detached = true;
        record.updated_at = now;
        self.save()
    }

    /// Remembers a completion sent through the local sink before it is
    /// observed, so the open task is not mirrored again meanwhile.
    pub fn assume_completed(&mut self, local_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let record = self
            .records
            .entry(local_id.to_string())
            .or_insert_with(|| SyncStateRecord::blank(local_id, now));
        if record.last_completed {
            return Ok(());
        }
        record.last_completed = true;
        record.updated_at = now;
        self.save()
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.last_sync = Some(now);
        self.save()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let file = SyncStateFile {
            last_sync: self.last_sync,
            records: self.records.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        write_atomic(path, &content)
    }
}

fn same_observation(old: &SyncStateRecord, new: &SyncStateRecord) -> bool {
    old.last_due_date == new.last_due_date
        && old.last_completed == new.last_completed
        && old.last_seen_title == new.last_seen_title
        && old.last_list == new.last_list
        && old.detached == new.detached
}

/// Exclusive lock held for the duration of a run.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        if file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(path.to_path_buf()));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Replaces `path` with `content` through a synced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mapping(local: &str, remote: &str) -> Mapping {
        Mapping {
            local_id: local.to_string(),
            remote_id: remote.to_string(),
            remote_list_id: "list-today".to_string(),
            created_at: Utc::now(),
            last_remote_due: None,
            origin: MappingOrigin::Local,
        }
    }

    fn record(local: &str) -> SyncStateRecord {
        SyncStateRecord {
            local_id: local.to_string(),
            last_due_date: NaiveDate::from_ymd_opt(2025, 1, 2),
            last_completed: false,
            last_seen_title: "Pay rent".to_string(),
            last_list: Some(ListName::Today),
            detached: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn mapping_store_persists_both_indexes() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("task_mapping.json");

        let mut store = MappingStore::load(&path).expect("load empty");
        store.insert(mapping("L1", "R1")).expect("insert");
        store.insert(mapping("L2", "R2")).expect("insert");

        let reloaded = MappingStore::load(&path).expect("reload");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.by_remote("R2").map(|m| m.local_id.as_str()), Some("L2"));
        assert_eq!(reloaded.by_local("L1").map(|m| m.remote_id.as_str()), Some("R1"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn insert_displaces_conflicting_mappings() {
        let mut store = MappingStore::in_memory();
        store.insert(mapping("L1", "R1")).expect("insert");
        store.insert(mapping("L2", "R1")).expect("insert");

        assert!(store.by_local("L1").is_none());
        assert_eq!(store.by_remote("R1").map(|m| m.local_id.as_str()), Some("L2"));
        assert_eq!(store.len(), 1);

        store.insert(mapping("L2", "R9")).expect("insert");
        assert!(store.by_remote("R1").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mapping_replaces_pending_marker() {
        let mut store = MappingStore::in_memory();
        store
            .insert_pending(PendingImport {
                remote_id: "R7".to_string(),
                remote_list_id: "list-today".to_string(),
                list: ListName::Today,
                expected_title: "Call dentist".to_string(),
                due_date: None,
                requested_at: Utc::now(),
                attempts: 1,
            })
            .expect("pending");
        assert!(store.pending("R7").is_some());

        store.insert(mapping("L7", "R7")).expect("insert");
        assert!(store.pending("R7").is_none());
    }

    #[test]
    fn unparseable_mapping_file_is_corrupt() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("task_mapping.json");
        fs::write(&path, "{ not json").expect("write");

        let err = MappingStore::load(&path).err().expect("corrupt");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn duplicate_remote_ids_on_disk_are_corrupt() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("task_mapping.json");
        let file = MappingFile {
            mappings: vec![mapping("L1", "R1"), mapping("L2", "R1")],
            pending: Vec::new(),
        };
        fs::write(&path, serde_json::to_string(&file).expect("encode")).expect("write");

        assert!(matches!(
            MappingStore::load(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn sync_state_round_trips_and_detaches() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("sync_state.json");

        let mut store = SyncStateStore::load(&path).expect("load");
        store.upsert(record("L1")).expect("upsert");
        store.detach("L1", Utc::now()).expect("detach");
        store.mark_synced(Utc::now()).expect("synced");

        let reloaded = SyncStateStore::load(&path).expect("reload");
        let loaded = reloaded.get("L1").expect("record");
        assert!(loaded.detached);
        assert_eq!(loaded.last_seen_title, "Pay rent");
        assert!(reloaded.last_sync().is_some());
    }

    #[test]
    fn corrupt_state_file_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("sync_state.json");
        fs::write(&path, "[1, 2").expect("write");
        assert!(matches!(
            SyncStateStore::load(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn second_lock_is_refused() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("tasksync.lock");
        let first = RunLock::acquire(&path).expect("first lock");
        assert!(matches!(RunLock::acquire(&path), Err(StoreError::Locked(_))));
        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }
}
