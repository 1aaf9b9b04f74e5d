//! Two-way reconciliation between the local task manager and the remote
//! task service.
//!
//! A cycle runs in three passes over data fetched up front:
//! forward (local to remote), reverse (remote to local) and a sweep that
//! drops mappings whose remote task disappeared. Every store mutation is
//! persisted before the next remote call, so an interrupted cycle never
//! repeats a successful creation.

mod dedup;
pub mod purge;
pub mod report;
pub mod retry;

pub use dedup::canon_title;
pub use report::CycleReport;
pub use retry::RetryPolicy;

use crate::models::{
    remote_due, ListName, LocalCommand, LocalTask, NewRemoteTask, RemoteList, RemotePatch,
    RemoteTask, SyncScope,
};
use crate::store::{
    Mapping, MappingOrigin, MappingStore, PendingImport, StoreError, SyncStateRecord,
    SyncStateStore,
};
use crate::translate::{Direction, TitlePipeline};
use chrono::{DateTime, Utc};
use dedup::title_keys;
use retry::with_retry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network failures, rate limits and server errors. Retried.
    #[error("temporary failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    Auth(String),
    #[error("request rejected: {0}")]
    Request(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

#[derive(Debug, Error)]
#[error("local task source failed: {0}")]
pub struct LocalSourceError(pub String);

#[derive(Debug, Error)]
#[error("local command not delivered: {0}")]
pub struct LocalSinkError(pub String);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote service: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    LocalSource(#[from] LocalSourceError),
}

/// Remote task service, addressed by list id.
pub trait RemoteTasks {
    fn task_lists(&mut self) -> Result<Vec<RemoteList>, RemoteError>;
    fn create_list(&mut self, title: &str) -> Result<RemoteList, RemoteError>;
    /// Every task in the list, completed and hidden ones included.
    fn list(&mut self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError>;
    fn insert(&mut self, list_id: &str, task: &NewRemoteTask) -> Result<RemoteTask, RemoteError>;
    fn patch(&mut self, list_id: &str, remote_id: &str, patch: &RemotePatch)
    -> Result<(), RemoteError>;
    fn delete(&mut self, list_id: &str, remote_id: &str) -> Result<(), RemoteError>;
    fn delete_list(&mut self, list_id: &str) -> Result<(), RemoteError>;
}

/// Read side of the local task manager.
pub trait LocalSource {
    fn snapshot(&self, list: ListName) -> Result<Vec<LocalTask>, LocalSourceError>;

    /// Tasks completed since `cutoff` that have already left their list.
    fn completed_since(&self, _cutoff: DateTime<Utc>) -> Result<Vec<LocalTask>, LocalSourceError> {
        Ok(Vec::new())
    }
}

/// Write side of the local task manager. Commands are fire-and-forget: a
/// successful send does not mean the change has landed.
pub trait LocalSink {
    fn send(&self, command: LocalCommand) -> Result<(), LocalSinkError>;
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Remote list title per local list. Missing entries use the list name.
    pub list_titles: BTreeMap<ListName, String>,
    pub create_missing_lists: bool,
    pub retry: RetryPolicy,
    /// Pause before every remote call.
    pub request_delay: Duration,
    /// Age after which an unconfirmed import is sent again.
    pub import_retry_after: chrono::Duration,
    pub max_import_attempts: u32,
    /// How recent an unmapped local task must be to match a new remote task.
    pub recency_window: chrono::Duration,
    pub completed_lookback: chrono::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            list_titles: BTreeMap::new(),
            create_missing_lists: true,
            retry: RetryPolicy::default(),
            request_delay: Duration::from_millis(100),
            import_retry_after: chrono::Duration::minutes(60),
            max_import_attempts: 3,
            recency_window: chrono::Duration::minutes(60),
            completed_lookback: chrono::Duration::days(2),
        }
    }
}

impl SyncSettings {
    pub fn list_title(&self, list: ListName) -> String {
        self.list_titles
            .get(&list)
            .cloned()
            .unwrap_or_else(|| list.as_str().to_string())
    }
}

struct ListData {
    list: ListName,
    list_id: String,
    locals: Vec<LocalTask>,
    remotes: Vec<RemoteTask>,
}

/// Working set of one cycle.
struct Cycle<'s> {
    now: DateTime<Utc>,
    mappings: &'s mut MappingStore,
    states: &'s mut SyncStateStore,
    report: CycleReport,
    /// Remote list ids whose listing succeeded.
    fetched: HashMap<String, ListName>,
    locals: Vec<LocalTask>,
    remotes: Vec<RemoteTask>,
    remote_ids: HashSet<String>,
    /// Remote ids created, changed or deleted this cycle.
    touched: HashSet<String>,
    /// Local ids linked by the reverse pass this cycle.
    claimed: HashSet<String>,
}

impl Cycle<'_> {
    fn local(&self, local_id: &str) -> Option<&LocalTask> {
        self.locals.iter().find(|l| l.local_id == local_id)
    }

    fn remote(&self, remote_id: &str) -> Option<&RemoteTask> {
        self.remotes.iter().find(|r| r.remote_id == remote_id)
    }

    /// Records what was just observed for `local`. A fresh link clears the
    /// detached flag.
    fn observe(&mut self, local: &LocalTask, linked: bool) -> Result<(), StoreError> {
        let detached = !linked
            && self
                .states
                .get(&local.local_id)
                .is_some_and(|record| record.detached);
        self.states.upsert(SyncStateRecord {
            local_id: local.local_id.clone(),
            last_due_date: local.due_date,
            last_completed: local.completed,
            last_seen_title: local.title.clone(),
            last_list: Some(local.list_name),
            detached,
            updated_at: self.now,
        })
    }

    /// Forgets a remote task that no longer exists. Its listing, if any, is
    /// left alone for the rest of the cycle.
    fn drop_mapping(&mut self, local_id: &str) -> Result<(), StoreError> {
        if let Some(mapping) = self.mappings.remove_by_local(local_id)? {
            self.touched.insert(mapping.remote_id);
        }
        self.states.detach(local_id, self.now)?;
        self.report.mappings_dropped += 1;
        Ok(())
    }
}

pub struct SyncEngine<'a> {
    remote: &'a mut dyn RemoteTasks,
    source: &'a dyn LocalSource,
    sink: &'a dyn LocalSink,
    titles: &'a TitlePipeline,
    settings: SyncSettings,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        remote: &'a mut dyn RemoteTasks,
        source: &'a dyn LocalSource,
        sink: &'a dyn LocalSink,
        titles: &'a TitlePipeline,
        settings: SyncSettings,
    ) -> Self {
        Self {
            remote,
            source,
            sink,
            titles,
            settings,
        }
    }

    /// Loads both stores and runs a cycle. Unreadable stores abort before any
    /// call is made.
    pub fn run_from_disk(
        &mut self,
        scope: SyncScope,
        mapping_path: &Path,
        state_path: &Path,
    ) -> Result<CycleReport, SyncError> {
        let mut mappings = MappingStore::load(mapping_path)?;
        let mut states = SyncStateStore::load(state_path)?;
        self.run(scope, &mut mappings, &mut states)
    }

    pub fn run(
        &mut self,
        scope: SyncScope,
        mappings: &mut MappingStore,
        states: &mut SyncStateStore,
    ) -> Result<CycleReport, SyncError> {
        self.run_at(scope, mappings, states, Utc::now())
    }

    pub fn run_at(
        &mut self,
        scope: SyncScope,
        mappings: &mut MappingStore,
        states: &mut SyncStateStore,
        now: DateTime<Utc>,
    ) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::new(scope);
        let targets = self.resolve_lists(scope, &mut report)?;

        let mut lists = Vec::new();
        let mut seen = HashSet::new();
        for (list, list_id) in targets {
            match self.fetch_list(list, &list_id) {
                Ok(mut data) => {
                    // A task shown in several lists belongs to the first one.
                    data.locals.retain(|local| seen.insert(local.local_id.clone()));
                    lists.push(data);
                }
                Err(err) => {
                    tracing::error!(list = %list, error = %err, "skipping list for this cycle");
                    report.failed_lists.push(list);
                }
            }
        }

        let mut cycle = Cycle {
            now,
            mappings,
            states,
            report,
            fetched: lists
                .iter()
                .map(|data| (data.list_id.clone(), data.list))
                .collect(),
            locals: lists.iter().flat_map(|d| d.locals.iter().cloned()).collect(),
            remotes: lists.iter().flat_map(|d| d.remotes.iter().cloned()).collect(),
            remote_ids: HashSet::new(),
            touched: HashSet::new(),
            claimed: HashSet::new(),
        };
        cycle.remote_ids = cycle.remotes.iter().map(|r| r.remote_id.clone()).collect();
        let late = self.recently_completed(&cycle);

        for data in &lists {
            for local in &data.locals {
                self.forward(&mut cycle, local, &data.list_id)?;
            }
        }
        for (local, list_id) in &late {
            self.forward(&mut cycle, local, list_id)?;
        }
        for data in &lists {
            for remote in &data.remotes {
                self.reverse(&mut cycle, remote, data.list)?;
            }
        }
        self.sweep(&mut cycle)?;

        cycle.states.mark_synced(now)?;
        tracing::info!(summary = %cycle.report.summary(), "sync cycle finished");
        Ok(cycle.report)
    }

    fn call<T>(
        &mut self,
        label: &str,
        mut op: impl FnMut(&mut (dyn RemoteTasks + 'a)) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let delay = self.settings.request_delay;
        let policy = self.settings.retry;
        let remote = &mut *self.remote;
        with_retry(&policy, label, || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            op(&mut *remote)
        })
    }

    fn dispatch(&self, cycle: &mut Cycle<'_>, command: LocalCommand) -> bool {
        let description = command.describe();
        match self.sink.send(command) {
            Ok(()) => {
                tracing::info!(command = %description, "queued local command");
                true
            }
            Err(err) => {
                tracing::warn!(command = %description, error = %err, "local command failed");
                cycle.report.sink_failures += 1;
                false
            }
        }
    }

    fn resolve_lists(
        &mut self,
        scope: SyncScope,
        report: &mut CycleReport,
    ) -> Result<Vec<(ListName, String)>, SyncError> {
        let existing = self.call("list task lists", |r| r.task_lists())?;
        let mut resolved: Vec<(ListName, String)> = Vec::new();

        for list in scope.lists() {
            let title = self.settings.list_title(list);
            let found = existing
                .iter()
                .find(|remote| remote.title.trim().eq_ignore_ascii_case(title.trim()))
                .map(|remote| remote.id.clone());
            let list_id = match found {
                Some(id) => id,
                None if self.settings.create_missing_lists => {
                    match self.call("create task list", |r| r.create_list(&title)) {
                        Ok(created) => {
                            tracing::info!(list = %list, title = %title, "created remote list");
                            created.id
                        }
                        Err(err) => {
                            tracing::error!(list = %list, error = %err, "cannot create remote list");
                            report.failed_lists.push(list);
                            continue;
                        }
                    }
                }
                None => {
                    tracing::error!(list = %list, title = %title, "remote list does not exist");
                    report.failed_lists.push(list);
                    continue;
                }
            };
            if resolved.iter().any(|(_, id)| *id == list_id) {
                tracing::error!(list = %list, title = %title, "remote list already used by another list");
                report.failed_lists.push(list);
                continue;
            }
            resolved.push((list, list_id));
        }
        Ok(resolved)
    }

    fn fetch_list(&mut self, list: ListName, list_id: &str) -> Result<ListData, SyncError> {
        let locals = self.source.snapshot(list)?;
        let mut remotes = self.call("list tasks", |r| r.list(list_id))?;
        for remote in &mut remotes {
            remote.list_id = list_id.to_string();
        }
        tracing::debug!(
            list = %list,
            local = locals.len(),
            remote = remotes.len(),
            "fetched list"
        );
        Ok(ListData {
            list,
            list_id: list_id.to_string(),
            locals,
            remotes,
        })
    }

    /// Mapped tasks completed recently that no longer show up in any list.
    fn recently_completed(&self, cycle: &Cycle<'_>) -> Vec<(LocalTask, String)> {
        if cycle.fetched.is_empty() {
            return Vec::new();
        }
        let cutoff = cycle.now - self.settings.completed_lookback;
        let completed = match self.source.completed_since(cutoff) {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read recently completed tasks");
                return Vec::new();
            }
        };
        completed
            .into_iter()
            .filter(|task| task.completed && cycle.local(&task.local_id).is_none())
            .filter_map(|task| {
                let mapping = cycle.mappings.by_local(&task.local_id)?;
                cycle
                    .fetched
                    .contains_key(&mapping.remote_list_id)
                    .then(|| (task, mapping.remote_list_id.clone()))
            })
            .collect()
    }

    fn forward(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        list_id: &str,
    ) -> Result<(), SyncError> {
        let Some(mut mapping) = cycle.mappings.by_local(&local.local_id).cloned() else {
            return self.forward_unmapped(cycle, local, list_id);
        };
        let remote = cycle.remote(&mapping.remote_id).cloned();
        if remote.is_none() && cycle.fetched.contains_key(&mapping.remote_list_id) {
            tracing::info!(
                local_id = %local.local_id,
                remote_id = %mapping.remote_id,
                "remote task deleted, detaching"
            );
            cycle.drop_mapping(&local.local_id)?;
            return Ok(());
        }

        if local.completed {
            return self.complete_remote(cycle, local, &mapping);
        }
        // Completed in the remote service; the reverse pass finishes it.
        if remote.as_ref().is_some_and(|r| r.completed) {
            return Ok(());
        }

        if mapping.remote_list_id != list_id {
            if let Some(remote) = remote.as_ref() {
                match self.relocate(cycle, &mapping, remote, list_id)? {
                    Some(moved) => mapping = moved,
                    None => return Ok(()),
                }
            }
        }

        let previous_due = cycle
            .states
            .get(&local.local_id)
            .map(|record| record.last_due_date)
            .unwrap_or(mapping.last_remote_due);
        // A local date equal to the remote one is an applied remote change.
        if previous_due != local.due_date
            && mapping.last_remote_due != local.due_date
            && !self.patch_due(cycle, local, &mapping)?
        {
            return Ok(());
        }
        cycle.observe(local, false)?;
        Ok(())
    }

    fn forward_unmapped(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        list_id: &str,
    ) -> Result<(), SyncError> {
        if local.completed {
            cycle.observe(local, false)?;
            return Ok(());
        }
        if local.title.trim().is_empty() {
            return Ok(());
        }
        if let Some(record) = cycle.states.get(&local.local_id) {
            if record.detached {
                tracing::debug!(local_id = %local.local_id, "detached, not re-creating");
                return Ok(());
            }
            if record.last_completed {
                tracing::debug!(local_id = %local.local_id, "completed earlier, not re-creating");
                return Ok(());
            }
        }

        let raw_keys = title_keys(&[local.title.as_str()]);
        if let Some(pending) = dedup::matching_pending(&*cycle.mappings, &raw_keys).cloned() {
            return self.confirm_import(cycle, local, pending);
        }
        if let Some(remote) =
            dedup::unmapped_remote(&cycle.remotes, &*cycle.mappings, &cycle.touched, list_id, &raw_keys)
                .cloned()
        {
            return self.adopt_remote(cycle, local, remote);
        }

        let title = self.titles.prepare(&local.title, Direction::Outgoing);
        if title != local.title {
            let keys = title_keys(&[local.title.as_str(), title.as_str()]);
            if let Some(remote) =
                dedup::unmapped_remote(&cycle.remotes, &*cycle.mappings, &cycle.touched, list_id, &keys)
                    .cloned()
            {
                return self.adopt_remote(cycle, local, remote);
            }
        }

        let new_task = NewRemoteTask {
            title,
            notes: local.notes.clone(),
            due: remote_due(local.due_date, local.due_time),
        };
        match self.call("insert task", |r| r.insert(list_id, &new_task)) {
            Ok(created) => {
                tracing::info!(
                    local_id = %local.local_id,
                    remote_id = %created.remote_id,
                    title = %new_task.title,
                    "created remote task"
                );
                cycle.mappings.insert(Mapping {
                    local_id: local.local_id.clone(),
                    remote_id: created.remote_id.clone(),
                    remote_list_id: list_id.to_string(),
                    created_at: cycle.now,
                    last_remote_due: local.due_date,
                    origin: MappingOrigin::Local,
                })?;
                cycle.touched.insert(created.remote_id);
                cycle.report.remote.created += 1;
                cycle.observe(local, true)?;
            }
            Err(err) => {
                tracing::warn!(local_id = %local.local_id, title = %local.title, error = %err, "cannot create remote task");
                cycle.report.skipped += 1;
            }
        }
        Ok(())
    }

    fn confirm_import(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        pending: PendingImport,
    ) -> Result<(), SyncError> {
        tracing::info!(
            local_id = %local.local_id,
            remote_id = %pending.remote_id,
            "imported task confirmed"
        );
        cycle.mappings.insert(Mapping {
            local_id: local.local_id.clone(),
            remote_id: pending.remote_id.clone(),
            remote_list_id: pending.remote_list_id.clone(),
            created_at: cycle.now,
            last_remote_due: pending.due_date,
            origin: MappingOrigin::Remote,
        })?;
        cycle.touched.insert(pending.remote_id);
        cycle.report.confirmed += 1;
        cycle.observe(local, true)?;
        Ok(())
    }

    fn adopt_remote(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        remote: RemoteTask,
    ) -> Result<(), SyncError> {
        tracing::info!(
            local_id = %local.local_id,
            remote_id = %remote.remote_id,
            title = %remote.title,
            "linked existing remote task"
        );
        let mapping = Mapping {
            local_id: local.local_id.clone(),
            remote_id: remote.remote_id.clone(),
            remote_list_id: remote.list_id.clone(),
            created_at: cycle.now,
            last_remote_due: remote.due_date(),
            origin: MappingOrigin::Local,
        };
        cycle.mappings.insert(mapping.clone())?;
        cycle.touched.insert(remote.remote_id.clone());
        cycle.report.adopted += 1;
        if remote.due_date() != local.due_date && !self.patch_due(cycle, local, &mapping)? {
            return Ok(());
        }
        cycle.observe(local, true)?;
        Ok(())
    }

    /// Pushes the local due date. Returns false when the task was skipped or
    /// detached and its state must not be recorded.
    fn patch_due(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        mapping: &Mapping,
    ) -> Result<bool, SyncError> {
        let patch = RemotePatch::due(remote_due(local.due_date, local.due_time));
        match self.call("patch due", |r| {
            r.patch(&mapping.remote_list_id, &mapping.remote_id, &patch)
        }) {
            Ok(()) => {
                tracing::info!(
                    local_id = %local.local_id,
                    remote_id = %mapping.remote_id,
                    due = ?local.due_date,
                    "updated remote due date"
                );
                cycle
                    .mappings
                    .set_last_remote_due(&local.local_id, local.due_date)?;
                cycle.touched.insert(mapping.remote_id.clone());
                cycle.report.remote.updated += 1;
                Ok(true)
            }
            Err(RemoteError::NotFound(_)) => {
                cycle.drop_mapping(&local.local_id)?;
                Ok(false)
            }
            Err(err) => {
                tracing::warn!(local_id = %local.local_id, error = %err, "cannot update remote due date");
                cycle.report.skipped += 1;
                Ok(false)
            }
        }
    }

    fn complete_remote(
        &mut self,
        cycle: &mut Cycle<'_>,
        local: &LocalTask,
        mapping: &Mapping,
    ) -> Result<(), SyncError> {
        let (list_id, remote_id) = (&mapping.remote_list_id, &mapping.remote_id);
        let patch = RemotePatch::complete();
        match self.call("complete task", |r| r.patch(list_id, remote_id, &patch)) {
            Ok(()) => cycle.report.remote.completed += 1,
            Err(RemoteError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(local_id = %local.local_id, error = %err, "cannot complete remote task");
                cycle.report.skipped += 1;
                return Ok(());
            }
        }
        match self.call("delete task", |r| r.delete(list_id, remote_id)) {
            Ok(()) => cycle.report.remote.deleted += 1,
            Err(RemoteError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(remote_id = %remote_id, error = %err, "completed remote task left in place");
            }
        }
        tracing::info!(local_id = %local.local_id, remote_id = %remote_id, "completed remote task");
        cycle.touched.insert(remote_id.clone());
        cycle.mappings.remove_by_local(&local.local_id)?;
        cycle.observe(local, false)?;
        Ok(())
    }

    /// Moves a remote task to the list matching its local list. The remote
    /// service cannot move tasks between lists, so this inserts a copy and
    /// deletes the original.
    fn relocate(
        &mut self,
        cycle: &mut Cycle<'_>,
        mapping: &Mapping,
        remote: &RemoteTask,
        list_id: &str,
    ) -> Result<Option<Mapping>, SyncError> {
        let copy = NewRemoteTask {
            title: remote.title.clone(),
            notes: remote.notes.clone(),
            due: remote.due,
        };
        let created = match self.call("insert task", |r| r.insert(list_id, &copy)) {
            Ok(created) => created,
            Err(err) => {
                tracing::warn!(local_id = %mapping.local_id, error = %err, "cannot move remote task");
                cycle.report.skipped += 1;
                return Ok(None);
            }
        };
        let (old_list, old_id) = (&mapping.remote_list_id, &mapping.remote_id);
        match self.call("delete task", |r| r.delete(old_list, old_id)) {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(local_id = %mapping.local_id, error = %err, "cannot remove moved remote task");
                let new_id = created.remote_id.clone();
                if let Err(err) = self.call("delete task", |r| r.delete(list_id, &new_id)) {
                    tracing::error!(remote_id = %new_id, error = %err, "remote task now exists twice");
                }
                cycle.report.skipped += 1;
                return Ok(None);
            }
        }

        let moved = Mapping {
            remote_id: created.remote_id.clone(),
            remote_list_id: list_id.to_string(),
            ..mapping.clone()
        };
        cycle.mappings.insert(moved.clone())?;
        cycle.touched.insert(old_id.clone());
        cycle.touched.insert(created.remote_id);
        cycle.report.remote.updated += 1;
        tracing::info!(
            local_id = %mapping.local_id,
            from = %old_list,
            to = %list_id,
            "moved remote task"
        );
        Ok(Some(moved))
    }

    fn reverse(
        &mut self,
        cycle: &mut Cycle<'_>,
        remote: &RemoteTask,
        list: ListName,
    ) -> Result<(), SyncError> {
        if cycle.touched.contains(&remote.remote_id) {
            return Ok(());
        }
        if let Some(mapping) = cycle.mappings.by_remote(&remote.remote_id).cloned() {
            return self.reverse_mapped(cycle, remote, &mapping);
        }
        if let Some(pending) = cycle.mappings.pending(&remote.remote_id).cloned() {
            return self.reverse_pending(cycle, remote, &pending);
        }
        self.reverse_unmapped(cycle, remote, list)
    }

    fn reverse_mapped(
        &mut self,
        cycle: &mut Cycle<'_>,
        remote: &RemoteTask,
        mapping: &Mapping,
    ) -> Result<(), SyncError> {
        let now = cycle.now;
        if remote.completed {
            let local_done = cycle
                .local(&mapping.local_id)
                .map(|local| local.completed)
                .or_else(|| {
                    cycle
                        .states
                        .get(&mapping.local_id)
                        .map(|record| record.last_completed)
                })
                .unwrap_or(false);
            if !local_done {
                let command = LocalCommand::Complete {
                    local_id: mapping.local_id.clone(),
                };
                if self.dispatch(cycle, command) {
                    cycle.states.assume_completed(&mapping.local_id, now)?;
                    cycle.report.local.completed += 1;
                } else {
                    return Ok(());
                }
            }
            let (list_id, remote_id) = (&mapping.remote_list_id, &remote.remote_id);
            match self.call("delete task", |r| r.delete(list_id, remote_id)) {
                Ok(()) => cycle.report.remote.deleted += 1,
                Err(RemoteError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(remote_id = %remote_id, error = %err, "cannot delete completed remote task");
                    cycle.report.skipped += 1;
                    return Ok(());
                }
            }
            cycle.mappings.remove_by_remote(remote_id)?;
            return Ok(());
        }

        let due = remote.due_date();
        if due != mapping.last_remote_due {
            let command = LocalCommand::UpdateDue {
                local_id: mapping.local_id.clone(),
                due_date: due,
            };
            // The state record keeps the local date until a snapshot shows the change.
            if self.dispatch(cycle, command) {
                cycle.mappings.set_last_remote_due(&mapping.local_id, due)?;
                cycle.report.local.updated += 1;
            }
        }
        Ok(())
    }

    fn reverse_pending(
        &mut self,
        cycle: &mut Cycle<'_>,
        remote: &RemoteTask,
        pending: &PendingImport,
    ) -> Result<(), SyncError> {
        if remote.completed {
            cycle.mappings.remove_pending(&remote.remote_id)?;
            return Ok(());
        }
        if cycle.now.signed_duration_since(pending.requested_at) < self.settings.import_retry_after {
            return Ok(());
        }
        if pending.attempts >= self.settings.max_import_attempts {
            tracing::debug!(remote_id = %remote.remote_id, attempts = pending.attempts, "import never confirmed");
            return Ok(());
        }
        let command = LocalCommand::Create {
            title: pending.expected_title.clone(),
            notes: remote.notes.clone(),
            due_date: remote.due_date(),
            list: pending.list,
        };
        if self.dispatch(cycle, command) {
            cycle.mappings.touch_pending(&remote.remote_id, cycle.now)?;
            cycle.report.local.created += 1;
        }
        Ok(())
    }

    fn reverse_unmapped(
        &mut self,
        cycle: &mut Cycle<'_>,
        remote: &RemoteTask,
        list: ListName,
    ) -> Result<(), SyncError> {
        if remote.completed || remote.title.trim().is_empty() {
            return Ok(());
        }

        let raw_keys = title_keys(&[remote.title.as_str()]);
        if let Some(local) = self.recent_local(cycle, &raw_keys) {
            return self.adopt_local(cycle, remote, &local);
        }
        let title = self.titles.prepare(&remote.title, Direction::Incoming);
        if title != remote.title {
            let keys = title_keys(&[remote.title.as_str(), title.as_str()]);
            if let Some(local) = self.recent_local(cycle, &keys) {
                return self.adopt_local(cycle, remote, &local);
            }
        }

        let command = LocalCommand::Create {
            title: title.clone(),
            notes: remote.notes.clone(),
            due_date: remote.due_date(),
            list,
        };
        if !self.dispatch(cycle, command) {
            return Ok(());
        }
        cycle.mappings.insert_pending(PendingImport {
            remote_id: remote.remote_id.clone(),
            remote_list_id: remote.list_id.clone(),
            list,
            expected_title: title,
            due_date: remote.due_date(),
            requested_at: cycle.now,
            attempts: 1,
        })?;
        cycle.report.local.created += 1;
        Ok(())
    }

    fn recent_local(&self, cycle: &Cycle<'_>, keys: &[String]) -> Option<LocalTask> {
        dedup::recent_local(
            &cycle.locals,
            &*cycle.mappings,
            &cycle.claimed,
            keys,
            cycle.now,
            self.settings.recency_window,
        )
        .cloned()
    }

    fn adopt_local(
        &mut self,
        cycle: &mut Cycle<'_>,
        remote: &RemoteTask,
        local: &LocalTask,
    ) -> Result<(), SyncError> {
        tracing::info!(
            local_id = %local.local_id,
            remote_id = %remote.remote_id,
            title = %local.title,
            "linked existing local task"
        );
        cycle.mappings.insert(Mapping {
            local_id: local.local_id.clone(),
            remote_id: remote.remote_id.clone(),
            remote_list_id: remote.list_id.clone(),
            created_at: cycle.now,
            last_remote_due: remote.due_date(),
            origin: MappingOrigin::Remote,
        })?;
        cycle.claimed.insert(local.local_id.clone());
        cycle.report.adopted += 1;
        cycle.observe(local, true)?;
        Ok(())
    }

    /// Drops links to remote tasks that vanished from a fetched list.
    fn sweep(&mut self, cycle: &mut Cycle<'_>) -> Result<(), SyncError> {
        let stale: Vec<String> = cycle
            .mappings
            .mappings()
            .filter(|m| {
                cycle.fetched.contains_key(&m.remote_list_id)
                    && !cycle.remote_ids.contains(&m.remote_id)
                    && !cycle.touched.contains(&m.remote_id)
            })
            .map(|m| m.local_id.clone())
            .collect();
        for local_id in stale {
            tracing::info!(local_id = %local_id, "remote task gone, detaching");
            cycle.drop_mapping(&local_id)?;
        }

        let abandoned: Vec<String> = cycle
            .mappings
            .pending_imports()
            .filter(|p| {
                cycle.fetched.contains_key(&p.remote_list_id)
                    && !cycle.remote_ids.contains(&p.remote_id)
            })
            .map(|p| p.remote_id.clone())
            .collect();
        for remote_id in abandoned {
            cycle.mappings.remove_pending(&remote_id)?;
        }
        Ok(())
    }
}
