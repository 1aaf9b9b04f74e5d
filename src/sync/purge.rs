//! Wipes the remote side: every task in every list, and every list except the
//! default one.

use super::retry::{with_retry, RetryPolicy};
use super::{RemoteError, RemoteTasks};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub tasks_deleted: usize,
    pub lists_deleted: usize,
    pub failures: usize,
}

impl PurgeReport {
    pub fn is_success(&self) -> bool {
        self.failures == 0
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Purge: deleted {} tasks and {} lists",
            self.tasks_deleted, self.lists_deleted
        );
        if self.failures > 0 {
            summary.push_str(&format!(" | {} failed", self.failures));
        }
        summary
    }
}

/// Deletes everything it can and counts the rest. Only a failure to read the
/// list of lists stops it.
///
/// The first list returned is the account's default list, which cannot be
/// deleted; it is only emptied.
pub fn purge_remote(
    remote: &mut dyn RemoteTasks,
    policy: &RetryPolicy,
) -> Result<PurgeReport, RemoteError> {
    let lists = with_retry(policy, "list task lists", || remote.task_lists())?;
    let mut report = PurgeReport::default();

    for (index, list) in lists.iter().enumerate() {
        let tasks = match with_retry(policy, "list tasks", || remote.list(&list.id)) {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(list = %list.title, error = %err, "cannot read list, skipping");
                report.failures += 1;
                continue;
            }
        };
        for task in &tasks {
            match with_retry(policy, "delete task", || remote.delete(&list.id, &task.remote_id)) {
                Ok(()) => report.tasks_deleted += 1,
                Err(RemoteError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(list = %list.title, title = %task.title, error = %err, "cannot delete task");
                    report.failures += 1;
                }
            }
        }

        if index == 0 {
            tracing::info!(list = %list.title, deleted = tasks.len(), "emptied default list");
            continue;
        }
        match with_retry(policy, "delete task list", || remote.delete_list(&list.id)) {
            Ok(()) => {
                tracing::info!(list = %list.title, "deleted list");
                report.lists_deleted += 1;
            }
            Err(RemoteError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(list = %list.title, error = %err, "cannot delete list");
                report.failures += 1;
            }
        }
    }
    Ok(report)
}
