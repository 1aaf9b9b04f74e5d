use crate::models::{ListName, SyncScope};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SideCounts {
    pub created: usize,
    pub updated: usize,
    pub completed: usize,
    pub deleted: usize,
}

impl SideCounts {
    fn total(&self) -> usize {
        self.created + self.updated + self.completed + self.deleted
    }
}

/// Outcome of one sync cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub scope: SyncScope,
    pub remote: SideCounts,
    pub local: SideCounts,
    /// Existing counterparts linked instead of creating duplicates.
    pub adopted: usize,
    /// Pending imports matched to the local task they created.
    pub confirmed: usize,
    pub mappings_dropped: usize,
    /// Tasks whose remote call failed after retries.
    pub skipped: usize,
    pub sink_failures: usize,
    pub failed_lists: Vec<ListName>,
}

impl CycleReport {
    pub fn new(scope: SyncScope) -> Self {
        Self {
            scope,
            remote: SideCounts::default(),
            local: SideCounts::default(),
            adopted: 0,
            confirmed: 0,
            mappings_dropped: 0,
            skipped: 0,
            sink_failures: 0,
            failed_lists: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.skipped == 0 && self.sink_failures == 0 && self.failed_lists.is_empty()
    }

    pub fn changes(&self) -> usize {
        self.remote.total() + self.local.total() + self.adopted + self.confirmed
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Sync {}: Google +{} ~{} ✓{} -{} | Things +{} ~{} ✓{} | linked {} | confirmed {}",
            self.scope,
            self.remote.created,
            self.remote.updated,
            self.remote.completed,
            self.remote.deleted,
            self.local.created,
            self.local.updated,
            self.local.completed,
            self.adopted,
            self.confirmed,
        );
        if self.mappings_dropped > 0 {
            summary.push_str(&format!(" | detached {}", self.mappings_dropped));
        }
        if self.skipped > 0 {
            summary.push_str(&format!(" | skipped {}", self.skipped));
        }
        if self.sink_failures > 0 {
            summary.push_str(&format!(" | undelivered {}", self.sink_failures));
        }
        if !self.failed_lists.is_empty() {
            let names: Vec<&str> = self.failed_lists.iter().map(|l| l.as_str()).collect();
            summary.push_str(&format!(" | failed lists: {}", names.join(", ")));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_tasks_fail_the_cycle() {
        let mut report = CycleReport::new(SyncScope::All);
        assert!(report.is_success());
        report.remote.created = 2;
        report.skipped = 1;
        assert!(!report.is_success());
        assert!(report.summary().contains("skipped 1"));
        assert!(report.summary().contains("Google +2"));
    }

    #[test]
    fn failed_lists_are_named() {
        let mut report = CycleReport::new(SyncScope::List(ListName::Today));
        report.failed_lists.push(ListName::Today);
        assert!(!report.is_success());
        assert!(report.summary().ends_with("failed lists: Today"));
    }
}
