use std::collections::HashSet;

use dashmap::DashMap;

/// Result of registering a transfer reference with the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The job had no outstanding references before this one.
    First,
    /// The job already had other outstanding references.
    Added,
    /// The reference was already outstanding for this job.
    Duplicate,
}

/// Outstanding transfer references per job, plus a reverse index from
/// reference to owning job.
///
/// Transfer references are globally unique. Callers serialize mutations for a
/// given job; the tracker only guarantees its own maps stay consistent.
#[derive(Debug, Default)]
pub struct TransferTracker {
    outstanding: DashMap<String, HashSet<String>>,
    owners: DashMap<String, String>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job_id: &str, transfer_id: &str) -> Registration {
        let registration = {
            let mut set = self.outstanding.entry(job_id.to_string()).or_default();
            if set.contains(transfer_id) {
                return Registration::Duplicate;
            }
            let first = set.is_empty();
            set.insert(transfer_id.to_string());
            if first {
                Registration::First
            } else {
                Registration::Added
            }
        };

        self.owners
            .insert(transfer_id.to_string(), job_id.to_string());
        registration
    }

    /// Removes `transfer_id` from the job's outstanding set and returns how
    /// many references remain, or `None` if it was not outstanding.
    pub fn complete(&self, job_id: &str, transfer_id: &str) -> Option<usize> {
        let remaining = {
            let mut set = self.outstanding.get_mut(job_id)?;
            if !set.remove(transfer_id) {
                return None;
            }
            set.len()
        };

        self.owners
            .remove_if(transfer_id, |_, owner| owner == job_id);
        Some(remaining)
    }

    pub fn owner_of(&self, transfer_id: &str) -> Option<String> {
        self.owners.get(transfer_id).map(|owner| owner.clone())
    }

    pub fn outstanding(&self, job_id: &str) -> Vec<String> {
        self.outstanding
            .get(job_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn outstanding_count(&self, job_id: &str) -> usize {
        self.outstanding.get(job_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Drops every reference held for `job_id`.
    pub fn forget_job(&self, job_id: &str) {
        if let Some((_, set)) = self.outstanding.remove(job_id) {
            for transfer_id in set {
                self.owners
                    .remove_if(&transfer_id, |_, owner| owner == job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_is_reported() {
        let tracker = TransferTracker::new();
        assert_eq!(tracker.add("job", "t1"), Registration::First);
        assert_eq!(tracker.add("job", "t2"), Registration::Added);
        assert_eq!(tracker.outstanding_count("job"), 2);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let tracker = TransferTracker::new();
        tracker.add("job", "t1");
        assert_eq!(tracker.add("job", "t1"), Registration::Duplicate);
        assert_eq!(tracker.outstanding_count("job"), 1);
        assert_eq!(tracker.complete("job", "t1"), Some(0));
    }

    #[test]
    fn completing_unknown_reference_keeps_state() {
        let tracker = TransferTracker::new();
        tracker.add("job", "t1");

        assert_eq!(tracker.complete("job", "nope"), None);
        assert_eq!(tracker.complete("other-job", "t1"), None);
        assert_eq!(tracker.outstanding("job"), vec!["t1".to_string()]);
        assert_eq!(tracker.owner_of("t1").as_deref(), Some("job"));
    }

    #[test]
    fn double_completion_is_reported() {
        let tracker = TransferTracker::new();
        tracker.add("job", "t1");
        tracker.add("job", "t2");

        assert_eq!(tracker.complete("job", "t1"), Some(1));
        assert_eq!(tracker.complete("job", "t1"), None);
        assert_eq!(tracker.owner_of("t1"), None);
        assert_eq!(tracker.owner_of("t2").as_deref(), Some("job"));
    }

    #[test]
    fn forget_job_clears_reverse_index() {
        let tracker = TransferTracker::new();
        tracker.add("job", "t1");
        tracker.add("job", "t2");
        tracker.add("other", "t3");

        tracker.forget_job("job");

        assert_eq!(tracker.outstanding_count("job"), 0);
        assert_eq!(tracker.owner_of("t1"), None);
        assert_eq!(tracker.owner_of("t3").as_deref(), Some("other"));
    }
}
