use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a submitted job: 128 random bits, shown as 32 hex chars.
/// Assigned by the client at submission time, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Just submitted, not yet evaluated.
    Inited,
    /// Eligible to run, waiting only on the concurrency cap.
    Queued,
    /// Waiting on at least one unfinished dependency.
    Blocked,
    /// Terminal: at least one dependency ended in a failed state.
    DependencyFailed,
    /// Worker process spawned and running.
    Active,
    /// Terminal success.
    Complete,
    /// Terminal: the job's own execution failed.
    Failed,
}

impl JobState {
    /// Still subject to poke-pass evaluation.
    pub fn is_waiting(self) -> bool {
        matches!(self, JobState::Inited | JobState::Queued | JobState::Blocked)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, JobState::Failed | JobState::DependencyFailed)
    }

    /// Terminal states. A finished job never changes state again except via
    /// an explicit retry.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Failed | JobState::DependencyFailed
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Inited => write!(f, "inited"),
            JobState::Queued => write!(f, "queued"),
            JobState::Blocked => write!(f, "blocked"),
            JobState::DependencyFailed => write!(f, "dependency_failed"),
            JobState::Active => write!(f, "active"),
            JobState::Complete => write!(f, "complete"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of submitted work. The payload is opaque to the scheduler; only
/// the worker that eventually runs the job decodes it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub icon: Option<String>,
    pub payload: Vec<u8>,
    pub depends_on: Vec<JobId>,
    pub state: JobState,
    pub retry_count: u32,
    /// Submission sequence number, assigned by the job table. Retained jobs
    /// keep their number, which keeps cascade re-queues in submission order.
    pub seq: u64,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        name: String,
        icon: Option<String>,
        payload: Vec<u8>,
        depends_on: Vec<JobId>,
    ) -> Self {
        Self {
            id,
            name,
            icon,
            payload,
            depends_on,
            state: JobState::Inited,
            retry_count: 0,
            seq: 0,
            submitted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_starts_inited() {
        let job = Job::new(JobId::random(), "noop".to_string(), None, vec![], vec![]);
        assert_eq!(job.state, JobState::Inited);
        assert_eq!(job.retry_count, 0);
        assert!(job.depends_on.is_empty());
    }

    #[test]
    fn state_predicates() {
        assert!(JobState::Inited.is_waiting());
        assert!(JobState::Queued.is_waiting());
        assert!(JobState::Blocked.is_waiting());
        assert!(!JobState::Active.is_waiting());

        assert!(JobState::Failed.is_failed());
        assert!(JobState::DependencyFailed.is_failed());
        assert!(!JobState::Complete.is_failed());

        assert!(JobState::Complete.is_finished());
        assert!(JobState::Failed.is_finished());
        assert!(JobState::DependencyFailed.is_finished());
        assert!(!JobState::Active.is_finished());
        assert!(!JobState::Queued.is_finished());
    }

    #[test]
    fn job_id_displays_as_hex() {
        let id = JobId::random();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
