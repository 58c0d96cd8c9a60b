use std::collections::{HashMap, HashSet, VecDeque};

use crate::scheduler::job::{Job, JobId, JobState};

/// Outcome of a retry request that found a job in a failed state.
#[derive(Debug)]
pub struct RetryOutcome {
    pub id: JobId,
    /// State the retried job held before it was reset.
    pub from: JobState,
    /// Dependency-failed jobs (transitively) reachable from the retried job,
    /// reset to `Inited` and re-queued in submission order.
    pub cascaded: Vec<JobId>,
}

/// The authoritative job table plus the poke queue.
///
/// The queue holds jobs still subject to evaluation, in submission order;
/// retried jobs are pushed to the front. Finished jobs leave the queue but
/// stay in the table so dependency lookups and retry cascades can still
/// reference them.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    queue: VecDeque<JobId>,
    next_seq: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly submitted job. Returns false on a duplicate id.
    pub fn insert(&mut self, mut job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        job.seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(job.id);
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Snapshot of the poke queue, front first.
    pub fn poke_queue(&self) -> Vec<JobId> {
        self.queue.iter().copied().collect()
    }

    /// Drop finished jobs from the poke queue. The jobs themselves are
    /// retained. Returns the number of entries removed.
    pub fn prune_finished(&mut self) -> usize {
        let before = self.queue.len();
        let jobs = &self.jobs;
        self.queue
            .retain(|id| jobs.get(id).is_some_and(|j| !j.state.is_finished()));
        before - self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.state == JobState::Active)
            .count()
    }

    pub fn waiting_count(&self) -> usize {
        self.jobs.values().filter(|j| j.state.is_waiting()).count()
    }

    pub fn has_failed(&self) -> bool {
        self.jobs.values().any(|j| j.state.is_failed())
    }

    /// All jobs in submission order.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Reset a failed job for another attempt.
    ///
    /// The job returns to `Inited` at the front of the queue so the next poke
    /// pass evaluates it first. Every dependency-failed job that (transitively)
    /// lists it as a dependency is also reset and appended at the back, in
    /// submission order. Returns `None` if the job is unknown or not in a
    /// failed state; a retry of a running or completed job is a no-op.
    pub fn retry(&mut self, id: JobId) -> Option<RetryOutcome> {
        let job = self.jobs.get_mut(&id)?;
        if !job.state.is_failed() {
            return None;
        }
        let from = job.state;
        job.retry_count += 1;
        job.state = JobState::Inited;
        self.queue.push_front(id);

        // Recover dependents: any dependency-failed job pointing at a reset
        // job is itself reset, repeated until the set stops growing.
        let mut reset: HashSet<JobId> = HashSet::from([id]);
        loop {
            let next: Vec<JobId> = self
                .jobs
                .values()
                .filter(|j| {
                    j.state == JobState::DependencyFailed
                        && !reset.contains(&j.id)
                        && j.depends_on.iter().any(|d| reset.contains(d))
                })
                .map(|j| j.id)
                .collect();
            if next.is_empty() {
                break;
            }
            for dep_id in next {
                if let Some(j) = self.jobs.get_mut(&dep_id) {
                    j.state = JobState::Inited;
                }
                reset.insert(dep_id);
            }
        }

        let mut cascaded: Vec<JobId> = reset.into_iter().filter(|r| *r != id).collect();
        cascaded.sort_by_key(|c| self.jobs[c].seq);
        for c in &cascaded {
            self.queue.push_back(*c);
        }

        Some(RetryOutcome { id, from, cascaded })
    }
}
