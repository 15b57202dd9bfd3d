use std::collections::{HashMap, VecDeque};

use tether_core::{JobId, RegistrationId, ResourceId, ServiceWorkerError, ServiceWorkerResult, VersionId};

use crate::{
    register_job::RegisterJob,
    storage::{DeleteOutcome, DeletedVersion},
    storage_worker::StoredRegistration,
    unregister_job::UnregisterJob,
};

/// Completion delivered to a running job by the coordination task.
#[derive(Debug)]
pub enum JobInput {
    Lookup(ServiceWorkerResult<StoredRegistration>),
    StaleDeleted(ServiceWorkerResult<DeleteOutcome>),
    RegistrationIdAllocated(ServiceWorkerResult<RegistrationId>),
    VersionIdAllocated(ServiceWorkerResult<VersionId>),
    ScriptReserved(ServiceWorkerResult<ResourceId>),
    ScriptWritten(ResourceId, ServiceWorkerResult<u64>),
    WorkerStarted(ServiceWorkerResult<()>),
    InstallFinished(ServiceWorkerResult<()>),
    Stored(ServiceWorkerResult<Option<DeletedVersion>>),
    ActivateFinished(ServiceWorkerResult<()>),
    Unregistered(ServiceWorkerResult<DeleteOutcome>),
}

pub enum Job {
    Register(RegisterJob),
    Unregister(UnregisterJob),
}

impl Job {
    pub fn id(&self) -> JobId {
        match self {
            Job::Register(job) => job.id,
            Job::Unregister(job) => job.id,
        }
    }

    pub fn scope(&self) -> &str {
        match self {
            Job::Register(job) => &job.scope,
            Job::Unregister(job) => &job.scope,
        }
    }

    pub fn is_equal(&self, other: &Job) -> bool {
        match (self, other) {
            (Job::Register(a), Job::Register(b)) => a.is_equal(b),
            (Job::Unregister(a), Job::Unregister(b)) => a.scope == b.scope,
            _ => false,
        }
    }

    /// Moves `other`'s waiters onto this job. Only called for equal jobs.
    fn absorb(&mut self, other: Job) {
        match (self, other) {
            (Job::Register(a), Job::Register(b)) => a.waiters.extend(b.waiters),
            (Job::Unregister(a), Job::Unregister(b)) => a.waiters.extend(b.waiters),
            _ => {}
        }
    }

    pub fn abort(self) {
        match self {
            Job::Register(mut job) => job.resolve_all(Err(ServiceWorkerError::Aborted)),
            Job::Unregister(mut job) => job.resolve_all(Err(ServiceWorkerError::Aborted)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was empty; the caller must start the job.
    Start(JobId),
    Queued(JobId),
    /// Folded into the queue's tail, which carries this id.
    Coalesced(JobId),
}

/// Per-scope FIFO of jobs. At most one job per scope runs at a time.
#[derive(Default)]
pub struct JobCoordinator {
    queues: HashMap<String, VecDeque<JobId>>,
    jobs: HashMap<JobId, Job>,
}

impl JobCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: Job) -> Enqueued {
        let scope = job.scope().to_string();
        let job_id = job.id();
        let queue = self.queues.entry(scope).or_default();

        if let Some(tail_id) = queue.back().copied() {
            if let Some(tail) = self.jobs.get_mut(&tail_id)
                && tail.is_equal(&job)
            {
                tail.absorb(job);
                return Enqueued::Coalesced(tail_id);
            }
            queue.push_back(job_id);
            self.jobs.insert(job_id, job);
            return Enqueued::Queued(job_id);
        }

        queue.push_back(job_id);
        self.jobs.insert(job_id, job);
        Enqueued::Start(job_id)
    }

    /// Lends a job out for the duration of one step. Must be handed back
    /// with [`restore`](Self::restore) or retired with [`finish_job`](Self::finish_job).
    pub fn take(&mut self, job_id: JobId) -> Option<Job> {
        self.jobs.remove(&job_id)
    }

    pub fn restore(&mut self, job: Job) {
        self.jobs.insert(job.id(), job);
    }

    pub fn queue_len(&self, scope: &str) -> usize {
        self.queues.get(scope).map_or(0, |q| q.len())
    }

    /// Retires the running job of `scope` and returns the next one to start.
    pub fn finish_job(&mut self, scope: &str, job_id: JobId) -> Option<JobId> {
        self.jobs.remove(&job_id);
        let queue = self.queues.get_mut(scope)?;
        if queue.front() == Some(&job_id) {
            queue.pop_front();
        } else {
            tracing::error!(scope, %job_id, "finished job was not at the head of its queue");
            queue.retain(|id| *id != job_id);
        }
        if queue.is_empty() {
            self.queues.remove(scope);
            return None;
        }
        queue.front().copied()
    }

    /// Teardown: resolves every job's waiters with `Aborted` and drops all queues.
    pub fn abort_all(&mut self) -> usize {
        let count = self.jobs.len();
        self.queues.clear();
        for (_, job) in self.jobs.drain() {
            job.abort();
        }
        count
    }
}
