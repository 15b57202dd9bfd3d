use std::collections::{BTreeSet, HashMap};

use tether_core::{ProcessId, VersionId, WorkerId};

use crate::worker_instance::WorkerInstance;

/// Owns every worker instance and knows which process hosts which worker.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    next_worker_id: i32,
    workers: HashMap<WorkerId, WorkerInstance>,
    by_process: HashMap<ProcessId, BTreeSet<WorkerId>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_worker(&mut self, version_id: VersionId, scope: &str, script_url: &str) -> WorkerId {
        let worker_id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.workers.insert(
            worker_id,
            WorkerInstance::new(worker_id, version_id, scope, script_url),
        );
        worker_id
    }

    pub fn remove_worker(&mut self, worker_id: WorkerId) -> Option<WorkerInstance> {
        let worker = self.workers.remove(&worker_id)?;
        if let Some(process_id) = worker.process_id() {
            self.unbind_process(process_id, worker_id);
        }
        Some(worker)
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerInstance> {
        self.workers.get(&worker_id)
    }

    pub fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerInstance> {
        self.workers.get_mut(&worker_id)
    }

    pub fn owner(&self, worker_id: WorkerId) -> Option<VersionId> {
        self.workers.get(&worker_id).map(|w| w.version_id())
    }

    pub fn bind_process(&mut self, process_id: ProcessId, worker_id: WorkerId) {
        self.by_process
            .entry(process_id)
            .or_default()
            .insert(worker_id);
    }

    pub fn unbind_process(&mut self, process_id: ProcessId, worker_id: WorkerId) {
        if let Some(set) = self.by_process.get_mut(&process_id) {
            set.remove(&worker_id);
            if set.is_empty() {
                self.by_process.remove(&process_id);
            }
        }
    }

    /// Owning version of a worker, but only if `process_id` hosts it.
    pub fn route(&self, process_id: ProcessId, worker_id: WorkerId) -> Option<VersionId> {
        let hosted = self
            .by_process
            .get(&process_id)
            .is_some_and(|set| set.contains(&worker_id));
        if !hosted {
            tracing::warn!(%process_id, %worker_id, "dropping message from a process that does not host the worker");
            return None;
        }
        self.owner(worker_id)
    }

    /// Forgets a process and returns the workers it hosted.
    pub fn remove_process(&mut self, process_id: ProcessId) -> Vec<WorkerId> {
        self.by_process
            .remove(&process_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.workers.clear();
        self.by_process.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_only_from_hosting_process() {
        let mut registry = WorkerRegistry::new();
        let w = registry.create_worker(VersionId(5), "https://a.test/", "https://a.test/sw.js");
        registry.bind_process(ProcessId(1), w);

        assert_eq!(registry.route(ProcessId(1), w), Some(VersionId(5)));
        assert_eq!(registry.route(ProcessId(2), w), None);
        assert_eq!(registry.route(ProcessId(1), WorkerId(99)), None);
    }

    #[test]
    fn removing_a_process_returns_hosted_workers() {
        let mut registry = WorkerRegistry::new();
        let a = registry.create_worker(VersionId(1), "https://a.test/", "https://a.test/a.js");
        let b = registry.create_worker(VersionId(2), "https://a.test/b/", "https://a.test/b.js");
        registry.bind_process(ProcessId(7), a);
        registry.bind_process(ProcessId(7), b);

        assert_eq!(registry.remove_process(ProcessId(7)), vec![a, b]);
        assert!(registry.remove_process(ProcessId(7)).is_empty());
        assert_eq!(registry.route(ProcessId(7), a), None);
    }

    #[test]
    fn worker_ids_are_not_reused() {
        let mut registry = WorkerRegistry::new();
        let a = registry.create_worker(VersionId(1), "https://a.test/", "https://a.test/a.js");
        registry.remove_worker(a);
        let b = registry.create_worker(VersionId(2), "https://a.test/", "https://a.test/a.js");
        assert_ne!(a, b);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.owner(b), Some(VersionId(2)));
    }
}
