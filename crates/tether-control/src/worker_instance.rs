use std::collections::BTreeMap;

use tether_core::{
    ProcessId, RunningStatus, ServiceWorkerError, ServiceWorkerResult, StartingPhase, VersionId,
    WorkerId,
};

use crate::host::{WorkerCommand, WorkerTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// Stop directive sent; a `Stopped` notification will follow.
    Stopping,
    /// The process was still being allocated; the start is abandoned.
    CancelledStart,
    /// The directive could not be delivered; the instance is now stopped and
    /// the process must be released.
    Detached(ProcessId),
}

/// Runtime state of one worker, owned by the registry.
#[derive(Debug)]
pub struct WorkerInstance {
    worker_id: WorkerId,
    version_id: VersionId,
    scope: String,
    script_url: String,
    status: RunningStatus,
    phase: StartingPhase,
    process_id: Option<ProcessId>,
    generation: u64,
    devtools_attached: bool,
    process_refs: BTreeMap<ProcessId, usize>,
}

impl WorkerInstance {
    pub fn new(worker_id: WorkerId, version_id: VersionId, scope: &str, script_url: &str) -> Self {
        Self {
            worker_id,
            version_id,
            scope: scope.to_string(),
            script_url: script_url.to_string(),
            status: RunningStatus::Stopped,
            phase: StartingPhase::NotStarting,
            process_id: None,
            generation: 0,
            devtools_attached: false,
            process_refs: BTreeMap::new(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn version_id(&self) -> VersionId {
        self.version_id
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    pub fn status(&self) -> RunningStatus {
        self.status
    }

    pub fn starting_phase(&self) -> StartingPhase {
        self.phase
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn devtools_attached(&self) -> bool {
        self.devtools_attached
    }

    pub fn set_devtools_attached(&mut self, attached: bool) {
        self.devtools_attached = attached;
    }

    pub fn add_process_reference(&mut self, process_id: ProcessId) {
        *self.process_refs.entry(process_id).or_insert(0) += 1;
    }

    pub fn remove_process_reference(&mut self, process_id: ProcessId) {
        if let Some(count) = self.process_refs.get_mut(&process_id) {
            *count -= 1;
            if *count == 0 {
                self.process_refs.remove(&process_id);
            }
        }
    }

    /// Processes ranked by how many clients reference them, then by id.
    pub fn candidates(&self) -> Vec<ProcessId> {
        let mut ranked: Vec<(ProcessId, usize)> =
            self.process_refs.iter().map(|(p, n)| (*p, *n)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(p, _)| p).collect()
    }

    /// Moves to STARTING. Returns the start generation and the ranked
    /// candidate processes for the allocator.
    pub fn begin_start(&mut self) -> ServiceWorkerResult<(u64, Vec<ProcessId>)> {
        if self.status != RunningStatus::Stopped {
            return Err(ServiceWorkerError::InvalidState(format!(
                "worker {} is {}",
                self.worker_id,
                self.status.as_str()
            )));
        }
        self.generation += 1;
        self.status = RunningStatus::Starting;
        self.phase = StartingPhase::AllocatingProcess;
        Ok((self.generation, self.candidates()))
    }

    /// Accepts an allocation only for the start that asked for it.
    pub fn on_process_allocated(&mut self, generation: u64, process_id: ProcessId) -> bool {
        if generation != self.generation
            || self.status != RunningStatus::Starting
            || self.phase != StartingPhase::AllocatingProcess
        {
            return false;
        }
        self.process_id = Some(process_id);
        self.phase = StartingPhase::RegisteringWithProcess;
        true
    }

    pub fn is_current_start(&self, generation: u64) -> bool {
        generation == self.generation && self.status == RunningStatus::Starting
    }

    pub fn send_start(&mut self, transport: &dyn WorkerTransport) -> ServiceWorkerResult<()> {
        let process_id = self.process_id.ok_or(ServiceWorkerError::StartWorkerFailed)?;
        transport.send(
            process_id,
            WorkerCommand::StartWorker {
                worker_id: self.worker_id,
                version_id: self.version_id,
                scope: self.scope.clone(),
                script_url: self.script_url.clone(),
            },
        )?;
        self.phase = StartingPhase::SentStartWorker;
        Ok(())
    }

    fn advance_phase(&mut self, phase: StartingPhase) -> bool {
        if self.status != RunningStatus::Starting {
            return false;
        }
        self.phase = phase;
        true
    }

    pub fn on_script_loaded(&mut self) -> bool {
        self.advance_phase(StartingPhase::ScriptLoaded)
    }

    pub fn on_script_evaluated(&mut self) -> bool {
        self.advance_phase(StartingPhase::ScriptEvaluated)
    }

    pub fn on_started(&mut self) -> bool {
        if !self.advance_phase(StartingPhase::ThreadStarted) {
            return false;
        }
        self.status = RunningStatus::Running;
        self.phase = StartingPhase::NotStarting;
        true
    }

    /// Sends a command to the hosting process.
    pub fn send(
        &self,
        transport: &dyn WorkerTransport,
        command: WorkerCommand,
    ) -> ServiceWorkerResult<()> {
        match (self.status, self.process_id) {
            (RunningStatus::Running | RunningStatus::Starting, Some(process_id)) => {
                transport.send(process_id, command)
            }
            _ => Err(ServiceWorkerError::IpcFailed),
        }
    }

    pub fn stop(&mut self, transport: &dyn WorkerTransport) -> StopOutcome {
        match self.status {
            RunningStatus::Stopped => return StopOutcome::AlreadyStopped,
            RunningStatus::Stopping => return StopOutcome::Stopping,
            RunningStatus::Starting | RunningStatus::Running => {}
        }
        let Some(process_id) = self.process_id else {
            self.detach();
            return StopOutcome::CancelledStart;
        };
        match transport.send(
            process_id,
            WorkerCommand::StopWorker {
                worker_id: self.worker_id,
            },
        ) {
            Ok(()) => {
                self.status = RunningStatus::Stopping;
                self.phase = StartingPhase::NotStarting;
                StopOutcome::Stopping
            }
            Err(err) => {
                tracing::warn!(worker_id = %self.worker_id, %process_id, error = %err, "stop undeliverable, detaching");
                self.detach();
                StopOutcome::Detached(process_id)
            }
        }
    }

    /// Like [`stop`](Self::stop) but only for a running worker without DevTools.
    pub fn stop_if_idle(&mut self, transport: &dyn WorkerTransport) -> Option<StopOutcome> {
        if self.status != RunningStatus::Running || self.devtools_attached {
            return None;
        }
        Some(self.stop(transport))
    }

    /// Forces STOPPED and hands back the process that must be released.
    pub fn detach(&mut self) -> Option<ProcessId> {
        self.status = RunningStatus::Stopped;
        self.phase = StartingPhase::NotStarting;
        self.process_id.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        sent: Mutex<Vec<(ProcessId, WorkerCommand)>>,
    }

    impl WorkerTransport for Recorder {
        fn send(&self, process_id: ProcessId, command: WorkerCommand) -> ServiceWorkerResult<()> {
            if self.fail {
                return Err(ServiceWorkerError::IpcFailed);
            }
            self.sent.lock().unwrap().push((process_id, command));
            Ok(())
        }
    }

    fn worker() -> WorkerInstance {
        WorkerInstance::new(WorkerId(1), VersionId(10), "https://a.test/", "https://a.test/sw.js")
    }

    fn start(w: &mut WorkerInstance, transport: &Recorder) {
        let (generation, _) = w.begin_start().unwrap();
        assert!(w.on_process_allocated(generation, ProcessId(3)));
        w.send_start(transport).unwrap();
        assert!(w.on_script_loaded());
        assert!(w.on_script_evaluated());
        assert!(w.on_started());
    }

    #[test]
    fn walks_through_start_phases() {
        let transport = Recorder::default();
        let mut w = worker();
        let (generation, _) = w.begin_start().unwrap();
        assert_eq!(w.starting_phase(), StartingPhase::AllocatingProcess);
        assert!(w.on_process_allocated(generation, ProcessId(3)));
        assert_eq!(w.starting_phase(), StartingPhase::RegisteringWithProcess);
        w.send_start(&transport).unwrap();
        assert_eq!(w.starting_phase(), StartingPhase::SentStartWorker);
        assert!(w.on_script_loaded());
        assert!(w.on_script_evaluated());
        assert!(w.on_started());
        assert_eq!(w.status(), RunningStatus::Running);
        assert_eq!(w.starting_phase(), StartingPhase::NotStarting);
        assert!(matches!(
            transport.sent.lock().unwrap()[0].1,
            WorkerCommand::StartWorker { .. }
        ));
    }

    #[test]
    fn start_only_from_stopped() {
        let mut w = worker();
        w.begin_start().unwrap();
        assert!(matches!(w.begin_start(), Err(ServiceWorkerError::InvalidState(_))));
    }

    #[test]
    fn stale_allocation_is_rejected() {
        let transport = Recorder::default();
        let mut w = worker();
        let (first, _) = w.begin_start().unwrap();
        assert_eq!(w.stop(&transport), StopOutcome::CancelledStart);
        assert_eq!(w.status(), RunningStatus::Stopped);
        let (second, _) = w.begin_start().unwrap();
        assert!(!w.on_process_allocated(first, ProcessId(1)));
        assert!(w.on_process_allocated(second, ProcessId(2)));
    }

    #[test]
    fn undeliverable_stop_detaches() {
        let ok = Recorder::default();
        let mut w = worker();
        start(&mut w, &ok);

        let broken = Recorder {
            fail: true,
            ..Default::default()
        };
        assert_eq!(w.stop(&broken), StopOutcome::Detached(ProcessId(3)));
        assert_eq!(w.status(), RunningStatus::Stopped);
        assert_eq!(w.process_id(), None);
    }

    #[test]
    fn stop_moves_to_stopping() {
        let transport = Recorder::default();
        let mut w = worker();
        start(&mut w, &transport);
        assert_eq!(w.stop(&transport), StopOutcome::Stopping);
        assert_eq!(w.stop(&transport), StopOutcome::Stopping);
        assert_eq!(w.detach(), Some(ProcessId(3)));
        assert_eq!(w.stop(&transport), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn idle_stop_spares_devtools() {
        let transport = Recorder::default();
        let mut w = worker();
        start(&mut w, &transport);
        w.set_devtools_attached(true);
        assert_eq!(w.stop_if_idle(&transport), None);
        w.set_devtools_attached(false);
        assert_eq!(w.stop_if_idle(&transport), Some(StopOutcome::Stopping));
    }

    #[test]
    fn candidates_rank_by_reference_count_then_id() {
        let mut w = worker();
        w.add_process_reference(ProcessId(9));
        w.add_process_reference(ProcessId(4));
        w.add_process_reference(ProcessId(9));
        w.add_process_reference(ProcessId(2));
        assert_eq!(w.candidates(), vec![ProcessId(9), ProcessId(2), ProcessId(4)]);
        w.remove_process_reference(ProcessId(9));
        w.remove_process_reference(ProcessId(9));
        assert_eq!(w.candidates(), vec![ProcessId(2), ProcessId(4)]);
    }
}
