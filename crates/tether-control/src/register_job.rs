use chrono::Utc;
use tether_core::{
    JobId, ProcessId, RegistrationId, ResourceId, ServiceWorkerError, ServiceWorkerResult,
    TimeoutBehavior, VersionId, VersionStatus, scope,
};
use tokio::sync::oneshot;

use crate::{
    context::{ContextCore, Event},
    host::WorkerEvent,
    job_coordinator::JobInput,
    registration::Registration,
    storage::RegistrationData,
    storage_worker::StoredRegistration,
    version::Waiter,
};

pub type RegisterReply = oneshot::Sender<ServiceWorkerResult<(RegistrationId, VersionId)>>;
pub type RegisterOutcome = ServiceWorkerResult<(RegistrationId, VersionId)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Register,
    /// Re-installs the stored script of an existing registration.
    Update,
}

/// `Initial -> Start -> {Register | Update} -> Install -> Store -> Activate -> Complete`,
/// with `Abort` reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterPhase {
    Initial,
    Start,
    Register,
    Update,
    Install,
    Store,
    Activate,
    Complete,
    Abort,
}

impl RegisterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Start => "start",
            Self::Register => "register",
            Self::Update => "update",
            Self::Install => "install",
            Self::Store => "store",
            Self::Activate => "activate",
            Self::Complete => "complete",
            Self::Abort => "abort",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Abort)
    }

    /// The phase after `self` if `next` is a legal move, else `None`.
    pub fn advance(self, next: RegisterPhase) -> Option<RegisterPhase> {
        use RegisterPhase::*;
        let legal = match (self, next) {
            (Complete | Abort, _) => false,
            (_, Abort) => true,
            (Initial, Start) => true,
            (Start, Register | Update | Complete) => true,
            (Register, Update | Complete) => true,
            (Update, Install | Complete) => true,
            (Install, Store | Complete) => true,
            (Store, Activate | Complete) => true,
            (Activate, Complete) => true,
            _ => false,
        };
        legal.then_some(next)
    }
}

pub struct RegisterWaiter {
    pub reply: Option<RegisterReply>,
    /// Process the caller lives in; ranks allocation candidates.
    pub process_hint: Option<ProcessId>,
}

pub struct RegisterJob {
    pub id: JobId,
    pub kind: RegisterKind,
    pub scope: String,
    /// Empty for an update until START reads the stored script URL.
    pub script_url: String,
    phase: RegisterPhase,
    pub waiters: Vec<RegisterWaiter>,
    pub registration_id: Option<RegistrationId>,
    pub version_id: Option<VersionId>,
    hinted_processes: Vec<ProcessId>,
    /// Waiters whose process hint has already reached the worker.
    hints_applied: usize,
}

impl RegisterJob {
    pub fn new(kind: RegisterKind, scope: &str, script_url: &str, waiter: RegisterWaiter) -> Self {
        Self {
            id: JobId::new(),
            kind,
            scope: scope.to_string(),
            script_url: script_url.to_string(),
            phase: RegisterPhase::Initial,
            waiters: vec![waiter],
            registration_id: None,
            version_id: None,
            hinted_processes: Vec::new(),
            hints_applied: 0,
        }
    }

    pub fn phase(&self) -> RegisterPhase {
        self.phase
    }

    pub fn is_equal(&self, other: &RegisterJob) -> bool {
        if self.kind != other.kind || self.scope != other.scope {
            return false;
        }
        match self.kind {
            RegisterKind::Register => self.script_url == other.script_url,
            RegisterKind::Update => true,
        }
    }

    pub fn resolve_all(&mut self, outcome: RegisterOutcome) {
        for waiter in self.waiters.drain(..) {
            if let Some(reply) = waiter.reply {
                let _ = reply.send(outcome.clone());
            }
        }
    }
}

/// `Ok(None)` while the job is still waiting on a completion.
type Step = ServiceWorkerResult<Option<(RegistrationId, VersionId)>>;

fn vanished(what: &str) -> ServiceWorkerError {
    ServiceWorkerError::InvalidState(format!("{what} vanished while its job was running"))
}

impl ContextCore {
    fn set_register_phase(&self, job: &mut RegisterJob, next: RegisterPhase) -> ServiceWorkerResult<()> {
        let Some(phase) = job.phase.advance(next) else {
            tracing::error!(
                job_id = %job.id,
                from = job.phase.as_str(),
                to = next.as_str(),
                "illegal register job transition"
            );
            return Err(ServiceWorkerError::InvalidState(format!(
                "register job cannot move from {} to {}",
                job.phase.as_str(),
                next.as_str()
            )));
        };
        job.phase = phase;
        self.observer
            .on_job_phase_changed(job.id, &job.scope, phase.as_str());
        Ok(())
    }

    fn job_ids(job: &RegisterJob) -> ServiceWorkerResult<(RegistrationId, VersionId)> {
        let registration_id = job.registration_id.ok_or_else(|| vanished("registration"))?;
        let version_id = job.version_id.ok_or_else(|| vanished("version"))?;
        Ok((registration_id, version_id))
    }

    pub(crate) fn begin_register_job(&mut self, job: &mut RegisterJob) {
        if self.set_register_phase(job, RegisterPhase::Start).is_err() {
            return;
        }
        let pending = self.storage.find_registration_for_pattern(&job.scope);
        self.forward_to_job(job.id, pending, JobInput::Lookup);
    }

    /// Applies one completion. `Some` means the job is finished.
    pub(crate) fn step_register_job(
        &mut self,
        job: &mut RegisterJob,
        input: JobInput,
    ) -> Option<RegisterOutcome> {
        self.apply_register_input(job, input).transpose()
    }

    fn apply_register_input(&mut self, job: &mut RegisterJob, input: JobInput) -> Step {
        use RegisterPhase as P;
        match (job.phase, input) {
            (P::Start, JobInput::Lookup(result)) => self.on_register_lookup(job, result),
            (P::Start, JobInput::StaleDeleted(result)) => {
                result?;
                if let Some(stale) = job.registration_id.take() {
                    self.observer.on_registration_deleted(stale, &job.scope);
                    self.drop_live_registration(stale);
                }
                self.enter_register_phase(job)
            }
            (P::Register, JobInput::RegistrationIdAllocated(result)) => {
                self.on_registration_id(job, result?)
            }
            (P::Update, JobInput::VersionIdAllocated(result)) => self.on_version_id(job, result?),
            (P::Update, JobInput::ScriptReserved(result)) => {
                let resource_id = result?;
                let (_, version_id) = Self::job_ids(job)?;
                let version = self
                    .versions
                    .get_mut(&version_id)
                    .ok_or_else(|| vanished("version"))?;
                version
                    .script_cache
                    .started_caching(&job.script_url, resource_id);
                let job_id = job.id;
                self.write_script_body(resource_id, &job.script_url, move |result| Event::Job {
                    job_id,
                    input: JobInput::ScriptWritten(resource_id, result),
                });
                Ok(None)
            }
            (P::Update, JobInput::ScriptWritten(resource_id, result)) => {
                self.on_main_script_written(job, resource_id, result)
            }
            (P::Update, JobInput::WorkerStarted(result)) => match result {
                Ok(()) => self.enter_install_phase(job),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, scope = %job.scope, error = %err, "worker failed to start");
                    Err(ServiceWorkerError::StartWorkerFailed)
                }
            },
            (P::Install, JobInput::InstallFinished(result)) => match result {
                Ok(()) => self.enter_store_phase(job),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, scope = %job.scope, error = %err, "install failed");
                    Err(ServiceWorkerError::InstallFailed)
                }
            },
            (P::Store, JobInput::Stored(result)) => {
                if let Some(deleted) = result? {
                    tracing::debug!(
                        version_id = %deleted.version_id,
                        resources = deleted.resource_ids.len(),
                        "superseded version resources are purgeable"
                    );
                }
                self.enter_activate_phase(job)
            }
            (P::Activate, JobInput::ActivateFinished(result)) => match result {
                Ok(()) => Self::job_ids(job).map(Some),
                Err(err) if err.is_storage_failure() => Err(err),
                Err(_) => Err(ServiceWorkerError::ActivateFailed),
            },
            (phase, input) => {
                tracing::warn!(job_id = %job.id, phase = phase.as_str(), ?input, "unexpected register job input");
                Ok(None)
            }
        }
    }

    fn on_register_lookup(
        &mut self,
        job: &mut RegisterJob,
        result: ServiceWorkerResult<StoredRegistration>,
    ) -> Step {
        let (data, resources) = match result {
            Ok(found) => found,
            Err(ServiceWorkerError::NotFound) if job.kind == RegisterKind::Register => {
                return self.enter_register_phase(job);
            }
            Err(err) => return Err(err),
        };

        let registration_id = self.materialize(data, resources);
        job.registration_id = Some(registration_id);
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or_else(|| vanished("registration"))?;

        if job.kind == RegisterKind::Update {
            if registration.is_uninstalling {
                return Err(ServiceWorkerError::NotFound);
            }
            job.script_url = registration.script_url.clone();
            let now = Utc::now();
            registration.last_update_check = now;
            let origin = registration.origin.clone();
            let pending = self
                .storage
                .update_last_update_check_time(registration_id, &origin, now);
            self.log_storage_failure(pending, "update last update check");
            return self.enter_update_phase(job);
        }

        if registration.is_uninstalling {
            tracing::info!(%registration_id, scope = %job.scope, "registration resurrected");
            registration.is_uninstalling = false;
        }
        if registration.script_url != job.script_url {
            tracing::info!(
                %registration_id,
                old = %registration.script_url,
                new = %job.script_url,
                "script changed, replacing registration"
            );
            let origin = registration.origin.clone();
            let pending = self.storage.delete_registration(registration_id, &origin);
            self.forward_to_job(job.id, pending, JobInput::StaleDeleted);
            return Ok(None);
        }
        match registration.active_version() {
            Some(active) => Ok(Some((registration_id, active))),
            None => self.enter_update_phase(job),
        }
    }

    fn enter_register_phase(&mut self, job: &mut RegisterJob) -> Step {
        self.set_register_phase(job, RegisterPhase::Register)?;
        let pending = self.storage.new_registration_id();
        self.forward_to_job(job.id, pending, JobInput::RegistrationIdAllocated);
        Ok(None)
    }

    fn on_registration_id(&mut self, job: &mut RegisterJob, registration_id: RegistrationId) -> Step {
        let origin = scope::origin_of(&job.scope).ok_or_else(|| {
            ServiceWorkerError::Disallowed(format!("scope has no origin: {}", job.scope))
        })?;
        let registration = Registration::new(
            registration_id,
            &job.scope,
            &job.script_url,
            &origin,
            Utc::now(),
        );
        self.registrations.insert(registration_id, registration);
        job.registration_id = Some(registration_id);
        self.enter_update_phase(job)
    }

    fn enter_update_phase(&mut self, job: &mut RegisterJob) -> Step {
        self.set_register_phase(job, RegisterPhase::Update)?;
        let pending = self.storage.new_version_id();
        self.forward_to_job(job.id, pending, JobInput::VersionIdAllocated);
        Ok(None)
    }

    fn on_version_id(&mut self, job: &mut RegisterJob, version_id: VersionId) -> Step {
        let registration_id = job.registration_id.ok_or_else(|| vanished("registration"))?;
        self.create_version(
            registration_id,
            version_id,
            &job.scope,
            &job.script_url,
            VersionStatus::New,
        );
        job.version_id = Some(version_id);
        if let Some(registration) = self.registrations.get_mut(&registration_id)
            && let Some(displaced) = registration.set_installing(version_id)
        {
            self.mark_redundant(displaced);
        }
        let pending = self.storage.reserve_uncommitted_resource_id();
        self.forward_to_job(job.id, pending, JobInput::ScriptReserved);
        Ok(None)
    }

    fn on_main_script_written(
        &mut self,
        job: &mut RegisterJob,
        resource_id: ResourceId,
        result: ServiceWorkerResult<u64>,
    ) -> Step {
        let (_, version_id) = Self::job_ids(job)?;
        let version = self
            .versions
            .get_mut(&version_id)
            .ok_or_else(|| vanished("version"))?;
        match result {
            Ok(size_bytes) => {
                version.script_cache.finished_caching(resource_id, size_bytes);
            }
            Err(err) => {
                tracing::warn!(%resource_id, url = %job.script_url, error = %err, "main script write failed");
                version.script_cache.failed_caching(resource_id);
                self.doom_resources(vec![resource_id]);
                return Err(ServiceWorkerError::StartWorkerFailed);
            }
        }

        self.apply_process_hints(job);
        self.start_worker_for(
            version_id,
            Waiter::Job {
                job_id: job.id,
                wake: JobInput::WorkerStarted,
            },
        );
        Ok(None)
    }

    /// Adds the process hints of waiters that joined since the last call as
    /// references on the job's worker. No-op until the version exists.
    pub(crate) fn apply_process_hints(&mut self, job: &mut RegisterJob) {
        let Some(worker) = job
            .version_id
            .and_then(|v| self.versions.get(&v))
            .and_then(|v| self.registry.get_mut(v.worker_id))
        else {
            return;
        };
        for waiter in job.waiters.iter().skip(job.hints_applied) {
            if let Some(hint) = waiter.process_hint {
                worker.add_process_reference(hint);
                job.hinted_processes.push(hint);
            }
        }
        job.hints_applied = job.waiters.len();
    }

    fn enter_install_phase(&mut self, job: &mut RegisterJob) -> Step {
        let (registration_id, version_id) = Self::job_ids(job)?;
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or_else(|| vanished("registration"))?;
        let displaced = registration.set_waiting(version_id);
        self.observer
            .on_waiting_version_changed(registration_id, Some(version_id));
        if let Some(displaced) = displaced {
            self.mark_redundant(displaced);
        }

        self.set_register_phase(job, RegisterPhase::Install)?;
        self.set_version_status(version_id, VersionStatus::Installing);
        self.dispatch(
            version_id,
            WorkerEvent::Install,
            TimeoutBehavior::KillOnTimeout,
            Waiter::Job {
                job_id: job.id,
                wake: JobInput::InstallFinished,
            },
        );
        Ok(None)
    }

    fn enter_store_phase(&mut self, job: &mut RegisterJob) -> Step {
        let (registration_id, version_id) = Self::job_ids(job)?;
        self.set_register_phase(job, RegisterPhase::Store)?;
        let registration = self
            .registrations
            .get(&registration_id)
            .ok_or_else(|| vanished("registration"))?;
        let version = self
            .versions
            .get(&version_id)
            .ok_or_else(|| vanished("version"))?;
        if version.script_cache.is_writing() {
            tracing::debug!(%version_id, "storing while imported scripts are still being written");
        }
        let resources = version.script_cache.resources();
        let data = RegistrationData {
            registration_id,
            scope: registration.scope.clone(),
            script_url: registration.script_url.clone(),
            version_id,
            is_active: false,
            has_fetch_handler: version.has_fetch_handler,
            last_update_check: registration.last_update_check,
            resources_total_size_bytes: resources.iter().map(|r| r.size_bytes).sum(),
        };
        let pending = self.storage.write_registration(data, resources);
        self.forward_to_job(job.id, pending, JobInput::Stored);
        Ok(None)
    }

    fn enter_activate_phase(&mut self, job: &mut RegisterJob) -> Step {
        let (registration_id, version_id) = Self::job_ids(job)?;
        let registration = self
            .registrations
            .get_mut(&registration_id)
            .ok_or_else(|| vanished("registration"))?;
        registration.stored = true;
        let scope = registration.scope.clone();
        let active = registration.active_version();
        self.observer.on_registration_stored(registration_id, &scope);
        self.set_version_status(version_id, VersionStatus::Installed);

        self.set_register_phase(job, RegisterPhase::Activate)?;
        if let Some(active) = active
            && self.versions.get(&active).is_some_and(|v| v.has_controllees())
        {
            tracing::info!(%registration_id, %version_id, %active, "activation deferred until the active version has no controllees");
            return Ok(Some((registration_id, version_id)));
        }
        self.activate_waiting_version(registration_id, Some(job.id));
        Ok(None)
    }

    /// Unwinds a failed job, answers every waiter once, and marks the job terminal.
    pub(crate) fn complete_register_job(&mut self, job: &mut RegisterJob, outcome: RegisterOutcome) {
        if let Err(err) = &outcome {
            tracing::warn!(job_id = %job.id, scope = %job.scope, error = %err, "register job failed");
            if let Some(version_id) = job.version_id {
                if let Some(version) = self.versions.get(&version_id) {
                    let ids = version.script_cache.resource_ids();
                    self.doom_resources(ids);
                }
                self.mark_redundant(version_id);
            }
            if let Some(registration_id) = job.registration_id
                && let Some(registration) = self.registrations.get(&registration_id)
                && registration.is_deletable()
            {
                if registration.stored {
                    let origin = registration.origin.clone();
                    let scope = registration.scope.clone();
                    let pending = self.storage.delete_registration(registration_id, &origin);
                    self.log_storage_failure(pending, "delete registration after failed job");
                    self.observer.on_registration_deleted(registration_id, &scope);
                }
                self.drop_live_registration(registration_id);
            }
        } else {
            tracing::info!(job_id = %job.id, scope = %job.scope, kind = ?job.kind, "register job finished");
        }

        if let Some(version_id) = job.version_id
            && let Some(version) = self.versions.get(&version_id)
            && let Some(worker) = self.registry.get_mut(version.worker_id)
        {
            for hint in job.hinted_processes.drain(..) {
                worker.remove_process_reference(hint);
            }
        }

        let terminal = if matches!(outcome, Err(ServiceWorkerError::Aborted)) {
            RegisterPhase::Abort
        } else {
            RegisterPhase::Complete
        };
        let _ = self.set_register_phase(job, terminal);
        job.resolve_all(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use RegisterPhase::*;
        let mut phase = Initial;
        for next in [Start, Register, Update, Install, Store, Activate, Complete] {
            phase = phase.advance(next).unwrap();
        }
        assert!(phase.is_terminal());
    }

    #[test]
    fn phases_never_move_backwards() {
        use RegisterPhase::*;
        assert_eq!(Install.advance(Update), None);
        assert_eq!(Store.advance(Register), None);
        assert_eq!(Initial.advance(Install), None);
        assert_eq!(Start.advance(Install), None);
    }

    #[test]
    fn abort_from_any_live_phase_only() {
        use RegisterPhase::*;
        for phase in [Initial, Start, Register, Update, Install, Store, Activate] {
            assert_eq!(phase.advance(Abort), Some(Abort));
        }
        assert_eq!(Complete.advance(Abort), None);
        assert_eq!(Abort.advance(Complete), None);
    }

    #[test]
    fn every_live_phase_after_start_can_complete() {
        use RegisterPhase::*;
        for phase in [Start, Register, Update, Install, Store, Activate] {
            assert_eq!(phase.advance(Complete), Some(Complete));
        }
        assert_eq!(Initial.advance(Complete), None);
    }

    fn job(kind: RegisterKind, scope: &str, script: &str) -> RegisterJob {
        RegisterJob::new(
            kind,
            scope,
            script,
            RegisterWaiter {
                reply: None,
                process_hint: None,
            },
        )
    }

    #[test]
    fn equality_depends_on_kind() {
        let a = job(RegisterKind::Register, "https://a.test/", "https://a.test/sw.js");
        let b = job(RegisterKind::Register, "https://a.test/", "https://a.test/sw2.js");
        assert!(!a.is_equal(&b));
        assert!(a.is_equal(&job(RegisterKind::Register, "https://a.test/", "https://a.test/sw.js")));

        let u1 = job(RegisterKind::Update, "https://a.test/", "");
        let u2 = job(RegisterKind::Update, "https://a.test/", "");
        assert!(u1.is_equal(&u2));
        assert!(!u1.is_equal(&a));
    }

    #[tokio::test]
    async fn resolve_all_answers_each_waiter_once() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let mut j = RegisterJob::new(
            RegisterKind::Register,
            "https://a.test/",
            "https://a.test/sw.js",
            RegisterWaiter {
                reply: Some(tx1),
                process_hint: None,
            },
        );
        j.waiters.push(RegisterWaiter {
            reply: Some(tx2),
            process_hint: Some(ProcessId(4)),
        });
        j.resolve_all(Ok((RegistrationId(1), VersionId(2))));
        assert_eq!(rx1.await.unwrap(), Ok((RegistrationId(1), VersionId(2))));
        assert_eq!(rx2.await.unwrap(), Ok((RegistrationId(1), VersionId(2))));
        assert!(j.waiters.is_empty());
    }
}
