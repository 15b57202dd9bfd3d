use tether_core::{JobId, RegistrationId, ServiceWorkerError, ServiceWorkerResult};
use tokio::sync::oneshot;

use crate::{
    context::ContextCore, job_coordinator::JobInput, storage::DeleteOutcome,
    storage_worker::StoredRegistration,
};

pub type UnregisterReply = oneshot::Sender<ServiceWorkerResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterPhase {
    Initial,
    Start,
    Unregister,
    Complete,
    Abort,
}

impl UnregisterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Start => "start",
            Self::Unregister => "unregister",
            Self::Complete => "complete",
            Self::Abort => "abort",
        }
    }

    pub fn advance(self, next: UnregisterPhase) -> Option<UnregisterPhase> {
        use UnregisterPhase::*;
        let legal = match (self, next) {
            (Complete | Abort, _) => false,
            (_, Abort) => true,
            (Initial, Start) | (Start, Unregister | Complete) | (Unregister, Complete) => true,
            _ => false,
        };
        legal.then_some(next)
    }
}

/// Deletes the stored row right away unless the active version still has
/// controllees; then the row goes when the last controllee leaves.
pub struct UnregisterJob {
    pub id: JobId,
    pub scope: String,
    phase: UnregisterPhase,
    pub waiters: Vec<UnregisterReply>,
    registration_id: Option<RegistrationId>,
}

impl UnregisterJob {
    pub fn new(scope: &str, reply: UnregisterReply) -> Self {
        Self {
            id: JobId::new(),
            scope: scope.to_string(),
            phase: UnregisterPhase::Initial,
            waiters: vec![reply],
            registration_id: None,
        }
    }

    pub fn phase(&self) -> UnregisterPhase {
        self.phase
    }

    pub fn resolve_all(&mut self, outcome: ServiceWorkerResult<()>) {
        for reply in self.waiters.drain(..) {
            let _ = reply.send(outcome.clone());
        }
    }
}

impl ContextCore {
    fn set_unregister_phase(&self, job: &mut UnregisterJob, next: UnregisterPhase) {
        match job.phase.advance(next) {
            Some(phase) => {
                job.phase = phase;
                self.observer
                    .on_job_phase_changed(job.id, &job.scope, phase.as_str());
            }
            None => tracing::error!(
                job_id = %job.id,
                from = job.phase.as_str(),
                to = next.as_str(),
                "illegal unregister job transition"
            ),
        }
    }

    pub(crate) fn begin_unregister_job(&mut self, job: &mut UnregisterJob) {
        self.set_unregister_phase(job, UnregisterPhase::Start);
        let pending = self.storage.find_registration_for_pattern(&job.scope);
        self.forward_to_job(job.id, pending, JobInput::Lookup);
    }

    pub(crate) fn step_unregister_job(
        &mut self,
        job: &mut UnregisterJob,
        input: JobInput,
    ) -> Option<ServiceWorkerResult<()>> {
        match (job.phase, input) {
            (UnregisterPhase::Start, JobInput::Lookup(result)) => self.on_unregister_lookup(job, result),
            (UnregisterPhase::Unregister, JobInput::Unregistered(result)) => {
                Some(self.on_unregistered(job, result))
            }
            (phase, input) => {
                tracing::warn!(job_id = %job.id, phase = phase.as_str(), ?input, "unexpected unregister job input");
                None
            }
        }
    }

    fn on_unregister_lookup(
        &mut self,
        job: &mut UnregisterJob,
        result: ServiceWorkerResult<StoredRegistration>,
    ) -> Option<ServiceWorkerResult<()>> {
        let (data, resources) = match result {
            Ok(found) => found,
            Err(err) => return Some(Err(err)),
        };
        let registration_id = self.materialize(data, resources);
        job.registration_id = Some(registration_id);
        self.set_unregister_phase(job, UnregisterPhase::Unregister);

        let Some(registration) = self.registrations.get_mut(&registration_id) else {
            return Some(Err(ServiceWorkerError::NotFound));
        };
        registration.is_uninstalling = true;
        let origin = registration.origin.clone();
        let controlled = registration
            .active_version()
            .and_then(|active| self.versions.get(&active))
            .is_some_and(|v| v.has_controllees());
        if controlled {
            tracing::info!(%registration_id, scope = %job.scope, "uninstall deferred until controllees leave");
            return Some(Ok(()));
        }

        let pending = self.storage.delete_registration(registration_id, &origin);
        self.forward_to_job(job.id, pending, JobInput::Unregistered);
        None
    }

    fn on_unregistered(
        &mut self,
        job: &mut UnregisterJob,
        result: ServiceWorkerResult<DeleteOutcome>,
    ) -> ServiceWorkerResult<()> {
        let registration_id = job.registration_id.ok_or(ServiceWorkerError::NotFound)?;
        match result {
            Ok(outcome) => {
                tracing::debug!(%registration_id, origin_is_deletable = outcome.origin_is_deletable, "registration row deleted");
                self.observer.on_registration_deleted(registration_id, &job.scope);
                self.drop_live_registration(registration_id);
                Ok(())
            }
            Err(err) => {
                if let Some(registration) = self.registrations.get_mut(&registration_id) {
                    registration.is_uninstalling = false;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn complete_unregister_job(
        &mut self,
        job: &mut UnregisterJob,
        outcome: ServiceWorkerResult<()>,
    ) {
        if let Err(err) = &outcome {
            tracing::info!(job_id = %job.id, scope = %job.scope, error = %err, "unregister job failed");
        }
        let terminal = if matches!(outcome, Err(ServiceWorkerError::Aborted)) {
            UnregisterPhase::Abort
        } else {
            UnregisterPhase::Complete
        };
        self.set_unregister_phase(job, terminal);
        job.resolve_all(outcome);
    }
}
