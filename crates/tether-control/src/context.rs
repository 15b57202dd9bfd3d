use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use tether_core::{
    ClientId, JobId, ProcessId, RegistrationId, RequestId, ResourceId, RunningStatus,
    ServiceWorkerError, ServiceWorkerResult, TimeoutBehavior, VersionId, VersionStatus, WorkerId,
    scope,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::Instrument;

use crate::{
    config::CoordinatorConfig,
    host::{EventStatus, Host, WorkerCommand, WorkerEvent, WorkerNotification},
    job_coordinator::{Enqueued, Job, JobCoordinator, JobInput},
    observer::ContextObserver,
    register_job::{RegisterJob, RegisterKind, RegisterReply, RegisterWaiter},
    registration::{Registration, RegistrationInfo, Slot, VersionInfo},
    storage::{DeleteOutcome, RegistrationData, ResourceRecord, ResourceStore},
    storage_worker::{Pending, StorageHandle, StoredRegistration, resolve, spawn_storage_worker},
    unregister_job::UnregisterJob,
    version::{EventSink, QueuedEvent, Version, Waiter, request_kind},
    worker_instance::StopOutcome,
    worker_registry::WorkerRegistry,
};

type Reply<T> = oneshot::Sender<ServiceWorkerResult<T>>;

/// What a lookup was keyed on; decides the live fallback on a storage miss.
#[derive(Debug, Clone)]
pub(crate) enum LookupKey {
    Document(String),
    Scope(String),
    Id(RegistrationId, String),
}

/// Completions posted back to the coordination task.
pub(crate) enum Event {
    Job {
        job_id: JobId,
        input: JobInput,
    },
    ActivateFinished {
        registration_id: RegistrationId,
        version_id: VersionId,
        job_id: Option<JobId>,
        result: ServiceWorkerResult<()>,
    },
    ProcessAllocated {
        worker_id: WorkerId,
        generation: u64,
        result: ServiceWorkerResult<ProcessId>,
    },
    ImportReserved {
        version_id: VersionId,
        url: String,
        result: ServiceWorkerResult<ResourceId>,
    },
    ImportWritten {
        version_id: VersionId,
        resource_id: ResourceId,
        result: ServiceWorkerResult<u64>,
    },
    LookupFinished {
        key: LookupKey,
        result: ServiceWorkerResult<StoredRegistration>,
        reply: Reply<RegistrationInfo>,
    },
    AllListed {
        result: ServiceWorkerResult<Vec<RegistrationData>>,
        reply: Reply<Vec<RegistrationInfo>>,
    },
    PurgeableListed {
        result: ServiceWorkerResult<Vec<ResourceId>>,
        reply: Reply<usize>,
    },
    DeferredUninstallFinished {
        registration_id: RegistrationId,
        scope: String,
        result: ServiceWorkerResult<DeleteOutcome>,
    },
}

enum Command {
    Register {
        scope: String,
        script_url: String,
        process_hint: Option<ProcessId>,
        reply: RegisterReply,
    },
    Unregister {
        scope: String,
        reply: Reply<()>,
    },
    Update {
        scope: String,
        reply: RegisterReply,
    },
    Find {
        key: LookupKey,
        reply: Reply<RegistrationInfo>,
    },
    GetAllInfo {
        reply: Reply<Vec<RegistrationInfo>>,
    },
    GetVersionInfo {
        version_id: VersionId,
        reply: Reply<VersionInfo>,
    },
    StartWorker {
        version_id: VersionId,
        reply: Reply<()>,
    },
    StopWorker {
        version_id: VersionId,
        reply: Reply<()>,
    },
    DispatchEvent {
        version_id: VersionId,
        event: WorkerEvent,
        behavior: TimeoutBehavior,
        reply: Reply<()>,
    },
    AddControllee {
        version_id: VersionId,
        client: ClientId,
        reply: Reply<()>,
    },
    RemoveControllee {
        version_id: VersionId,
        client: ClientId,
        reply: Reply<()>,
    },
    AddProcessReference {
        version_id: VersionId,
        process_id: ProcessId,
        reply: Reply<()>,
    },
    RemoveProcessReference {
        version_id: VersionId,
        process_id: ProcessId,
        reply: Reply<()>,
    },
    SetDevToolsAttached {
        version_id: VersionId,
        attached: bool,
        reply: Reply<()>,
    },
    WorkerNotification {
        process_id: ProcessId,
        notification: WorkerNotification,
    },
    ProcessGone {
        process_id: ProcessId,
    },
    PurgeResources {
        reply: Reply<usize>,
    },
    DeleteAndStartOver {
        reply: Reply<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns every registration, version, worker and job. Never awaits a
/// collaborator inline; forwarder tasks post an [`Event`] back instead.
pub(crate) struct ContextCore {
    pub(crate) config: CoordinatorConfig,
    pub(crate) storage: StorageHandle,
    pub(crate) host: Host,
    pub(crate) observer: Arc<dyn ContextObserver>,
    pub(crate) events: EventSink,
    pub(crate) jobs: JobCoordinator,
    pub(crate) registrations: HashMap<RegistrationId, Registration>,
    pub(crate) versions: HashMap<VersionId, Version>,
    pub(crate) registry: WorkerRegistry,
}

impl ContextCore {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut timer = time::interval(self.config.timeout_timer_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.config.purge_on_startup {
            let (reply, rx) = oneshot::channel();
            self.purge_resources(reply);
            tokio::spawn(async move {
                match rx.await {
                    Ok(Ok(count)) => tracing::info!(count, "purged resources on startup"),
                    Ok(Err(err)) => tracing::warn!(error = %err, "startup purge failed"),
                    Err(_) => {}
                }
            });
        }

        tracing::info!("context started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown_live_state();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown_live_state();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = timer.tick() => self.on_timer(Instant::now()),
            }
        }
        tracing::info!("context stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                scope,
                script_url,
                process_hint,
                reply,
            } => {
                if let Err(err) = scope::validate_registration(&scope, &script_url) {
                    tracing::info!(%scope, %script_url, error = %err, "register rejected");
                    let _ = reply.send(Err(err));
                    return;
                }
                let job = RegisterJob::new(
                    RegisterKind::Register,
                    &scope,
                    &script_url,
                    RegisterWaiter {
                        reply: Some(reply),
                        process_hint,
                    },
                );
                self.enqueue_job(Job::Register(job));
            }
            Command::Update { scope, reply } => {
                let job = RegisterJob::new(
                    RegisterKind::Update,
                    &scope,
                    "",
                    RegisterWaiter {
                        reply: Some(reply),
                        process_hint: None,
                    },
                );
                self.enqueue_job(Job::Register(job));
            }
            Command::Unregister { scope, reply } => {
                self.enqueue_job(Job::Unregister(UnregisterJob::new(&scope, reply)));
            }
            Command::Find { key, reply } => self.find_registration(key, reply),
            Command::GetAllInfo { reply } => {
                let pending = self.storage.get_all_registrations();
                self.forward(pending, move |result| Event::AllListed { result, reply });
            }
            Command::GetVersionInfo { version_id, reply } => {
                let _ = reply.send(self.version_info(version_id).ok_or(ServiceWorkerError::NotFound));
            }
            Command::StartWorker { version_id, reply } => {
                self.start_worker_for(version_id, Waiter::Caller(reply));
            }
            Command::StopWorker { version_id, reply } => {
                self.stop_worker_for(version_id, Waiter::Caller(reply));
            }
            Command::DispatchEvent {
                version_id,
                event,
                behavior,
                reply,
            } => self.dispatch(version_id, event, behavior, Waiter::Caller(reply)),
            Command::AddControllee {
                version_id,
                client,
                reply,
            } => {
                let _ = reply.send(self.add_controllee(version_id, client));
            }
            Command::RemoveControllee {
                version_id,
                client,
                reply,
            } => {
                let _ = reply.send(self.remove_controllee(version_id, client));
            }
            Command::AddProcessReference {
                version_id,
                process_id,
                reply,
            } => {
                let result = self
                    .worker_of(version_id)
                    .map(|worker_id| {
                        if let Some(worker) = self.registry.get_mut(worker_id) {
                            worker.add_process_reference(process_id);
                        }
                    });
                let _ = reply.send(result);
            }
            Command::RemoveProcessReference {
                version_id,
                process_id,
                reply,
            } => {
                let result = self
                    .worker_of(version_id)
                    .map(|worker_id| {
                        if let Some(worker) = self.registry.get_mut(worker_id) {
                            worker.remove_process_reference(process_id);
                        }
                    });
                let _ = reply.send(result);
            }
            Command::SetDevToolsAttached {
                version_id,
                attached,
                reply,
            } => {
                let result = self
                    .worker_of(version_id)
                    .map(|worker_id| {
                        if let Some(worker) = self.registry.get_mut(worker_id) {
                            worker.set_devtools_attached(attached);
                        }
                    });
                let _ = reply.send(result);
            }
            Command::WorkerNotification {
                process_id,
                notification,
            } => self.on_worker_notification(process_id, notification),
            Command::ProcessGone { process_id } => self.on_process_gone(process_id),
            Command::PurgeResources { reply } => self.purge_resources(reply),
            Command::DeleteAndStartOver { reply } => {
                self.teardown_live_state();
                let pending = self.storage.delete_and_start_over();
                tokio::spawn(async move {
                    let _ = reply.send(resolve(pending).await);
                });
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Job { job_id, input } => self.on_job_input(job_id, input),
            Event::ActivateFinished {
                registration_id,
                version_id,
                job_id,
                result,
            } => self.on_activate_finished(registration_id, version_id, job_id, result),
            Event::ProcessAllocated {
                worker_id,
                generation,
                result,
            } => self.on_process_allocated(worker_id, generation, result),
            Event::ImportReserved {
                version_id,
                url,
                result,
            } => self.on_import_reserved(version_id, url, result),
            Event::ImportWritten {
                version_id,
                resource_id,
                result,
            } => self.on_import_written(version_id, resource_id, result),
            Event::LookupFinished { key, result, reply } => {
                let _ = reply.send(self.on_lookup_finished(&key, result));
            }
            Event::AllListed { result, reply } => {
                let _ = reply.send(result.map(|rows| self.merge_all_info(rows)));
            }
            Event::PurgeableListed { result, reply } => self.on_purgeable_listed(result, reply),
            Event::DeferredUninstallFinished {
                registration_id,
                scope,
                result,
            } => self.on_deferred_uninstall_finished(registration_id, &scope, result),
        }
    }

    // ---- plumbing ----

    /// Awaits `pending` off-task and posts the wrapped result back.
    pub(crate) fn forward<T: Send + 'static>(
        &self,
        pending: Pending<T>,
        wrap: impl FnOnce(ServiceWorkerResult<T>) -> Event + Send + 'static,
    ) {
        let sink = self.events.clone();
        tokio::spawn(async move {
            let result = resolve(pending).await;
            let _ = sink.send(wrap(result));
        });
    }

    pub(crate) fn forward_to_job<T: Send + 'static>(
        &self,
        job_id: JobId,
        pending: Pending<T>,
        wrap: fn(ServiceWorkerResult<T>) -> JobInput,
    ) {
        self.forward(pending, move |result| Event::Job {
            job_id,
            input: wrap(result),
        });
    }

    pub(crate) fn send_job_input(&self, job_id: JobId, input: JobInput) {
        let _ = self.events.send(Event::Job { job_id, input });
    }

    /// For storage writes nobody waits on.
    pub(crate) fn log_storage_failure<T: Send + 'static>(&self, pending: Pending<T>, what: &'static str) {
        tokio::spawn(async move {
            if let Err(err) = resolve(pending).await {
                tracing::warn!(error = %err, what, "storage request failed");
            }
        });
    }

    pub(crate) fn write_script_body(
        &self,
        resource_id: ResourceId,
        url: &str,
        wrap: impl FnOnce(ServiceWorkerResult<u64>) -> Event + Send + 'static,
    ) {
        let bodies = self.host.bodies.clone();
        let sink = self.events.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            let result = bodies.write_script(resource_id, &url).await;
            let _ = sink.send(wrap(result));
        });
    }

    pub(crate) fn doom_resources(&self, ids: Vec<ResourceId>) {
        if ids.is_empty() {
            return;
        }
        let pending = self.storage.doom_uncommitted_resource_ids(ids);
        self.log_storage_failure(pending, "doom uncommitted resources");
    }

    fn release_process(&self, worker_id: WorkerId, process_id: ProcessId) {
        let allocator = self.host.allocator.clone();
        tokio::spawn(async move {
            allocator.release(worker_id, process_id).await;
        });
    }

    fn worker_of(&self, version_id: VersionId) -> ServiceWorkerResult<WorkerId> {
        self.versions
            .get(&version_id)
            .map(|v| v.worker_id)
            .ok_or(ServiceWorkerError::NotFound)
    }

    fn running_status(&self, version_id: VersionId) -> RunningStatus {
        self.versions
            .get(&version_id)
            .and_then(|v| self.registry.get(v.worker_id))
            .map_or(RunningStatus::Stopped, |w| w.status())
    }

    // ---- jobs ----

    fn enqueue_job(&mut self, job: Job) {
        let scope = job.scope().to_string();
        match self.jobs.enqueue(job) {
            Enqueued::Start(job_id) => self.start_job(job_id),
            Enqueued::Queued(job_id) => {
                tracing::debug!(%scope, %job_id, depth = self.jobs.queue_len(&scope), "job queued");
            }
            Enqueued::Coalesced(job_id) => {
                tracing::debug!(%scope, %job_id, "job coalesced onto queue tail");
                if let Some(mut job) = self.jobs.take(job_id) {
                    if let Job::Register(register) = &mut job {
                        self.apply_process_hints(register);
                    }
                    self.jobs.restore(job);
                }
            }
        }
    }

    fn start_job(&mut self, job_id: JobId) {
        let Some(mut job) = self.jobs.take(job_id) else {
            return;
        };
        match &mut job {
            Job::Register(register) => self.begin_register_job(register),
            Job::Unregister(unregister) => self.begin_unregister_job(unregister),
        }
        self.jobs.restore(job);
    }

    fn on_job_input(&mut self, job_id: JobId, input: JobInput) {
        let Some(mut job) = self.jobs.take(job_id) else {
            tracing::debug!(%job_id, ?input, "input for a finished job dropped");
            return;
        };
        let finished = match &mut job {
            Job::Register(register) => match self.step_register_job(register, input) {
                Some(outcome) => {
                    self.complete_register_job(register, outcome);
                    true
                }
                None => false,
            },
            Job::Unregister(unregister) => match self.step_unregister_job(unregister, input) {
                Some(outcome) => {
                    self.complete_unregister_job(unregister, outcome);
                    true
                }
                None => false,
            },
        };
        if !finished {
            self.jobs.restore(job);
            return;
        }
        let scope = job.scope().to_string();
        if let Some(next) = self.jobs.finish_job(&scope, job_id) {
            self.start_job(next);
        }
    }

    // ---- registrations and versions ----

    pub(crate) fn create_version(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
        scope: &str,
        script_url: &str,
        status: VersionStatus,
    ) {
        let worker_id = self.registry.create_worker(version_id, scope, script_url);
        let version = Version::new(
            version_id,
            registration_id,
            scope,
            script_url,
            status,
            worker_id,
            Instant::now(),
        );
        self.versions.insert(version_id, version);
        self.observer.on_version_status_changed(version_id, status);
    }

    pub(crate) fn set_version_status(&mut self, version_id: VersionId, status: VersionStatus) {
        if let Some(version) = self.versions.get_mut(&version_id)
            && version.set_status(status)
        {
            self.observer.on_version_status_changed(version_id, status);
        }
    }

    /// Live state for a stored row. An existing live registration wins.
    pub(crate) fn materialize(
        &mut self,
        data: RegistrationData,
        resources: Vec<ResourceRecord>,
    ) -> RegistrationId {
        let registration_id = data.registration_id;
        if let Some(registration) = self.registrations.get_mut(&registration_id) {
            registration.stored = true;
            return registration_id;
        }

        let origin = data.origin().unwrap_or_default();
        let mut registration = Registration::new(
            registration_id,
            &data.scope,
            &data.script_url,
            &origin,
            data.last_update_check,
        );
        registration.stored = true;

        let version_id = data.version_id;
        if !self.versions.contains_key(&version_id) {
            let status = if data.is_active {
                VersionStatus::Activated
            } else {
                VersionStatus::Installed
            };
            self.create_version(registration_id, version_id, &data.scope, &data.script_url, status);
            if let Some(version) = self.versions.get_mut(&version_id) {
                version.script_cache.set_resources(resources);
                version.has_fetch_handler = data.has_fetch_handler;
            }
        }
        if self
            .versions
            .get(&version_id)
            .is_some_and(|v| v.status() != VersionStatus::Redundant)
        {
            if data.is_active {
                registration.set_active(version_id);
            } else {
                registration.set_waiting(version_id);
            }
        }
        tracing::debug!(%registration_id, scope = %data.scope, %version_id, "registration loaded");
        self.registrations.insert(registration_id, registration);
        registration_id
    }

    pub(crate) fn mark_redundant(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };
        version.clear_controllees();
        let registration_id = version.registration_id;
        if version.set_status(VersionStatus::Redundant) {
            self.observer
                .on_version_status_changed(version_id, VersionStatus::Redundant);
        }
        if let Some(registration) = self.registrations.get_mut(&registration_id)
            && registration.unset_version(version_id) == Some(Slot::Waiting)
        {
            self.observer.on_waiting_version_changed(registration_id, None);
        }
        self.maybe_drop_version(version_id);
    }

    /// Forgets a redundant version once its worker is stopped.
    fn maybe_drop_version(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get(&version_id) else {
            return;
        };
        if version.status() != VersionStatus::Redundant {
            return;
        }
        if self.running_status(version_id) != RunningStatus::Stopped {
            self.stop_worker_for(version_id, Waiter::Detached);
            return;
        }
        let Some(mut version) = self.versions.remove(&version_id) else {
            return;
        };
        version.fail_requests(&self.events, &ServiceWorkerError::Aborted);
        version.fail_queued_events(&self.events, &ServiceWorkerError::Aborted);
        version.resolve_start_waiters(&self.events, Err(ServiceWorkerError::Aborted));
        version.resolve_stop_waiters(&self.events);
        self.registry.remove_worker(version.worker_id);
        tracing::debug!(%version_id, "version dropped");
    }

    pub(crate) fn drop_live_registration(&mut self, registration_id: RegistrationId) {
        let Some(mut registration) = self.registrations.remove(&registration_id) else {
            return;
        };
        registration.is_uninstalled = true;
        tracing::info!(%registration_id, scope = %registration.scope, "registration uninstalled");
        for version_id in registration.versions() {
            self.mark_redundant(version_id);
        }
    }

    /// Promotes the waiting version and dispatches `activate` to it.
    pub(crate) fn activate_waiting_version(
        &mut self,
        registration_id: RegistrationId,
        job_id: Option<JobId>,
    ) {
        let Some(registration) = self.registrations.get_mut(&registration_id) else {
            if let Some(job_id) = job_id {
                self.send_job_input(job_id, JobInput::ActivateFinished(Err(ServiceWorkerError::NotFound)));
            }
            return;
        };
        let Some(waiting) = registration.waiting_version() else {
            if let Some(job_id) = job_id {
                self.send_job_input(job_id, JobInput::ActivateFinished(Err(ServiceWorkerError::ActivateFailed)));
            }
            return;
        };
        let displaced = registration.set_active(waiting);
        self.observer.on_waiting_version_changed(registration_id, None);
        if let Some(old) = displaced {
            self.mark_redundant(old);
        }
        tracing::info!(%registration_id, version_id = %waiting, "activating version");
        self.set_version_status(waiting, VersionStatus::Activating);
        self.dispatch(
            waiting,
            WorkerEvent::Activate,
            TimeoutBehavior::KillOnTimeout,
            Waiter::Activation {
                registration_id,
                version_id: waiting,
                job_id,
            },
        );
    }

    /// A waiting version loaded from storage with nothing active, such as one
    /// whose activation was deferred before a restart, is activated right away.
    fn activate_orphaned_waiting_version(&mut self, registration_id: RegistrationId) {
        let Some(registration) = self.registrations.get(&registration_id) else {
            return;
        };
        if registration.active_version().is_some()
            || registration.waiting_version().is_none()
            || registration.is_uninstalling
            || self.jobs.queue_len(&registration.scope) > 0
        {
            return;
        }
        tracing::info!(%registration_id, "activating a waiting version left over from a previous run");
        self.activate_waiting_version(registration_id, None);
    }

    fn on_activate_finished(
        &mut self,
        registration_id: RegistrationId,
        version_id: VersionId,
        job_id: Option<JobId>,
        result: ServiceWorkerResult<()>,
    ) {
        match result {
            Ok(()) => {
                self.set_version_status(version_id, VersionStatus::Activated);
                let origin = self
                    .registrations
                    .get(&registration_id)
                    .filter(|r| r.stored)
                    .map(|r| r.origin.clone());
                match (origin, job_id) {
                    (Some(origin), Some(job_id)) => {
                        let pending = self.storage.update_to_active_state(registration_id, &origin);
                        self.forward_to_job(job_id, pending, JobInput::ActivateFinished);
                    }
                    (Some(origin), None) => {
                        let pending = self.storage.update_to_active_state(registration_id, &origin);
                        self.log_storage_failure(pending, "mark registration active");
                    }
                    (None, Some(job_id)) => {
                        self.send_job_input(job_id, JobInput::ActivateFinished(Err(ServiceWorkerError::NotFound)));
                    }
                    (None, None) => {}
                }
            }
            Err(err) => {
                tracing::warn!(%registration_id, %version_id, error = %err, "activation failed");
                self.mark_redundant(version_id);
                if let Some(job_id) = job_id {
                    self.send_job_input(job_id, JobInput::ActivateFinished(Err(ServiceWorkerError::ActivateFailed)));
                }
            }
        }
    }

    fn add_controllee(&mut self, version_id: VersionId, client: ClientId) -> ServiceWorkerResult<()> {
        let version = self
            .versions
            .get_mut(&version_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        if version.status() == VersionStatus::Redundant {
            return Err(ServiceWorkerError::InvalidState(format!(
                "version {version_id} is redundant"
            )));
        }
        if version.add_controllee(client, Instant::now()) {
            tracing::debug!(%version_id, %client, "first controllee");
        }
        Ok(())
    }

    fn remove_controllee(&mut self, version_id: VersionId, client: ClientId) -> ServiceWorkerResult<()> {
        let version = self
            .versions
            .get_mut(&version_id)
            .ok_or(ServiceWorkerError::NotFound)?;
        if version.remove_controllee(client, Instant::now()) {
            tracing::debug!(%version_id, %client, "last controllee left");
            self.on_no_controllees(version_id);
        }
        Ok(())
    }

    /// Runs deferred uninstall or deferred activation once a version is uncontrolled.
    fn on_no_controllees(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get(&version_id) else {
            return;
        };
        if version.status() == VersionStatus::Redundant {
            self.maybe_drop_version(version_id);
            return;
        }
        let registration_id = version.registration_id;
        let Some(registration) = self.registrations.get(&registration_id) else {
            return;
        };
        if registration.active_version() != Some(version_id) {
            return;
        }

        if registration.is_uninstalling {
            let scope = registration.scope.clone();
            let pending = self
                .storage
                .delete_registration(registration_id, &registration.origin);
            self.forward(pending, move |result| Event::DeferredUninstallFinished {
                registration_id,
                scope,
                result,
            });
            return;
        }

        let ready = registration
            .waiting_version()
            .and_then(|waiting| self.versions.get(&waiting))
            .is_some_and(|v| v.status() == VersionStatus::Installed);
        if ready {
            self.activate_waiting_version(registration_id, None);
        }
    }

    fn on_deferred_uninstall_finished(
        &mut self,
        registration_id: RegistrationId,
        scope: &str,
        result: ServiceWorkerResult<DeleteOutcome>,
    ) {
        match result {
            Ok(_) => {
                let still_uninstalling = self
                    .registrations
                    .get(&registration_id)
                    .is_some_and(|r| r.is_uninstalling);
                if !still_uninstalling {
                    tracing::info!(%registration_id, scope, "registration resurrected before its row was deleted");
                    return;
                }
                self.observer.on_registration_deleted(registration_id, scope);
                self.drop_live_registration(registration_id);
            }
            Err(err) => {
                tracing::warn!(%registration_id, scope, error = %err, "deferred uninstall failed");
            }
        }
    }

    // ---- workers ----

    pub(crate) fn start_worker_for(&mut self, version_id: VersionId, waiter: Waiter) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        if version.status() == VersionStatus::Redundant {
            waiter.resolve(
                &self.events,
                Err(ServiceWorkerError::InvalidState(format!(
                    "version {version_id} is redundant"
                ))),
            );
            return;
        }
        let status = self
            .registry
            .get(version.worker_id)
            .map_or(RunningStatus::Stopped, |w| w.status());
        match status {
            RunningStatus::Running => waiter.resolve(&self.events, Ok(())),
            RunningStatus::Starting | RunningStatus::Stopping => version.start_waiters.push(waiter),
            RunningStatus::Stopped => {
                version.start_waiters.push(waiter);
                self.begin_worker_start(version_id);
            }
        }
    }

    fn begin_worker_start(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };
        let Some(worker) = self.registry.get_mut(version.worker_id) else {
            return;
        };
        match worker.begin_start() {
            Ok((generation, candidates)) => {
                let now = Instant::now();
                version.start_deadline = Some(now + self.config.start_worker_timeout);
                version.touch(now);
                let worker_id = worker.worker_id();
                let script_url = worker.script_url().to_string();
                tracing::debug!(%version_id, %worker_id, generation, ?candidates, "starting worker");
                self.observer
                    .on_running_status_changed(version_id, RunningStatus::Starting);

                let allocator = self.host.allocator.clone();
                let sink = self.events.clone();
                tokio::spawn(async move {
                    let result = allocator.allocate(worker_id, &candidates, &script_url).await;
                    let _ = sink.send(Event::ProcessAllocated {
                        worker_id,
                        generation,
                        result,
                    });
                });
            }
            Err(err) => version.resolve_start_waiters(&self.events, Err(err)),
        }
    }

    fn on_process_allocated(
        &mut self,
        worker_id: WorkerId,
        generation: u64,
        result: ServiceWorkerResult<ProcessId>,
    ) {
        let version_id = self.registry.owner(worker_id);
        let Some(worker) = self.registry.get_mut(worker_id) else {
            if let Ok(process_id) = result {
                self.release_process(worker_id, process_id);
            }
            return;
        };
        let Some(version_id) = version_id else {
            return;
        };

        match result {
            Ok(process_id) => {
                if !worker.on_process_allocated(generation, process_id) {
                    tracing::debug!(%worker_id, %process_id, generation, "stale allocation released");
                    self.release_process(worker_id, process_id);
                    return;
                }
                let sent = worker.send_start(&*self.host.transport);
                self.registry.bind_process(process_id, worker_id);
                if let Err(err) = sent {
                    tracing::warn!(%worker_id, %process_id, error = %err, "start directive undeliverable");
                    self.force_stop(version_id, ServiceWorkerError::StartWorkerFailed);
                }
            }
            Err(err) => {
                if !worker.is_current_start(generation) {
                    return;
                }
                tracing::warn!(%worker_id, %version_id, error = %err, "process allocation failed");
                worker.detach();
                self.worker_detached(
                    version_id,
                    RunningStatus::Starting,
                    None,
                    Some(ServiceWorkerError::StartWorkerFailed),
                );
            }
        }
    }

    fn on_worker_started(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };
        let now = Instant::now();
        version.start_deadline = None;
        version.last_ping = Some(now);
        version.ping_outstanding_since = None;
        version.touch(now);
        version.resolve_start_waiters(&self.events, Ok(()));
        let queued: Vec<QueuedEvent> = version.queued_events.drain(..).collect();
        tracing::debug!(%version_id, flushed = queued.len(), "worker running");
        self.observer
            .on_running_status_changed(version_id, RunningStatus::Running);
        for queued in queued {
            self.send_event(version_id, queued.event, queued.behavior, queued.waiter);
        }
    }

    pub(crate) fn stop_worker_for(&mut self, version_id: VersionId, waiter: Waiter) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        let Some(worker) = self.registry.get_mut(version.worker_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        let previous = worker.status();
        match worker.stop(&*self.host.transport) {
            StopOutcome::AlreadyStopped => waiter.resolve(&self.events, Ok(())),
            StopOutcome::Stopping => {
                if previous == RunningStatus::Starting {
                    version.start_deadline = None;
                    version.resolve_start_waiters(&self.events, Err(ServiceWorkerError::Aborted));
                    version.fail_queued_events(&self.events, &ServiceWorkerError::Aborted);
                }
                version.stop_waiters.push(waiter);
                if previous != RunningStatus::Stopping {
                    version.stop_deadline = Some(Instant::now() + self.config.start_worker_timeout);
                    self.observer
                        .on_running_status_changed(version_id, RunningStatus::Stopping);
                }
            }
            StopOutcome::CancelledStart => {
                version.stop_waiters.push(waiter);
                self.worker_detached(version_id, previous, None, Some(ServiceWorkerError::Aborted));
            }
            StopOutcome::Detached(process_id) => {
                waiter.resolve(&self.events, Err(ServiceWorkerError::IpcFailed));
                self.worker_detached(
                    version_id,
                    previous,
                    Some(process_id),
                    Some(ServiceWorkerError::IpcFailed),
                );
            }
        }
    }

    /// Best-effort stop directive, then forced STOPPED.
    fn force_stop(&mut self, version_id: VersionId, cause: ServiceWorkerError) {
        let Some(version) = self.versions.get(&version_id) else {
            return;
        };
        let Some(worker) = self.registry.get_mut(version.worker_id) else {
            return;
        };
        let previous = worker.status();
        if previous == RunningStatus::Stopped {
            return;
        }
        let worker_id = worker.worker_id();
        if let Err(err) = worker.send(&*self.host.transport, WorkerCommand::StopWorker { worker_id }) {
            tracing::debug!(%worker_id, error = %err, "stop directive not delivered");
        }
        let released = worker.detach();
        tracing::warn!(%version_id, %worker_id, cause = %cause, from = previous.as_str(), "worker force-stopped");
        self.worker_detached(version_id, previous, released, Some(cause));
    }

    /// Settles a version whose worker just became STOPPED.
    fn worker_detached(
        &mut self,
        version_id: VersionId,
        previous: RunningStatus,
        released: Option<ProcessId>,
        cause: Option<ServiceWorkerError>,
    ) {
        let Some(worker_id) = self.versions.get(&version_id).map(|v| v.worker_id) else {
            return;
        };
        if let Some(process_id) = released {
            self.registry.unbind_process(process_id, worker_id);
            self.release_process(worker_id, process_id);
        }
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };

        let request_error = match (&cause, previous) {
            (Some(cause), _) => cause.clone(),
            (None, RunningStatus::Stopping) => ServiceWorkerError::Aborted,
            (None, _) => ServiceWorkerError::IpcFailed,
        };
        version.fail_requests(&self.events, &request_error);
        version.start_deadline = None;
        version.stop_deadline = None;
        version.clear_ping();

        if previous == RunningStatus::Starting {
            let start_error = match cause {
                Some(ServiceWorkerError::Timeout) => ServiceWorkerError::Timeout,
                Some(ServiceWorkerError::Aborted) => ServiceWorkerError::Aborted,
                _ => ServiceWorkerError::StartWorkerFailed,
            };
            version.resolve_start_waiters(&self.events, Err(start_error.clone()));
            version.fail_queued_events(&self.events, &start_error);
        }
        version.resolve_stop_waiters(&self.events);

        let redundant = version.status() == VersionStatus::Redundant;
        if redundant {
            version.resolve_start_waiters(&self.events, Err(ServiceWorkerError::Aborted));
            version.fail_queued_events(&self.events, &ServiceWorkerError::Aborted);
        }
        let restart = !version.start_waiters.is_empty();
        self.observer
            .on_running_status_changed(version_id, RunningStatus::Stopped);

        if restart {
            tracing::debug!(%version_id, "restarting worker for pending start requests");
            self.begin_worker_start(version_id);
        } else {
            self.maybe_drop_version(version_id);
        }
    }

    fn on_worker_stopped(&mut self, version_id: VersionId) {
        let Some(worker) = self
            .versions
            .get(&version_id)
            .and_then(|v| self.registry.get_mut(v.worker_id))
        else {
            return;
        };
        let previous = worker.status();
        if previous == RunningStatus::Stopped {
            return;
        }
        let released = worker.detach();
        if previous != RunningStatus::Stopping {
            tracing::warn!(%version_id, from = previous.as_str(), "worker stopped unexpectedly");
        }
        self.worker_detached(version_id, previous, released, None);
    }

    fn on_process_gone(&mut self, process_id: ProcessId) {
        let hosted = self.registry.remove_process(process_id);
        tracing::warn!(%process_id, workers = hosted.len(), "process gone");
        for worker_id in hosted {
            let Some(version_id) = self.registry.owner(worker_id) else {
                continue;
            };
            let Some(worker) = self.registry.get_mut(worker_id) else {
                continue;
            };
            let previous = worker.status();
            if previous == RunningStatus::Stopped {
                continue;
            }
            let released = worker.detach();
            self.worker_detached(
                version_id,
                previous,
                released,
                Some(ServiceWorkerError::IpcFailed),
            );
        }
    }

    fn on_worker_notification(&mut self, process_id: ProcessId, notification: WorkerNotification) {
        let worker_id = notification.worker_id();
        let Some(version_id) = self.registry.route(process_id, worker_id) else {
            return;
        };
        match notification {
            WorkerNotification::ScriptLoaded { .. } => {
                if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.on_script_loaded();
                }
            }
            WorkerNotification::ScriptEvaluated { success, .. } => {
                if !success {
                    tracing::warn!(%version_id, %worker_id, "script evaluation failed");
                    self.force_stop(version_id, ServiceWorkerError::StartWorkerFailed);
                } else if let Some(worker) = self.registry.get_mut(worker_id) {
                    worker.on_script_evaluated();
                }
            }
            WorkerNotification::Started { thread_id, .. } => {
                let started = self
                    .registry
                    .get_mut(worker_id)
                    .is_some_and(|w| w.on_started());
                if started {
                    tracing::debug!(%version_id, thread_id, "worker thread started");
                    self.on_worker_started(version_id);
                }
            }
            WorkerNotification::Stopped { .. } => self.on_worker_stopped(version_id),
            WorkerNotification::EventFinished {
                request_id, status, ..
            } => self.on_event_finished(version_id, request_id, status),
            WorkerNotification::Pong { .. } => {
                if let Some(version) = self.versions.get_mut(&version_id) {
                    version.ping_outstanding_since = None;
                }
            }
            WorkerNotification::ImportScript { url, .. } => self.cache_import(version_id, url),
            WorkerNotification::FetchHandlerPresent { .. } => {
                if let Some(version) = self.versions.get_mut(&version_id) {
                    version.has_fetch_handler = true;
                }
            }
            WorkerNotification::ReportException {
                message,
                line,
                column,
                source_url,
                ..
            } => self
                .observer
                .on_error_reported(version_id, &message, line, column, &source_url),
            WorkerNotification::ConsoleMessage { level, message, .. } => {
                self.observer.on_console_message(version_id, &level, &message)
            }
        }
    }

    // ---- events ----

    /// Sends `event` now if the worker runs, else queues it and starts the worker.
    pub(crate) fn dispatch(
        &mut self,
        version_id: VersionId,
        event: WorkerEvent,
        behavior: TimeoutBehavior,
        waiter: Waiter,
    ) {
        let status = self.running_status(version_id);
        let Some(version) = self.versions.get_mut(&version_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        if version.status() == VersionStatus::Redundant {
            waiter.resolve(
                &self.events,
                Err(ServiceWorkerError::InvalidState(format!(
                    "version {version_id} is redundant"
                ))),
            );
            return;
        }
        if status == RunningStatus::Running {
            self.send_event(version_id, event, behavior, waiter);
            return;
        }
        version.queued_events.push_back(QueuedEvent {
            event,
            behavior,
            waiter,
        });
        if status != RunningStatus::Starting {
            self.start_worker_for(version_id, Waiter::Detached);
        }
    }

    fn send_event(
        &mut self,
        version_id: VersionId,
        event: WorkerEvent,
        behavior: TimeoutBehavior,
        waiter: Waiter,
    ) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        let Some(worker) = self.registry.get(version.worker_id) else {
            waiter.resolve(&self.events, Err(ServiceWorkerError::NotFound));
            return;
        };
        let now = Instant::now();
        let kind = request_kind(&event);
        let request_id =
            version
                .requests
                .start_request(kind, behavior, now + self.config.request_timeout);
        version.touch(now);
        let command = WorkerCommand::DispatchEvent {
            worker_id: worker.worker_id(),
            request_id,
            event,
        };
        match worker.send(&*self.host.transport, command) {
            Ok(()) => {
                tracing::debug!(%version_id, %request_id, kind = kind.as_str(), "event dispatched");
                version.event_waiters.insert(request_id, waiter);
            }
            Err(err) => {
                version.requests.finish_request(request_id);
                waiter.resolve(&self.events, Err(err));
            }
        }
    }

    fn on_event_finished(&mut self, version_id: VersionId, request_id: RequestId, status: EventStatus) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };
        let Some((kind, waiter)) = version.finish_request(request_id) else {
            tracing::debug!(%version_id, %request_id, "finish for unknown request ignored");
            return;
        };
        version.touch(Instant::now());
        tracing::debug!(%version_id, %request_id, kind = kind.as_str(), ?status, "event finished");
        let result = match status {
            EventStatus::Completed => Ok(()),
            EventStatus::Rejected => Err(ServiceWorkerError::EventRejected),
        };
        waiter.resolve(&self.events, result);
    }

    // ---- imported scripts ----

    fn cache_import(&mut self, version_id: VersionId, url: String) {
        let Some(version) = self.versions.get(&version_id) else {
            return;
        };
        if !matches!(version.status(), VersionStatus::New | VersionStatus::Installing) {
            tracing::debug!(%version_id, %url, "import after install ignored");
            return;
        }
        if version.script_cache.has_url(&url) {
            return;
        }
        let pending = self.storage.reserve_uncommitted_resource_id();
        self.forward(pending, move |result| Event::ImportReserved {
            version_id,
            url,
            result,
        });
    }

    fn on_import_reserved(
        &mut self,
        version_id: VersionId,
        url: String,
        result: ServiceWorkerResult<ResourceId>,
    ) {
        let resource_id = match result {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%version_id, %url, error = %err, "could not reserve import id");
                return;
            }
        };
        let accepted = self.versions.get_mut(&version_id).is_some_and(|v| {
            matches!(v.status(), VersionStatus::New | VersionStatus::Installing)
                && v.script_cache.started_caching(&url, resource_id)
        });
        if !accepted {
            self.doom_resources(vec![resource_id]);
            return;
        }
        self.write_script_body(resource_id, &url, move |result| Event::ImportWritten {
            version_id,
            resource_id,
            result,
        });
    }

    fn on_import_written(
        &mut self,
        version_id: VersionId,
        resource_id: ResourceId,
        result: ServiceWorkerResult<u64>,
    ) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            self.doom_resources(vec![resource_id]);
            return;
        };
        match result {
            Ok(size_bytes) => {
                version.script_cache.finished_caching(resource_id, size_bytes);
            }
            Err(err) => {
                let url = version.script_cache.failed_caching(resource_id);
                tracing::warn!(%version_id, %resource_id, ?url, error = %err, "import write failed");
                self.doom_resources(vec![resource_id]);
            }
        }
    }

    // ---- timers ----

    fn on_timer(&mut self, now: Instant) {
        let version_ids: Vec<VersionId> = self.versions.keys().copied().collect();
        for version_id in version_ids {
            self.check_version_timers(version_id, now);
        }
    }

    fn check_version_timers(&mut self, version_id: VersionId, now: Instant) {
        let Some(version) = self.versions.get_mut(&version_id) else {
            return;
        };
        let Some(worker) = self.registry.get_mut(version.worker_id) else {
            return;
        };
        let status = worker.status();

        if status == RunningStatus::Starting && version.start_deadline.is_some_and(|d| now >= d) {
            tracing::warn!(%version_id, phase = worker.starting_phase().as_str(), "worker start timed out");
            self.force_stop(version_id, ServiceWorkerError::Timeout);
            return;
        }
        if status == RunningStatus::Stopping && version.stop_deadline.is_some_and(|d| now >= d) {
            tracing::warn!(%version_id, "worker never reported stopped");
            self.force_stop(version_id, ServiceWorkerError::Timeout);
            return;
        }

        let mut kill = false;
        for expired in version.requests.tick(now) {
            match expired.behavior {
                TimeoutBehavior::ContinueOnTimeout => {
                    tracing::info!(%version_id, request_id = %expired.request_id, kind = expired.kind.as_str(), "request timed out");
                    if let Some(waiter) = version.event_waiters.remove(&expired.request_id) {
                        waiter.resolve(&self.events, Err(ServiceWorkerError::Timeout));
                    }
                }
                TimeoutBehavior::KillOnTimeout => {
                    tracing::warn!(%version_id, request_id = %expired.request_id, kind = expired.kind.as_str(), "request timed out, killing worker");
                    kill = true;
                }
            }
        }
        if kill {
            self.force_stop(version_id, ServiceWorkerError::Timeout);
            return;
        }

        if status != RunningStatus::Running || worker.devtools_attached() {
            return;
        }

        if let Some(since) = version.ping_outstanding_since {
            if now.saturating_duration_since(since) >= self.config.ping_timeout {
                tracing::warn!(%version_id, "no pong, worker considered hung");
                self.force_stop(version_id, ServiceWorkerError::Timeout);
                return;
            }
        } else if version
            .last_ping
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.ping_interval)
        {
            let worker_id = worker.worker_id();
            if let Err(err) = worker.send(&*self.host.transport, WorkerCommand::Ping { worker_id }) {
                tracing::warn!(%version_id, error = %err, "ping undeliverable");
                self.force_stop(version_id, ServiceWorkerError::IpcFailed);
                return;
            }
            version.last_ping = Some(now);
            version.ping_outstanding_since = Some(now);
        }

        if !version.is_idle(now, self.config.idle_timeout) {
            return;
        }
        match worker.stop_if_idle(&*self.host.transport) {
            Some(StopOutcome::Stopping) => {
                tracing::debug!(%version_id, "idle worker stopping");
                version.stop_deadline = Some(now + self.config.start_worker_timeout);
                self.observer
                    .on_running_status_changed(version_id, RunningStatus::Stopping);
            }
            Some(StopOutcome::Detached(process_id)) => {
                self.worker_detached(
                    version_id,
                    RunningStatus::Running,
                    Some(process_id),
                    Some(ServiceWorkerError::IpcFailed),
                );
            }
            Some(StopOutcome::AlreadyStopped | StopOutcome::CancelledStart) | None => {}
        }
    }

    // ---- lookups ----

    fn find_registration(&mut self, key: LookupKey, reply: Reply<RegistrationInfo>) {
        let pending = match &key {
            LookupKey::Document(url) => self.storage.find_registration_for_document(url),
            LookupKey::Scope(scope) => self.storage.find_registration_for_pattern(scope),
            LookupKey::Id(registration_id, origin) => {
                self.storage.find_registration_for_id(*registration_id, origin)
            }
        };
        self.forward(pending, move |result| Event::LookupFinished { key, result, reply });
    }

    fn on_lookup_finished(
        &mut self,
        key: &LookupKey,
        result: ServiceWorkerResult<StoredRegistration>,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        let registration_id = match result {
            Ok((data, resources)) => {
                let registration_id = self.materialize(data, resources);
                self.activate_orphaned_waiting_version(registration_id);
                registration_id
            }
            Err(ServiceWorkerError::NotFound) => {
                self.find_live(key).ok_or(ServiceWorkerError::NotFound)?
            }
            Err(err) => return Err(err),
        };
        let uninstalling = self
            .registrations
            .get(&registration_id)
            .is_some_and(|r| r.is_uninstalling);
        if uninstalling && matches!(key, LookupKey::Document(_)) {
            return Err(ServiceWorkerError::NotFound);
        }
        self.registration_info(registration_id)
            .ok_or(ServiceWorkerError::NotFound)
    }

    /// Registrations that exist only in memory, such as one still installing.
    fn find_live(&self, key: &LookupKey) -> Option<RegistrationId> {
        let live = self.registrations.values().filter(|r| !r.is_uninstalled);
        match key {
            LookupKey::Document(url) => live
                .filter(|r| !r.is_uninstalling && scope::scope_matches(&r.scope, url))
                .max_by_key(|r| r.scope.len())
                .map(|r| r.id),
            LookupKey::Scope(scope) => live.filter(|r| &r.scope == scope).map(|r| r.id).next(),
            LookupKey::Id(registration_id, origin) => live
                .filter(|r| r.id == *registration_id && &r.origin == origin)
                .map(|r| r.id)
                .next(),
        }
    }

    pub(crate) fn version_info(&self, version_id: VersionId) -> Option<VersionInfo> {
        let version = self.versions.get(&version_id)?;
        Some(VersionInfo {
            version_id,
            script_url: version.script_url.clone(),
            status: version.status(),
            running_status: self.running_status(version_id),
            controllees: version.controllee_count(),
            process_candidates: self
                .registry
                .get(version.worker_id)
                .map(|w| w.candidates())
                .unwrap_or_default(),
        })
    }

    pub(crate) fn registration_info(&self, registration_id: RegistrationId) -> Option<RegistrationInfo> {
        let registration = self.registrations.get(&registration_id)?;
        Some(RegistrationInfo {
            registration_id,
            scope: registration.scope.clone(),
            script_url: registration.script_url.clone(),
            installing: registration
                .installing_version()
                .and_then(|v| self.version_info(v)),
            waiting: registration
                .waiting_version()
                .and_then(|v| self.version_info(v)),
            active: registration
                .active_version()
                .and_then(|v| self.version_info(v)),
            last_update_check: registration.last_update_check,
            is_uninstalling: registration.is_uninstalling,
            stored: registration.stored,
        })
    }

    fn stored_info(data: &RegistrationData) -> RegistrationInfo {
        let version = VersionInfo {
            version_id: data.version_id,
            script_url: data.script_url.clone(),
            status: if data.is_active {
                VersionStatus::Activated
            } else {
                VersionStatus::Installed
            },
            running_status: RunningStatus::Stopped,
            controllees: 0,
            process_candidates: Vec::new(),
        };
        let (waiting, active) = if data.is_active {
            (None, Some(version))
        } else {
            (Some(version), None)
        };
        RegistrationInfo {
            registration_id: data.registration_id,
            scope: data.scope.clone(),
            script_url: data.script_url.clone(),
            installing: None,
            waiting,
            active,
            last_update_check: data.last_update_check,
            is_uninstalling: false,
            stored: true,
        }
    }

    /// Stored rows overlaid with live state, plus in-flight registrations.
    fn merge_all_info(&self, rows: Vec<RegistrationData>) -> Vec<RegistrationInfo> {
        let mut seen = BTreeSet::new();
        let mut infos: Vec<RegistrationInfo> = rows
            .iter()
            .map(|row| {
                seen.insert(row.registration_id);
                self.registration_info(row.registration_id)
                    .unwrap_or_else(|| Self::stored_info(row))
            })
            .collect();
        infos.extend(
            self.registrations
                .keys()
                .filter(|id| !seen.contains(*id))
                .filter_map(|id| self.registration_info(*id)),
        );
        infos.sort_by_key(|info| info.registration_id);
        infos
    }

    // ---- resources ----

    fn purge_resources(&mut self, reply: Reply<usize>) {
        let pending = self.storage.get_purgeable_resource_ids();
        self.forward(pending, move |result| Event::PurgeableListed { result, reply });
    }

    fn on_purgeable_listed(&mut self, result: ServiceWorkerResult<Vec<ResourceId>>, reply: Reply<usize>) {
        let ids = match result {
            Ok(ids) => ids,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let held: BTreeSet<ResourceId> = self
            .versions
            .values()
            .flat_map(|v| v.script_cache.resource_ids())
            .collect();
        let doomed: Vec<ResourceId> = ids.into_iter().filter(|id| !held.contains(id)).collect();
        if doomed.is_empty() {
            let _ = reply.send(Ok(0));
            return;
        }

        let bodies = self.host.bodies.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let mut deleted = Vec::with_capacity(doomed.len());
            for resource_id in doomed {
                match bodies.delete_resource(resource_id).await {
                    Ok(()) => deleted.push(resource_id),
                    Err(err) => {
                        tracing::warn!(%resource_id, error = %err, "could not delete resource body")
                    }
                }
            }
            let count = deleted.len();
            let cleared = resolve(storage.clear_purgeable_resource_ids(deleted)).await;
            let _ = reply.send(cleared.map(|()| count));
        });
    }

    // ---- teardown ----

    /// Aborts every job and forgets all live state. Late completions find
    /// nothing to act on.
    fn teardown_live_state(&mut self) {
        let aborted = self.jobs.abort_all();
        let version_ids: Vec<VersionId> = self.versions.keys().copied().collect();
        for version_id in &version_ids {
            if let Some(version) = self.versions.get_mut(version_id) {
                version.resolve_start_waiters(&self.events, Err(ServiceWorkerError::Aborted));
                version.fail_queued_events(&self.events, &ServiceWorkerError::Aborted);
            }
            self.force_stop(*version_id, ServiceWorkerError::Aborted);
        }
        for (_, mut version) in self.versions.drain() {
            version.fail_requests(&self.events, &ServiceWorkerError::Aborted);
            version.resolve_stop_waiters(&self.events);
        }
        let registrations = self.registrations.len();
        self.registrations.clear();
        self.registry.clear();
        tracing::info!(aborted, versions = version_ids.len(), registrations, "live state torn down");
    }
}

/// Cloneable front door to the coordination task.
#[derive(Clone)]
pub struct ContextHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ContextHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> ServiceWorkerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| ServiceWorkerError::Aborted)?;
        rx.await.unwrap_or(Err(ServiceWorkerError::Aborted))
    }

    pub async fn register(
        &self,
        scope: &str,
        script_url: &str,
        process_hint: Option<ProcessId>,
    ) -> ServiceWorkerResult<(RegistrationId, VersionId)> {
        let scope = scope.to_string();
        let script_url = script_url.to_string();
        self.request(|reply| Command::Register {
            scope,
            script_url,
            process_hint,
            reply,
        })
        .await
    }

    pub async fn unregister(&self, scope: &str) -> ServiceWorkerResult<()> {
        let scope = scope.to_string();
        self.request(|reply| Command::Unregister { scope, reply }).await
    }

    /// Re-installs the stored script of the registration at `scope`.
    pub async fn update(&self, scope: &str) -> ServiceWorkerResult<(RegistrationId, VersionId)> {
        let scope = scope.to_string();
        self.request(|reply| Command::Update { scope, reply }).await
    }

    pub async fn find_registration_for_document(
        &self,
        document_url: &str,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        let key = LookupKey::Document(document_url.to_string());
        self.request(|reply| Command::Find { key, reply }).await
    }

    pub async fn find_registration_for_scope(&self, scope: &str) -> ServiceWorkerResult<RegistrationInfo> {
        let key = LookupKey::Scope(scope.to_string());
        self.request(|reply| Command::Find { key, reply }).await
    }

    pub async fn find_registration_for_id(
        &self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> ServiceWorkerResult<RegistrationInfo> {
        let key = LookupKey::Id(registration_id, origin.to_string());
        self.request(|reply| Command::Find { key, reply }).await
    }

    pub async fn get_all_registrations_info(&self) -> ServiceWorkerResult<Vec<RegistrationInfo>> {
        self.request(|reply| Command::GetAllInfo { reply }).await
    }

    pub async fn version_info(&self, version_id: VersionId) -> ServiceWorkerResult<VersionInfo> {
        self.request(|reply| Command::GetVersionInfo { version_id, reply })
            .await
    }

    pub async fn start_worker(&self, version_id: VersionId) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::StartWorker { version_id, reply })
            .await
    }

    pub async fn stop_worker(&self, version_id: VersionId) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::StopWorker { version_id, reply })
            .await
    }

    pub async fn dispatch_event(
        &self,
        version_id: VersionId,
        event: WorkerEvent,
        behavior: TimeoutBehavior,
    ) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::DispatchEvent {
            version_id,
            event,
            behavior,
            reply,
        })
        .await
    }

    pub async fn add_controllee(&self, version_id: VersionId, client: ClientId) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::AddControllee {
            version_id,
            client,
            reply,
        })
        .await
    }

    pub async fn remove_controllee(
        &self,
        version_id: VersionId,
        client: ClientId,
    ) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::RemoveControllee {
            version_id,
            client,
            reply,
        })
        .await
    }

    pub async fn add_process_reference(
        &self,
        version_id: VersionId,
        process_id: ProcessId,
    ) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::AddProcessReference {
            version_id,
            process_id,
            reply,
        })
        .await
    }

    pub async fn remove_process_reference(
        &self,
        version_id: VersionId,
        process_id: ProcessId,
    ) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::RemoveProcessReference {
            version_id,
            process_id,
            reply,
        })
        .await
    }

    pub async fn set_devtools_attached(
        &self,
        version_id: VersionId,
        attached: bool,
    ) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::SetDevToolsAttached {
            version_id,
            attached,
            reply,
        })
        .await
    }

    /// Deletes the bodies of purgeable resources; returns how many went.
    pub async fn purge_resources(&self) -> ServiceWorkerResult<usize> {
        self.request(|reply| Command::PurgeResources { reply }).await
    }

    pub async fn delete_and_start_over(&self) -> ServiceWorkerResult<()> {
        self.request(|reply| Command::DeleteAndStartOver { reply })
            .await
    }

    /// Aborts everything in flight and stops the task. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Entry point for the worker transport; never blocks.
    pub fn on_worker_notification(&self, process_id: ProcessId, notification: WorkerNotification) {
        let _ = self.tx.send(Command::WorkerNotification {
            process_id,
            notification,
        });
    }

    pub fn on_process_gone(&self, process_id: ProcessId) {
        let _ = self.tx.send(Command::ProcessGone { process_id });
    }
}

/// Starts the storage task and the coordination task.
pub fn spawn_context(
    config: CoordinatorConfig,
    store: ResourceStore,
    host: Host,
    observer: Arc<dyn ContextObserver>,
) -> (ContextHandle, JoinHandle<()>) {
    let storage = spawn_storage_worker(store);
    let (tx, commands) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let core = ContextCore {
        config,
        storage,
        host,
        observer,
        events: events_tx,
        jobs: JobCoordinator::new(),
        registrations: HashMap::new(),
        versions: HashMap::new(),
        registry: WorkerRegistry::new(),
    };
    let task = tokio::spawn(
        core.run(commands, events)
            .instrument(tracing::info_span!("context")),
    );
    (ContextHandle { tx }, task)
}
