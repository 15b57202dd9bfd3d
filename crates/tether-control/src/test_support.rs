use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use tether_core::{
    JobId, ProcessId, RegistrationId, ResourceId, RunningStatus, ServiceWorkerError,
    ServiceWorkerResult, VersionId, WorkerId,
};
use tokio::task::JoinHandle;

use crate::{
    config::CoordinatorConfig,
    context::{ContextHandle, spawn_context},
    host::{
        BodyStore, EventStatus, Host, ProcessAllocator, WorkerCommand, WorkerEvent,
        WorkerNotification, WorkerTransport,
    },
    observer::ContextObserver,
    registration::VersionInfo,
    storage::ResourceStore,
};

pub(crate) const DEFAULT_PROCESS: ProcessId = ProcessId(100);

#[derive(Default)]
pub(crate) struct FakeAllocator {
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    pub allocations: Mutex<Vec<(WorkerId, Vec<ProcessId>)>>,
    pub releases: Mutex<Vec<(WorkerId, ProcessId)>>,
}

#[async_trait::async_trait]
impl ProcessAllocator for FakeAllocator {
    async fn allocate(
        &self,
        worker_id: WorkerId,
        candidates: &[ProcessId],
        _script_url: &str,
    ) -> ServiceWorkerResult<ProcessId> {
        self.allocations
            .lock()
            .unwrap()
            .push((worker_id, candidates.to_vec()));
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::StartWorkerFailed);
        }
        Ok(candidates.first().copied().unwrap_or(DEFAULT_PROCESS))
    }

    async fn release(&self, worker_id: WorkerId, process_id: ProcessId) {
        self.releases.lock().unwrap().push((worker_id, process_id));
    }
}

/// How the fake worker answers. `None` for an event means it never finishes.
pub(crate) struct Behavior {
    pub install: Option<EventStatus>,
    pub activate: Option<EventStatus>,
    pub fetch: Option<EventStatus>,
    pub message: Option<EventStatus>,
    pub pong: bool,
    pub evaluate_ok: bool,
    pub stop_ack: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            install: Some(EventStatus::Completed),
            activate: Some(EventStatus::Completed),
            fetch: Some(EventStatus::Completed),
            message: Some(EventStatus::Completed),
            pong: true,
            evaluate_ok: true,
            stop_ack: true,
        }
    }
}

/// Answers commands synchronously through the context handle, the way a
/// well-behaved worker process would.
#[derive(Default)]
pub(crate) struct FakeTransport {
    handle: OnceLock<ContextHandle>,
    pub behavior: Mutex<Behavior>,
    pub sent: Mutex<Vec<(ProcessId, WorkerCommand)>>,
}

impl FakeTransport {
    pub fn attach(&self, handle: ContextHandle) {
        let _ = self.handle.set(handle);
    }

    pub fn count_sent(&self, matches: impl Fn(&WorkerCommand) -> bool) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| matches(c))
            .count()
    }
}

impl WorkerTransport for FakeTransport {
    fn send(&self, process_id: ProcessId, command: WorkerCommand) -> ServiceWorkerResult<()> {
        self.sent.lock().unwrap().push((process_id, command.clone()));
        let Some(handle) = self.handle.get() else {
            return Err(ServiceWorkerError::IpcFailed);
        };
        let behavior = self.behavior.lock().unwrap();
        let notify = |n: WorkerNotification| handle.on_worker_notification(process_id, n);
        match command {
            WorkerCommand::StartWorker { worker_id, .. } => {
                notify(WorkerNotification::ScriptLoaded { worker_id });
                notify(WorkerNotification::ScriptEvaluated {
                    worker_id,
                    success: behavior.evaluate_ok,
                });
                if behavior.evaluate_ok {
                    notify(WorkerNotification::Started {
                        worker_id,
                        thread_id: 1,
                    });
                }
            }
            WorkerCommand::StopWorker { worker_id } => {
                if behavior.stop_ack {
                    notify(WorkerNotification::Stopped { worker_id });
                }
            }
            WorkerCommand::DispatchEvent {
                worker_id,
                request_id,
                event,
            } => {
                let status = match event {
                    WorkerEvent::Install => behavior.install,
                    WorkerEvent::Activate => behavior.activate,
                    WorkerEvent::Fetch { .. } => behavior.fetch,
                    WorkerEvent::Message { .. } => behavior.message,
                };
                if let Some(status) = status {
                    notify(WorkerNotification::EventFinished {
                        worker_id,
                        request_id,
                        status,
                    });
                }
            }
            WorkerCommand::Ping { worker_id } => {
                if behavior.pong {
                    notify(WorkerNotification::Pong { worker_id });
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeBodyStore {
    pub fail_writes: AtomicBool,
    pub written: Mutex<Vec<(ResourceId, String)>>,
    pub deleted: Mutex<Vec<ResourceId>>,
}

#[async_trait::async_trait]
impl BodyStore for FakeBodyStore {
    async fn write_script(&self, resource_id: ResourceId, url: &str) -> ServiceWorkerResult<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::Io(format!("cannot fetch {url}")));
        }
        self.written
            .lock()
            .unwrap()
            .push((resource_id, url.to_string()));
        Ok(url.len() as u64)
    }

    async fn delete_resource(&self, resource_id: ResourceId) -> ServiceWorkerResult<()> {
        self.deleted.lock().unwrap().push(resource_id);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub phases: Mutex<Vec<(JobId, &'static str)>>,
    pub running: Mutex<Vec<(VersionId, RunningStatus)>>,
    pub stored: Mutex<Vec<RegistrationId>>,
    pub deleted: Mutex<Vec<RegistrationId>>,
}

impl RecordingObserver {
    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }
}

impl ContextObserver for RecordingObserver {
    fn on_registration_stored(&self, registration_id: RegistrationId, _scope: &str) {
        self.stored.lock().unwrap().push(registration_id);
    }

    fn on_registration_deleted(&self, registration_id: RegistrationId, _scope: &str) {
        self.deleted.lock().unwrap().push(registration_id);
    }

    fn on_running_status_changed(&self, version_id: VersionId, status: RunningStatus) {
        self.running.lock().unwrap().push((version_id, status));
    }

    fn on_job_phase_changed(&self, job_id: JobId, _scope: &str, phase: &'static str) {
        self.phases.lock().unwrap().push((job_id, phase));
    }
}

pub(crate) struct Harness {
    pub handle: ContextHandle,
    pub task: JoinHandle<()>,
    pub db: DatabaseConnection,
    pub allocator: Arc<FakeAllocator>,
    pub transport: Arc<FakeTransport>,
    pub bodies: Arc<FakeBodyStore>,
    pub observer: Arc<RecordingObserver>,
}

pub(crate) fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        database_url: "sqlite::memory:".to_string(),
        timeout_timer_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        start_worker_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(60),
        ping_interval: Duration::from_secs(60),
        ping_timeout: Duration::from_secs(60),
        purge_on_startup: false,
        body_root: PathBuf::from("unused"),
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub(crate) async fn harness_with(config: CoordinatorConfig) -> Harness {
    let db = tether_db::connect(&config.database_url).await.unwrap();
    tether_migration::Migrator::up(&db, None).await.unwrap();

    let allocator = Arc::new(FakeAllocator::default());
    let transport = Arc::new(FakeTransport::default());
    let bodies = Arc::new(FakeBodyStore::default());
    let observer = Arc::new(RecordingObserver::default());
    let host = Host {
        allocator: allocator.clone(),
        transport: transport.clone(),
        bodies: bodies.clone(),
    };
    let (handle, task) = spawn_context(config, ResourceStore::new(db.clone()), host, observer.clone());
    transport.attach(handle.clone());

    Harness {
        handle,
        task,
        db,
        allocator,
        transport,
        bodies,
        observer,
    }
}

/// Polls `check` until it holds, for up to two seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Polls the version until `check` holds. Panics if it never does.
pub(crate) async fn wait_for_version(
    handle: &ContextHandle,
    version_id: VersionId,
    check: impl Fn(&ServiceWorkerResult<VersionInfo>) -> bool,
) {
    for _ in 0..200 {
        if check(&handle.version_info(version_id).await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("version {version_id} never reached the expected state");
}

pub(crate) async fn wait_for_running(handle: &ContextHandle, version_id: VersionId, status: RunningStatus) {
    wait_for_version(handle, version_id, |info| {
        info.as_ref().is_ok_and(|i| i.running_status == status)
    })
    .await;
}
