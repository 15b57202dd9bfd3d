use std::{path::PathBuf, sync::Arc};

use tether_core::{
    ProcessId, RequestId, ResourceId, ServiceWorkerError, ServiceWorkerResult, VersionId, WorkerId,
};

/// Directive sent to a worker process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    StartWorker {
        worker_id: WorkerId,
        version_id: VersionId,
        scope: String,
        script_url: String,
    },
    StopWorker {
        worker_id: WorkerId,
    },
    DispatchEvent {
        worker_id: WorkerId,
        request_id: RequestId,
        event: WorkerEvent,
    },
    Ping {
        worker_id: WorkerId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch { url: String },
    Message { payload: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Completed,
    Rejected,
}

/// Report coming back from a worker process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerNotification {
    ScriptLoaded {
        worker_id: WorkerId,
    },
    ScriptEvaluated {
        worker_id: WorkerId,
        success: bool,
    },
    Started {
        worker_id: WorkerId,
        thread_id: i32,
    },
    Stopped {
        worker_id: WorkerId,
    },
    EventFinished {
        worker_id: WorkerId,
        request_id: RequestId,
        status: EventStatus,
    },
    Pong {
        worker_id: WorkerId,
    },
    ImportScript {
        worker_id: WorkerId,
        url: String,
    },
    FetchHandlerPresent {
        worker_id: WorkerId,
    },
    ReportException {
        worker_id: WorkerId,
        message: String,
        line: u32,
        column: u32,
        source_url: String,
    },
    ConsoleMessage {
        worker_id: WorkerId,
        level: String,
        message: String,
    },
}

impl WorkerNotification {
    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::ScriptLoaded { worker_id }
            | Self::ScriptEvaluated { worker_id, .. }
            | Self::Started { worker_id, .. }
            | Self::Stopped { worker_id }
            | Self::EventFinished { worker_id, .. }
            | Self::Pong { worker_id }
            | Self::ImportScript { worker_id, .. }
            | Self::FetchHandlerPresent { worker_id }
            | Self::ReportException { worker_id, .. }
            | Self::ConsoleMessage { worker_id, .. } => *worker_id,
        }
    }
}

#[async_trait::async_trait]
pub trait ProcessAllocator: Send + Sync {
    /// Picks a process for `worker_id`. `candidates` is ranked best first.
    async fn allocate(
        &self,
        worker_id: WorkerId,
        candidates: &[ProcessId],
        script_url: &str,
    ) -> ServiceWorkerResult<ProcessId>;

    async fn release(&self, worker_id: WorkerId, process_id: ProcessId);
}

/// Non-blocking send to a worker process. Replies arrive through
/// `ContextHandle::on_worker_notification`.
pub trait WorkerTransport: Send + Sync {
    fn send(&self, process_id: ProcessId, command: WorkerCommand) -> ServiceWorkerResult<()>;
}

#[async_trait::async_trait]
pub trait BodyStore: Send + Sync {
    /// Makes the body of `url` available under `resource_id`; returns its size.
    async fn write_script(&self, resource_id: ResourceId, url: &str) -> ServiceWorkerResult<u64>;

    async fn delete_resource(&self, resource_id: ResourceId) -> ServiceWorkerResult<()>;
}

#[derive(Clone)]
pub struct Host {
    pub allocator: Arc<dyn ProcessAllocator>,
    pub transport: Arc<dyn WorkerTransport>,
    pub bodies: Arc<dyn BodyStore>,
}

/// Host for the admin binary: no worker processes exist, bodies live on disk.
pub fn detached_host(body_root: PathBuf) -> Host {
    Host {
        allocator: Arc::new(NoProcesses),
        transport: Arc::new(NoProcesses),
        bodies: Arc::new(FsBodyStore::new(body_root)),
    }
}

struct NoProcesses;

#[async_trait::async_trait]
impl ProcessAllocator for NoProcesses {
    async fn allocate(
        &self,
        worker_id: WorkerId,
        _candidates: &[ProcessId],
        _script_url: &str,
    ) -> ServiceWorkerResult<ProcessId> {
        tracing::debug!(%worker_id, "no worker processes available");
        Err(ServiceWorkerError::StartWorkerFailed)
    }

    async fn release(&self, _worker_id: WorkerId, _process_id: ProcessId) {}
}

impl WorkerTransport for NoProcesses {
    fn send(&self, _process_id: ProcessId, _command: WorkerCommand) -> ServiceWorkerResult<()> {
        Err(ServiceWorkerError::IpcFailed)
    }
}

/// Bodies stored as `<root>/<resource_id>`, placed there by the fetcher.
pub struct FsBodyStore {
    root: PathBuf,
}

impl FsBodyStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, resource_id: ResourceId) -> PathBuf {
        self.root.join(resource_id.to_string())
    }
}

#[async_trait::async_trait]
impl BodyStore for FsBodyStore {
    async fn write_script(&self, resource_id: ResourceId, url: &str) -> ServiceWorkerResult<u64> {
        let path = self.path_for(resource_id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) => {
                tracing::warn!(%resource_id, url, path = %path.display(), error = %err, "script body missing");
                Err(ServiceWorkerError::Io(err.to_string()))
            }
        }
    }

    async fn delete_resource(&self, resource_id: ResourceId) -> ServiceWorkerResult<()> {
        let path = self.path_for(resource_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ServiceWorkerError::Io(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_names_its_worker() {
        let n = WorkerNotification::EventFinished {
            worker_id: WorkerId(3),
            request_id: RequestId(1),
            status: EventStatus::Completed,
        };
        assert_eq!(n.worker_id(), WorkerId(3));
    }

    #[test]
    fn commands_serialize_with_type_tag() {
        let cmd = WorkerCommand::StopWorker {
            worker_id: WorkerId(7),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "stop_worker");
        assert_eq!(json["worker_id"], 7);
    }

    #[tokio::test]
    async fn fs_body_store_reports_size_and_deletes() {
        let root = std::env::temp_dir().join(format!("tether-bodies-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("5"), b"self.onfetch = null;").await.unwrap();

        let store = FsBodyStore::new(root.clone());
        let size = store
            .write_script(ResourceId(5), "https://a.test/sw.js")
            .await
            .unwrap();
        assert_eq!(size, 20);
        assert!(store.write_script(ResourceId(6), "https://a.test/x.js").await.is_err());

        store.delete_resource(ResourceId(5)).await.unwrap();
        // Already gone.
        store.delete_resource(ResourceId(5)).await.unwrap();
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
