use chrono::{DateTime, Utc};
use tether_core::{RegistrationId, ResourceId, ServiceWorkerError, ServiceWorkerResult, VersionId};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::storage::{DeleteOutcome, DeletedVersion, RegistrationData, ResourceRecord, ResourceStore};

type Reply<T> = oneshot::Sender<ServiceWorkerResult<T>>;
pub type Pending<T> = oneshot::Receiver<ServiceWorkerResult<T>>;
pub type StoredRegistration = (RegistrationData, Vec<ResourceRecord>);

enum StorageRequest {
    FindForPattern {
        scope: String,
        reply: Reply<StoredRegistration>,
    },
    FindForDocument {
        document_url: String,
        reply: Reply<StoredRegistration>,
    },
    FindForId {
        registration_id: RegistrationId,
        origin: String,
        reply: Reply<StoredRegistration>,
    },
    GetAll {
        reply: Reply<Vec<RegistrationData>>,
    },
    NewRegistrationId {
        reply: Reply<RegistrationId>,
    },
    NewVersionId {
        reply: Reply<VersionId>,
    },
    ReserveResourceId {
        reply: Reply<ResourceId>,
    },
    Write {
        data: RegistrationData,
        resources: Vec<ResourceRecord>,
        reply: Reply<Option<DeletedVersion>>,
    },
    UpdateToActive {
        registration_id: RegistrationId,
        origin: String,
        reply: Reply<()>,
    },
    UpdateLastCheck {
        registration_id: RegistrationId,
        origin: String,
        at: DateTime<Utc>,
        reply: Reply<()>,
    },
    Delete {
        registration_id: RegistrationId,
        origin: String,
        reply: Reply<DeleteOutcome>,
    },
    DoomUncommitted {
        ids: Vec<ResourceId>,
        reply: Reply<u64>,
    },
    GetPurgeable {
        reply: Reply<Vec<ResourceId>>,
    },
    ClearPurgeable {
        ids: Vec<ResourceId>,
        reply: Reply<()>,
    },
    DeleteAndStartOver {
        reply: Reply<()>,
    },
}

/// Cheap, cloneable sender half of the storage task.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<StorageRequest>,
}

/// Waits for a storage reply; a dropped task counts as `Aborted`.
pub async fn resolve<T>(pending: Pending<T>) -> ServiceWorkerResult<T> {
    pending.await.unwrap_or(Err(ServiceWorkerError::Aborted))
}

impl StorageHandle {
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> StorageRequest) -> Pending<T> {
        let (reply, rx) = oneshot::channel();
        // A closed task drops the request and with it the reply sender.
        let _ = self.tx.send(make(reply));
        rx
    }

    pub fn find_registration_for_pattern(&self, scope: &str) -> Pending<StoredRegistration> {
        let scope = scope.to_string();
        self.call(|reply| StorageRequest::FindForPattern { scope, reply })
    }

    pub fn find_registration_for_document(&self, document_url: &str) -> Pending<StoredRegistration> {
        let document_url = document_url.to_string();
        self.call(|reply| StorageRequest::FindForDocument {
            document_url,
            reply,
        })
    }

    pub fn find_registration_for_id(
        &self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> Pending<StoredRegistration> {
        let origin = origin.to_string();
        self.call(|reply| StorageRequest::FindForId {
            registration_id,
            origin,
            reply,
        })
    }

    pub fn get_all_registrations(&self) -> Pending<Vec<RegistrationData>> {
        self.call(|reply| StorageRequest::GetAll { reply })
    }

    pub fn new_registration_id(&self) -> Pending<RegistrationId> {
        self.call(|reply| StorageRequest::NewRegistrationId { reply })
    }

    pub fn new_version_id(&self) -> Pending<VersionId> {
        self.call(|reply| StorageRequest::NewVersionId { reply })
    }

    pub fn reserve_uncommitted_resource_id(&self) -> Pending<ResourceId> {
        self.call(|reply| StorageRequest::ReserveResourceId { reply })
    }

    pub fn write_registration(
        &self,
        data: RegistrationData,
        resources: Vec<ResourceRecord>,
    ) -> Pending<Option<DeletedVersion>> {
        self.call(|reply| StorageRequest::Write {
            data,
            resources,
            reply,
        })
    }

    pub fn update_to_active_state(&self, registration_id: RegistrationId, origin: &str) -> Pending<()> {
        let origin = origin.to_string();
        self.call(|reply| StorageRequest::UpdateToActive {
            registration_id,
            origin,
            reply,
        })
    }

    pub fn update_last_update_check_time(
        &self,
        registration_id: RegistrationId,
        origin: &str,
        at: DateTime<Utc>,
    ) -> Pending<()> {
        let origin = origin.to_string();
        self.call(|reply| StorageRequest::UpdateLastCheck {
            registration_id,
            origin,
            at,
            reply,
        })
    }

    pub fn delete_registration(
        &self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> Pending<DeleteOutcome> {
        let origin = origin.to_string();
        self.call(|reply| StorageRequest::Delete {
            registration_id,
            origin,
            reply,
        })
    }

    pub fn doom_uncommitted_resource_ids(&self, ids: Vec<ResourceId>) -> Pending<u64> {
        self.call(|reply| StorageRequest::DoomUncommitted { ids, reply })
    }

    pub fn get_purgeable_resource_ids(&self) -> Pending<Vec<ResourceId>> {
        self.call(|reply| StorageRequest::GetPurgeable { reply })
    }

    pub fn clear_purgeable_resource_ids(&self, ids: Vec<ResourceId>) -> Pending<()> {
        self.call(|reply| StorageRequest::ClearPurgeable { ids, reply })
    }

    pub fn delete_and_start_over(&self) -> Pending<()> {
        self.call(|reply| StorageRequest::DeleteAndStartOver { reply })
    }
}

/// Moves the store onto its own task. The task ends once every handle is gone.
pub fn spawn_storage_worker(store: ResourceStore) -> StorageHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(store, rx).instrument(tracing::info_span!("storage_worker")));
    StorageHandle { tx }
}

async fn run(mut store: ResourceStore, mut rx: mpsc::UnboundedReceiver<StorageRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            StorageRequest::FindForPattern { scope, reply } => {
                let _ = reply.send(store.find_registration_for_pattern(&scope).await);
            }
            StorageRequest::FindForDocument {
                document_url,
                reply,
            } => {
                let _ = reply.send(store.find_registration_for_document(&document_url).await);
            }
            StorageRequest::FindForId {
                registration_id,
                origin,
                reply,
            } => {
                let _ = reply.send(store.find_registration_for_id(registration_id, &origin).await);
            }
            StorageRequest::GetAll { reply } => {
                let _ = reply.send(store.get_all_registrations().await);
            }
            StorageRequest::NewRegistrationId { reply } => {
                let _ = reply.send(store.new_registration_id().await);
            }
            StorageRequest::NewVersionId { reply } => {
                let _ = reply.send(store.new_version_id().await);
            }
            StorageRequest::ReserveResourceId { reply } => {
                let _ = reply.send(store.reserve_uncommitted_resource_id().await);
            }
            StorageRequest::Write {
                data,
                resources,
                reply,
            } => {
                let _ = reply.send(store.write_registration(&data, &resources).await);
            }
            StorageRequest::UpdateToActive {
                registration_id,
                origin,
                reply,
            } => {
                let _ = reply.send(store.update_to_active_state(registration_id, &origin).await);
            }
            StorageRequest::UpdateLastCheck {
                registration_id,
                origin,
                at,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .update_last_update_check_time(registration_id, &origin, at)
                        .await,
                );
            }
            StorageRequest::Delete {
                registration_id,
                origin,
                reply,
            } => {
                let _ = reply.send(store.delete_registration(registration_id, &origin).await);
            }
            StorageRequest::DoomUncommitted { ids, reply } => {
                let _ = reply.send(store.doom_uncommitted_resource_ids(&ids).await);
            }
            StorageRequest::GetPurgeable { reply } => {
                let _ = reply.send(store.get_purgeable_resource_ids().await);
            }
            StorageRequest::ClearPurgeable { ids, reply } => {
                let _ = reply.send(store.clear_purgeable_resource_ids(&ids).await);
            }
            StorageRequest::DeleteAndStartOver { reply } => {
                let _ = reply.send(store.delete_and_start_over().await);
            }
        }
    }
    tracing::debug!("storage worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm_migration::MigratorTrait;

    async fn spawn() -> StorageHandle {
        let db = tether_db::connect("sqlite::memory:").await.unwrap();
        tether_migration::Migrator::up(&db, None).await.unwrap();
        spawn_storage_worker(ResourceStore::new(db))
    }

    #[tokio::test]
    async fn requests_run_in_issuance_order() {
        let storage = spawn().await;
        let a = storage.new_version_id();
        let b = storage.new_version_id();
        let c = storage.new_version_id();
        // Awaited out of order; ids still follow send order.
        let c = resolve(c).await.unwrap();
        let a = resolve(a).await.unwrap();
        let b = resolve(b).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn lookup_miss_is_not_found() {
        let storage = spawn().await;
        let err = resolve(storage.find_registration_for_pattern("https://a.test/"))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::NotFound);
    }

    #[tokio::test]
    async fn closed_task_reports_aborted() {
        let (_tx, rx) = oneshot::channel::<ServiceWorkerResult<()>>();
        drop(_tx);
        assert_eq!(resolve(rx).await, Err(ServiceWorkerError::Aborted));
    }
}
