use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use tether_core::{RegistrationId, ResourceId, ServiceWorkerError, ServiceWorkerResult, VersionId, scope};
use tether_db::entities::{id_counters, registrations, resource_id_lists, resources};

/// Value copy of one stored registration row.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegistrationData {
    pub registration_id: RegistrationId,
    pub scope: String,
    pub script_url: String,
    pub version_id: VersionId,
    pub is_active: bool,
    pub has_fetch_handler: bool,
    pub last_update_check: DateTime<Utc>,
    pub resources_total_size_bytes: u64,
}

impl RegistrationData {
    pub fn origin(&self) -> Option<String> {
        scope::origin_of(&self.scope)
    }
}

/// One committed script resource of a version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub url: String,
    pub size_bytes: u64,
}

/// The stored version a write or delete displaced; its ids are now purgeable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedVersion {
    pub version_id: VersionId,
    pub resource_ids: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// No registration remains for the origin.
    pub origin_is_deletable: bool,
    pub deleted_version: Option<DeletedVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Uninitialized,
    Initialized,
    Disabled,
}

#[derive(Debug)]
struct InitialState {
    counters: BTreeMap<String, i64>,
    origins: Vec<String>,
    recovered_uncommitted: u64,
}

const FIRST_ID: i64 = 1;

/// Durable registration store. A database error disables it: the failing
/// call reports `Io` or `Corrupted` and every later call reports `Aborted`
/// until [`ResourceStore::delete_and_start_over`] succeeds.
pub struct ResourceStore {
    db: DatabaseConnection,
    state: StoreState,
    next_registration_id: i64,
    next_version_id: i64,
    next_resource_id: i64,
    registered_origins: BTreeSet<String>,
}

impl ResourceStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            state: StoreState::Uninitialized,
            next_registration_id: FIRST_ID,
            next_version_id: FIRST_ID,
            next_resource_id: FIRST_ID,
            registered_origins: BTreeSet::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.state == StoreState::Disabled
    }

    fn disable(&mut self, reason: &str) {
        if self.state != StoreState::Disabled {
            tracing::error!(reason, "resource store disabled");
        }
        self.state = StoreState::Disabled;
    }

    fn check<T>(&mut self, result: Result<T, DbErr>) -> ServiceWorkerResult<T> {
        result.map_err(|err| {
            let msg = err.to_string();
            self.disable(&msg);
            ServiceWorkerError::Io(msg)
        })
    }

    fn corrupted(&mut self, msg: String) -> ServiceWorkerError {
        self.disable(&msg);
        ServiceWorkerError::Corrupted(msg)
    }

    async fn ensure_initialized(&mut self) -> ServiceWorkerResult<()> {
        match self.state {
            StoreState::Initialized => return Ok(()),
            StoreState::Disabled => return Err(ServiceWorkerError::Aborted),
            StoreState::Uninitialized => {}
        }

        let result = load_initial_state(&self.db).await;
        let init = self.check(result)?;

        let counter = |name: &str| init.counters.get(name).copied().unwrap_or(FIRST_ID);
        self.next_registration_id = counter(id_counters::REGISTRATION);
        self.next_version_id = counter(id_counters::VERSION);
        self.next_resource_id = counter(id_counters::RESOURCE);
        if [
            self.next_registration_id,
            self.next_version_id,
            self.next_resource_id,
        ]
        .iter()
        .any(|v| *v < FIRST_ID)
        {
            return Err(self.corrupted("negative id counter".to_string()));
        }

        self.registered_origins = init.origins.into_iter().collect();
        self.state = StoreState::Initialized;

        tracing::info!(
            origins = self.registered_origins.len(),
            recovered_uncommitted = init.recovered_uncommitted,
            next_registration_id = self.next_registration_id,
            next_version_id = self.next_version_id,
            next_resource_id = self.next_resource_id,
            "resource store initialized"
        );
        Ok(())
    }

    pub async fn registered_origins(&mut self) -> ServiceWorkerResult<Vec<String>> {
        self.ensure_initialized().await?;
        Ok(self.registered_origins.iter().cloned().collect())
    }

    async fn allocate(&mut self, name: &'static str) -> ServiceWorkerResult<i64> {
        self.ensure_initialized().await?;
        let id = match name {
            id_counters::REGISTRATION => self.next_registration_id,
            id_counters::VERSION => self.next_version_id,
            _ => self.next_resource_id,
        };
        let result = write_counter(&self.db, name, id + 1).await;
        self.check(result)?;
        match name {
            id_counters::REGISTRATION => self.next_registration_id = id + 1,
            id_counters::VERSION => self.next_version_id = id + 1,
            _ => self.next_resource_id = id + 1,
        }
        Ok(id)
    }

    pub async fn new_registration_id(&mut self) -> ServiceWorkerResult<RegistrationId> {
        self.allocate(id_counters::REGISTRATION)
            .await
            .map(RegistrationId)
    }

    pub async fn new_version_id(&mut self) -> ServiceWorkerResult<VersionId> {
        self.allocate(id_counters::VERSION).await.map(VersionId)
    }

    pub async fn new_resource_id(&mut self) -> ServiceWorkerResult<ResourceId> {
        self.allocate(id_counters::RESOURCE).await.map(ResourceId)
    }

    /// Allocates a resource id and records it as uncommitted in one step.
    pub async fn reserve_uncommitted_resource_id(&mut self) -> ServiceWorkerResult<ResourceId> {
        let id = self.new_resource_id().await?;
        self.store_uncommitted_resource_ids(&[id]).await?;
        Ok(id)
    }

    fn to_data(&mut self, row: registrations::Model) -> ServiceWorkerResult<RegistrationData> {
        if row.registration_id < FIRST_ID || row.version_id < FIRST_ID {
            return Err(self.corrupted(format!(
                "registration row {} has an invalid id",
                row.registration_id
            )));
        }
        if row.resources_total_size_bytes < 0 {
            return Err(self.corrupted(format!(
                "registration row {} has a negative size",
                row.registration_id
            )));
        }
        if scope::origin_of(&row.scope).as_deref() != Some(row.origin.as_str()) {
            return Err(self.corrupted(format!(
                "registration row {} origin does not match its scope",
                row.registration_id
            )));
        }
        Ok(RegistrationData {
            registration_id: RegistrationId(row.registration_id),
            scope: row.scope,
            script_url: row.script_url,
            version_id: VersionId(row.version_id),
            is_active: row.is_active,
            has_fetch_handler: row.has_fetch_handler,
            last_update_check: row.last_update_check.with_timezone(&Utc),
            resources_total_size_bytes: row.resources_total_size_bytes as u64,
        })
    }

    async fn read_resources(&mut self, version_id: VersionId) -> ServiceWorkerResult<Vec<ResourceRecord>> {
        let result = resources::Entity::find()
            .filter(resources::Column::VersionId.eq(version_id.0))
            .order_by_asc(resources::Column::ResourceId)
            .all(&self.db)
            .await;
        let rows = self.check(result)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if row.size_bytes < 0 {
                return Err(self.corrupted(format!(
                    "resource {} has a negative size",
                    row.resource_id
                )));
            }
            out.push(ResourceRecord {
                resource_id: ResourceId(row.resource_id),
                url: row.url,
                size_bytes: row.size_bytes as u64,
            });
        }
        Ok(out)
    }

    async fn with_resources(
        &mut self,
        row: registrations::Model,
    ) -> ServiceWorkerResult<(RegistrationData, Vec<ResourceRecord>)> {
        let data = self.to_data(row)?;
        let resources = self.read_resources(data.version_id).await?;
        Ok((data, resources))
    }

    pub async fn find_registration_for_pattern(
        &mut self,
        scope: &str,
    ) -> ServiceWorkerResult<(RegistrationData, Vec<ResourceRecord>)> {
        self.ensure_initialized().await?;
        let Some(origin) = scope::origin_of(scope) else {
            return Err(ServiceWorkerError::NotFound);
        };
        if !self.registered_origins.contains(&origin) {
            return Err(ServiceWorkerError::NotFound);
        }

        let result = registrations::Entity::find()
            .filter(registrations::Column::Scope.eq(scope))
            .one(&self.db)
            .await;
        let row = self.check(result)?.ok_or(ServiceWorkerError::NotFound)?;
        self.with_resources(row).await
    }

    /// Longest-scope match for a document URL.
    pub async fn find_registration_for_document(
        &mut self,
        document_url: &str,
    ) -> ServiceWorkerResult<(RegistrationData, Vec<ResourceRecord>)> {
        self.ensure_initialized().await?;
        let Some(origin) = scope::origin_of(document_url) else {
            return Err(ServiceWorkerError::NotFound);
        };
        if !self.registered_origins.contains(&origin) {
            return Err(ServiceWorkerError::NotFound);
        }

        let result = registrations::Entity::find()
            .filter(registrations::Column::Origin.eq(origin.as_str()))
            .all(&self.db)
            .await;
        let rows = self.check(result)?;
        let best_scope = scope::longest_matching_scope(rows.iter().map(|r| r.scope.as_str()), document_url)
            .map(str::to_string)
            .ok_or(ServiceWorkerError::NotFound)?;
        let best = rows
            .into_iter()
            .find(|row| row.scope == best_scope)
            .ok_or(ServiceWorkerError::NotFound)?;
        self.with_resources(best).await
    }

    pub async fn find_registration_for_id(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> ServiceWorkerResult<(RegistrationData, Vec<ResourceRecord>)> {
        self.ensure_initialized().await?;
        if !self.registered_origins.contains(origin) {
            return Err(ServiceWorkerError::NotFound);
        }
        let result = registrations::Entity::find_by_id(registration_id.0)
            .one(&self.db)
            .await;
        let row = self
            .check(result)?
            .filter(|row| row.origin == origin)
            .ok_or(ServiceWorkerError::NotFound)?;
        self.with_resources(row).await
    }

    pub async fn get_registrations_for_origin(
        &mut self,
        origin: &str,
    ) -> ServiceWorkerResult<Vec<RegistrationData>> {
        self.ensure_initialized().await?;
        if !self.registered_origins.contains(origin) {
            return Ok(Vec::new());
        }
        let result = registrations::Entity::find()
            .filter(registrations::Column::Origin.eq(origin))
            .order_by_asc(registrations::Column::RegistrationId)
            .all(&self.db)
            .await;
        let rows = self.check(result)?;
        rows.into_iter().map(|row| self.to_data(row)).collect()
    }

    pub async fn get_all_registrations(&mut self) -> ServiceWorkerResult<Vec<RegistrationData>> {
        self.ensure_initialized().await?;
        let result = registrations::Entity::find()
            .order_by_asc(registrations::Column::RegistrationId)
            .all(&self.db)
            .await;
        let rows = self.check(result)?;
        rows.into_iter().map(|row| self.to_data(row)).collect()
    }

    /// Persists a registration together with its version's resource list.
    ///
    /// The resource ids leave the uncommitted list. If the row previously
    /// pointed at another version, that version's resources become purgeable
    /// and are returned.
    pub async fn write_registration(
        &mut self,
        data: &RegistrationData,
        resources: &[ResourceRecord],
    ) -> ServiceWorkerResult<Option<DeletedVersion>> {
        self.ensure_initialized().await?;
        let Some(origin) = data.origin() else {
            return Err(ServiceWorkerError::InvalidState(format!(
                "scope has no origin: {}",
                data.scope
            )));
        };
        let total: u64 = resources.iter().map(|r| r.size_bytes).sum();
        if total != data.resources_total_size_bytes {
            return Err(ServiceWorkerError::InvalidState(format!(
                "resource sizes add up to {total}, registration says {}",
                data.resources_total_size_bytes
            )));
        }

        let result = registrations::Entity::find()
            .filter(registrations::Column::Scope.eq(data.scope.as_str()))
            .one(&self.db)
            .await;
        if let Some(other) = self.check(result)?
            && other.registration_id != data.registration_id.0
        {
            return Err(ServiceWorkerError::AlreadyExists);
        }

        let result = write_registration_txn(&self.db, &origin, data, resources).await;
        let deleted = self.check(result)?;
        self.registered_origins.insert(origin);
        Ok(deleted)
    }

    pub async fn update_to_active_state(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> ServiceWorkerResult<()> {
        self.ensure_initialized().await?;
        let result = registrations::Entity::update_many()
            .col_expr(registrations::Column::IsActive, Expr::value(true))
            .filter(registrations::Column::RegistrationId.eq(registration_id.0))
            .filter(registrations::Column::Origin.eq(origin))
            .exec(&self.db)
            .await;
        let updated = self.check(result)?;
        if updated.rows_affected == 0 {
            return Err(ServiceWorkerError::NotFound);
        }
        Ok(())
    }

    pub async fn update_last_update_check_time(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
        at: DateTime<Utc>,
    ) -> ServiceWorkerResult<()> {
        self.ensure_initialized().await?;
        let at: sea_orm::prelude::DateTimeWithTimeZone = at.into();
        let result = registrations::Entity::update_many()
            .col_expr(registrations::Column::LastUpdateCheck, Expr::value(at))
            .filter(registrations::Column::RegistrationId.eq(registration_id.0))
            .filter(registrations::Column::Origin.eq(origin))
            .exec(&self.db)
            .await;
        let updated = self.check(result)?;
        if updated.rows_affected == 0 {
            return Err(ServiceWorkerError::NotFound);
        }
        Ok(())
    }

    /// Deletes a registration row; a missing row is not an error.
    pub async fn delete_registration(
        &mut self,
        registration_id: RegistrationId,
        origin: &str,
    ) -> ServiceWorkerResult<DeleteOutcome> {
        self.ensure_initialized().await?;
        if !self.registered_origins.contains(origin) {
            return Ok(DeleteOutcome {
                origin_is_deletable: true,
                deleted_version: None,
            });
        }

        let result = delete_registration_txn(&self.db, registration_id, origin).await;
        let (deleted_version, origin_has_more) = self.check(result)?;
        if !origin_has_more {
            self.registered_origins.remove(origin);
        }
        Ok(DeleteOutcome {
            origin_is_deletable: !origin_has_more,
            deleted_version,
        })
    }

    pub async fn store_uncommitted_resource_ids(
        &mut self,
        ids: &[ResourceId],
    ) -> ServiceWorkerResult<()> {
        self.ensure_initialized().await?;
        if ids.is_empty() {
            return Ok(());
        }
        // An id already purgeable stays purgeable.
        let result = resource_id_lists::Entity::insert_many(ids.iter().map(|id| {
            resource_id_lists::ActiveModel {
                resource_id: Set(id.0),
                list: Set(resource_id_lists::UNCOMMITTED.to_string()),
            }
        }))
        .on_conflict(
            OnConflict::column(resource_id_lists::Column::ResourceId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await;
        self.check(result)?;
        Ok(())
    }

    pub async fn clear_uncommitted_resource_ids(
        &mut self,
        ids: &[ResourceId],
    ) -> ServiceWorkerResult<()> {
        self.ensure_initialized().await?;
        if ids.is_empty() {
            return Ok(());
        }
        let result = resource_id_lists::Entity::delete_many()
            .filter(resource_id_lists::Column::List.eq(resource_id_lists::UNCOMMITTED))
            .filter(resource_id_lists::Column::ResourceId.is_in(ids.iter().map(|id| id.0)))
            .exec(&self.db)
            .await;
        self.check(result)?;
        Ok(())
    }

    /// Moves uncommitted ids to the purgeable list. Ids that are committed or
    /// already purgeable are left alone. Returns how many moved.
    pub async fn doom_uncommitted_resource_ids(
        &mut self,
        ids: &[ResourceId],
    ) -> ServiceWorkerResult<u64> {
        self.ensure_initialized().await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = resource_id_lists::Entity::update_many()
            .col_expr(
                resource_id_lists::Column::List,
                Expr::value(resource_id_lists::PURGEABLE),
            )
            .filter(resource_id_lists::Column::List.eq(resource_id_lists::UNCOMMITTED))
            .filter(resource_id_lists::Column::ResourceId.is_in(ids.iter().map(|id| id.0)))
            .exec(&self.db)
            .await;
        let updated = self.check(result)?;
        Ok(updated.rows_affected)
    }

    async fn list_ids(&mut self, list: &str) -> ServiceWorkerResult<Vec<ResourceId>> {
        self.ensure_initialized().await?;
        let result = resource_id_lists::Entity::find()
            .filter(resource_id_lists::Column::List.eq(list))
            .order_by_asc(resource_id_lists::Column::ResourceId)
            .all(&self.db)
            .await;
        let rows = self.check(result)?;
        Ok(rows.into_iter().map(|r| ResourceId(r.resource_id)).collect())
    }

    pub async fn get_uncommitted_resource_ids(&mut self) -> ServiceWorkerResult<Vec<ResourceId>> {
        self.list_ids(resource_id_lists::UNCOMMITTED).await
    }

    pub async fn get_purgeable_resource_ids(&mut self) -> ServiceWorkerResult<Vec<ResourceId>> {
        self.list_ids(resource_id_lists::PURGEABLE).await
    }

    pub async fn clear_purgeable_resource_ids(
        &mut self,
        ids: &[ResourceId],
    ) -> ServiceWorkerResult<()> {
        self.ensure_initialized().await?;
        if ids.is_empty() {
            return Ok(());
        }
        let result = resource_id_lists::Entity::delete_many()
            .filter(resource_id_lists::Column::List.eq(resource_id_lists::PURGEABLE))
            .filter(resource_id_lists::Column::ResourceId.is_in(ids.iter().map(|id| id.0)))
            .exec(&self.db)
            .await;
        self.check(result)?;
        Ok(())
    }

    /// Wipes every table and re-arms the store, including a disabled one.
    pub async fn delete_and_start_over(&mut self) -> ServiceWorkerResult<()> {
        let result = wipe(&self.db).await;
        if let Err(err) = result {
            let msg = err.to_string();
            self.disable(&msg);
            return Err(ServiceWorkerError::Io(msg));
        }
        self.state = StoreState::Uninitialized;
        self.next_registration_id = FIRST_ID;
        self.next_version_id = FIRST_ID;
        self.next_resource_id = FIRST_ID;
        self.registered_origins.clear();
        tracing::warn!("resource store wiped");
        Ok(())
    }
}

async fn load_initial_state(db: &DatabaseConnection) -> Result<InitialState, DbErr> {
    let counters = id_counters::Entity::find()
        .all(db)
        .await?
        .into_iter()
        .map(|row| (row.name, row.next_id))
        .collect();

    let origins = registrations::Entity::find()
        .select_only()
        .column(registrations::Column::Origin)
        .distinct()
        .into_tuple::<String>()
        .all(db)
        .await?;

    // Anything still uncommitted was never referenced by a stored version.
    let recovered = resource_id_lists::Entity::update_many()
        .col_expr(
            resource_id_lists::Column::List,
            Expr::value(resource_id_lists::PURGEABLE),
        )
        .filter(resource_id_lists::Column::List.eq(resource_id_lists::UNCOMMITTED))
        .exec(db)
        .await?;

    Ok(InitialState {
        counters,
        origins,
        recovered_uncommitted: recovered.rows_affected,
    })
}

async fn write_counter(db: &DatabaseConnection, name: &str, next_id: i64) -> Result<(), DbErr> {
    id_counters::Entity::insert(id_counters::ActiveModel {
        name: Set(name.to_string()),
        next_id: Set(next_id),
    })
    .on_conflict(
        OnConflict::column(id_counters::Column::Name)
            .update_column(id_counters::Column::NextId)
            .to_owned(),
    )
    .exec_without_returning(db)
    .await?;
    Ok(())
}

async fn resource_ids_for_version<C: ConnectionTrait>(
    conn: &C,
    version_id: i64,
) -> Result<Vec<i64>, DbErr> {
    resources::Entity::find()
        .select_only()
        .column(resources::Column::ResourceId)
        .filter(resources::Column::VersionId.eq(version_id))
        .order_by_asc(resources::Column::ResourceId)
        .into_tuple::<i64>()
        .all(conn)
        .await
}

/// Drops a stored version's resource rows and puts their ids on the purgeable list.
async fn retire_version<C: ConnectionTrait>(
    conn: &C,
    version_id: i64,
) -> Result<DeletedVersion, DbErr> {
    let ids = resource_ids_for_version(conn, version_id).await?;
    resources::Entity::delete_many()
        .filter(resources::Column::VersionId.eq(version_id))
        .exec(conn)
        .await?;
    if !ids.is_empty() {
        resource_id_lists::Entity::insert_many(ids.iter().map(|id| {
            resource_id_lists::ActiveModel {
                resource_id: Set(*id),
                list: Set(resource_id_lists::PURGEABLE.to_string()),
            }
        }))
        .on_conflict(
            OnConflict::column(resource_id_lists::Column::ResourceId)
                .update_column(resource_id_lists::Column::List)
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    }
    Ok(DeletedVersion {
        version_id: VersionId(version_id),
        resource_ids: ids.into_iter().map(ResourceId).collect(),
    })
}

async fn write_registration_txn(
    db: &DatabaseConnection,
    origin: &str,
    data: &RegistrationData,
    records: &[ResourceRecord],
) -> Result<Option<DeletedVersion>, DbErr> {
    let txn = db.begin().await?;

    let existing = registrations::Entity::find_by_id(data.registration_id.0)
        .one(&txn)
        .await?;
    let mut deleted = None;
    if let Some(existing) = existing
        && existing.version_id != data.version_id.0
    {
        deleted = Some(retire_version(&txn, existing.version_id).await?);
    }

    // Rewriting the same version replaces its resource rows.
    resources::Entity::delete_many()
        .filter(resources::Column::VersionId.eq(data.version_id.0))
        .exec(&txn)
        .await?;
    if !records.is_empty() {
        resources::Entity::insert_many(records.iter().map(|r| resources::ActiveModel {
            resource_id: Set(r.resource_id.0),
            version_id: Set(data.version_id.0),
            url: Set(r.url.clone()),
            size_bytes: Set(r.size_bytes as i64),
        }))
        .exec_without_returning(&txn)
        .await?;

        resource_id_lists::Entity::delete_many()
            .filter(
                resource_id_lists::Column::ResourceId
                    .is_in(records.iter().map(|r| r.resource_id.0)),
            )
            .exec(&txn)
            .await?;
    }

    registrations::Entity::insert(registrations::ActiveModel {
        registration_id: Set(data.registration_id.0),
        origin: Set(origin.to_string()),
        scope: Set(data.scope.clone()),
        script_url: Set(data.script_url.clone()),
        version_id: Set(data.version_id.0),
        is_active: Set(data.is_active),
        has_fetch_handler: Set(data.has_fetch_handler),
        last_update_check: Set(data.last_update_check.into()),
        resources_total_size_bytes: Set(data.resources_total_size_bytes as i64),
    })
    .on_conflict(
        OnConflict::column(registrations::Column::RegistrationId)
            .update_columns([
                registrations::Column::Origin,
                registrations::Column::Scope,
                registrations::Column::ScriptUrl,
                registrations::Column::VersionId,
                registrations::Column::IsActive,
                registrations::Column::HasFetchHandler,
                registrations::Column::LastUpdateCheck,
                registrations::Column::ResourcesTotalSizeBytes,
            ])
            .to_owned(),
    )
    .exec_without_returning(&txn)
    .await?;

    txn.commit().await?;
    Ok(deleted)
}

async fn delete_registration_txn(
    db: &DatabaseConnection,
    registration_id: RegistrationId,
    origin: &str,
) -> Result<(Option<DeletedVersion>, bool), DbErr> {
    let txn = db.begin().await?;

    let row = registrations::Entity::find_by_id(registration_id.0)
        .one(&txn)
        .await?
        .filter(|row| row.origin == origin);
    let mut deleted = None;
    if let Some(row) = row {
        deleted = Some(retire_version(&txn, row.version_id).await?);
        registrations::Entity::delete_by_id(row.registration_id)
            .exec(&txn)
            .await?;
    }

    let origin_has_more = registrations::Entity::find()
        .filter(registrations::Column::Origin.eq(origin))
        .one(&txn)
        .await?
        .is_some();

    txn.commit().await?;
    Ok((deleted, origin_has_more))
}

async fn wipe(db: &DatabaseConnection) -> Result<(), DbErr> {
    let txn = db.begin().await?;
    registrations::Entity::delete_many().exec(&txn).await?;
    resources::Entity::delete_many().exec(&txn).await?;
    resource_id_lists::Entity::delete_many().exec(&txn).await?;
    id_counters::Entity::delete_many().exec(&txn).await?;
    txn.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sea_orm_migration::MigratorTrait;

    async fn open() -> (ResourceStore, DatabaseConnection) {
        let db = tether_db::connect("sqlite::memory:").await.unwrap();
        tether_migration::Migrator::up(&db, None).await.unwrap();
        (ResourceStore::new(db.clone()), db)
    }

    fn data(id: i64, scope: &str, version: i64, sizes: &[u64]) -> RegistrationData {
        RegistrationData {
            registration_id: RegistrationId(id),
            scope: scope.to_string(),
            script_url: format!("{scope}sw.js"),
            version_id: VersionId(version),
            is_active: true,
            has_fetch_handler: false,
            last_update_check: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            resources_total_size_bytes: sizes.iter().sum(),
        }
    }

    fn records(first_id: i64, scope: &str, sizes: &[u64]) -> Vec<ResourceRecord> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| ResourceRecord {
                resource_id: ResourceId(first_id + i as i64),
                url: format!("{scope}script{i}.js"),
                size_bytes: *size,
            })
            .collect()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (mut store, _db) = open().await;
        let reg = data(1, "https://a.test/app/", 10, &[100, 20]);
        let res = records(1, "https://a.test/app/", &[100, 20]);
        store.store_uncommitted_resource_ids(&[ResourceId(1), ResourceId(2)]).await.unwrap();

        let deleted = store.write_registration(&reg, &res).await.unwrap();
        assert_eq!(deleted, None);

        let (found, found_res) = store
            .find_registration_for_id(RegistrationId(1), "https://a.test")
            .await
            .unwrap();
        assert_eq!(found, reg);
        assert_eq!(found_res, res);
        // Committed ids leave the uncommitted list.
        assert!(store.get_uncommitted_resource_ids().await.unwrap().is_empty());

        store
            .delete_registration(RegistrationId(1), "https://a.test")
            .await
            .unwrap();
        let err = store
            .find_registration_for_id(RegistrationId(1), "https://a.test")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::NotFound);
    }

    #[tokio::test]
    async fn deleting_missing_registration_is_ok() {
        let (mut store, _db) = open().await;
        let outcome = store
            .delete_registration(RegistrationId(77), "https://nowhere.test")
            .await
            .unwrap();
        assert!(outcome.origin_is_deletable);
        assert_eq!(outcome.deleted_version, None);

        store
            .write_registration(&data(1, "https://a.test/", 1, &[]), &[])
            .await
            .unwrap();
        let outcome = store
            .delete_registration(RegistrationId(99), "https://a.test")
            .await
            .unwrap();
        assert!(!outcome.origin_is_deletable);
        assert_eq!(outcome.deleted_version, None);
    }

    #[tokio::test]
    async fn superseded_version_resources_become_purgeable_once() {
        let (mut store, _db) = open().await;
        let scope = "https://a.test/app/";
        store
            .store_uncommitted_resource_ids(&[ResourceId(1), ResourceId(2)])
            .await
            .unwrap();
        store
            .write_registration(&data(1, scope, 10, &[5, 6]), &records(1, scope, &[5, 6]))
            .await
            .unwrap();

        store.store_uncommitted_resource_ids(&[ResourceId(3)]).await.unwrap();
        let deleted = store
            .write_registration(&data(1, scope, 11, &[7]), &records(3, scope, &[7]))
            .await
            .unwrap();
        assert_eq!(
            deleted,
            Some(DeletedVersion {
                version_id: VersionId(10),
                resource_ids: vec![ResourceId(1), ResourceId(2)],
            })
        );
        assert_eq!(
            store.get_purgeable_resource_ids().await.unwrap(),
            vec![ResourceId(1), ResourceId(2)]
        );
        assert!(store.get_uncommitted_resource_ids().await.unwrap().is_empty());
        let committed: Vec<i64> = resources::Entity::find()
            .all(&store.db)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(committed, vec![3]);

        // Re-storing the current version does not purge anything again.
        let again = store
            .write_registration(&data(1, scope, 11, &[7]), &records(3, scope, &[7]))
            .await
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(store.get_purgeable_resource_ids().await.unwrap().len(), 2);

        // A purgeable id never goes back to uncommitted.
        store.store_uncommitted_resource_ids(&[ResourceId(1)]).await.unwrap();
        assert!(store.get_uncommitted_resource_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_ids_are_purgeable_after_restart() {
        let (mut store, db) = open().await;
        let id = store.reserve_uncommitted_resource_id().await.unwrap();
        assert_eq!(store.get_uncommitted_resource_ids().await.unwrap(), vec![id]);
        drop(store);

        let mut reopened = ResourceStore::new(db);
        assert!(reopened.get_uncommitted_resource_ids().await.unwrap().is_empty());
        assert_eq!(reopened.get_purgeable_resource_ids().await.unwrap(), vec![id]);
        // Counters survive the restart.
        let next = reopened.new_resource_id().await.unwrap();
        assert_eq!(next, ResourceId(id.0 + 1));
    }

    #[tokio::test]
    async fn doom_moves_only_uncommitted_ids() {
        let (mut store, _db) = open().await;
        let scope = "https://a.test/";
        store
            .store_uncommitted_resource_ids(&[ResourceId(1), ResourceId(2)])
            .await
            .unwrap();
        store
            .write_registration(&data(1, scope, 1, &[3]), &records(1, scope, &[3]))
            .await
            .unwrap();

        let moved = store
            .doom_uncommitted_resource_ids(&[ResourceId(1), ResourceId(2)])
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(
            store.get_purgeable_resource_ids().await.unwrap(),
            vec![ResourceId(2)]
        );
        store
            .clear_purgeable_resource_ids(&[ResourceId(2)])
            .await
            .unwrap();
        assert!(store.get_purgeable_resource_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn origin_index_tracks_remaining_registrations() {
        let (mut store, _db) = open().await;
        store
            .write_registration(&data(1, "https://a.test/one/", 1, &[]), &[])
            .await
            .unwrap();
        store
            .write_registration(&data(2, "https://a.test/two/", 2, &[]), &[])
            .await
            .unwrap();

        let outcome = store
            .delete_registration(RegistrationId(1), "https://a.test")
            .await
            .unwrap();
        assert!(!outcome.origin_is_deletable);
        assert_eq!(
            store.registered_origins().await.unwrap(),
            vec!["https://a.test".to_string()]
        );

        let outcome = store
            .delete_registration(RegistrationId(2), "https://a.test")
            .await
            .unwrap();
        assert!(outcome.origin_is_deletable);
        assert!(store.registered_origins().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn document_lookup_prefers_longest_scope() {
        let (mut store, _db) = open().await;
        store
            .write_registration(&data(1, "https://a.test/", 1, &[]), &[])
            .await
            .unwrap();
        store
            .write_registration(&data(2, "https://a.test/app/", 2, &[]), &[])
            .await
            .unwrap();

        let (found, _) = store
            .find_registration_for_document("https://a.test/app/index.html")
            .await
            .unwrap();
        assert_eq!(found.registration_id, RegistrationId(2));
        let (found, _) = store
            .find_registration_for_document("https://a.test/about")
            .await
            .unwrap();
        assert_eq!(found.registration_id, RegistrationId(1));
        let err = store
            .find_registration_for_document("https://b.test/app/")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::NotFound);
    }

    #[tokio::test]
    async fn same_scope_under_another_id_is_rejected() {
        let (mut store, _db) = open().await;
        store
            .write_registration(&data(1, "https://a.test/", 1, &[]), &[])
            .await
            .unwrap();
        let err = store
            .write_registration(&data(2, "https://a.test/", 2, &[]), &[])
            .await
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::AlreadyExists);
        assert!(!store.is_disabled());
    }

    #[tokio::test]
    async fn active_flag_and_update_check_are_updated_in_place() {
        let (mut store, _db) = open().await;
        let mut reg = data(1, "https://a.test/", 1, &[]);
        reg.is_active = false;
        store.write_registration(&reg, &[]).await.unwrap();

        store
            .update_to_active_state(RegistrationId(1), "https://a.test")
            .await
            .unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store
            .update_last_update_check_time(RegistrationId(1), "https://a.test", later)
            .await
            .unwrap();

        let (found, _) = store
            .find_registration_for_pattern("https://a.test/")
            .await
            .unwrap();
        assert!(found.is_active);
        assert_eq!(found.last_update_check, later);

        let err = store
            .update_to_active_state(RegistrationId(5), "https://a.test")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::NotFound);
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let (mut store, _db) = open().await;
        let a = store.new_registration_id().await.unwrap();
        let b = store.new_registration_id().await.unwrap();
        assert!(b > a);
        let v1 = store.new_version_id().await.unwrap();
        let v2 = store.new_version_id().await.unwrap();
        assert_eq!(v2.0, v1.0 + 1);
    }

    #[tokio::test]
    async fn database_error_disables_until_start_over() {
        let (mut store, db) = open().await;
        store
            .write_registration(&data(1, "https://a.test/", 1, &[]), &[])
            .await
            .unwrap();

        db.execute_unprepared("DROP TABLE resources").await.unwrap();
        let err = store
            .find_registration_for_pattern("https://a.test/")
            .await
            .unwrap_err();
        assert!(err.is_storage_failure());
        assert!(store.is_disabled());
        let err = store.get_all_registrations().await.unwrap_err();
        assert_eq!(err, ServiceWorkerError::Aborted);

        tether_migration::Migrator::fresh(&db).await.unwrap();
        store.delete_and_start_over().await.unwrap();
        assert!(!store.is_disabled());
        assert!(store.get_all_registrations().await.unwrap().is_empty());
        assert_eq!(store.new_registration_id().await.unwrap(), RegistrationId(1));
    }
}
