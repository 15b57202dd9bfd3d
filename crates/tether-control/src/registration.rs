use chrono::{DateTime, Utc};
use tether_core::{ProcessId, RegistrationId, RunningStatus, VersionId, VersionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Installing,
    Waiting,
    Active,
}

/// Scope-to-version binding. Each version sits in at most one slot.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: RegistrationId,
    pub scope: String,
    pub script_url: String,
    pub origin: String,
    installing: Option<VersionId>,
    waiting: Option<VersionId>,
    active: Option<VersionId>,
    pub last_update_check: DateTime<Utc>,
    pub is_uninstalling: bool,
    pub is_uninstalled: bool,
    /// A row exists in the store. Until then the registration is in flight
    /// and only visible through live lookups.
    pub stored: bool,
}

impl Registration {
    pub fn new(
        id: RegistrationId,
        scope: &str,
        script_url: &str,
        origin: &str,
        last_update_check: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            scope: scope.to_string(),
            script_url: script_url.to_string(),
            origin: origin.to_string(),
            installing: None,
            waiting: None,
            active: None,
            last_update_check,
            is_uninstalling: false,
            is_uninstalled: false,
            stored: false,
        }
    }

    pub fn installing_version(&self) -> Option<VersionId> {
        self.installing
    }

    pub fn waiting_version(&self) -> Option<VersionId> {
        self.waiting
    }

    pub fn active_version(&self) -> Option<VersionId> {
        self.active
    }

    pub fn slot_of(&self, version_id: VersionId) -> Option<Slot> {
        if self.installing == Some(version_id) {
            Some(Slot::Installing)
        } else if self.waiting == Some(version_id) {
            Some(Slot::Waiting)
        } else if self.active == Some(version_id) {
            Some(Slot::Active)
        } else {
            None
        }
    }

    /// Clears whichever slot holds the version.
    pub fn unset_version(&mut self, version_id: VersionId) -> Option<Slot> {
        let slot = self.slot_of(version_id)?;
        match slot {
            Slot::Installing => self.installing = None,
            Slot::Waiting => self.waiting = None,
            Slot::Active => self.active = None,
        }
        Some(slot)
    }

    /// Each setter returns the version it displaced from that slot, if any.
    pub fn set_installing(&mut self, version_id: VersionId) -> Option<VersionId> {
        self.unset_version(version_id);
        self.installing.replace(version_id).filter(|v| *v != version_id)
    }

    pub fn set_waiting(&mut self, version_id: VersionId) -> Option<VersionId> {
        self.unset_version(version_id);
        self.waiting.replace(version_id).filter(|v| *v != version_id)
    }

    pub fn set_active(&mut self, version_id: VersionId) -> Option<VersionId> {
        self.unset_version(version_id);
        self.active.replace(version_id).filter(|v| *v != version_id)
    }

    pub fn versions(&self) -> Vec<VersionId> {
        [self.installing, self.waiting, self.active]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn is_deletable(&self) -> bool {
        self.waiting.is_none() && self.active.is_none()
    }
}

/// Value snapshot of one version.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub version_id: VersionId,
    pub script_url: String,
    pub status: VersionStatus,
    pub running_status: RunningStatus,
    pub controllees: usize,
    /// Processes referencing the worker, best allocation candidate first.
    pub process_candidates: Vec<ProcessId>,
}

/// Value snapshot of one registration, merged from live and stored state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegistrationInfo {
    pub registration_id: RegistrationId,
    pub scope: String,
    pub script_url: String,
    pub installing: Option<VersionInfo>,
    pub waiting: Option<VersionInfo>,
    pub active: Option<VersionInfo>,
    pub last_update_check: DateTime<Utc>,
    pub is_uninstalling: bool,
    pub stored: bool,
}
