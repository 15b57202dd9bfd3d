use std::fmt;

pub mod error;
pub mod scope;

pub use error::{ServiceWorkerError, ServiceWorkerResult};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Durable registration id. Allocated from the store's `registration` counter.
    RegistrationId(i64)
);
numeric_id!(
    /// Durable version id. Allocated from the store's `version` counter.
    VersionId(i64)
);
numeric_id!(
    /// Opaque handle to one script body held by the body store.
    ResourceId(i64)
);
numeric_id!(
    /// In-memory handle of a worker instance; never persisted.
    WorkerId(i32)
);
numeric_id!(
    /// Host process id as handed out by the process allocator.
    ProcessId(i32)
);
numeric_id!(
    /// Per-version id of a dispatched event.
    RequestId(u64)
);
numeric_id!(
    /// Opaque client (document or worker) served by a version.
    ClientId(u64)
);

/// Identity of one queued register/update/unregister job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a version as seen by its registration.
///
/// Moves forward only, except for the rollback to `New` when an install fails
/// before anything was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum VersionStatus {
    New,
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Installing => 1,
            Self::Installed => 2,
            Self::Activating => 3,
            Self::Activated => 4,
            Self::Redundant => 5,
        }
    }

    /// Whether `self -> next` is a legal status change.
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        if next == VersionStatus::New {
            return *self == VersionStatus::Installing;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RunningStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl RunningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Where a starting worker currently is. Used for diagnostics and timeout
/// attribution only; nothing branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StartingPhase {
    NotStarting,
    AllocatingProcess,
    RegisteringWithProcess,
    SentStartWorker,
    ScriptLoaded,
    ScriptEvaluated,
    ThreadStarted,
}

impl StartingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarting => "not_starting",
            Self::AllocatingProcess => "allocating_process",
            Self::RegisteringWithProcess => "registering_with_process",
            Self::SentStartWorker => "sent_start_worker",
            Self::ScriptLoaded => "script_loaded",
            Self::ScriptEvaluated => "script_evaluated",
            Self::ThreadStarted => "thread_started",
        }
    }
}

/// What a dispatched event does to the worker when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimeoutBehavior {
    KillOnTimeout,
    ContinueOnTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn version_status_moves_forward_only() {
        assert!(VersionStatus::New.can_transition_to(VersionStatus::Installing));
        assert!(VersionStatus::Installed.can_transition_to(VersionStatus::Redundant));
        assert!(!VersionStatus::Activated.can_transition_to(VersionStatus::Installing));
        assert!(!VersionStatus::Redundant.can_transition_to(VersionStatus::Activated));
    }

    #[test]
    fn version_status_rolls_back_only_from_installing() {
        assert!(VersionStatus::Installing.can_transition_to(VersionStatus::New));
        assert!(!VersionStatus::Installed.can_transition_to(VersionStatus::New));
    }

    #[test]
    fn ids_display_as_numbers() {
        assert_eq!(RegistrationId(42).to_string(), "42");
        assert_eq!(ProcessId(-1).to_string(), "-1");
    }
}
