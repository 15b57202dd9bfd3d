use std::sync::Arc;

use tether_core::{JobId, RegistrationId, RunningStatus, VersionId, VersionStatus};

/// Fire-and-forget notifications from the coordination task. Implementations
/// must not block; nothing they do feeds back into control flow.
pub trait ContextObserver: Send + Sync {
    fn on_registration_stored(&self, _registration_id: RegistrationId, _scope: &str) {}

    fn on_registration_deleted(&self, _registration_id: RegistrationId, _scope: &str) {}

    fn on_version_status_changed(&self, _version_id: VersionId, _status: VersionStatus) {}

    fn on_running_status_changed(&self, _version_id: VersionId, _status: RunningStatus) {}

    fn on_waiting_version_changed(
        &self,
        _registration_id: RegistrationId,
        _version_id: Option<VersionId>,
    ) {
    }

    fn on_job_phase_changed(&self, _job_id: JobId, _scope: &str, _phase: &'static str) {}

    fn on_error_reported(
        &self,
        _version_id: VersionId,
        _message: &str,
        _line: u32,
        _column: u32,
        _source_url: &str,
    ) {
    }

    fn on_console_message(&self, _version_id: VersionId, _level: &str, _message: &str) {}
}

/// Mirrors notifications into the log.
pub struct TracingObserver;

impl ContextObserver for TracingObserver {
    fn on_registration_stored(&self, registration_id: RegistrationId, scope: &str) {
        tracing::info!(%registration_id, scope, "registration stored");
    }

    fn on_registration_deleted(&self, registration_id: RegistrationId, scope: &str) {
        tracing::info!(%registration_id, scope, "registration deleted");
    }

    fn on_version_status_changed(&self, version_id: VersionId, status: VersionStatus) {
        tracing::debug!(%version_id, status = status.as_str(), "version status");
    }

    fn on_running_status_changed(&self, version_id: VersionId, status: RunningStatus) {
        tracing::debug!(%version_id, status = status.as_str(), "running status");
    }

    fn on_waiting_version_changed(&self, registration_id: RegistrationId, version_id: Option<VersionId>) {
        tracing::debug!(%registration_id, ?version_id, "waiting version");
    }

    fn on_job_phase_changed(&self, job_id: JobId, scope: &str, phase: &'static str) {
        tracing::debug!(%job_id, scope, phase, "job phase");
    }

    fn on_error_reported(
        &self,
        version_id: VersionId,
        message: &str,
        line: u32,
        column: u32,
        source_url: &str,
    ) {
        tracing::warn!(%version_id, line, column, source_url, "worker exception: {message}");
    }

    fn on_console_message(&self, version_id: VersionId, level: &str, message: &str) {
        tracing::info!(%version_id, level, "worker console: {message}");
    }
}

/// Fans a notification out to several observers.
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Vec<Arc<dyn ContextObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Arc<dyn ContextObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ContextObserver for ObserverList {
    fn on_registration_stored(&self, registration_id: RegistrationId, scope: &str) {
        for o in &self.observers {
            o.on_registration_stored(registration_id, scope);
        }
    }

    fn on_registration_deleted(&self, registration_id: RegistrationId, scope: &str) {
        for o in &self.observers {
            o.on_registration_deleted(registration_id, scope);
        }
    }

    fn on_version_status_changed(&self, version_id: VersionId, status: VersionStatus) {
        for o in &self.observers {
            o.on_version_status_changed(version_id, status);
        }
    }

    fn on_running_status_changed(&self, version_id: VersionId, status: RunningStatus) {
        for o in &self.observers {
            o.on_running_status_changed(version_id, status);
        }
    }

    fn on_waiting_version_changed(&self, registration_id: RegistrationId, version_id: Option<VersionId>) {
        for o in &self.observers {
            o.on_waiting_version_changed(registration_id, version_id);
        }
    }

    fn on_job_phase_changed(&self, job_id: JobId, scope: &str, phase: &'static str) {
        for o in &self.observers {
            o.on_job_phase_changed(job_id, scope, phase);
        }
    }

    fn on_error_reported(
        &self,
        version_id: VersionId,
        message: &str,
        line: u32,
        column: u32,
        source_url: &str,
    ) {
        for o in &self.observers {
            o.on_error_reported(version_id, message, line, column, source_url);
        }
    }

    fn on_console_message(&self, version_id: VersionId, level: &str, message: &str) {
        for o in &self.observers {
            o.on_console_message(version_id, level, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counting {
        stored: Mutex<Vec<RegistrationId>>,
    }

    impl ContextObserver for Counting {
        fn on_registration_stored(&self, registration_id: RegistrationId, _scope: &str) {
            self.stored.lock().unwrap().push(registration_id);
        }
    }

    #[test]
    fn list_fans_out_and_defaults_are_silent() {
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let mut list = ObserverList::new();
        list.add(a.clone());
        list.add(b.clone());
        list.add(Arc::new(TracingObserver));

        list.on_registration_stored(RegistrationId(3), "https://a.test/");
        list.on_registration_deleted(RegistrationId(3), "https://a.test/");

        assert_eq!(*a.stored.lock().unwrap(), vec![RegistrationId(3)]);
        assert_eq!(*b.stored.lock().unwrap(), vec![RegistrationId(3)]);
        assert_eq!(list.len(), 3);
    }
}
