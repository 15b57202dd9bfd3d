use std::collections::{BTreeSet, HashMap, VecDeque};

use tether_core::{
    ClientId, JobId, RegistrationId, RequestId, ServiceWorkerError, ServiceWorkerResult,
    TimeoutBehavior, VersionId, VersionStatus, WorkerId,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Duration, Instant},
};

use crate::{
    context::Event,
    host::WorkerEvent,
    job_coordinator::JobInput,
    request_table::{RequestKind, RequestTable},
    script_cache::ScriptCache,
};

pub type EventSink = mpsc::UnboundedSender<Event>;

/// Someone waiting for a start, stop or dispatched event to finish.
pub enum Waiter {
    Job {
        job_id: JobId,
        wake: fn(ServiceWorkerResult<()>) -> JobInput,
    },
    Activation {
        registration_id: RegistrationId,
        version_id: VersionId,
        job_id: Option<JobId>,
    },
    Caller(oneshot::Sender<ServiceWorkerResult<()>>),
    Detached,
}

impl Waiter {
    /// Results for the coordination task are queued as events, never handled inline.
    pub fn resolve(self, sink: &EventSink, result: ServiceWorkerResult<()>) {
        match self {
            Waiter::Job { job_id, wake } => {
                let _ = sink.send(Event::Job {
                    job_id,
                    input: wake(result),
                });
            }
            Waiter::Activation {
                registration_id,
                version_id,
                job_id,
            } => {
                let _ = sink.send(Event::ActivateFinished {
                    registration_id,
                    version_id,
                    job_id,
                    result,
                });
            }
            Waiter::Caller(reply) => {
                let _ = reply.send(result);
            }
            Waiter::Detached => {}
        }
    }
}

pub fn request_kind(event: &WorkerEvent) -> RequestKind {
    match event {
        WorkerEvent::Install => RequestKind::Install,
        WorkerEvent::Activate => RequestKind::Activate,
        WorkerEvent::Fetch { .. } => RequestKind::Fetch,
        WorkerEvent::Message { .. } => RequestKind::Message,
    }
}

/// An event waiting for the worker to finish starting.
pub struct QueuedEvent {
    pub event: WorkerEvent,
    pub behavior: TimeoutBehavior,
    pub waiter: Waiter,
}

pub struct Version {
    pub id: VersionId,
    pub registration_id: RegistrationId,
    pub scope: String,
    pub script_url: String,
    status: VersionStatus,
    pub worker_id: WorkerId,
    pub script_cache: ScriptCache,
    pub has_fetch_handler: bool,
    controllees: BTreeSet<ClientId>,
    pub requests: RequestTable,
    pub event_waiters: HashMap<RequestId, Waiter>,
    pub start_waiters: Vec<Waiter>,
    pub stop_waiters: Vec<Waiter>,
    pub queued_events: VecDeque<QueuedEvent>,
    pub start_deadline: Option<Instant>,
    /// When a STOPPING worker is given up on and detached.
    pub stop_deadline: Option<Instant>,
    pub last_ping: Option<Instant>,
    pub ping_outstanding_since: Option<Instant>,
    pub last_activity: Instant,
}

impl Version {
    pub fn new(
        id: VersionId,
        registration_id: RegistrationId,
        scope: &str,
        script_url: &str,
        status: VersionStatus,
        worker_id: WorkerId,
        now: Instant,
    ) -> Self {
        Self {
            id,
            registration_id,
            scope: scope.to_string(),
            script_url: script_url.to_string(),
            status,
            worker_id,
            script_cache: ScriptCache::new(),
            has_fetch_handler: false,
            controllees: BTreeSet::new(),
            requests: RequestTable::new(),
            event_waiters: HashMap::new(),
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            queued_events: VecDeque::new(),
            start_deadline: None,
            stop_deadline: None,
            last_ping: None,
            ping_outstanding_since: None,
            last_activity: now,
        }
    }

    pub fn status(&self) -> VersionStatus {
        self.status
    }

    /// Applies a legal status change; anything else is logged and ignored.
    pub fn set_status(&mut self, next: VersionStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                version_id = %self.id,
                from = self.status.as_str(),
                to = next.as_str(),
                "ignoring illegal version status change"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn controllee_count(&self) -> usize {
        self.controllees.len()
    }

    pub fn has_controllees(&self) -> bool {
        !self.controllees.is_empty()
    }

    /// True when this was the first controllee.
    pub fn add_controllee(&mut self, client: ClientId, now: Instant) -> bool {
        self.last_activity = now;
        self.controllees.insert(client) && self.controllees.len() == 1
    }

    /// True when this removed the last controllee.
    pub fn remove_controllee(&mut self, client: ClientId, now: Instant) -> bool {
        self.last_activity = now;
        self.controllees.remove(&client) && self.controllees.is_empty()
    }

    pub fn clear_controllees(&mut self) {
        self.controllees.clear();
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.requests.is_empty()
            && self.controllees.is_empty()
            && self.queued_events.is_empty()
            && now.saturating_duration_since(self.last_activity) >= idle_timeout
    }

    pub fn fail_requests(&mut self, sink: &EventSink, err: &ServiceWorkerError) {
        for request_id in self.requests.drain() {
            if let Some(waiter) = self.event_waiters.remove(&request_id) {
                waiter.resolve(sink, Err(err.clone()));
            }
        }
        for (_, waiter) in self.event_waiters.drain() {
            waiter.resolve(sink, Err(err.clone()));
        }
    }

    pub fn fail_queued_events(&mut self, sink: &EventSink, err: &ServiceWorkerError) {
        for queued in self.queued_events.drain(..) {
            queued.waiter.resolve(sink, Err(err.clone()));
        }
    }

    pub fn resolve_start_waiters(&mut self, sink: &EventSink, result: ServiceWorkerResult<()>) {
        for waiter in self.start_waiters.drain(..) {
            waiter.resolve(sink, result.clone());
        }
    }

    pub fn resolve_stop_waiters(&mut self, sink: &EventSink) {
        for waiter in self.stop_waiters.drain(..) {
            waiter.resolve(sink, Ok(()));
        }
    }

    pub fn finish_request(&mut self, request_id: RequestId) -> Option<(RequestKind, Waiter)> {
        let kind = self.requests.finish_request(request_id)?;
        let waiter = self.event_waiters.remove(&request_id)?;
        Some((kind, waiter))
    }

    pub fn clear_ping(&mut self) {
        self.ping_outstanding_since = None;
        self.last_ping = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(status: VersionStatus) -> Version {
        Version::new(
            VersionId(1),
            RegistrationId(1),
            "https://a.test/",
            "https://a.test/sw.js",
            status,
            WorkerId(0),
            Instant::now(),
        )
    }

    #[test]
    fn first_and_last_controllee_are_reported() {
        let now = Instant::now();
        let mut v = version(VersionStatus::Activated);
        assert!(v.add_controllee(ClientId(1), now));
        assert!(!v.add_controllee(ClientId(2), now));
        assert!(!v.add_controllee(ClientId(2), now));
        assert!(!v.remove_controllee(ClientId(1), now));
        assert!(v.remove_controllee(ClientId(2), now));
        assert!(!v.remove_controllee(ClientId(2), now));
    }

    #[test]
    fn status_changes_are_checked() {
        let mut v = version(VersionStatus::New);
        assert!(v.set_status(VersionStatus::Installing));
        assert!(v.set_status(VersionStatus::Installed));
        assert!(!v.set_status(VersionStatus::Installing));
        assert_eq!(v.status(), VersionStatus::Installed);
        assert!(v.set_status(VersionStatus::Redundant));
        assert!(!v.set_status(VersionStatus::Activated));
    }

    #[test]
    fn idle_needs_no_requests_and_no_controllees() {
        let start = Instant::now();
        let mut v = version(VersionStatus::Activated);
        let later = start + Duration::from_secs(60);
        assert!(v.is_idle(later, Duration::from_secs(30)));

        v.add_controllee(ClientId(1), start);
        assert!(!v.is_idle(later, Duration::from_secs(30)));
        v.remove_controllee(ClientId(1), start);

        v.requests
            .start_request(RequestKind::Fetch, TimeoutBehavior::ContinueOnTimeout, later);
        assert!(!v.is_idle(later, Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn failing_requests_resolves_callers() {
        let (sink, _events) = mpsc::unbounded_channel();
        let mut v = version(VersionStatus::Activated);
        let (tx, rx) = oneshot::channel();
        let id = v.requests.start_request(
            RequestKind::Fetch,
            TimeoutBehavior::ContinueOnTimeout,
            Instant::now() + Duration::from_secs(5),
        );
        v.event_waiters.insert(id, Waiter::Caller(tx));

        v.fail_requests(&sink, &ServiceWorkerError::IpcFailed);
        assert_eq!(rx.await.unwrap(), Err(ServiceWorkerError::IpcFailed));
        assert!(v.requests.is_empty());
    }
}
