use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
};

use tether_core::{RequestId, TimeoutBehavior};
use tokio::time::Instant;

/// What a dispatched request was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RequestKind {
    Install,
    Activate,
    Fetch,
    Message,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch => "fetch",
            Self::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeoutEntry {
    deadline: Instant,
    request_id: RequestId,
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    kind: RequestKind,
    deadline: Instant,
    behavior: TimeoutBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredRequest {
    pub request_id: RequestId,
    pub kind: RequestKind,
    pub behavior: TimeoutBehavior,
}

/// In-flight requests of one version, with a min-heap of deadlines.
///
/// Finished requests leave stale heap entries behind; `tick` skips them.
#[derive(Debug, Default)]
pub struct RequestTable {
    next_id: u64,
    in_flight: HashMap<RequestId, InFlight>,
    deadlines: BinaryHeap<Reverse<TimeoutEntry>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_request(
        &mut self,
        kind: RequestKind,
        behavior: TimeoutBehavior,
        deadline: Instant,
    ) -> RequestId {
        let request_id = RequestId(self.next_id);
        self.next_id += 1;
        self.in_flight.insert(
            request_id,
            InFlight {
                kind,
                deadline,
                behavior,
            },
        );
        self.deadlines.push(Reverse(TimeoutEntry {
            deadline,
            request_id,
        }));
        request_id
    }

    /// Returns the kind of a request that was still in flight.
    pub fn finish_request(&mut self, request_id: RequestId) -> Option<RequestKind> {
        self.in_flight.remove(&request_id).map(|r| r.kind)
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Removes and returns every request whose deadline is at or before `now`,
    /// earliest first.
    pub fn tick(&mut self, now: Instant) -> Vec<ExpiredRequest> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.deadlines.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.deadlines.pop() else {
                break;
            };
            match self.in_flight.get(&entry.request_id) {
                Some(req) if req.deadline == entry.deadline => {
                    expired.push(ExpiredRequest {
                        request_id: entry.request_id,
                        kind: req.kind,
                        behavior: req.behavior,
                    });
                    self.in_flight.remove(&entry.request_id);
                }
                _ => continue,
            }
        }
        expired
    }

    /// Drops every request, returning their ids in id order.
    pub fn drain(&mut self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.in_flight.drain().map(|(id, _)| id).collect();
        ids.sort();
        self.deadlines.clear();
        ids
    }
}
