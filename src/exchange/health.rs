//! Liveness and health reporting for the dispatch loop.
//!
//! A contained dispatch error must not kill the loop, but it must not be
//! invisible either: an operator needs to tell a healthy loop apart from
//! one that is alive yet quietly dropping requests. `LoopHealth` keeps
//! cheap atomic counters the loop bumps as it works, and snapshots them
//! into a serializable report.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Coarse state of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Loop thread running, no contained errors so far.
    Running,
    /// Loop thread running but at least one dispatch error was contained.
    Degraded,
    /// Loop thread not running (never started, or exited).
    Stopped,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopHealthReport {
    pub state: LoopState,
    pub connections_registered: usize,
    pub iterations: u64,
    pub requests_served: u64,
    pub resolver_failures: u64,
    pub connections_closed: u64,
    pub dispatch_errors: u64,
    pub last_error: Option<String>,
}

/// Counters shared between the dispatch loop and observers.
#[derive(Default)]
pub struct LoopHealth {
    iterations: AtomicU64,
    requests_served: AtomicU64,
    resolver_failures: AtomicU64,
    connections_closed: AtomicU64,
    dispatch_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl LoopHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolver_failure(&self) {
        self.resolver_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_error(&self, detail: &str) {
        self.dispatch_errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(detail.to_string());
    }

    pub fn dispatch_errors(&self) -> u64 {
        self.dispatch_errors.load(Ordering::Relaxed)
    }

    /// Snapshot the counters into a report.
    pub fn report(&self, loop_alive: bool, connections_registered: usize) -> LoopHealthReport {
        let dispatch_errors = self.dispatch_errors.load(Ordering::Relaxed);
        let state = if !loop_alive {
            LoopState::Stopped
        } else if dispatch_errors > 0 {
            LoopState::Degraded
        } else {
            LoopState::Running
        };

        LoopHealthReport {
            state,
            connections_registered,
            iterations: self.iterations.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            resolver_failures: self.resolver_failures.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            dispatch_errors,
            last_error: self.last_error.lock().clone(),
        }
    }
}
