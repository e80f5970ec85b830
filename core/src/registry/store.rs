// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The single-lock registry: client table, thread table, work-unit
//! table, and the transitions between them.

use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::entities::{
    Client, ClientId, ClientStatus, Thread, ThreadIndex, ThreadStatus, WorkUnit, WorkUnitId,
    WorkUnitStatus,
};

/// Coarse, derived coordinator-wide status, as served on the snapshot
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    /// No client has registered yet.
    Ready,
    /// At least one work unit is running or stuck.
    Running,
    /// Nothing is in flight and at least one unit is failed or dead.
    Failed,
    /// The finalizer has committed; no further work will be dispatched.
    Finished,
}

/// Result of a dispatch (`Download`) call.
pub enum Dispatch {
    /// A payload is ready to send to the worker.
    Payload(Vec<u8>),
    /// The workload provider has no more units; the caller should
    /// begin finalization.
    Drained,
}

/// Result of a `ReloadWorkUnit` call.
pub enum Reload {
    /// The unit's payload, echoed back after bumping `attempts`.
    Payload(Vec<u8>),
    /// The unit is dead or already at its attempt cap.
    Dead,
}

struct Inner {
    clients: Vec<Client>,
    work_units: Vec<WorkUnit>,
    next_work_unit_id: WorkUnitId,
    finalized: bool,
}

/// Owns every client, thread, and work-unit record behind one lock.
///
/// All cross-entity invariants (at most one non-terminal unit per
/// (client, thread), monotonic attempts, the dead-iff-exhausted rule)
/// are enforced by always mutating through this type rather than the
/// entities directly.
pub struct Registry {
    inner: Mutex<Inner>,
    /// Attempts allowed before a unit is permanently retired.
    pub attempt_cap: u32,
    /// Liveness timeout: no progress within this window marks a unit stuck.
    pub timeout: Duration,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(attempt_cap: u32, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                clients: Vec::new(),
                work_units: Vec::new(),
                next_work_unit_id: 1,
                finalized: false,
            }),
            attempt_cap,
            timeout,
        }
    }

    /// Register a new client, assigning it the next sequential id.
    ///
    /// The registry has no "connecting" status distinct from `ready`;
    /// a client is `ready` the instant it is registered, and the
    /// subsequent `Ready` RPC is an idempotent confirmation logged for
    /// visibility rather than a further status transition.
    pub fn register_client(&self, declared_threads: u32) -> ClientId {
        let mut inner = self.inner.lock();
        let id = inner.clients.len() as ClientId + 1;
        inner.clients.push(Client::new(id, declared_threads));
        info!(client = id, threads = declared_threads, "client registered");
        id
    }

    /// Confirm a client as booted and ready.
    pub fn mark_ready(&self, client: ClientId) -> RegistryResult<()> {
        let mut inner = self.inner.lock();
        let c = find_client_mut(&mut inner.clients, client)?;
        c.recompute_status(false, false);
        debug!(client, "client confirmed ready");
        Ok(())
    }

    /// Record a client-level fatal error report.
    pub fn mark_failed(&self, client: ClientId) -> RegistryResult<()> {
        let mut inner = self.inner.lock();
        let c = find_client_mut(&mut inner.clients, client)?;
        c.status = ClientStatus::Failed;
        warn!(client, "client reported failure");
        Ok(())
    }

    /// Dispatch a work unit to (client, thread): a `Download` call.
    ///
    /// Reuses a retryable stuck/failed unit if one exists (global,
    /// insertion-ordered scan), otherwise asks `allocate` for a fresh
    /// payload. `allocate` is invoked without holding the lock.
    pub fn dispatch<F>(
        &self,
        client: ClientId,
        thread: ThreadIndex,
        allocate: F,
    ) -> RegistryResult<Dispatch>
    where
        F: FnOnce(ClientId) -> Option<Vec<u8>>,
    {
        {
            let mut inner = self.inner.lock();
            ensure_thread(&inner.clients, client, thread)?;
            if let Some(idx) = find_reusable(&mut inner.work_units, self.attempt_cap) {
                let now = Utc::now();
                let wu = &mut inner.work_units[idx];
                wu.attempts += 1;
                wu.assigned_client = Some(client);
                wu.assigned_thread = Some(thread);
                wu.status = WorkUnitStatus::Running;
                wu.last_activity = now;
                let payload = wu.payload.clone();
                set_thread_status(&mut inner.clients, client, thread, ThreadStatus::Running);
                recompute_client(&mut inner.clients, &inner.work_units, client);
                info!(client, thread, wu = wu.id, attempts = wu.attempts, "reused work unit");
                return Ok(Dispatch::Payload(payload));
            }
        }

        let Some(payload) = allocate(client) else {
            return Ok(Dispatch::Drained);
        };

        let mut inner = self.inner.lock();
        ensure_thread(&inner.clients, client, thread)?;
        let id = inner.next_work_unit_id;
        inner.next_work_unit_id += 1;
        let now = Utc::now();
        let wu = WorkUnit::new(id, payload.clone(), client, thread, now);
        inner.work_units.push(wu);
        set_thread_status(&mut inner.clients, client, thread, ThreadStatus::Running);
        recompute_client(&mut inner.clients, &inner.work_units, client);
        info!(client, thread, wu = id, "allocated new work unit");
        Ok(Dispatch::Payload(payload))
    }

    /// Record a successful result: an `Upload` call with no error.
    pub fn complete(
        &self,
        client: ClientId,
        thread: ThreadIndex,
        result: Vec<u8>,
    ) -> RegistryResult<()> {
        let mut inner = self.inner.lock();
        ensure_thread(&inner.clients, client, thread)?;
        let idx = find_assigned(&inner.work_units, client, thread)
            .ok_or(RegistryError::NoSuchWorkUnit { client, thread })?;
        let now = Utc::now();
        let wu = &mut inner.work_units[idx];
        wu.status = WorkUnitStatus::Completed;
        wu.result = result;
        wu.last_activity = now;
        let wu_id = wu.id;
        set_thread_status(&mut inner.clients, client, thread, ThreadStatus::Ready);
        recompute_client(&mut inner.clients, &inner.work_units, client);
        info!(client, thread, wu = wu_id, "work unit completed");
        Ok(())
    }

    /// Record a failed result: an `Upload` call carrying an error.
    pub fn fail(&self, client: ClientId, thread: ThreadIndex) -> RegistryResult<()> {
        let mut inner = self.inner.lock();
        ensure_thread(&inner.clients, client, thread)?;
        let idx = find_assigned(&inner.work_units, client, thread)
            .ok_or(RegistryError::NoSuchWorkUnit { client, thread })?;
        let wu = &mut inner.work_units[idx];
        wu.status = WorkUnitStatus::Failed;
        let wu_id = wu.id;
        set_thread_status(&mut inner.clients, client, thread, ThreadStatus::Failed);
        recompute_client(&mut inner.clients, &inner.work_units, client);
        warn!(client, thread, wu = wu_id, "work unit reported failed");
        Ok(())
    }

    /// Reload a stalled unit: a worker driver recovery call.
    pub fn reload(&self, client: ClientId, thread: ThreadIndex) -> RegistryResult<Reload> {
        let mut inner = self.inner.lock();
        ensure_thread(&inner.clients, client, thread)?;
        let idx = find_assigned(&inner.work_units, client, thread)
            .ok_or(RegistryError::NoSuchWorkUnit { client, thread })?;
        let wu = &mut inner.work_units[idx];
        if wu.status == WorkUnitStatus::Dead || wu.attempts >= self.attempt_cap {
            return Ok(Reload::Dead);
        }
        wu.attempts += 1;
        wu.status = WorkUnitStatus::Unknown;
        wu.last_activity = Utc::now();
        let payload = wu.payload.clone();
        debug!(client, thread, wu = wu.id, attempts = wu.attempts, "work unit reloaded");
        Ok(Reload::Payload(payload))
    }

    /// Scan every running/stuck unit for liveness timeout.
    pub fn scan_liveness(&self) {
        let mut inner = self.inner.lock();
        let timeout = self.timeout;
        let now = Utc::now();
        let mut touched: Vec<ClientId> = Vec::new();
        for wu in inner.work_units.iter_mut() {
            if matches!(wu.status, WorkUnitStatus::Running | WorkUnitStatus::Stuck) {
                let elapsed = now.signed_duration_since(wu.last_activity);
                if elapsed
                    > chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero())
                {
                    if wu.status != WorkUnitStatus::Stuck {
                        warn!(wu = wu.id, "work unit detected stuck");
                    }
                    wu.status = WorkUnitStatus::Stuck;
                    if let Some(c) = wu.assigned_client {
                        touched.push(c);
                    }
                }
            }
        }
        for client in touched {
            recompute_client(&mut inner.clients, &inner.work_units, client);
        }
    }

    /// Derive the coordinator-wide coarse status.
    pub fn coordinator_status(&self) -> CoordinatorStatus {
        let inner = self.inner.lock();
        if inner.finalized {
            return CoordinatorStatus::Finished;
        }
        if inner.clients.is_empty() {
            return CoordinatorStatus::Ready;
        }
        let any_active = inner
            .work_units
            .iter()
            .any(|w| matches!(w.status, WorkUnitStatus::Running | WorkUnitStatus::Stuck));
        if any_active {
            return CoordinatorStatus::Running;
        }
        let any_failed = inner
            .work_units
            .iter()
            .any(|w| matches!(w.status, WorkUnitStatus::Failed | WorkUnitStatus::Dead));
        if any_failed {
            CoordinatorStatus::Failed
        } else {
            CoordinatorStatus::Ready
        }
    }

    /// Mark the registry finalized; no further work will be dispatched.
    pub fn mark_finalized(&self) {
        self.inner.lock().finalized = true;
    }

    /// Non-`completed` units, for the shutdown dump.
    pub fn unfinished_units(&self) -> Vec<WorkUnit> {
        self.inner
            .lock()
            .work_units
            .iter()
            .filter(|w| w.status != WorkUnitStatus::Completed)
            .cloned()
            .collect()
    }

    /// Whether every known work unit has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.inner
            .lock()
            .work_units
            .iter()
            .all(|w| w.status.is_terminal())
    }

    /// Snapshot of every client and work unit, for the dashboard.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock();
        RegistrySnapshot {
            clients: inner.clients.clone(),
            work_units: inner.work_units.clone(),
        }
    }
}

/// Plain-data snapshot of registry contents.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// All registered clients.
    pub clients: Vec<Client>,
    /// All known work units.
    pub work_units: Vec<WorkUnit>,
}

fn find_client_mut(clients: &mut [Client], id: ClientId) -> RegistryResult<&mut Client> {
    clients
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or(RegistryError::ClientNotFound(id))
}

fn ensure_thread(clients: &[Client], client: ClientId, thread: ThreadIndex) -> RegistryResult<()> {
    let c = clients
        .iter()
        .find(|c| c.id == client)
        .ok_or(RegistryError::ClientNotFound(client))?;
    if thread == 0 || c.thread(thread).is_none() {
        return Err(RegistryError::ThreadNotFound { client, thread });
    }
    Ok(())
}

fn set_thread_status(
    clients: &mut [Client],
    client: ClientId,
    thread: ThreadIndex,
    status: ThreadStatus,
) {
    if let Some(c) = clients.iter_mut().find(|c| c.id == client) {
        if let Some(t) = c.thread_mut(thread) {
            t.status = status;
        }
    }
}

fn recompute_client(clients: &mut [Client], work_units: &[WorkUnit], client: ClientId) {
    let any_stuck = work_units
        .iter()
        .any(|w| w.assigned_client == Some(client) && w.status == WorkUnitStatus::Stuck);
    let any_running = work_units
        .iter()
        .any(|w| w.assigned_client == Some(client) && w.status == WorkUnitStatus::Running);
    if let Some(c) = clients.iter_mut().find(|c| c.id == client) {
        c.recompute_status(any_stuck, any_running);
    }
}

/// Locate the work unit currently held by (client, thread) in a
/// non-terminal status; at most one can exist per the registry's own
/// invariant.
fn find_assigned(work_units: &[WorkUnit], client: ClientId, thread: ThreadIndex) -> Option<usize> {
    work_units
        .iter()
        .position(|w| w.is_assigned_to(client, thread))
}

/// Find the oldest retryable stuck/failed unit, demoting any unit that
/// has exhausted its attempt cap to `dead` along the way.
///
/// The spec's distillation only calls out `unknown` units as being
/// lazily demoted to `dead` during this scan; the same lazy-discovery
/// principle is generalized here to `stuck`/`failed` units, since
/// otherwise a unit that exhausts its cap while failed would sit
/// forever in a non-dead terminal-in-practice state, contradicting the
/// "dead iff attempts have been exhausted" invariant. Demotion happens
/// the next time the scan visits the unit, not the instant the cap is
/// reached.
fn find_reusable(work_units: &mut [WorkUnit], attempt_cap: u32) -> Option<usize> {
    for (idx, wu) in work_units.iter_mut().enumerate() {
        match wu.status {
            WorkUnitStatus::Unknown => {
                if wu.attempts >= attempt_cap {
                    wu.status = WorkUnitStatus::Dead;
                }
            }
            WorkUnitStatus::Stuck | WorkUnitStatus::Failed => {
                if wu.attempts >= attempt_cap {
                    wu.status = WorkUnitStatus::Dead;
                } else {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn registry() -> Registry {
        Registry::new(2, StdDuration::from_secs(5))
    }

    #[test]
    fn register_client_assigns_sequential_ids() {
        let r = registry();
        assert_eq!(r.register_client(2), 1);
        assert_eq!(r.register_client(1), 2);
    }

    #[test]
    fn dispatch_allocates_then_reuses_on_failure() {
        let r = registry();
        let client = r.register_client(1);

        let Dispatch::Payload(p1) = r.dispatch(client, 1, |_| Some(b"p1".to_vec())).unwrap()
        else {
            panic!("expected payload");
        };
        assert_eq!(p1, b"p1");

        r.fail(client, 1).unwrap();

        let Dispatch::Payload(p2) = r.dispatch(client, 1, |_| Some(b"p2".to_vec())).unwrap()
        else {
            panic!("expected payload");
        };
        assert_eq!(p2, b"p1", "failed unit should be reused before allocating fresh work");
    }

    #[test]
    fn exhausted_unit_becomes_dead_and_is_never_reused() {
        let r = registry();
        let client = r.register_client(1);

        r.dispatch(client, 1, |_| Some(b"p1".to_vec())).unwrap();
        r.fail(client, 1).unwrap();
        // second dispatch: reuse p1, attempts -> 2
        r.dispatch(client, 1, |_| panic!("should reuse, not allocate"))
            .unwrap();
        r.fail(client, 1).unwrap();

        // third dispatch: attempts(2) >= cap(2), not eligible; fresh unit allocated
        let Dispatch::Payload(p3) = r.dispatch(client, 1, |_| Some(b"p2".to_vec())).unwrap()
        else {
            panic!("expected payload");
        };
        assert_eq!(p3, b"p2");

        let snap = r.snapshot();
        let dead = snap
            .work_units
            .iter()
            .filter(|w| w.status == WorkUnitStatus::Dead)
            .count();
        assert_eq!(dead, 1);
    }

    #[test]
    fn complete_requires_an_assigned_unit() {
        let r = registry();
        let client = r.register_client(1);
        let err = r.complete(client, 1, vec![]).unwrap_err();
        assert_eq!(err, RegistryError::NoSuchWorkUnit { client, thread: 1 });
    }

    #[test]
    fn reload_increments_attempts_and_is_idempotent_across_calls() {
        // attempt_cap must allow both reloads to succeed (1 from dispatch
        // + 2 reloads = 3 attempts) rather than the shared `registry()`
        // helper's cap of 2, which would turn the second reload into a
        // `Reload::Dead` and leave attempts at 2.
        let r = Registry::new(5, StdDuration::from_secs(5));
        let client = r.register_client(1);
        r.dispatch(client, 1, |_| Some(b"p".to_vec())).unwrap();

        r.reload(client, 1).unwrap();
        r.reload(client, 1).unwrap();

        let snap = r.snapshot();
        let wu = snap.work_units.first().unwrap();
        assert_eq!(wu.attempts, 3); // 1 from dispatch + 2 reloads
    }

    #[test]
    fn reload_refuses_once_attempts_reach_cap() {
        let r = registry();
        let client = r.register_client(1);
        r.dispatch(client, 1, |_| Some(b"p".to_vec())).unwrap();
        r.reload(client, 1).unwrap(); // attempts -> 2 == cap

        let outcome = r.reload(client, 1).unwrap();
        assert!(matches!(outcome, Reload::Dead));
    }

    #[test]
    fn scan_liveness_marks_stuck_after_timeout() {
        let r = Registry::new(5, StdDuration::from_secs(0));
        let client = r.register_client(1);
        r.dispatch(client, 1, |_| Some(b"p".to_vec())).unwrap();
        r.scan_liveness();
        let snap = r.snapshot();
        assert_eq!(snap.work_units[0].status, WorkUnitStatus::Stuck);
    }

    #[test]
    fn coordinator_status_tracks_activity() {
        let r = registry();
        assert!(matches!(r.coordinator_status(), CoordinatorStatus::Ready));
        let client = r.register_client(1);
        r.dispatch(client, 1, |_| Some(b"p".to_vec())).unwrap();
        assert!(matches!(r.coordinator_status(), CoordinatorStatus::Running));
        r.fail(client, 1).unwrap();
        assert!(matches!(r.coordinator_status(), CoordinatorStatus::Failed));
        r.mark_finalized();
        assert!(matches!(r.coordinator_status(), CoordinatorStatus::Finished));
    }
}
