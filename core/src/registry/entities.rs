// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Entity types owned by the [`super::Registry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Client id, assigned sequentially by the registry.
pub type ClientId = i64;

/// 1-based thread index within a client.
pub type ThreadIndex = u32;

/// Work unit id, assigned sequentially by the registry.
pub type WorkUnitId = u64;

/// Coarse client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Registered and not currently known to be stuck or failed.
    Ready,
    /// At least one thread is actively running a work unit.
    Running,
    /// At least one thread's work unit has exceeded the liveness timeout.
    Stuck,
    /// The client reported a fatal error.
    Failed,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Ready => "ready",
            ClientStatus::Running => "running",
            ClientStatus::Stuck => "stuck",
            ClientStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-thread status within a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Idle, no work unit currently assigned.
    Ready,
    /// A `Download` call is in flight (transient; observed in snapshots only).
    Downloading,
    /// Executing a work unit.
    Running,
    /// An `Upload` call is in flight.
    Uploading,
    /// The last work unit this thread touched ended in an error report.
    Failed,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadStatus::Ready => "ready",
            ThreadStatus::Downloading => "downloading",
            ThreadStatus::Running => "running",
            ThreadStatus::Uploading => "uploading",
            ThreadStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    /// Freshly (re)assigned, about to be reported as running.
    New,
    /// Dispatched to a client/thread and presumed progressing.
    Running,
    /// Reloaded by the worker driver; outcome not yet known.
    Unknown,
    /// Liveness timeout elapsed with no progress.
    Stuck,
    /// The client reported a failure for this unit.
    Failed,
    /// Result delivered successfully; terminal.
    Completed,
    /// Exhausted its attempt cap; terminal, never reassigned.
    Dead,
}

impl WorkUnitStatus {
    /// Whether this status can still transition (is not `completed`/`dead`).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkUnitStatus::Completed | WorkUnitStatus::Dead)
    }
}

impl fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkUnitStatus::New => "new",
            WorkUnitStatus::Running => "running",
            WorkUnitStatus::Unknown => "unknown",
            WorkUnitStatus::Stuck => "stuck",
            WorkUnitStatus::Failed => "failed",
            WorkUnitStatus::Completed => "completed",
            WorkUnitStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A single worker thread slot, as tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// 1-based index within the owning client.
    pub index: ThreadIndex,
    /// Current coarse status.
    pub status: ThreadStatus,
}

impl Thread {
    /// Create a new idle thread record.
    pub fn new(index: ThreadIndex) -> Self {
        Self {
            index,
            status: ThreadStatus::Ready,
        }
    }
}

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Assigned client id.
    pub id: ClientId,
    /// Declared thread count, fixed at registration.
    pub declared_threads: u32,
    /// Ordered thread records, `threads[i].index == i + 1`.
    pub threads: Vec<Thread>,
    /// Coarse client status.
    pub status: ClientStatus,
}

impl Client {
    /// Register a new client with `declared_threads` idle threads.
    pub fn new(id: ClientId, declared_threads: u32) -> Self {
        let threads = (1..=declared_threads).map(Thread::new).collect();
        Self {
            id,
            declared_threads,
            threads,
            status: ClientStatus::Ready,
        }
    }

    /// Look up a thread by its 1-based index.
    pub fn thread(&self, index: ThreadIndex) -> Option<&Thread> {
        self.threads.iter().find(|t| t.index == index)
    }

    /// Look up a thread by its 1-based index, mutably.
    pub fn thread_mut(&mut self, index: ThreadIndex) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.index == index)
    }

    /// Recompute the client's coarse status from its threads and the
    /// work units assigned to it.
    ///
    /// `any_stuck`/`any_running` are derived by the registry from the
    /// work-unit table, since a thread's own status alone cannot
    /// distinguish "running" from "stuck" (both threads stay
    /// `running` on the wire; the distinction lives on the work unit).
    pub fn recompute_status(&mut self, any_stuck: bool, any_running: bool) {
        if self.status == ClientStatus::Failed {
            return;
        }
        self.status = if any_stuck {
            ClientStatus::Stuck
        } else if any_running {
            ClientStatus::Running
        } else {
            ClientStatus::Ready
        };
    }
}

/// A unit of work dispatched to exactly one (client, thread) at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Monotonically assigned id.
    pub id: WorkUnitId,
    /// Opaque payload handed to the worker.
    pub payload: Vec<u8>,
    /// Client currently (or most recently) holding this unit.
    pub assigned_client: Option<ClientId>,
    /// Thread currently (or most recently) holding this unit.
    pub assigned_thread: Option<ThreadIndex>,
    /// Current lifecycle status.
    pub status: WorkUnitStatus,
    /// Number of times this unit has been dispatched.
    pub attempts: u32,
    /// Last time a progress-signaling transition touched this unit.
    pub last_activity: DateTime<Utc>,
    /// Result bytes, populated once `status == completed`.
    pub result: Vec<u8>,
}

impl WorkUnit {
    /// Create a freshly allocated unit, dispatched once.
    pub fn new(
        id: WorkUnitId,
        payload: Vec<u8>,
        client: ClientId,
        thread: ThreadIndex,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload,
            assigned_client: Some(client),
            assigned_thread: Some(thread),
            status: WorkUnitStatus::Running,
            attempts: 1,
            last_activity: now,
            result: Vec::new(),
        }
    }

    /// Whether this unit is currently held by (client, thread) in a
    /// non-terminal status.
    pub fn is_assigned_to(&self, client: ClientId, thread: ThreadIndex) -> bool {
        !self.status.is_terminal()
            && self.assigned_client == Some(client)
            && self.assigned_thread == Some(thread)
    }
}
