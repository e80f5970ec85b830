// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker thread driver (spec §4.6): N concurrent slots, each
//! repeatedly fetching, running, and returning one work unit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::worker::executor::{ExecutionOutcome, TaskExecutor};

/// Per-slot coarse status, mirroring [`crate::registry::ThreadStatus`]
/// on the coordinator side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Idle, about to request a unit.
    Ready,
    /// `SendWorkUnit`/`ReloadWorkUnit` call in flight.
    Downloading,
    /// Executor running.
    Running,
    /// Upload call in flight.
    Uploading,
    /// Last attempt ended in an error report.
    Failed,
}

/// Observable state of one driver slot.
pub struct Slot {
    /// 1-based index, matching the coordinator's thread numbering.
    pub index: u32,
    status: RwLock<SlotStatus>,
    attempts: AtomicU32,
}

impl Slot {
    fn new(index: u32) -> Self {
        Self {
            index,
            status: RwLock::new(SlotStatus::Ready),
            attempts: AtomicU32::new(0),
        }
    }

    /// Current status, for dashboards/tests.
    pub fn status(&self) -> SlotStatus {
        *self.status.read()
    }

    fn set_status(&self, status: SlotStatus) {
        *self.status.write() = status;
    }
}

/// Outcome of a `ReloadWorkUnit` call, as seen by the driver.
pub enum ReloadOutcome {
    /// The unit's payload, echoed back.
    Payload(Vec<u8>),
    /// The unit is dead; the slot must request a fresh one instead.
    Dead,
}

/// The RPC surface the driver needs from the coordinator connection.
///
/// Kept as a trait so the slot loop can be exercised in tests without
/// a real socket; [`crate::worker::client::CoordinatorClient`] (cli
/// crate) provides the networked implementation.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// `SendWorkUnit`: request a unit for `thread`. `Ok(None)` means
    /// the workload provider has drained.
    async fn send_work_unit(&self, thread: u32) -> anyhow::Result<Option<Vec<u8>>>;

    /// `FetchWorkUnit` success path: upload `result`.
    async fn upload(&self, thread: u32, result: Vec<u8>) -> anyhow::Result<()>;

    /// `FetchWorkUnit` failure path: report `message`.
    async fn report_error(&self, thread: u32, message: String) -> anyhow::Result<()>;

    /// `ReloadWorkUnit`: re-request the unit currently held by `thread`.
    async fn reload_work_unit(&self, thread: u32) -> anyhow::Result<ReloadOutcome>;
}

/// Drives `slots.len()` concurrent slots against `rpc`, running each
/// fetched payload through `executor`.
pub struct Driver<R: WorkerRpc + 'static, E: TaskExecutor + 'static> {
    rpc: Arc<R>,
    executor: Arc<E>,
    slots: Vec<Arc<Slot>>,
    /// Retries via `ReloadWorkUnit` before falling back to a fresh unit
    /// (spec §4.6's `N_client_retries`).
    client_retries: u32,
}

impl<R: WorkerRpc + 'static, E: TaskExecutor + 'static> Driver<R, E> {
    /// Build a driver with `thread_count` slots.
    pub fn new(thread_count: u32, rpc: Arc<R>, executor: Arc<E>, client_retries: u32) -> Self {
        let slots = (1..=thread_count).map(|i| Arc::new(Slot::new(i))).collect();
        Self {
            rpc,
            executor,
            slots,
            client_retries,
        }
    }

    /// Current slot states, for diagnostics.
    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    /// Run every slot until `kill` fires, or until every slot observes
    /// the workload provider drained.
    pub async fn run(&self, kill: broadcast::Receiver<()>) {
        let mut handles = Vec::new();
        for slot in &self.slots {
            let slot = slot.clone();
            let rpc = self.rpc.clone();
            let executor = self.executor.clone();
            let retries = self.client_retries;
            let mut kill = kill.resubscribe();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = run_slot(slot, rpc, executor, retries) => {}
                    _ = kill.recv() => {}
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// The per-slot state machine (spec §4.6).
///
/// Calls to `rpc` for a given slot are always serialized: the loop
/// never issues a second `send_work_unit` before the prior upload or
/// error report has returned (spec §5, "Ordering guarantees").
async fn run_slot<R: WorkerRpc, E: TaskExecutor>(
    slot: Arc<Slot>,
    rpc: Arc<R>,
    executor: Arc<E>,
    client_retries: u32,
) {
    let thread = slot.index;
    let mut attempts: u32 = 0;
    let mut held_payload: Option<Vec<u8>> = None;

    loop {
        let payload = match held_payload.take() {
            Some(p) => p,
            None => {
                slot.set_status(SlotStatus::Downloading);
                slot.attempts.store(0, Ordering::Relaxed);
                attempts = 0;
                match rpc.send_work_unit(thread).await {
                    Ok(Some(p)) => p,
                    Ok(None) => {
                        info!(thread, "workload drained; slot idling");
                        return;
                    }
                    Err(e) => {
                        warn!(thread, error = %e, "send_work_unit failed; retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }
        };

        slot.set_status(SlotStatus::Running);
        let failure_message = match executor.execute(&payload).await {
            Ok(ExecutionOutcome::Success(result)) => {
                slot.set_status(SlotStatus::Uploading);
                if let Err(e) = rpc.upload(thread, result).await {
                    warn!(thread, error = %e, "upload failed");
                }
                slot.set_status(SlotStatus::Ready);
                continue;
            }
            Ok(ExecutionOutcome::Failure(message)) => message,
            Err(e) => e.to_string(),
        };

        slot.set_status(SlotStatus::Failed);
        if let Err(e) = rpc.report_error(thread, failure_message).await {
            warn!(thread, error = %e, "error report failed");
        }

        attempts += 1;
        slot.attempts.store(attempts, Ordering::Relaxed);

        if attempts < client_retries {
            match rpc.reload_work_unit(thread).await {
                Ok(ReloadOutcome::Payload(p)) => {
                    held_payload = Some(p);
                    slot.set_status(SlotStatus::Running);
                    continue;
                }
                Ok(ReloadOutcome::Dead) | Err(_) => {
                    // fresh unit on next loop iteration
                }
            }
        }
        slot.set_status(SlotStatus::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::worker::executor::FnExecutor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct FakeRpc {
        payloads: Mutex<Vec<Vec<u8>>>,
        uploads: Mutex<Vec<Vec<u8>>>,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl WorkerRpc for FakeRpc {
        async fn send_work_unit(&self, _thread: u32) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.payloads.lock().unwrap().pop())
        }

        async fn upload(&self, _thread: u32, result: Vec<u8>) -> anyhow::Result<()> {
            self.uploads.lock().unwrap().push(result);
            Ok(())
        }

        async fn report_error(&self, _thread: u32, _message: String) -> anyhow::Result<()> {
            self.errors.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn reload_work_unit(&self, _thread: u32) -> anyhow::Result<ReloadOutcome> {
            Ok(ReloadOutcome::Dead)
        }
    }

    #[tokio::test]
    async fn slot_uploads_successful_results_then_idles_when_drained() {
        let rpc = Arc::new(FakeRpc {
            payloads: Mutex::new(vec![b"unit".to_vec()]),
            uploads: Mutex::new(Vec::new()),
            errors: AtomicUsize::new(0),
        });
        let executor = Arc::new(FnExecutor::new(|p: &[u8]| {
            Ok(ExecutionOutcome::Success(p.to_vec()))
        }));

        run_slot(Arc::new(Slot::new(1)), rpc.clone(), executor, 2).await;

        assert_eq!(rpc.uploads.lock().unwrap().as_slice(), &[b"unit".to_vec()]);
    }

    #[tokio::test]
    async fn slot_reports_failure_and_drains_after_reload_returns_dead() {
        let rpc = Arc::new(FakeRpc {
            payloads: Mutex::new(vec![b"unit".to_vec()]),
            uploads: Mutex::new(Vec::new()),
            errors: AtomicUsize::new(0),
        });
        let executor = Arc::new(FnExecutor::new(|_: &[u8]| {
            Ok::<_, ExecutorError>(ExecutionOutcome::Failure("boom".to_string()))
        }));

        run_slot(Arc::new(Slot::new(1)), rpc.clone(), executor, 1).await;

        assert_eq!(rpc.errors.load(Ordering::Relaxed), 1);
        assert!(rpc.uploads.lock().unwrap().is_empty());
    }
}
