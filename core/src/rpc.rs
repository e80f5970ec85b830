// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The five RPC handlers (spec §4.3), each a thin adapter from the
//! protocol envelope to a [`Registry`] operation.

use std::sync::Arc;

use tracing::{info, warn};

use crate::protocol::{keyword, Opcode, Reply, Request, RpcMethod};
use crate::registry::{Dispatch, Registry, Reload};
use crate::workload::WorkloadProvider;

/// Bytes delivered once per client at `Init`, plus the filename the
/// coordinator echoes back (spec §6, "Worker-code blob").
pub struct WorkerCode {
    /// Filename handed back in the reply's `data` field.
    pub filename: String,
    /// Opaque worker-code bytes.
    pub bytes: Vec<u8>,
}

/// Signal raised when a `SendWorkUnit` call discovers the workload
/// provider has drained; the caller (the connection handler) forwards
/// this to the finalizer.
pub struct DrainedSignal;

/// Adapts the wire protocol to the registry, holding no state of its
/// own beyond references to the two collaborators it coordinates.
pub struct RpcService {
    registry: Arc<Registry>,
    provider: Arc<dyn WorkloadProvider>,
    worker_code: Option<WorkerCode>,
    drained_tx: tokio::sync::watch::Sender<bool>,
}

impl RpcService {
    /// Build a service over `registry` and `provider`, optionally
    /// serving `worker_code` at `Init`.
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn WorkloadProvider>,
        worker_code: Option<WorkerCode>,
    ) -> Self {
        let (drained_tx, _rx) = tokio::sync::watch::channel(false);
        Self {
            registry,
            provider,
            worker_code,
            drained_tx,
        }
    }

    /// A receiver that flips to `true` once the workload provider has
    /// reported drained; the finalizer task awaits this.
    pub fn drained_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.drained_tx.subscribe()
    }

    /// Dispatch a framed call to the handler matching its method.
    pub fn handle(&self, method: RpcMethod, request: Request) -> Reply {
        match method {
            RpcMethod::Init => self.init(request),
            RpcMethod::SendStatus => self.send_status(request),
            RpcMethod::SendWorkUnit => self.send_work_unit(request),
            RpcMethod::FetchWorkUnit => self.fetch_work_unit(request),
            RpcMethod::ReloadWorkUnit => self.reload_work_unit(request),
        }
    }

    /// `Listener.Init` — fetch the worker-code blob and its filename.
    fn init(&self, request: Request) -> Reply {
        match &self.worker_code {
            Some(code) => Reply {
                data: code.filename.clone(),
                error: None,
                id: request.id,
                payload: code.bytes.clone(),
            },
            None => Reply::keyword(request.id, keyword::ERROR),
        }
    }

    /// `Listener.SendStatus` — `hello` / `ready` / `error`.
    fn send_status(&self, request: Request) -> Reply {
        match request.status {
            Opcode::Hello => {
                // A malformed or zero thread count is clamped to 1 rather
                // than rejected, so a misbehaving worker still registers
                // and is visible on the dashboard instead of being shut out.
                let declared_threads: u32 = request.data.trim().parse().unwrap_or(1).max(1);
                let id = self.registry.register_client(declared_threads);
                Reply::ok(id)
            }
            Opcode::Ready => match self.registry.mark_ready(request.id) {
                Ok(()) => Reply::ok(request.id),
                Err(_) => Reply::keyword(request.id, keyword::CLIENT_NOT_FOUND),
            },
            Opcode::Error => {
                if let Err(e) = self.registry.mark_failed(request.id) {
                    warn!(client = request.id, error = %e, "error report for unknown client");
                } else {
                    warn!(
                        client = request.id,
                        message = request.error.as_deref().unwrap_or(""),
                        "client reported fatal error"
                    );
                }
                Reply::ok(request.id)
            }
            other => {
                warn!(?other, "SendStatus called with an unexpected opcode");
                Reply::error(request.id, "unexpected opcode for SendStatus")
            }
        }
    }

    /// `Listener.SendWorkUnit` — `download`: dispatch a unit to a thread.
    fn send_work_unit(&self, request: Request) -> Reply {
        let Some(thread) = request.thread_from_data() else {
            return Reply::error(request.id, "malformed thread index");
        };
        let provider = &self.provider;
        let outcome = self
            .registry
            .dispatch(request.id, thread, |client| provider.next_unit(client));
        match outcome {
            Ok(Dispatch::Payload(payload)) => {
                info!(client = request.id, thread, "dispatched work unit");
                Reply::ok_with_payload(request.id, payload)
            }
            Ok(Dispatch::Drained) => {
                let _ = self.drained_tx.send(true);
                info!("workload provider drained; signaling finalizer");
                Reply::keyword(request.id, keyword::ERROR)
            }
            Err(e) => {
                warn!(client = request.id, thread, error = %e, "send_work_unit failed");
                Reply::error(request.id, e.to_string())
            }
        }
    }

    /// `Listener.FetchWorkUnit` — `upload` success, or an error report.
    fn fetch_work_unit(&self, request: Request) -> Reply {
        let Some(thread) = request.thread_from_data() else {
            return Reply::error(request.id, "malformed thread index");
        };
        if request.error.is_some() || request.status == Opcode::Error {
            return match self.registry.fail(request.id, thread) {
                Ok(()) => Reply::keyword(request.id, keyword::ERROR),
                Err(e) => Reply::error(request.id, e.to_string()),
            };
        }
        match self.registry.complete(request.id, thread, request.payload) {
            Ok(()) => Reply::ok(request.id),
            Err(e) => {
                warn!(client = request.id, thread, error = %e, "upload rejected");
                Reply::error(request.id, e.to_string())
            }
        }
    }

    /// `Listener.ReloadWorkUnit` — re-request the currently assigned unit.
    fn reload_work_unit(&self, request: Request) -> Reply {
        let Some(thread) = request.thread_from_data() else {
            return Reply::error(request.id, "malformed thread index");
        };
        match self.registry.reload(request.id, thread) {
            Ok(Reload::Payload(payload)) => Reply::ok_with_payload(request.id, payload),
            Ok(Reload::Dead) => Reply::keyword(request.id, keyword::DEAD),
            Err(e) => {
                warn!(client = request.id, thread, error = %e, "reload failed");
                Reply::keyword(request.id, keyword::NO_SUCH_WU)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, Request};
    use crate::registry::Registry;
    use crate::workload::CountingWorkloadProvider;
    use std::time::Duration;

    fn service(total: u64) -> RpcService {
        let registry = Arc::new(Registry::new(2, Duration::from_secs(5)));
        let provider = Arc::new(CountingWorkloadProvider::new(total));
        RpcService::new(registry, provider, None)
    }

    #[test]
    fn hello_assigns_sequential_ids() {
        let svc = service(10);
        let r1 = svc.handle(
            RpcMethod::SendStatus,
            Request::status(Opcode::Hello, -1, 0, "2"),
        );
        assert_eq!(r1.data, "ok");
        assert_eq!(r1.id, 1);
    }

    #[test]
    fn s1_happy_path_one_worker_one_thread() {
        let svc = service(1);
        let hello = svc.handle(
            RpcMethod::SendStatus,
            Request::status(Opcode::Hello, -1, 0, "1"),
        );
        let id = hello.id;

        let ready = svc.handle(
            RpcMethod::SendStatus,
            Request::status(Opcode::Ready, id, 0, ""),
        );
        assert_eq!(ready.data, "ok");

        let dl = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );
        assert_eq!(dl.data, "ok");
        assert_eq!(dl.payload, 0u64.to_le_bytes().to_vec());

        let mut upload = Request::status(Opcode::Upload, id, 1, "1");
        upload.payload = b"R1".to_vec();
        let up = svc.handle(RpcMethod::FetchWorkUnit, upload);
        assert_eq!(up.data, "ok");

        let drained = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );
        assert_eq!(drained.data, "error");
    }

    #[test]
    fn s2_retry_on_failure_reuses_same_unit() {
        let svc = service(5);
        let id = svc
            .handle(
                RpcMethod::SendStatus,
                Request::status(Opcode::Hello, -1, 0, "1"),
            )
            .id;
        let first = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );

        let mut err = Request::status(Opcode::Error, id, 1, "1");
        err.error = Some("boom".to_string());
        let fail_reply = svc.handle(RpcMethod::FetchWorkUnit, err);
        assert_eq!(fail_reply.data, "error");

        let second = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );
        assert_eq!(second.payload, first.payload, "same unit must be reused");
    }

    #[test]
    fn s6_multi_thread_fairness_retryables_before_fresh_units() {
        let svc = service(10);
        let id = svc
            .handle(
                RpcMethod::SendStatus,
                Request::status(Opcode::Hello, -1, 0, "4"),
            )
            .id;

        // Threads 1 and 2 each pick up a unit, then both fail so the two
        // units become retryable (failed, attempts < cap).
        let a = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );
        let b = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 2, "2"),
        );
        for thread in [1u32, 2] {
            let mut err = Request::status(Opcode::Error, id, thread, thread.to_string());
            err.error = Some("boom".to_string());
            svc.handle(RpcMethod::FetchWorkUnit, err);
        }

        // Threads 3 and 4 reclaim the retryables in insertion order
        // before any fresh unit is allocated.
        let c = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 3, "3"),
        );
        let d = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 4, "4"),
        );
        assert_eq!(c.payload, a.payload, "thread 3 should reclaim thread 1's retryable unit");
        assert_eq!(d.payload, b.payload, "thread 4 should reclaim thread 2's retryable unit");

        // A further request gets a fresh unit distinct from the two
        // reclaimed retryables.
        svc.handle(
            RpcMethod::FetchWorkUnit,
            {
                let mut up = Request::status(Opcode::Upload, id, 3, "3");
                up.payload = b"done".to_vec();
                up
            },
        );
        let fresh = svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 3, "3"),
        );
        assert_ne!(fresh.payload, a.payload);
        assert_ne!(fresh.payload, b.payload);
    }

    #[test]
    fn s5_reload_then_upload_completes() {
        let svc = service(5);
        let id = svc
            .handle(
                RpcMethod::SendStatus,
                Request::status(Opcode::Hello, -1, 0, "1"),
            )
            .id;
        svc.handle(
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );

        let reload = svc.handle(
            RpcMethod::ReloadWorkUnit,
            Request::status(Opcode::Download, id, 1, "1"),
        );
        assert_eq!(reload.data, "ok");

        let mut upload = Request::status(Opcode::Upload, id, 1, "1");
        upload.payload = b"done".to_vec();
        let up = svc.handle(RpcMethod::FetchWorkUnit, upload);
        assert_eq!(up.data, "ok");
    }

    #[test]
    fn init_without_configured_blob_errors() {
        let svc = service(1);
        let reply = svc.handle(RpcMethod::Init, Request::status(Opcode::Hello, -1, 0, ""));
        assert_eq!(reply.data, "error");
    }
}
