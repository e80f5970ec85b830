// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The networked [`WorkerRpc`] implementation: one dedicated TCP
//! connection per slot, plus one control connection for the
//! client-level `Init`/`SendStatus` calls.
//!
//! One connection per thread avoids interleaving replies on a shared
//! socket: [`wu_coordinator_core::transport::Connection`] is a plain
//! request-then-response channel with no call-id multiplexing, so two
//! slots sharing a connection could read back each other's reply.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use wu_coordinator_core::protocol::{keyword, Call, Opcode, Request, RpcMethod};
use wu_coordinator_core::registry::ClientId;
use wu_coordinator_core::transport::Connection;
use wu_coordinator_core::worker::driver::{ReloadOutcome, WorkerRpc};

/// The worker-code blob fetched at `Init`.
pub struct WorkerCode {
    /// Filename echoed back by the coordinator.
    pub filename: String,
    /// Opaque bytes to run.
    pub bytes: Vec<u8>,
}

/// A connected worker client: one control connection plus `threads`
/// dedicated per-slot connections.
pub struct CoordinatorClient {
    client_id: ClientId,
    worker_code: WorkerCode,
    conns: Vec<Mutex<Connection>>,
}

impl CoordinatorClient {
    /// Dial `addr`, complete the `Init`/`Hello`/`Ready` handshake, and
    /// open one additional connection per thread.
    pub async fn connect(addr: &str, threads: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to coordinator at {addr}"))?;
        let mut control = Connection::new(stream);

        let init_reply = call(
            &mut control,
            RpcMethod::Init,
            Request::status(Opcode::Init, wu_coordinator_core::protocol::UNASSIGNED_CLIENT_ID, 0, ""),
        )
        .await?;
        if init_reply.data == keyword::ERROR {
            bail!("coordinator has no worker-code blob configured");
        }
        let worker_code = WorkerCode {
            filename: init_reply.data,
            bytes: init_reply.payload,
        };

        let hello_reply = call(
            &mut control,
            RpcMethod::SendStatus,
            Request::status(
                Opcode::Hello,
                wu_coordinator_core::protocol::UNASSIGNED_CLIENT_ID,
                0,
                threads.to_string(),
            ),
        )
        .await?;
        let client_id = hello_reply.id;

        call(
            &mut control,
            RpcMethod::SendStatus,
            Request::status(Opcode::Ready, client_id, 0, ""),
        )
        .await?;

        let mut conns = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("opening per-thread connection to {addr}"))?;
            conns.push(Mutex::new(Connection::new(stream)));
        }

        Ok(Self {
            client_id,
            worker_code,
            conns,
        })
    }

    /// The worker-code blob fetched at `Init`.
    pub fn worker_code(&self) -> &WorkerCode {
        &self.worker_code
    }

    fn conn_for(&self, thread: u32) -> &Mutex<Connection> {
        &self.conns[(thread - 1) as usize]
    }
}

async fn call(
    conn: &mut Connection,
    method: RpcMethod,
    request: Request,
) -> Result<wu_coordinator_core::protocol::Reply> {
    conn.write_call(&Call { method, request }).await?;
    Ok(conn.read_reply().await?)
}

#[async_trait]
impl WorkerRpc for CoordinatorClient {
    async fn send_work_unit(&self, thread: u32) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_for(thread).lock().await;
        let reply = call(
            &mut conn,
            RpcMethod::SendWorkUnit,
            Request::status(Opcode::Download, self.client_id, thread, thread.to_string()),
        )
        .await?;
        match reply.data.as_str() {
            keyword::OK => Ok(Some(reply.payload)),
            keyword::ERROR => Ok(None),
            other => Err(anyhow!("unexpected send_work_unit reply: {other}")),
        }
    }

    async fn upload(&self, thread: u32, result: Vec<u8>) -> Result<()> {
        let mut conn = self.conn_for(thread).lock().await;
        let mut request = Request::status(Opcode::Upload, self.client_id, thread, thread.to_string());
        request.payload = result;
        let reply = call(&mut conn, RpcMethod::FetchWorkUnit, request).await?;
        if reply.data != keyword::OK {
            bail!("upload rejected: {}", reply.error.unwrap_or(reply.data));
        }
        Ok(())
    }

    async fn report_error(&self, thread: u32, message: String) -> Result<()> {
        let mut conn = self.conn_for(thread).lock().await;
        let request = Request::error_report(self.client_id, thread, message);
        let reply = call(&mut conn, RpcMethod::FetchWorkUnit, request).await?;
        if reply.data != keyword::ERROR {
            bail!("error report not acknowledged: {}", reply.data);
        }
        Ok(())
    }

    async fn reload_work_unit(&self, thread: u32) -> Result<ReloadOutcome> {
        let mut conn = self.conn_for(thread).lock().await;
        let reply = call(
            &mut conn,
            RpcMethod::ReloadWorkUnit,
            Request::status(Opcode::Download, self.client_id, thread, thread.to_string()),
        )
        .await?;
        match reply.data.as_str() {
            keyword::OK => Ok(ReloadOutcome::Payload(reply.payload)),
            keyword::DEAD => Ok(ReloadOutcome::Dead),
            other => bail!("unexpected reload_work_unit reply: {other}"),
        }
    }
}
