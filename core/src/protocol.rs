// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire protocol between workers and the coordinator.
//!
//! A single `Request`/`Reply` pair carries every RPC; there is no
//! streaming. Fields are carried by name (`serde` struct fields), not
//! position, so additions stay backwards compatible.

use serde::{Deserialize, Serialize};

/// Client id sentinel meaning "not yet assigned".
pub const UNASSIGNED_CLIENT_ID: i64 = -1;

/// The opcode tag carried by a [`Request`].
///
/// The wire form is the five short strings named in the protocol
/// section of the spec, plus the untagged `Init` call used to fetch
/// the worker-code blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Fetch the worker-code blob (no status tag on the wire).
    Init,
    /// Register a new client or re-announce an existing one.
    Hello,
    /// Mark the client ready after it has booted its worker code.
    Ready,
    /// A client-level fatal error report.
    Error,
    /// Request a work unit for a given thread.
    Download,
    /// Deliver a work unit result for a given thread.
    Upload,
}

/// The fixed RPC method name a [`Request`] is addressed to.
///
/// The wire protocol (spec §6) names five methods — `Listener.Init`,
/// `Listener.SendStatus`, `Listener.SendWorkUnit`, `Listener.FetchWorkUnit`,
/// `Listener.ReloadWorkUnit` — and two of them (`SendWorkUnit` and
/// `ReloadWorkUnit`) carry the same `Download` [`Opcode`] on their
/// request body. The method name, not the opcode, is what tells the
/// coordinator which handler to run; a length-delimited JSON frame on
/// the wire is a `Call { method, request }` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    /// `Listener.Init` — fetch the worker-code blob.
    Init,
    /// `Listener.SendStatus` — `hello`/`ready`/`error` client-level calls.
    SendStatus,
    /// `Listener.SendWorkUnit` — dispatch a work unit (`download`).
    SendWorkUnit,
    /// `Listener.FetchWorkUnit` — deliver a result or failure report.
    FetchWorkUnit,
    /// `Listener.ReloadWorkUnit` — re-request the currently assigned unit.
    ReloadWorkUnit,
}

/// One framed call: the method it is addressed to plus its request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Which of the five fixed RPC methods this call invokes.
    pub method: RpcMethod,
    /// The request body.
    pub request: Request,
}

/// Worker → coordinator request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Opcode tag driving dispatch.
    pub status: Opcode,
    /// Free-form string payload; meaning depends on `status`.
    ///
    /// For `Download`/`Upload`/reload calls this is the 1-based thread
    /// index rendered as a string. For `Hello` it is the declared
    /// thread count. Unused by `Init`/`Ready`.
    #[serde(default)]
    pub data: String,
    /// Non-empty when the worker is reporting a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Client id; [`UNASSIGNED_CLIENT_ID`] when not yet known.
    #[serde(default = "default_client_id")]
    pub id: i64,
    /// 1-based thread index, 0 for client-level operations.
    #[serde(default)]
    pub thread: u32,
    /// Opaque result bytes for an upload call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

fn default_client_id() -> i64 {
    UNASSIGNED_CLIENT_ID
}

impl Request {
    /// Build a bare status request carrying no payload or error.
    pub fn status(status: Opcode, id: i64, thread: u32, data: impl Into<String>) -> Self {
        Self {
            status,
            data: data.into(),
            error: None,
            id,
            thread,
            payload: Vec::new(),
        }
    }

    /// Build an error report for `thread`.
    pub fn error_report(id: i64, thread: u32, message: impl Into<String>) -> Self {
        Self {
            status: Opcode::Upload,
            data: thread.to_string(),
            error: Some(message.into()),
            id,
            thread,
            payload: Vec::new(),
        }
    }

    /// Parse the `data` field as a thread index.
    ///
    /// Returns `None` on a malformed index, matching the protocol-error
    /// class in the error handling design.
    pub fn thread_from_data(&self) -> Option<u32> {
        self.data.trim().parse().ok()
    }
}

/// Coordinator → worker reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// `"ok"`, a short error keyword, or a filename/echo.
    pub data: String,
    /// Present on protocol-class failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Echoed client id, or the newly assigned one.
    pub id: i64,
    /// Opaque bytes: worker-code blob or work-unit payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// Short reply keywords used across handlers.
pub mod keyword {
    /// Call succeeded.
    pub const OK: &str = "ok";
    /// Generic protocol-class failure.
    pub const ERROR: &str = "error";
    /// `SendStatus`/`ReloadWorkUnit` could not find the client.
    pub const CLIENT_NOT_FOUND: &str = "client not found";
    /// `ReloadWorkUnit`/`FetchWorkUnit` found no work unit for (client, thread).
    pub const NO_SUCH_WU: &str = "no such wu";
    /// `ReloadWorkUnit` on a work unit that has exhausted its attempt cap.
    pub const DEAD: &str = "dead";
}

impl Reply {
    /// Build a bare `ok` reply with no payload.
    pub fn ok(id: i64) -> Self {
        Self {
            data: keyword::OK.to_string(),
            error: None,
            id,
            payload: Vec::new(),
        }
    }

    /// Build an `ok` reply carrying a payload.
    pub fn ok_with_payload(id: i64, payload: Vec<u8>) -> Self {
        Self {
            data: keyword::OK.to_string(),
            error: None,
            id,
            payload,
        }
    }

    /// Build a keyword-only error reply.
    pub fn keyword(id: i64, keyword: &str) -> Self {
        Self {
            data: keyword.to_string(),
            error: None,
            id,
            payload: Vec::new(),
        }
    }

    /// Build an error reply carrying a descriptive message.
    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            data: keyword::ERROR.to_string(),
            error: Some(message.into()),
            id,
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = Request::status(Opcode::Download, 3, 1, "1");
        let bytes = serde_json::to_vec(&req).unwrap();
        let decoded: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.thread, req.thread);
        assert_eq!(decoded.status, req.status);
        assert_eq!(decoded.data, req.data);
    }

    #[test]
    fn reply_round_trips_through_json() {
        let reply = Reply::ok_with_payload(7, vec![1, 2, 3]);
        let bytes = serde_json::to_vec(&reply).unwrap();
        let decoded: Reply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id, reply.id);
        assert_eq!(decoded.payload, reply.payload);
        assert_eq!(decoded.data, reply.data);
    }

    #[test]
    fn thread_from_data_rejects_malformed_index() {
        let req = Request::status(Opcode::Download, 1, 0, "not-a-number");
        assert_eq!(req.thread_from_data(), None);
    }

    #[test]
    fn call_round_trips_and_keeps_method_distinct_from_opcode() {
        let call = Call {
            method: RpcMethod::ReloadWorkUnit,
            request: Request::status(Opcode::Download, 3, 1, "1"),
        };
        let bytes = serde_json::to_vec(&call).unwrap();
        let decoded: Call = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.method, RpcMethod::ReloadWorkUnit);
        assert_eq!(decoded.request.status, Opcode::Download);
    }

    #[test]
    fn unassigned_client_id_triggers_assignment() {
        let req = Request::status(Opcode::Hello, UNASSIGNED_CLIENT_ID, 0, "4");
        assert_eq!(req.id, -1);
    }
}
