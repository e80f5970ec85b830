// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error taxonomy for the coordinator and worker.

use thiserror::Error;

/// Registry-level protocol errors: missing client, thread, or work unit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No client is registered under this id.
    #[error("client not found: {0}")]
    ClientNotFound(i64),

    /// The client has no thread at this index.
    #[error("thread not found: client {client}, thread {thread}")]
    ThreadNotFound {
        /// Client id.
        client: i64,
        /// Requested thread index.
        thread: u32,
    },

    /// `data` could not be parsed as a thread index.
    #[error("malformed thread index: {0:?}")]
    MalformedThreadIndex(String),

    /// No work unit is currently assigned to (client, thread).
    #[error("no work unit assigned to client {client}, thread {thread}")]
    NoSuchWorkUnit {
        /// Client id.
        client: i64,
        /// Thread index.
        thread: u32,
    },

    /// The workload provider has no more units to hand out.
    #[error("workload provider drained")]
    Drained,
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors arising from the TCP framing layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame did not decode as a `Request`/`Reply`.
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer closed the connection mid-call.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors reported by a worker's task executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor process could not be spawned.
    #[error("failed to launch executor: {0}")]
    Spawn(#[from] std::io::Error),

    /// The executor exited with a nonzero status or wrote to stderr.
    #[error("executor reported failure: {0}")]
    ExecutionFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_messages_are_stable() {
        assert_eq!(
            RegistryError::ClientNotFound(5).to_string(),
            "client not found: 5"
        );
        assert_eq!(
            RegistryError::ThreadNotFound { client: 1, thread: 2 }.to_string(),
            "thread not found: client 1, thread 2"
        );
    }
}
