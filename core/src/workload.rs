// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The workload-provider ABI (spec §6) and a default implementation.
//!
//! The provider's *content* — what a work unit actually contains, and
//! what finalize does with the results — is explicitly out of scope
//! for the core (spec §1); this module only pins down the four-
//! operation interface the registry and RPC handlers call through, and
//! ships one concrete provider so the coordinator binary does
//! something end to end without an operator plugging in their own.

use std::time::Duration;

use parking_lot::Mutex;

use crate::registry::ClientId;

/// Four operations the coordinator core depends on, per spec §6.
///
/// `next_unit` is invoked without the registry lock held (spec §4.2,
/// §5); implementations must be internally synchronized if they carry
/// mutable state, since multiple dispatch calls can race to allocate.
pub trait WorkloadProvider: Send + Sync {
    /// One-time setup before the coordinator starts accepting traffic.
    fn init(&self) {}

    /// Produce the next payload for `client`, or `None` once drained.
    fn next_unit(&self, client: ClientId) -> Option<Vec<u8>>;

    /// Advise the provider of the worker pool size, for providers that
    /// size their batch to it. The default no-op is correct for
    /// providers with an unbounded or externally fixed supply.
    fn prepare_batch(&self, _worker_threads: u32) {}

    /// Post-process the ordered list of completed results.
    fn finalize(&self, results: Vec<Vec<u8>>);

    /// Liveness timeout the coordinator should use, read once at
    /// startup. `None` defers to the coordinator's configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// A workload provider that hands out a bounded, numbered sequence of
/// payloads and sums a numeric result field on finalize.
///
/// Grounded in `original_source/server.go`'s `Server.Prepare` /
/// `Server.Run` / `Server.Process`: the original demo provider counts
/// out `n` units, each payload a little-endian `u64` index, and its
/// finalize step parses each result back to a `u64` and sums them.
/// This is the stand-in for "the pluggable workload provider that
/// supplies and post-processes units" (spec §1), which the core treats
/// as an opaque collaborator but which a runnable crate needs a
/// working default implementation of.
pub struct CountingWorkloadProvider {
    state: Mutex<CountingState>,
}

struct CountingState {
    next: u64,
    total: u64,
}

impl CountingWorkloadProvider {
    /// Hand out `total` payloads, numbered `0..total`.
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(CountingState { next: 0, total }),
        }
    }
}

impl WorkloadProvider for CountingWorkloadProvider {
    fn next_unit(&self, _client: ClientId) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if state.next >= state.total {
            return None;
        }
        let payload = state.next.to_le_bytes().to_vec();
        state.next += 1;
        Some(payload)
    }

    fn finalize(&self, results: Vec<Vec<u8>>) {
        let sum: u128 = results
            .iter()
            .filter_map(|r| <[u8; 8]>::try_from(r.as_slice()).ok())
            .map(|bytes| u64::from_le_bytes(bytes) as u128)
            .sum();
        tracing::info!(units = results.len(), sum, "counting workload finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_sequential_payloads_then_drains() {
        let provider = CountingWorkloadProvider::new(2);
        assert_eq!(provider.next_unit(1), Some(0u64.to_le_bytes().to_vec()));
        assert_eq!(provider.next_unit(1), Some(1u64.to_le_bytes().to_vec()));
        assert_eq!(provider.next_unit(1), None);
    }

    #[test]
    fn finalize_does_not_panic_on_malformed_result() {
        let provider = CountingWorkloadProvider::new(1);
        provider.finalize(vec![b"not eight bytes".to_vec()]);
    }
}
