// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The liveness scanner: a single periodic task that marks running
//! units stuck past their timeout (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::debug;

use crate::registry::Registry;

/// How often the scanner wakes, per spec §4.4 ("wakes every second").
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Run the liveness scan loop until `kill` fires.
///
/// The scanner only marks units stuck; it never retries them itself
/// (spec §4.4 — "retry is demand-driven").
pub async fn run(registry: Arc<Registry>, mut kill: broadcast::Receiver<()>) {
    let mut ticker = interval(SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.scan_liveness();
                debug!(status = ?registry.coordinator_status(), "liveness scan complete");
            }
            _ = kill.recv() => {
                debug!("liveness scanner shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn scanner_marks_units_stuck_and_stops_on_kill() {
        let registry = Arc::new(Registry::new(3, StdDuration::from_millis(10)));
        let client = registry.register_client(1);
        registry
            .dispatch(client, 1, |_| Some(b"p".to_vec()))
            .unwrap();

        let (kill_tx, kill_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(registry.clone(), kill_rx));

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        let snap = registry.snapshot();
        assert_eq!(
            snap.work_units[0].status,
            crate::registry::WorkUnitStatus::Stuck
        );

        kill_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
