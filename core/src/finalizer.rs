// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The finalizer: entered once the workload provider reports drained,
//! drains running work, and commits results (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::registry::{ClientStatus, Registry, WorkUnitStatus};
use crate::workload::WorkloadProvider;

/// Polling resolution while waiting for running clients to drain,
/// per spec §4.5 ("polling at one-second resolution").
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Headless policy replacing the reference CLI's interactive operator
/// prompt (DESIGN NOTES §9: "Finalizer polling loop with operator
/// prompt"). This is the one policy decision spec.md leaves
/// configurable (spec §4.5, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerPolicy {
    /// Block until every client leaves `running`/`stuck`, however long
    /// that takes.
    WaitForever,
    /// Stop waiting on stuck/unknown clients after this long past entry,
    /// treating the remainder as abandoned and finalizing anyway.
    SkipStuckAfter(Duration),
    /// Finalize immediately, treating any stuck/unknown client as a
    /// hard failure to surface rather than wait out.
    FailOnStuck,
}

impl Default for FinalizerPolicy {
    fn default() -> Self {
        FinalizerPolicy::WaitForever
    }
}

/// Run the finalizer once the workload provider has drained.
///
/// Waits for every client to leave `running` (per `policy`), then
/// classifies every unit by its final status, logs diagnostics for
/// anything non-`completed`, and calls `provider.finalize` with the
/// ordered list of completed results (spec §8, property 5: order
/// matches insertion order of completion).
pub async fn run(registry: Arc<Registry>, provider: Arc<dyn WorkloadProvider>, policy: FinalizerPolicy) {
    info!("workload provider drained; entering finalizer");
    let deadline = match policy {
        FinalizerPolicy::SkipStuckAfter(d) => Some(tokio::time::Instant::now() + d),
        _ => None,
    };

    loop {
        if no_client_running(&registry) {
            break;
        }
        if policy == FinalizerPolicy::FailOnStuck {
            warn!("finalizer policy fail_on_stuck: a client is still running");
            break;
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                warn!("finalizer policy skip_stuck_after elapsed; proceeding without drain");
                break;
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let snapshot = registry.snapshot();
    let mut completed = Vec::new();
    for wu in &snapshot.work_units {
        match wu.status {
            WorkUnitStatus::Completed => completed.push(wu.result.clone()),
            other => warn!(wu = wu.id, status = %other, "work unit not completed at finalize"),
        }
    }

    info!(completed = completed.len(), "finalizing workload provider");
    provider.finalize(completed);
    registry.mark_finalized();
}

fn no_client_running(registry: &Registry) -> bool {
    let snapshot = registry.snapshot();
    !snapshot
        .clients
        .iter()
        .any(|c| matches!(c.status, ClientStatus::Running | ClientStatus::Stuck))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::CountingWorkloadProvider;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn finalizes_immediately_when_nothing_is_running() {
        let registry = Arc::new(Registry::new(2, StdDuration::from_secs(5)));
        let client = registry.register_client(1);
        registry
            .dispatch(client, 1, |_| Some(b"p".to_vec()))
            .unwrap();
        registry.complete(client, 1, b"R".to_vec()).unwrap();

        let provider = Arc::new(CountingWorkloadProvider::new(0));
        run(registry.clone(), provider, FinalizerPolicy::WaitForever).await;

        assert!(matches!(
            registry.coordinator_status(),
            crate::registry::CoordinatorStatus::Finished
        ));
    }

    #[tokio::test]
    async fn fail_on_stuck_proceeds_without_waiting() {
        let registry = Arc::new(Registry::new(2, StdDuration::from_secs(5)));
        let client = registry.register_client(1);
        registry
            .dispatch(client, 1, |_| Some(b"p".to_vec()))
            .unwrap();

        let provider = Arc::new(CountingWorkloadProvider::new(0));
        run(registry.clone(), provider, FinalizerPolicy::FailOnStuck).await;

        assert!(matches!(
            registry.coordinator_status(),
            crate::registry::CoordinatorStatus::Finished
        ));
    }
}
