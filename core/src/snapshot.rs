// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The read-only JSON snapshot endpoint for the dashboard (spec §6).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::{Client, CoordinatorStatus, Registry, WorkUnit};

/// Shared state for the snapshot router.
#[derive(Clone)]
pub struct SnapshotState {
    registry: Arc<Registry>,
    warnings: Arc<parking_lot::Mutex<Vec<String>>>,
    errors: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl SnapshotState {
    /// Build snapshot state over `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            warnings: Arc::new(parking_lot::Mutex::new(Vec::new())),
            errors: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Record an operator-visible warning, shown on the next snapshot.
    pub fn push_warning(&self, message: impl Into<String>) {
        self.warnings.lock().push(message.into());
    }

    /// Record an operator-visible error, shown on the next snapshot.
    pub fn push_error(&self, message: impl Into<String>) {
        self.errors.lock().push(message.into());
    }
}

/// The document served at `GET /snapshot` (spec §6).
#[derive(Debug, Serialize)]
pub struct SnapshotDocument {
    /// HTML-escaped operator warnings accumulated so far.
    pub warnings: Vec<String>,
    /// HTML-escaped operator errors accumulated so far.
    pub errors: Vec<String>,
    /// Coarse coordinator-wide status.
    pub status: String,
    /// All registered clients.
    pub clients: Vec<Client>,
    /// All known work units.
    pub work_units: Vec<WorkUnit>,
}

/// Health-check response, in the teacher's `api::rest::health_check` style.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
}

/// Build the dashboard's HTTP router: `GET /snapshot`, `GET /health`.
pub fn router(state: SnapshotState) -> Router {
    Router::new()
        .route("/snapshot", get(snapshot_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn snapshot_handler(State(state): State<SnapshotState>) -> Json<SnapshotDocument> {
    let snap = state.registry.snapshot();
    let warnings = state.warnings.lock().iter().map(|s| escape_html(s)).collect();
    let errors = state.errors.lock().iter().map(|s| escape_html(s)).collect();
    Json(SnapshotDocument {
        warnings,
        errors,
        status: coordinator_status_str(state.registry.coordinator_status()),
        clients: snap.clients,
        work_units: snap.work_units,
    })
}

fn coordinator_status_str(status: CoordinatorStatus) -> String {
    match status {
        CoordinatorStatus::Ready => "ready",
        CoordinatorStatus::Running => "running",
        CoordinatorStatus::Failed => "failed",
        CoordinatorStatus::Finished => "finished",
    }
    .to_string()
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

/// Minimal HTML escaping for warning/error strings (spec §6: "Message
/// strings ... are HTML-escaped"). The pack carries no dedicated
/// escaping crate, so this covers the five characters that matter for
/// embedding arbitrary text in an HTML document.
fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_the_five_reserved_characters() {
        assert_eq!(
            escape_html(r#"<script>"a" & 'b'</script>"#),
            "&lt;script&gt;&quot;a&quot; &amp; &#39;b&#39;&lt;/script&gt;"
        );
    }
}
