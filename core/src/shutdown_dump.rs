// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! On a graceful shutdown before finalization, record every
//! non-completed work unit so an operator can inspect or replay lost
//! work (spec §7: "the coordinator ... records work in flight").

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::registry::{ClientId, Registry, ThreadIndex, WorkUnit};

/// One line of the shutdown dump: enough to identify and, if desired,
/// resubmit the unit elsewhere.
#[derive(Debug, Serialize)]
struct DumpedUnit<'a> {
    id: u64,
    status: String,
    attempts: u32,
    assigned_client: Option<ClientId>,
    assigned_thread: Option<ThreadIndex>,
    payload: &'a [u8],
    /// Last-known result bytes, if any were recorded before the unit
    /// left `completed` (spec §6: "its stored payload and last-known
    /// result").
    result: &'a [u8],
}

/// Append one JSON line per unit not in `completed` status to `path`.
///
/// Opens in append mode so repeated shutdowns (or a coordinator
/// restarted mid-run) accumulate a full history rather than clobbering
/// prior entries.
pub fn dump_unfinished(registry: &Registry, path: impl AsRef<Path>) -> std::io::Result<usize> {
    let units = registry.unfinished_units();
    if units.is_empty() {
        return Ok(0);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    for wu in &units {
        let line = serde_json::to_string(&to_dumped(wu)).expect("work unit is always JSON-safe");
        writeln!(file, "{line}")?;
    }
    file.flush()?;
    Ok(units.len())
}

fn to_dumped(wu: &WorkUnit) -> DumpedUnit<'_> {
    DumpedUnit {
        id: wu.id,
        status: wu.status.to_string(),
        attempts: wu.attempts,
        assigned_client: wu.assigned_client,
        assigned_thread: wu.assigned_thread,
        payload: &wu.payload,
        result: &wu.result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::io::BufRead;
    use std::time::Duration;

    #[test]
    fn dumps_only_non_completed_units() {
        let registry = Registry::new(3, Duration::from_secs(30));
        let client = registry.register_client(2);
        registry.dispatch(client, 1, |_| Some(b"stuck".to_vec())).unwrap();
        registry
            .dispatch(client, 2, |_| Some(b"done".to_vec()))
            .unwrap();
        registry.complete(client, 2, b"result".to_vec()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.jsonl");
        let count = dump_unfinished(&registry, &path).unwrap();
        assert_eq!(count, 1);

        let file = std::fs::File::open(&path).unwrap();
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"payload\":[115,116,117,99,107]"));
    }

    #[test]
    fn writing_with_no_unfinished_units_creates_no_lines() {
        let registry = Registry::new(3, Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.jsonl");
        let count = dump_unfinished(&registry, &path).unwrap();
        assert_eq!(count, 0);
    }
}
