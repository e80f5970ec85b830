// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Layered configuration for the coordinator and worker binaries
//! (spec §6): CLI arguments, then `WU_COORD_`/`WU_WORKER_`-prefixed
//! environment variables, then an optional TOML file, then defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;

/// Environment variable prefix for coordinator overrides.
pub const COORDINATOR_ENV_PREFIX: &str = "WU_COORD";
/// Environment variable prefix for worker overrides.
pub const WORKER_ENV_PREFIX: &str = "WU_WORKER";
const ENV_SEPARATOR: &str = "__";

/// Coordinator-side configuration (spec §6: `ClientFile`, `Port`,
/// `ServerFile`, `DashboardPort`, plus the attempt/timeout/finalize
/// knobs the distillation leaves implicit in the original CLI flags).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// TCP port the worker-facing listener binds.
    #[validate(minimum = 1)]
    pub port: u16,
    /// Port the JSON snapshot/health dashboard binds.
    #[validate(minimum = 1)]
    pub dashboard_port: u16,
    /// Path to the worker-code blob handed out on `Init`.
    pub server_file: PathBuf,
    /// Optional path recording expected client count, mirroring the
    /// reference CLI's `-clients` flag.
    pub client_file: Option<PathBuf>,
    /// Attempts allowed before a work unit is retired as dead.
    #[validate(minimum = 1)]
    pub attempt_cap: u32,
    /// Seconds of inactivity before a running unit is marked stuck.
    #[validate(minimum = 1)]
    pub liveness_timeout_secs: u64,
    /// Finalizer policy: 0 waits forever, otherwise seconds to wait on
    /// stuck clients before finalizing anyway.
    pub finalize_timeout_secs: u64,
    /// Path the shutdown dump of unfinished work units is appended to.
    pub shutdown_dump_path: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            dashboard_port: 9001,
            server_file: PathBuf::from("worker-code.bin"),
            client_file: None,
            attempt_cap: 3,
            liveness_timeout_secs: 30,
            finalize_timeout_secs: 0,
            shutdown_dump_path: PathBuf::from("unfinished-work-units.jsonl"),
        }
    }
}

/// Worker-side configuration (spec §6: `Addr`, `Threads`, plus the
/// client-retry knob the driver needs).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WorkerConfig {
    /// `host:port` of the coordinator to dial.
    pub addr: String,
    /// Number of concurrent slots to run.
    #[validate(minimum = 1)]
    pub threads: u32,
    /// `ReloadWorkUnit` retries before requesting a fresh unit.
    #[validate(minimum = 1)]
    pub client_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9000".to_string(),
            threads: 1,
            client_retries: 3,
        }
    }
}

/// Builder-style loader mirroring the teacher's `ConfigLoader`:
/// defaults, then an optional file, then environment variables,
/// each source overriding the last.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
    env_prefix: &'static str,
}

impl ConfigLoader {
    /// A loader for the coordinator binary.
    pub fn coordinator() -> Self {
        Self {
            env_prefix: COORDINATOR_ENV_PREFIX,
            ..Default::default()
        }
    }

    /// A loader for the worker binary.
    pub fn worker() -> Self {
        Self {
            env_prefix: WORKER_ENV_PREFIX,
            ..Default::default()
        }
    }

    /// Load from this TOML file in addition to defaults and env vars.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the environment-variable layer (tests).
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    fn build<T>(&self, defaults: &T) -> Result<T>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Validate,
    {
        let mut builder = ConfigBuilder::builder();
        let defaults_value = serde_json::to_value(defaults).context("serializing defaults")?;
        builder = builder.add_source(config::Config::try_from(&defaults_value)?);

        if let Some(path) = &self.file {
            builder = builder.add_source(
                File::from(path.as_path())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(self.env_prefix)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let built = builder.build().context("building configuration")?;
        let parsed: T = built.try_deserialize().context("deserializing configuration")?;
        parsed
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration validation failed: {e}"))?;
        Ok(parsed)
    }

    /// Load a [`CoordinatorConfig`].
    pub fn load_coordinator(&self) -> Result<CoordinatorConfig> {
        self.build(&CoordinatorConfig::default())
    }

    /// Load a [`WorkerConfig`].
    pub fn load_worker(&self) -> Result<WorkerConfig> {
        self.build(&WorkerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_defaults_validate() {
        let cfg = ConfigLoader::coordinator().skip_env().load_coordinator().unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.attempt_cap, 3);
    }

    #[test]
    fn worker_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "threads = 8\naddr = \"10.0.0.1:9000\"\n").unwrap();

        let cfg = ConfigLoader::worker()
            .with_file(&path)
            .skip_env()
            .load_worker()
            .unwrap();
        assert_eq!(cfg.threads, 8);
        assert_eq!(cfg.addr, "10.0.0.1:9000");
    }

    #[test]
    fn invalid_thread_count_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "threads = 0\n").unwrap();

        let result = ConfigLoader::worker().with_file(&path).skip_env().load_worker();
        assert!(result.is_err());
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.toml");
        std::fs::write(&path, "port = 7000\n").unwrap();

        std::env::set_var("WU_COORD_PORT", "8000");
        let cfg = ConfigLoader::coordinator()
            .with_file(&path)
            .load_coordinator()
            .unwrap();
        std::env::remove_var("WU_COORD_PORT");

        assert_eq!(cfg.port, 8000);
    }
}
