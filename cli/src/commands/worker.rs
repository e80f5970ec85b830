// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::sync::broadcast;
use tracing::info;

use wu_coordinator_core::config::ConfigLoader;
use wu_coordinator_core::worker::{Driver, ProcessExecutor};

use crate::client::CoordinatorClient;

/// Run a worker against a coordinator.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// `host:port` of the coordinator, overriding configuration.
    #[arg(long)]
    pub addr: Option<String>,

    /// Number of concurrent slots to run, overriding configuration.
    #[arg(long)]
    pub threads: Option<u32>,

    /// Path to the executable the fetched worker-code blob is written
    /// to and run once per work unit.
    #[arg(long)]
    pub executor: Option<PathBuf>,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Connect to the coordinator and drive every slot until killed or
/// the workload provider drains.
pub async fn execute(args: WorkerArgs, _verbose: bool) -> Result<()> {
    let mut loader = ConfigLoader::worker();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut cfg = loader.load_worker().context("loading worker configuration")?;
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(threads) = args.threads {
        cfg.threads = threads;
    }

    info!(addr = %cfg.addr, threads = cfg.threads, "connecting to coordinator");
    let client = Arc::new(CoordinatorClient::connect(&cfg.addr, cfg.threads).await?);

    let executor_path = args
        .executor
        .unwrap_or_else(|| std::env::temp_dir().join(&client.worker_code().filename));
    tokio::fs::write(&executor_path, &client.worker_code().bytes)
        .await
        .with_context(|| format!("writing worker-code blob to {}", executor_path.display()))?;
    make_executable(&executor_path)?;

    let executor = Arc::new(ProcessExecutor::new(executor_path));
    let driver = Driver::new(cfg.threads, client, executor, cfg.client_retries);

    let (_kill_tx, kill_rx) = broadcast::channel(1);
    driver.run(kill_rx).await;

    info!("worker exiting");
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
