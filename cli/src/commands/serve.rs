// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use wu_coordinator_core::config::ConfigLoader;
use wu_coordinator_core::finalizer::{self, FinalizerPolicy};
use wu_coordinator_core::liveness;
use wu_coordinator_core::protocol::Call;
use wu_coordinator_core::registry::Registry;
use wu_coordinator_core::rpc::{RpcService, WorkerCode};
use wu_coordinator_core::shutdown_dump;
use wu_coordinator_core::snapshot::{self, SnapshotState};
use wu_coordinator_core::transport::Connection;
use wu_coordinator_core::workload::{CountingWorkloadProvider, WorkloadProvider};

/// Run the coordinator.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port the worker-facing listener binds, overriding configuration.
    #[arg(long)]
    pub port: Option<u16>,

    /// Port the JSON snapshot/health dashboard binds, overriding configuration.
    #[arg(long)]
    pub dashboard_port: Option<u16>,

    /// Number of work units the default counting workload provider hands out.
    #[arg(long, default_value_t = 100)]
    pub units: u64,

    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Accept worker connections, dispatch work units, and finalize once
/// the workload provider drains.
pub async fn execute(args: ServeArgs, _verbose: bool) -> Result<()> {
    let mut loader = ConfigLoader::coordinator();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut cfg = loader.load_coordinator().context("loading coordinator configuration")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(dashboard_port) = args.dashboard_port {
        cfg.dashboard_port = dashboard_port;
    }

    let registry = Arc::new(Registry::new(
        cfg.attempt_cap,
        Duration::from_secs(cfg.liveness_timeout_secs),
    ));
    let provider: Arc<dyn WorkloadProvider> = Arc::new(CountingWorkloadProvider::new(args.units));
    provider.init();

    let worker_code = match tokio::fs::read(&cfg.server_file).await {
        Ok(bytes) => Some(WorkerCode {
            filename: cfg
                .server_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "worker-code.bin".to_string()),
            bytes,
        }),
        Err(e) => {
            warn!(path = %cfg.server_file.display(), error = %e, "no worker-code blob configured");
            None
        }
    };
    let service = Arc::new(RpcService::new(registry.clone(), provider.clone(), worker_code));

    let (kill_tx, _) = broadcast::channel(1);

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("binding listener on port {}", cfg.port))?;
    info!(port = cfg.port, "coordinator listening");
    tokio::spawn(accept_loop(listener, service.clone(), kill_tx.subscribe()));

    tokio::spawn(liveness::run(registry.clone(), kill_tx.subscribe()));

    let policy = if cfg.finalize_timeout_secs == 0 {
        FinalizerPolicy::WaitForever
    } else {
        FinalizerPolicy::SkipStuckAfter(Duration::from_secs(cfg.finalize_timeout_secs))
    };
    spawn_finalizer(service.clone(), registry.clone(), provider.clone(), policy, kill_tx.clone());

    let snapshot_state = SnapshotState::new(registry.clone());
    let dashboard_addr = SocketAddr::from(([0, 0, 0, 0], cfg.dashboard_port));
    let dashboard_listener = TcpListener::bind(dashboard_addr)
        .await
        .with_context(|| format!("binding dashboard on port {}", cfg.dashboard_port))?;
    info!(port = cfg.dashboard_port, "snapshot dashboard listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(dashboard_listener, snapshot::router(snapshot_state)).await {
            warn!(error = %e, "snapshot dashboard exited");
        }
    });

    let mut finished = kill_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        _ = finished.recv() => {
            info!("finalizer completed");
        }
    }
    let _ = kill_tx.send(());

    let dumped = shutdown_dump::dump_unfinished(&registry, &cfg.shutdown_dump_path)
        .context("writing shutdown dump")?;
    if dumped > 0 {
        warn!(count = dumped, path = %cfg.shutdown_dump_path.display(), "recorded unfinished work units");
    }

    Ok(())
}

fn spawn_finalizer(
    service: Arc<RpcService>,
    registry: Arc<Registry>,
    provider: Arc<dyn WorkloadProvider>,
    policy: FinalizerPolicy,
    kill_tx: broadcast::Sender<()>,
) {
    let mut drained_rx = service.drained_signal();
    tokio::spawn(async move {
        loop {
            if drained_rx.changed().await.is_err() {
                return;
            }
            if *drained_rx.borrow() {
                break;
            }
        }
        finalizer::run(registry, provider, policy).await;
        let _ = kill_tx.send(());
    });
}

async fn accept_loop(listener: TcpListener, service: Arc<RpcService>, mut kill: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let service = service.clone();
                        let kill = kill.resubscribe();
                        tokio::spawn(handle_connection(stream, service, kill, peer.to_string()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = kill.recv() => {
                info!("listener shutting down");
                return;
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    service: Arc<RpcService>,
    mut kill: broadcast::Receiver<()>,
    peer: String,
) {
    let mut conn = Connection::new(stream);
    loop {
        let call = tokio::select! {
            call = conn.read_call() => call,
            _ = kill.recv() => return,
        };
        let Call { method, request } = match call {
            Ok(Some(call)) => call,
            Ok(None) => return,
            Err(e) => {
                warn!(peer, error = %e, "connection read failed");
                return;
            }
        };
        let reply = service.handle(method, request);
        if let Err(e) = conn.write_reply(&reply).await {
            warn!(peer, error = %e, "connection write failed");
            return;
        }
    }
}
