use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use machineset_controller::controller_manager::ControllerManager;
use machineset_controller::events::KubeEventRecorder;
use machineset_controller::leader::LeaderElector;
use machineset_controller::opts::Opts;
use machineset_controller::serve::{self, Health};
use machineset_controller::store::KubeStore;
use tokio::sync::watch;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const CONTROLLER_NAME: &str = "machineset-controller";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(log_filter)
        .init();

    info!(?opts, "Starting");
    let client = Client::try_default()
        .await
        .context("failed to build kubernetes client")?;
    let identity = opts.identity();

    let store = Arc::new(KubeStore::new(client.clone(), opts.api_timeout()));
    let recorder = Arc::new(KubeEventRecorder::new(
        client.clone(),
        CONTROLLER_NAME,
        Some(identity),
    ));
    let manager = ControllerManager::new(store, recorder, opts.manager_config());

    let leading = Arc::new(AtomicBool::new(!opts.leader_elect));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve::serve(
        opts.health_addr,
        Health::new(manager.subscribe(), Arc::clone(&leading)),
        async move {
            let _ = shutdown_rx.changed().await;
        },
    ));

    let elector = opts
        .leader_elect
        .then(|| LeaderElector::new(client.clone(), opts.leader_election_config()));
    if let Some(elector) = &elector {
        tokio::select! {
            _ = elector.acquire() => leading.store(true, Ordering::Relaxed),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted before acquiring leadership");
                let _ = shutdown_tx.send(true);
                return Ok(());
            }
        }
    }

    let lease_lost = Arc::new(AtomicBool::new(false));
    let stop = {
        let lease_lost = Arc::clone(&lease_lost);
        let leading = Arc::clone(&leading);
        let elector = elector.clone();
        async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(error = %e, "Failed to listen for interrupt");
                    }
                    info!("Interrupted");
                }
                _ = hold(elector.as_ref()) => {
                    leading.store(false, Ordering::Relaxed);
                    lease_lost.store(true, Ordering::Relaxed);
                    error!("Lost leadership");
                }
            }
        }
    };
    manager.run(stop).await;

    let _ = shutdown_tx.send(true);
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
    }

    if lease_lost.load(Ordering::Relaxed) {
        anyhow::bail!("leadership lost");
    }
    if let Some(elector) = &elector {
        elector
            .release()
            .await
            .context("failed to release leadership")?;
    }
    Ok(())
}

async fn hold(elector: Option<&LeaderElector>) {
    match elector {
        Some(elector) => elector.hold().await,
        None => futures::future::pending().await,
    }
}
