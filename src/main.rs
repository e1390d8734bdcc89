#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use cache::ClusterCache;
use config::ControllerConfig;
use controller::EndpointsController;
use error::Result;
use gateway::GatewayRegistry;
use lease::LeaseElector;

pub mod cache;
pub mod config;
pub mod consts;
pub mod controller;
pub mod crd;
pub mod destination;
pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod tracker;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ControllerConfig::parse();
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    tracing::info!(
        "Starting external-endpoints-controller v{}",
        env!("CARGO_PKG_VERSION")
    );
    let client = kube::Client::try_default().await?;
    tracing::info!("Kube client is connected");

    metrics::register_all();
    let cache = ClusterCache::spawn(&client);
    let (signal, shutdown) = drain::channel();

    // Gateway bookkeeping and the discovery resolver follow the caches for
    // the whole process lifetime, leader or not.
    let gateways = Arc::new(GatewayRegistry::new());
    gateways.attach(&cache.service_handlers);

    let ready = Arc::new(AtomicBool::new(false));
    let admin_state = metrics::AdminState {
        ready: ready.clone(),
        gateways: gateways.clone(),
    };
    let admin_shutdown = shutdown.clone();
    let admin_addr = config.admin_addr;
    tokio::spawn(async move {
        if let Err(error) = metrics::serve_admin(admin_addr, admin_state, admin_shutdown).await {
            tracing::error!(%error, "Admin server failed");
        }
    });

    let resolver = destination::DestinationService::new(
        cache.clone(),
        config.cluster_domain.clone(),
    );
    let grpc_shutdown = shutdown.clone();
    let grpc_addr = config.grpc_addr;
    tokio::spawn(async move {
        if let Err(error) = destination::serve(grpc_addr, resolver, grpc_shutdown).await {
            tracing::error!(%error, "Destination server failed");
        }
    });

    // Slice writes are single-holder: the elector publishes leadership and
    // the controller follows it.
    let (leadership_tx, leadership_rx) = watch::channel(false);
    let elector = LeaseElector::new(
        client.clone(),
        &config.controller_namespace,
        ControllerConfig::identity(),
    );
    tokio::spawn(elector.run(leadership_tx, shutdown.clone()));

    let controller = EndpointsController::new(client, cache.clone(), config.workers);
    tokio::spawn(controller.run(leadership_rx, shutdown.clone()));
    drop(shutdown);

    cache.wait_ready().await;
    ready.store(true, Ordering::Relaxed);
    tracing::info!("Informer caches are synced");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received"),
    }

    // Release the lease, drain the queue, close the streams; drain() waits
    // for all of it.
    signal.drain().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
