use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use wirepas_ipv6_bridge::bridge::Bridge;
use wirepas_ipv6_bridge::config::Cli;
use wirepas_ipv6_bridge::mesh;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Cli::parse().into_bridge_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let sink_manager: Arc<dyn mesh::SinkManager> = mesh::connect_sdk();

    info!(interface = %config.external_interface, "starting wirepas-ipv6-bridge");
    let bridge = match Bridge::start(config, sink_manager) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "failed to start bridge");
            error!("do you have root privileges? try running with 'sudo'.");
            std::process::exit(1);
        }
    };

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
    }

    bridge.shutdown();
    info!("bridge stopped");
}
