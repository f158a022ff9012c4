//! Funcwave Kubernetes Operator
//!
//! This operator reconciles Function custom resources on Kubernetes.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! funcwave-operator --namespace functions
//!
//! # Run with custom log level
//! RUST_LOG=debug funcwave-operator
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use funcwave_operator::{
    ControllerConfig, ControllerHost, Function, KubeObjectStore, KubeResourceClient,
};
use kube::Client;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Funcwave Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "funcwave-operator")]
#[command(version, about = "Kubernetes Operator for Function resources")]
struct Args {
    /// Namespace to watch for Function resources
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Number of reconciliation workers
    #[arg(long, default_value = "4")]
    num_workers: usize,

    /// Seconds between forced resyncs of all known functions
    #[arg(long, default_value = "600")]
    resync_interval_secs: u64,

    /// Comma-separated image pull secret names for function pods
    #[arg(long, default_value = "")]
    image_pull_secrets: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting Funcwave Kubernetes Operator");
    info!("Watching namespace: {}", args.namespace);
    info!("Workers: {}", args.num_workers);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let store = Arc::new(KubeObjectStore::<Function>::new(client.clone()));
    let resource_client = Arc::new(KubeResourceClient::new(client));

    let host = ControllerHost::new(
        store,
        resource_client,
        ControllerConfig {
            namespace: args.namespace,
            resync_interval: Duration::from_secs(args.resync_interval_secs),
            num_workers: args.num_workers,
            image_pull_secrets: args.image_pull_secrets,
        },
    );

    host.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    host.stop().await;

    info!("Funcwave Operator shutting down");
    Ok(())
}
