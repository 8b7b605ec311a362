//! kdeploy Kubernetes Operator binary.
//!
//! Runs the Release controller until SIGINT or SIGTERM.

use clap::Parser;
use kdeploy_operator::config::OperatorConfig;
use kdeploy_operator::controller::{Controller, ControllerContext};
use kdeploy_operator::error::OperatorError;
use kdeploy_operator::registrar::ResourceTypeDescriptor;
use kdeploy_operator::telemetry::init_tracing;
use kube::Client;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.generate_crds {
        generate_crds()?;
        return Ok(());
    }

    init_tracing(&config.tracing_config())?;
    config.validate()?;

    tracing::info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "Starting kdeploy operator"
    );

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let controller = Controller::new(
        ControllerContext::from_client(client),
        config.controller_config(),
    );

    match controller.run(cancel).await {
        Ok(()) | Err(OperatorError::Cancelled) => {
            tracing::info!("Operator shut down");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Operator failed");
            Err(e.into())
        }
    }
}

/// Cancel on the first SIGINT/SIGTERM. Later signals are logged and ignored.
async fn shutdown_on_signal(cancel: CancellationToken) {
    loop {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
            cancel.cancel();
            return;
        }
        if cancel.is_cancelled() {
            tracing::warn!("Shutdown already in progress");
        } else {
            tracing::info!("Shutdown signal received");
            cancel.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Print the Release CRD, as registered at startup, as YAML.
fn generate_crds() -> anyhow::Result<()> {
    let crd = ResourceTypeDescriptor::for_release().build();
    println!("---");
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
