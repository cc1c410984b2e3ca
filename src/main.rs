use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use tunnel_manager::config::{self, TunnelConfig};
use tunnel_manager::runtime::PodmanRuntime;
use tunnel_manager::server::{self, AppState};
use tunnel_manager::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let s = config::settings();
    let tunnel_config = TunnelConfig::from_settings(s);
    let runtime = Arc::new(PodmanRuntime::new(
        s.container_runtime.as_str(),
        tunnel_config.runtime_call_deadline,
    ));
    let supervisor = Arc::new(Supervisor::new(runtime, tunnel_config));

    // Re-attach monitors to containers that survived a server restart
    let attached = supervisor.reconcile().await;
    tracing::info!(attached, "Startup reconciliation complete");

    let app = server::router(AppState {
        supervisor: supervisor.clone(),
        prometheus: Some(prometheus_handle),
    });

    let listener = tokio::net::TcpListener::bind(&s.listen_addr).await?;
    tracing::info!("Listening on {}", s.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
