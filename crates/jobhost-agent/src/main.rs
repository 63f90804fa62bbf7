use jobhost_agent::{AgentConfig, JobManager, health_service, job_service};
use tonic::transport::Server;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env()?;
    let addr = config.listen_addr;
    tracing::info!(
        %addr,
        data_root = %config.data_root.display(),
        stop_grace_ms = config.stop_grace.as_millis() as u64,
        "jobhost-agent gRPC listening"
    );

    let manager = JobManager::new(config);

    Server::builder()
        .add_service(health_service::server(manager.clone()))
        .add_service(job_service::server(manager.clone()))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    tracing::info!("shutting down; stopping live jobs");
    manager.shutdown().await;
    Ok(())
}
