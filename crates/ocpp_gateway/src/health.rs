use crate::supervisor::{GatewayStats, HealthReport, Supervisor};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(supervisor)
}

async fn health(State(supervisor): State<Arc<Supervisor>>) -> (StatusCode, Json<HealthReport>) {
    let report = supervisor.health().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn stats(State(supervisor): State<Arc<Supervisor>>) -> Json<GatewayStats> {
    Json(supervisor.stats().await)
}

/// Serves `/health` and `/stats` until `shutdown` fires.
pub async fn serve_health(
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "health endpoint listening");
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::InMemoryBridge;
    use crate::registry::SessionRegistry;
    use crate::supervisor::SupervisorSettings;
    use std::sync::atomic::AtomicBool;
    use tokio_util::task::TaskTracker;

    fn supervisor(bridge: Arc<InMemoryBridge>) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            Arc::new(SessionRegistry::default()),
            bridge,
            Arc::new(AtomicBool::new(true)),
            TaskTracker::new(),
            CancellationToken::new(),
            SupervisorSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_health_status_codes() {
        let bridge = Arc::new(InMemoryBridge::connected());
        let sup = supervisor(bridge.clone());

        let (status, Json(report)) = health(State(sup.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.healthy);

        bridge.set_connected(false);
        let (status, Json(report)) = health(State(sup)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_stats_report_empty_gateway() {
        let sup = supervisor(Arc::new(InMemoryBridge::connected()));
        let Json(stats) = stats(State(sup)).await;
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.broker_connections, 1);
    }
}
