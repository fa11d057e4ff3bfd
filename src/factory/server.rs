//! Builds the axum `Router` and drives the HTTP server process: binds
//! the listener, wires CORS, mounts the REST surface plus the SSE
//! streamer, and waits for Ctrl+C before draining in-flight builds.
//!
//! Grounded in the teacher's `server.rs` shape (`ServerConfig`,
//! `build_router`, `start_server`, `shutdown_signal`); the SPA static
//! file fallback and `/ws` broadcast route are dropped since this
//! service has no bundled frontend and streams over SSE instead of
//! WebSocket (spec §4.9/§6).

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, SharedState};
use super::config::OrchestratorConfig;
use super::db::DbHandle;
use super::object_store::{LocalObjectStore, ObjectStoreAdapter};
use super::orchestrator::{BuildRegistry, Orchestrator};
use super::sandbox::{DockerSandboxManager, SandboxConfig};
use super::sse::{self, SseState};

/// Full application router: the REST surface from `api::api_router`
/// plus the SSE stream endpoint, merged as two independently-stated
/// sub-routers since they close over different state types.
pub fn build_router(orchestrator: SharedState) -> Router {
    let sse_state = SseState {
        db: orchestrator.db_handle(),
        registry: orchestrator.registry(),
    };

    let sse_router: Router<()> = Router::new()
        .route(
            "/builds/:id/stream",
            axum::routing::get(sse::stream_handler::<BuildRegistry>),
        )
        .with_state(sse_state);

    api::api_router()
        .with_state(orchestrator)
        .merge(sse_router)
}

/// Build the `Orchestrator` and its dependencies from config, ensuring
/// the Docker daemon is reachable before the server accepts traffic —
/// unlike the teacher's optional `FORGE_SANDBOX` toggle, this service
/// has no non-sandboxed execution path (spec §4.4: every tool call runs
/// inside the sandbox, never on the host).
async fn build_orchestrator(config: &OrchestratorConfig) -> Result<SharedState> {
    config.ensure_directories()?;

    let db = DbHandle::new(&config.db_path).context("failed to open orchestrator database")?;

    let sandbox_manager = DockerSandboxManager::new(config.sandbox_image.clone())
        .await
        .context("Docker is not reachable; the orchestrator cannot provision sandboxes without it")?;

    let object_store = build_object_store(config).await;

    Ok(Arc::new(Orchestrator::new(
        db,
        Arc::new(BuildRegistry::new()),
        Arc::new(sandbox_manager),
        SandboxConfig {
            image: Some(config.sandbox_image.clone()),
            timeout: config.sandbox_timeout_secs,
            ..SandboxConfig::default()
        },
        Some(object_store),
    )))
}

/// S3-backed storage when a bucket is configured and the `s3` feature is
/// compiled in; a filesystem store under `data_dir/artifacts` otherwise.
#[cfg(feature = "s3")]
async fn build_object_store(config: &OrchestratorConfig) -> Arc<dyn ObjectStoreAdapter> {
    if let Some(bucket) = &config.object_store_bucket {
        return Arc::new(super::object_store::S3ObjectStore::new(bucket.clone()).await);
    }
    Arc::new(LocalObjectStore::new(config.data_dir.join("artifacts")))
}

#[cfg(not(feature = "s3"))]
async fn build_object_store(config: &OrchestratorConfig) -> Arc<dyn ObjectStoreAdapter> {
    Arc::new(LocalObjectStore::new(config.data_dir.join("artifacts")))
}

/// Start the orchestrator HTTP server and run until shutdown.
pub async fn start_server(config: OrchestratorConfig) -> Result<()> {
    let cors_permissive = config.cors_permissive;
    let bind_addr = config.bind_addr.clone();

    let orchestrator = build_orchestrator(&config).await?;
    let mut app = build_router(orchestrator);

    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "build orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install ctrl+c handler");
        return;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_router() -> Option<Router> {
        let manager = DockerSandboxManager::new("forge-build:test".to_string()).await?;
        let db = DbHandle::new_in_memory().unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            db,
            Arc::new(BuildRegistry::new()),
            Arc::new(manager),
            SandboxConfig::default(),
            None,
        ));
        Some(build_router(orchestrator))
    }

    #[tokio::test]
    async fn health_route_is_mounted() {
        let Some(app) = test_router().await else { return };
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_route_for_unknown_build_is_404() {
        let Some(app) = test_router().await else { return };
        let req = Request::builder()
            .uri(format!("/builds/{}/stream", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
