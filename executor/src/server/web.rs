use crate::server::state::ServerState;
use crate::{api, db, settings, tasks};
use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{self, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{info, Level};

pub struct Server {}

impl Server {
    pub async fn start() -> Result<()> {
        info!("{} {} (pid={})", env!("CARGO_PKG_DESCRIPTION"), env!("CARGO_PKG_VERSION"), std::process::id());

        // Initialize the operational database
        let db_conn_pool = db::init().await?;

        // Server initialization
        let server = Server {};
        let listener = server.bind().await?;
        server.run(listener, ServerState::new(db_conn_pool)).await
    }

    /// Bind the server to listen_address:port
    async fn bind(&self) -> Result<TcpListener> {
        let listen_addr = format!("{}:{}", settings::get_listen_address(), settings::get_port());
        tokio::net::TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("Unable to bind to the listen address: {}", listen_addr))
    }

    /// Create the API router.
    fn api(state: &ServerState) -> Router {
        let routes = Router::new()
            .merge(api::queries::routes(state.clone()))
            .merge(api::keys::routes(state.clone()))
            .merge(api::publications::routes());

        // all routes are nested under the /v1 path
        Router::new().nest("/v1", routes).route("/health", get(health))
    }

    /// Run the server.
    ///
    /// This function will start the server and will not return until the
    /// server is stopped.
    async fn run(&self, listener: TcpListener, state: ServerState) -> Result<()> {
        // Start the background workers: the engine task queue and the
        // publish consumer.
        state.start().await;
        tasks::publish::spawn_publish_worker(state.clone());

        let api = Self::api(&state).layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().include_headers(false).level(Level::TRACE))
                .on_request(trace::DefaultOnRequest::new().level(Level::TRACE))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO).latency_unit(LatencyUnit::Micros)),
        );

        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, api).with_graceful_shutdown(shutdown_signal()).await?;
        Ok(())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "health check successful" }))
}

/// Configure the signal handlers.
///
/// This function will return when the user presses Ctrl+C or when the process
/// receives a SIGTERM signal, allowing the graceful shutdown of the server.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c =>  { info!("Received Ctrl+C, initiating graceful shutdown.") },
        _ = terminate => { info!("Received SIGTERM, initiating graceful shutdown.") },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionManager, ConnectionPool};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// A state whose pool is never asked for a connection.
    fn test_state() -> ServerState {
        let pool = ConnectionPool::builder(ConnectionManager {
            conn_string: "postgresql://postgres@localhost:5432/never_used".to_string(),
        })
        .build()
        .unwrap();
        ServerState::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_health() {
        let response = Server::api(&test_state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_identity_is_rejected() {
        let response = Server::api(&test_state())
            .oneshot(Request::builder().uri("/v1/queries/g1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_results_limit_is_validated() {
        for query_string in ["limit=0&offset=0", "limit=1001&offset=0", "limit=10&offset=-1"] {
            let response = Server::api(&test_state())
                .oneshot(
                    Request::builder()
                        .uri(format!("/v1/queries/g1/results?{query_string}"))
                        .header(crate::api::X_IDENTITY_ID_HEADER, "u1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
