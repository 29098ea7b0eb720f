//! The inbound HTTP surface: `POST /query`, `GET /query` and `/health`.

use std::sync::Arc;

use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use http::HeaderMap;
use serde::Deserialize;
use tracing::info;

use crate::gateway::Gateway;
use crate::graphql;

pub fn app(gateway: Arc<Gateway>) -> Router {
    let body_limit = axum::extract::DefaultBodyLimit::max(gateway.config.max_file_upload_size);
    Router::new()
        .route("/query", post(post_query).get(get_query))
        .route("/health", get(health))
        .layer(body_limit)
        .with_state(gateway)
}

async fn post_query(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<graphql::Request>,
) -> Json<graphql::Response> {
    Json(gateway.handle_request(request, &headers).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    query: String,
    operation_name: Option<String>,
    /// JSON-encoded variables object.
    variables: Option<String>,
}

async fn get_query(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(params): Query<GetParams>,
) -> Json<graphql::Response> {
    let variables = params
        .variables
        .as_deref()
        .and_then(|raw| serde_json::from_str::<graphql::Object>(raw).ok())
        .unwrap_or_default();
    let request = graphql::Request {
        query: params.query,
        operation_name: params.operation_name,
        variables,
    };
    Json(gateway.handle_request(request, &headers).await)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    if gateway.snapshot().await.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serves until SIGTERM or ctrl-c, then drains in-flight requests.
pub async fn serve(gateway: Arc<Gateway>, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "gateway listening");
    axum::serve(listener, app(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
}
