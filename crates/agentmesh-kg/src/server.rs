//! HTTP endpoint serving any [`TripleStore`] backend.

use crate::query::Query;
use crate::store::TripleStore;
use crate::wire::{ErrorBody, QueryRequest, QueryResponse, UpdateRequest, UpdateResponse};
use agentmesh_core::StoreError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

type SharedStore = Arc<dyn TripleStore>;

pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/query", post(query_handler))
        .route("/update", post(update_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

pub async fn serve(store: SharedStore, addr: SocketAddr) -> std::io::Result<()> {
    let location = store.location();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Triple store endpoint listening on http://{}", listener.local_addr()?);
    info!("  Backend: {}", location);
    axum::serve(listener, router(store)).await
}

struct ApiError(StoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, position) = match &self.0 {
            StoreError::Parse { position, .. } => (StatusCode::BAD_REQUEST, Some(*position)),
            StoreError::Json(_) => (StatusCode::BAD_REQUEST, None),
            StoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, None),
            StoreError::Network(_) | StoreError::Protocol(_) => (StatusCode::BAD_GATEWAY, None),
            StoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            position,
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

async fn query_handler(
    State(store): State<SharedStore>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let query = Query::parse(&request.query)?;
    let rows = store
        .execute_query(&query, request.timeout_ms.map(Duration::from_millis))
        .await?;
    let vars = if query.select.is_empty() {
        let all: BTreeSet<&String> = rows.iter().flat_map(|r| r.vars()).collect();
        all.into_iter().cloned().collect()
    } else {
        query.select.clone()
    };
    Ok(Json(QueryResponse::from_rows(vars, &rows)))
}

async fn update_handler(
    State(store): State<SharedStore>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, ApiError> {
    let update = request.update.into_update()?;
    let receipt = store
        .apply_update(&update, request.timeout_ms.map(Duration::from_millis))
        .await?;
    Ok(Json(UpdateResponse::from(&receipt)))
}

async fn health_handler(State(store): State<SharedStore>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": store.location(),
    }))
}
