//! HTTP API handlers and routes using axum.
//!
//! Routes:
//! - GET /health - Connection state and statistics
//! - GET /stats - Merge statistics
//! - GET /records/{topic} - Every canonical record of a topic
//! - GET /records/{topic}/{key} - One record (entity id, or command id)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::stream::Topic;
use connection::{ConnectionState, ConnectionStats};
use merge::{CanonicalRecord, MergeEngine};
use serde::Serialize;
use std::sync::Arc;
use subscription::{SubscriptionDescriptor, SubscriptionRegistry};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SubscriptionRegistry,
    pub engine: MergeEngine,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/records/{topic}", get(list_records_handler))
        .route("/records/{topic}/{key}", get(get_record_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionView {
    #[serde(flatten)]
    descriptor: SubscriptionDescriptor,
    active: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    /// "ok" once authenticated, "degraded" otherwise.
    status: &'static str,
    connection: ConnectionState,
    stats: ConnectionStats,
    last_error: Option<String>,
    subscriptions: Vec<SubscriptionView>,
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = state.registry.connection();
    let current = connection.state();
    let subscriptions = state
        .registry
        .desired()
        .into_iter()
        .map(|descriptor| SubscriptionView {
            active: state.registry.is_active(descriptor.topic),
            descriptor,
        })
        .collect();

    Json(HealthResponse {
        status: if current == ConnectionState::Authenticated {
            "ok"
        } else {
            "degraded"
        },
        connection: current,
        stats: connection.stats(),
        last_error: connection.last_error(),
        subscriptions,
    })
}

/// GET /stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.stats())
}

/// GET /records/{topic}
async fn list_records_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Json<Vec<CanonicalRecord>>, ApiError> {
    let topic = parse_topic(&topic)?;
    let mut records = state.engine.get_all(topic);
    records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    Ok(Json(records))
}

/// GET /records/{topic}/{key}
async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path((topic, key)): Path<(String, String)>,
) -> Result<Json<CanonicalRecord>, ApiError> {
    let topic = parse_topic(&topic)?;
    match state.engine.get_for_entity(topic, &key) {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(format!(
            "No {} record for '{}'",
            topic, key
        ))),
    }
}

fn parse_topic(raw: &str) -> Result<Topic, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Unknown topic '{}'", raw)))
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error types.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::stream::{Position, StreamEvent, StreamPayload};
    use connection::{ConnectionConfig, ConnectionManager, MemoryTransport};
    use merge::MergeConfig;
    use serde_json::Value;
    use std::time::Duration;
    use subscription::Scope;

    async fn serve() -> (String, AppState) {
        let connection = ConnectionManager::new(
            ConnectionConfig::default(),
            Arc::new(MemoryTransport::new()),
        );
        let engine = MergeEngine::new(MergeConfig {
            throttle: Duration::ZERO,
            ..Default::default()
        });
        let registry = SubscriptionRegistry::new(connection, Arc::new(engine.clone()));
        let state = AppState { registry, engine };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_health_reports_deferred_subscriptions() {
        let (base, state) = serve().await;
        state.registry.subscribe(Topic::Positions, Scope::All);

        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["connection"], "disconnected");
        assert_eq!(body["subscriptions"][0]["topic"], "position-updates");
        assert_eq!(body["subscriptions"][0]["active"], false);
    }

    #[tokio::test]
    async fn test_records_routes() {
        let (base, state) = serve().await;
        state.engine.ingest(StreamEvent::new(
            "d1",
            StreamPayload::Position(Position {
                latitude: 47.1,
                longitude: 8.5,
                altitude: 120.0,
                heading: 90.0,
                speed: 12.0,
            }),
            1_000,
        ));

        let list: Value = reqwest::get(format!("{}/records/positions", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.as_array().map(Vec::len), Some(1));

        let one: Value = reqwest::get(format!("{}/records/position-updates/d1", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(one["entityId"], "d1");
        assert_eq!(one["payload"]["latitude"], 47.1);
        assert_eq!(one["source"], "stream");

        let missing = reqwest::get(format!("{}/records/positions/d2", base)).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);
        let unknown = reqwest::get(format!("{}/records/weather", base)).await.unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let stats: Value = reqwest::get(format!("{}/stats", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["topics"]["position-updates"]["applied"], 1);
    }
}
