//! Console HTTP API.
//!
//! The console is how external producers hand events to cascade without
//! speaking the broker protocol themselves: `POST /events` publishes a
//! payload as the source event of a (possibly minted) sequence.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use cascade_bus::{BusClient, CHANNEL_NOTIFY, SOURCE_EVENT_ID};

#[derive(Clone)]
struct AppState {
    client: Arc<BusClient>,
}

/// Serve the console API until the token is cancelled.
pub async fn serve(
    address: &str,
    client: Arc<BusClient>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState { client };

    let app = Router::new()
        .route("/health", get(health))
        .route("/events", post(publish_event))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %address, "Console available");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    if state.client.is_connected() {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "disconnected",
                version: env!("CARGO_PKG_VERSION"),
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
struct PublishEventRequest {
    /// Sequence to extend; minted when absent.
    sequence_id: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PublishEventResponse {
    sequence_id: String,
    sent: bool,
}

async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishEventRequest>,
) -> Result<Json<PublishEventResponse>, (StatusCode, String)> {
    let sequence_id = request
        .sequence_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let payload = serde_json::to_vec(&request.payload)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let publication = state
        .client
        .publish(payload, &[CHANNEL_NOTIFY, &sequence_id, SOURCE_EVENT_ID])
        .await
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;

    Ok(Json(PublishEventResponse {
        sequence_id,
        sent: publication.was_sent(),
    }))
}
