//! HTTP API handlers for Beacon.
//!
//! - **POST /alerts**: inbound emergency trigger; validates, then runs the
//!   two-branch fanout. The caller always gets a definitive success/failure
//!   body; zero recipients is reported, never silently dropped.
//! - **POST /devices**: device registration upsert (the minimal surface the
//!   neighbor resolver reads).
//! - **POST /identity/token**: issue a rank-annotated identity token.
//! - **GET /health**: health check.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::broadcast::ChannelPublisher;
use crate::geo::StoreResolver;
use crate::identity::{TokenIssuer, TokenWire};
use crate::model::{AlertResponse, DeviceUpsertRequest, EmergencyEvent, RawAlertRequest};
use crate::pipeline;
use crate::push::PushProvider;
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState<P> {
    pub storage: Storage,
    pub publisher: ChannelPublisher,
    pub provider: P,
    pub issuer: TokenIssuer,
}

/// Build the application router over any push provider implementation.
pub fn router<P>(state: AppState<P>) -> Router
where
    P: PushProvider + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/alerts", post(post_alert::<P>))
        .route("/devices", post(post_device::<P>))
        .route("/identity/token", post(post_identity_token::<P>))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /alerts - Trigger the fanout pipeline for one emergency event.
///
/// # Request Body
///
/// ```json
/// {
///     "alert_id": "A1",
///     "latitude": 10.0,
///     "longitude": 20.0,
///     "victim_id": "U1",
///     "type": "SOS"
/// }
/// ```
///
/// `emergency_id`/`user_id` are accepted as aliases. Returns 200 with the
/// delivery report on success, 400 on validation failure, 502 when the
/// geodata store or push provider is unavailable.
#[instrument(skip(state, raw))]
pub async fn post_alert<P>(
    State(state): State<AppState<P>>,
    Json(raw): Json<RawAlertRequest>,
) -> (StatusCode, Json<AlertResponse>)
where
    P: PushProvider + Clone + Send + Sync + 'static,
{
    // Validation gate: nothing downstream runs on a malformed payload.
    let event = match EmergencyEvent::from_request(raw, Utc::now()) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Alert payload rejected");
            return (
                StatusCode::BAD_REQUEST,
                Json(AlertResponse::err(e.to_string())),
            );
        }
    };

    let resolver = StoreResolver::new(state.storage.clone());

    match pipeline::run_alert(&resolver, &state.publisher, &state.provider, &event).await {
        Ok(outcome) => {
            info!(
                alert_id = %event.alert_id,
                success = outcome.report.success_count,
                failure = outcome.report.failure_count,
                invalid = outcome.report.invalid_tokens.len(),
                "Alert fanout complete"
            );

            let message = match &outcome.broadcast_warning {
                Some(w) => format!("Alert dispatched; broadcast degraded: {w}"),
                None => "Alert dispatched".to_string(),
            };

            (
                StatusCode::OK,
                Json(AlertResponse::ok(message, outcome.report)),
            )
        }
        Err(e) => {
            warn!(alert_id = %event.alert_id, error = %e, "Alert fanout failed");
            (e.status(), Json(AlertResponse::err(e.to_string())))
        }
    }
}

/// POST /devices - Register or refresh a device token and position.
#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn post_device<P>(
    State(state): State<AppState<P>>,
    Json(request): Json<DeviceUpsertRequest>,
) -> impl IntoResponse
where
    P: PushProvider + Clone + Send + Sync + 'static,
{
    match state
        .storage
        .upsert_device(
            &request.user_id,
            &request.token,
            request.latitude,
            request.longitude,
            Utc::now(),
        )
        .await
    {
        Ok(()) => {
            info!(user_id = %request.user_id, "Device registered");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(user_id = %request.user_id, error = %e, "Device registration failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Request body for POST /identity/token.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// The subject to issue for.
    pub subject_id: String,
}

/// POST /identity/token - Issue a rank-annotated identity token.
///
/// The response is the token wire format; rendering it into a scannable
/// code is the client's concern.
#[instrument(skip(state, request))]
pub async fn post_identity_token<P>(
    State(state): State<AppState<P>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenWire>, StatusCode>
where
    P: PushProvider + Clone + Send + Sync + 'static,
{
    match state
        .issuer
        .issue(&state.storage, &request.subject_id, Utc::now())
        .await
    {
        Ok(token) => {
            info!(
                subject = %token.subject_id,
                rank = token.rank.label(),
                "Identity token issued"
            );
            Ok(Json(token.to_wire()))
        }
        Err(e) => {
            warn!(subject = %request.subject_id, error = %e, "Token issuance failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
