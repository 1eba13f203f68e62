//! Error taxonomy for the alert fanout pipeline.
//!
//! The pipeline distinguishes errors by where they stop processing:
//!
//! - [`FanoutError::InvalidPayload`] rejects the request before any side
//!   effect is attempted.
//! - [`FanoutError::ResolutionUnavailable`] aborts the push branch only;
//!   the broadcast branch is unaffected.
//! - [`FanoutError::DispatchUnavailable`] fails the whole dispatch call;
//!   an already-published broadcast stands.
//! - Per-token delivery failures are *not* errors; they are recorded in
//!   the [`DeliveryReport`](crate::model::DeliveryReport) and returned to
//!   the caller.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised by the fanout pipeline and the identity token issuer.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The inbound alert record is missing a required field or carries an
    /// out-of-range value. Nothing downstream has run.
    #[error("invalid payload: missing or out-of-range field `{field}`")]
    InvalidPayload { field: &'static str },

    /// The geodata store could not answer the radius query. Distinct from
    /// a valid empty result: callers must not treat this as "zero neighbors".
    #[error("neighbor resolution unavailable: {0}")]
    ResolutionUnavailable(String),

    /// The push provider is unreachable or rejected our credentials.
    /// Fatal for the whole dispatch call, unlike per-token failures.
    #[error("push dispatch unavailable: {0}")]
    DispatchUnavailable(String),

    /// The realtime broadcast channel could not accept the event.
    /// Always demoted to a warning by the pipeline; never fatal.
    #[error("broadcast publish failed: {0}")]
    BroadcastFailed(String),

    /// An identity token's validity window has elapsed (`now >= exp`).
    #[error("identity token expired")]
    TokenExpired,

    /// An identity token failed structural or signature checks.
    #[error("identity token malformed: {0}")]
    TokenMalformed(String),

    /// Underlying database failure outside the resolution path.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl FanoutError {
    /// HTTP status the API layer maps this error to.
    pub fn status(&self) -> StatusCode {
        match self {
            FanoutError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            FanoutError::ResolutionUnavailable(_) | FanoutError::DispatchUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            FanoutError::TokenExpired | FanoutError::TokenMalformed(_) => StatusCode::UNAUTHORIZED,
            FanoutError::BroadcastFailed(_) | FanoutError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
