//! Data models for the alert fanout pipeline.
//!
//! The central type is [`EmergencyEvent`], an immutable value representing
//! one SOS occurrence. It is created at ingestion by
//! [`EmergencyEvent::from_request`], the mandatory validation gate, and
//! discarded once the pipeline run completes. Nothing in this core persists
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FanoutError;

/// Classification of an emergency event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertKind {
    /// A personal SOS raised by a victim.
    Sos,
    /// A general security incident.
    Security,
}

impl AlertKind {
    /// Parse the wire `type` field. Unrecognized or absent values fall back
    /// to the generic `Security` classification rather than failing.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("SOS") => AlertKind::Sos,
            _ => AlertKind::Security,
        }
    }

    /// Fixed notification title for this kind.
    pub fn title(&self) -> &'static str {
        match self {
            AlertKind::Sos => "\u{1F198} SOS Alert!",
            AlertKind::Security => "\u{26A0}\u{FE0F} Security Alert",
        }
    }

    /// Wire representation used in push data payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Sos => "SOS",
            AlertKind::Security => "SECURITY",
        }
    }
}

/// One validated SOS occurrence. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyEvent {
    /// Opaque unique identifier for this alert.
    pub alert_id: String,

    /// Event classification.
    pub kind: AlertKind,

    /// The user who raised the alert. Their own devices are excluded
    /// from the notification fanout.
    pub reporter_id: String,

    /// WGS-84 latitude in degrees, within [-90, 90].
    pub latitude: f64,

    /// WGS-84 longitude in degrees, within [-180, 180].
    pub longitude: f64,

    /// When the event was ingested (server-assigned, UTC).
    pub occurred_at: DateTime<Utc>,
}

/// Raw inbound trigger body for POST /alerts.
///
/// Both historical field spellings are accepted: `emergency_id` or
/// `alert_id`, and `victim_id` or `user_id`. All core fields are optional
/// here so that absence is reported as a named validation failure instead
/// of a deserialization error.
#[derive(Debug, Clone, Deserialize)]
pub struct RawAlertRequest {
    /// Alert identifier.
    #[serde(alias = "emergency_id")]
    pub alert_id: Option<String>,

    /// WGS-84 latitude in degrees.
    pub latitude: Option<f64>,

    /// WGS-84 longitude in degrees.
    pub longitude: Option<f64>,

    /// The reporting user.
    #[serde(alias = "user_id")]
    pub victim_id: Option<String>,

    /// Alert classification; unrecognized values map to `SECURITY`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl EmergencyEvent {
    /// Validate a raw inbound record into a typed event.
    ///
    /// Pure and total: no network, no database, no side effects. Fails with
    /// [`FanoutError::InvalidPayload`] naming the first missing or
    /// out-of-range field. This gate runs before either fanout branch.
    pub fn from_request(
        raw: RawAlertRequest,
        now: DateTime<Utc>,
    ) -> Result<EmergencyEvent, FanoutError> {
        let alert_id = match raw.alert_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(FanoutError::InvalidPayload { field: "alert_id" }),
        };

        let latitude = match raw.latitude {
            Some(lat) if lat.is_finite() && (-90.0..=90.0).contains(&lat) => lat,
            _ => return Err(FanoutError::InvalidPayload { field: "latitude" }),
        };

        let longitude = match raw.longitude {
            Some(lng) if lng.is_finite() && (-180.0..=180.0).contains(&lng) => lng,
            _ => return Err(FanoutError::InvalidPayload { field: "longitude" }),
        };

        let reporter_id = match raw.victim_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(FanoutError::InvalidPayload { field: "victim_id" }),
        };

        Ok(EmergencyEvent {
            alert_id,
            kind: AlertKind::from_wire(raw.kind.as_deref()),
            reporter_id,
            latitude,
            longitude,
            occurred_at: now,
        })
    }
}

/// One device eligible for push notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeighborCandidate {
    /// Opaque push-provider token.
    pub token: String,

    /// Great-circle distance from the alert origin, informational only.
    pub distance_meters: Option<f64>,
}

/// Aggregate result of dispatching all batches for one alert.
///
/// Invariant: `success_count + failure_count` equals the total number of
/// tokens dispatched, for any mix of per-batch outcomes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    /// Tokens the provider accepted.
    pub success_count: usize,

    /// Tokens that failed, including every token of a batch whose
    /// transport failed outright.
    pub failure_count: usize,

    /// Tokens the provider reports as permanently unregistered. Candidates
    /// for external cleanup; never retried here.
    pub invalid_tokens: Vec<String>,
}

impl DeliveryReport {
    /// Fold another partial report into this one.
    pub fn absorb(&mut self, other: DeliveryReport) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.invalid_tokens.extend(other.invalid_tokens);
    }

    /// Total tokens accounted for.
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count
    }
}

/// Response body for POST /alerts.
#[derive(Debug, Clone, Serialize)]
pub struct AlertResponse {
    /// Whether the alert was accepted and the push branch completed.
    pub success: bool,

    /// Human-readable summary on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Error description on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Delivery accounting on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryReport>,
}

impl AlertResponse {
    /// Successful outcome with its delivery accounting.
    pub fn ok(message: String, delivery: DeliveryReport) -> Self {
        Self {
            success: true,
            message: Some(message),
            error: None,
            delivery: Some(delivery),
        }
    }

    /// Failed outcome with an error description.
    pub fn err(error: String) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error),
            delivery: None,
        }
    }
}

/// Request body for POST /devices: the minimal registration surface the
/// neighbor resolver reads. Token lifecycle beyond upsert is external.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceUpsertRequest {
    /// Owning user.
    pub user_id: String,

    /// Push-provider token, unique per device.
    pub token: String,

    /// Last known latitude.
    pub latitude: f64,

    /// Last known longitude.
    pub longitude: f64,
}
