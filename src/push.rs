//! Push dispatch engine: batched multicast delivery of one alert.
//!
//! Candidates are partitioned into batches no larger than the provider
//! ceiling, submitted concurrently (bounded, to respect provider rate
//! limits), and the per-batch responses are folded into one
//! [`DeliveryReport`]. Batches are independent: one batch failing never
//! aborts its siblings. The only fatal condition is the provider itself
//! being unavailable or misconfigured.
//!
//! Repeated dispatch for the same `alert_id` is not deduplicated here; an
//! external supervisor owns at-most-one invocation per alert.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::FanoutError;
use crate::geo::DEFAULT_RADIUS_METERS;
use crate::model::{DeliveryReport, EmergencyEvent, NeighborCandidate};

/// Provider-imposed ceiling on tokens per multicast request.
pub const BATCH_CEILING: usize = 500;

/// Maximum concurrent in-flight multicast submissions.
const DISPATCH_CONCURRENCY: usize = 8;

/// Provider error codes marking a token as permanently unregistered.
const INVALID_TOKEN_ERRORS: [&str; 2] = ["NotRegistered", "InvalidRegistration"];

/// Errors from one multicast submission.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider is unreachable as a whole or rejected our credentials.
    /// Fatal for the entire dispatch call.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// This one request failed in transit. Counts every token in the batch
    /// as failed; sibling batches proceed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// One multicast send request, FCM legacy HTTP shape.
#[derive(Debug, Clone, Serialize)]
pub struct MulticastRequest {
    /// Device tokens addressed by this request, at most [`BATCH_CEILING`].
    pub registration_ids: Vec<String>,

    /// Visible notification content.
    pub notification: PushNotification,

    /// Data payload forwarded to the app. Provider constraint: all values
    /// are strings, so numeric fields are serialized as text.
    pub data: HashMap<String, String>,

    /// Platform hint for time-critical delivery.
    pub priority: &'static str,
}

/// Visible title/body pair.
#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

/// Per-token result row, aligned with the request's token order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MulticastResult {
    #[serde(default)]
    pub message_id: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
}

impl MulticastResult {
    /// True when the provider reports the token as permanently
    /// unregistered (cleanup candidate, never retried).
    pub fn is_invalid_token(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| INVALID_TOKEN_ERRORS.contains(&e))
    }
}

/// Provider response for one multicast request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MulticastResponse {
    /// Tokens accepted for delivery.
    #[serde(default)]
    pub success: usize,

    /// Tokens that failed.
    #[serde(default)]
    pub failure: usize,

    /// Per-token results, aligned with the request's token order.
    #[serde(default)]
    pub results: Vec<MulticastResult>,
}

/// External multicast push interface.
pub trait PushProvider: Send + Sync {
    /// Submit one multicast request.
    fn send_multicast(
        &self,
        request: MulticastRequest,
    ) -> impl Future<Output = Result<MulticastResponse, ProviderError>> + Send;
}

/// FCM legacy HTTP client.
#[derive(Clone)]
pub struct FcmClient {
    client: reqwest::Client,
    base_url: String,
    server_key: String,
}

/// Production FCM endpoint.
const FCM_API_BASE: &str = "https://fcm.googleapis.com";

impl FcmClient {
    /// Create a client against the production endpoint.
    pub fn new(server_key: &str) -> Self {
        Self::with_base_url(FCM_API_BASE, server_key)
    }

    /// Create a client with a custom base URL (for testing).
    pub fn with_base_url(base_url: &str, server_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            server_key: server_key.to_string(),
        }
    }
}

impl PushProvider for FcmClient {
    async fn send_multicast(
        &self,
        request: MulticastRequest,
    ) -> Result<MulticastResponse, ProviderError> {
        if self.server_key.is_empty() {
            return Err(ProviderError::Unavailable(
                "push provider server key not configured".to_string(),
            ));
        }

        let url = format!("{}/fcm/send", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Unavailable(format!(
                "push provider rejected credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!(
                "push provider returned {status}"
            )));
        }

        response
            .json::<MulticastResponse>()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

/// Partition candidate tokens into insertion-ordered batches of at most
/// [`BATCH_CEILING`]. The union of all batches equals the input set.
pub fn batch_tokens(candidates: &[NeighborCandidate]) -> Vec<Vec<String>> {
    candidates
        .chunks(BATCH_CEILING)
        .map(|chunk| chunk.iter().map(|c| c.token.clone()).collect())
        .collect()
}

/// Build the multicast request for one batch. All batches of an alert
/// share the same payload; only the token list differs.
pub fn build_multicast_request(event: &EmergencyEvent, tokens: Vec<String>) -> MulticastRequest {
    let mut data = HashMap::new();
    data.insert("alertId".to_string(), event.alert_id.clone());
    data.insert("latitude".to_string(), event.latitude.to_string());
    data.insert("longitude".to_string(), event.longitude.to_string());
    data.insert("type".to_string(), event.kind.as_str().to_string());

    MulticastRequest {
        registration_ids: tokens,
        notification: PushNotification {
            title: event.kind.title().to_string(),
            body: format!(
                "Emergency reported within {:.0} m of your location. Open the app for details.",
                DEFAULT_RADIUS_METERS
            ),
        },
        data,
        priority: "high",
    }
}

/// Dispatch one alert to all candidates and fold the responses into a
/// single [`DeliveryReport`].
///
/// Batch submissions run concurrently, bounded by [`DISPATCH_CONCURRENCY`];
/// inter-batch ordering is not observable and not guaranteed. A transport
/// failure marks every token of that batch failed. Provider unavailability
/// aborts the whole call with [`FanoutError::DispatchUnavailable`].
pub async fn dispatch<P>(
    provider: &P,
    event: &EmergencyEvent,
    candidates: Vec<NeighborCandidate>,
) -> Result<DeliveryReport, FanoutError>
where
    P: PushProvider + Clone + Send + Sync + 'static,
{
    if candidates.is_empty() {
        debug!(alert_id = %event.alert_id, "No neighbors to notify");
        return Ok(DeliveryReport::default());
    }

    let batches = batch_tokens(&candidates);
    let semaphore = Arc::new(Semaphore::new(DISPATCH_CONCURRENCY));
    let mut set = JoinSet::new();

    // Tokens stay on this side of the spawn, keyed by task id, so every
    // batch is accounted for even if its task dies before returning.
    let mut tokens_by_task: HashMap<tokio::task::Id, Vec<String>> = HashMap::new();

    for tokens in batches {
        let provider = provider.clone();
        let semaphore = Arc::clone(&semaphore);
        let request = build_multicast_request(event, tokens.clone());

        let handle = set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            provider.send_multicast(request).await
        });
        tokens_by_task.insert(handle.id(), tokens);
    }

    let mut report = DeliveryReport::default();

    while let Some(joined) = set.join_next_with_id().await {
        let (tokens, outcome) = match joined {
            Ok((id, outcome)) => {
                let tokens = tokens_by_task.remove(&id).unwrap_or_default();
                (tokens, outcome)
            }
            Err(e) => {
                let tokens = tokens_by_task.remove(&e.id()).unwrap_or_default();
                warn!(
                    alert_id = %event.alert_id,
                    batch_size = tokens.len(),
                    error = %e,
                    "Batch dispatch task died; counting its tokens as failed"
                );
                report.failure_count += tokens.len();
                continue;
            }
        };

        match outcome {
            Ok(response) => {
                report.success_count += response.success;
                report.failure_count += response.failure;
                for (token, result) in tokens.iter().zip(response.results.iter()) {
                    if result.is_invalid_token() {
                        report.invalid_tokens.push(token.clone());
                    }
                }
            }
            Err(ProviderError::Unavailable(message)) => {
                set.abort_all();
                return Err(FanoutError::DispatchUnavailable(message));
            }
            Err(ProviderError::Transport(message)) => {
                warn!(
                    alert_id = %event.alert_id,
                    batch_size = tokens.len(),
                    error = %message,
                    "Multicast batch failed in transit"
                );
                report.failure_count += tokens.len();
            }
        }
    }

    debug!(
        alert_id = %event.alert_id,
        success = report.success_count,
        failure = report.failure_count,
        invalid = report.invalid_tokens.len(),
        "Dispatch complete"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawAlertRequest;
    use chrono::Utc;
    use std::collections::HashSet;

    fn event(kind: &str) -> EmergencyEvent {
        EmergencyEvent::from_request(
            RawAlertRequest {
                alert_id: Some("A1".into()),
                latitude: Some(10.0),
                longitude: Some(20.0),
                victim_id: Some("U1".into()),
                kind: Some(kind.into()),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn candidates(prefix: &str, count: usize) -> Vec<NeighborCandidate> {
        (0..count)
            .map(|i| NeighborCandidate {
                token: format!("{prefix}-{i}"),
                distance_meters: None,
            })
            .collect()
    }

    /// Deterministic mock: tokens prefixed `net` fail their whole batch in
    /// transit, `stale` tokens come back NotRegistered, `down` tokens make
    /// the provider unavailable, everything else succeeds.
    #[derive(Clone)]
    struct RuleProvider;

    impl PushProvider for RuleProvider {
        async fn send_multicast(
            &self,
            request: MulticastRequest,
        ) -> Result<MulticastResponse, ProviderError> {
            if request.registration_ids.iter().any(|t| t.starts_with("down")) {
                return Err(ProviderError::Unavailable("bad credentials".into()));
            }
            if request.registration_ids.iter().any(|t| t.starts_with("net")) {
                return Err(ProviderError::Transport("connection reset".into()));
            }

            let results: Vec<MulticastResult> = request
                .registration_ids
                .iter()
                .map(|t| {
                    if t.starts_with("stale") {
                        MulticastResult {
                            message_id: None,
                            error: Some("NotRegistered".into()),
                        }
                    } else {
                        MulticastResult {
                            message_id: Some(format!("msg-{t}")),
                            error: None,
                        }
                    }
                })
                .collect();

            let failure = results.iter().filter(|r| r.error.is_some()).count();
            Ok(MulticastResponse {
                success: results.len() - failure,
                failure,
                results,
            })
        }
    }

    #[test]
    fn test_batching_splits_at_ceiling() {
        let input = candidates("tok", 1200);
        let batches = batch_tokens(&input);

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= BATCH_CEILING));

        let union: HashSet<&String> = batches.iter().flatten().collect();
        assert_eq!(union.len(), 1200);
        for candidate in &input {
            assert!(union.contains(&candidate.token));
        }
    }

    #[test]
    fn test_batching_preserves_insertion_order() {
        let input = candidates("tok", 501);
        let batches = batch_tokens(&input);

        assert_eq!(batches[0][0], "tok-0");
        assert_eq!(batches[0][499], "tok-499");
        assert_eq!(batches[1][0], "tok-500");
    }

    #[test]
    fn test_request_payload_shape() {
        let request = build_multicast_request(&event("SOS"), vec!["t1".into()]);

        assert_eq!(request.notification.title, "\u{1F198} SOS Alert!");
        assert!(request.notification.body.contains("500 m"));
        assert_eq!(request.data["alertId"], "A1");
        // Numeric fields travel as strings
        assert_eq!(request.data["latitude"], "10");
        assert_eq!(request.data["longitude"], "20");
        assert_eq!(request.data["type"], "SOS");
        assert_eq!(request.priority, "high");
    }

    #[test]
    fn test_title_depends_on_kind() {
        let sos = build_multicast_request(&event("SOS"), vec![]);
        let other = build_multicast_request(&event("SECURITY"), vec![]);
        assert_ne!(sos.notification.title, other.notification.title);
        assert_eq!(other.notification.title, "\u{26A0}\u{FE0F} Security Alert");
    }

    #[tokio::test]
    async fn test_dispatch_empty_candidates_reports_zero() {
        let report = dispatch(&RuleProvider, &event("SOS"), vec![]).await.unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_all_success() {
        let report = dispatch(&RuleProvider, &event("SOS"), candidates("tok", 3))
            .await
            .unwrap();

        assert_eq!(report.success_count, 3);
        assert_eq!(report.failure_count, 0);
        assert!(report.invalid_tokens.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_counts_whole_batch_on_transport_failure() {
        // 1200 tokens, middle batch (tok-500..tok-999 includes net-*) fails:
        // build input so batch 2 carries the transport-failing tokens.
        let mut input = candidates("tok", 500);
        input.extend(candidates("net", 500));
        input.extend(candidates("tok2", 200));

        let report = dispatch(&RuleProvider, &event("SOS"), input).await.unwrap();

        assert_eq!(report.success_count, 700);
        assert_eq!(report.failure_count, 500);
        assert_eq!(report.total(), 1200);
    }

    #[tokio::test]
    async fn test_dispatch_unions_invalid_tokens() {
        let mut input = candidates("tok", 2);
        input.push(NeighborCandidate {
            token: "stale-1".into(),
            distance_meters: None,
        });

        let report = dispatch(&RuleProvider, &event("SOS"), input).await.unwrap();

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.invalid_tokens, vec!["stale-1".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_unavailable_is_fatal() {
        let result = dispatch(&RuleProvider, &event("SOS"), candidates("down", 2)).await;

        assert!(matches!(result, Err(FanoutError::DispatchUnavailable(_))));
    }

    #[tokio::test]
    async fn test_accounting_invariant_across_mixed_outcomes() {
        // 2 ok + 1 stale + whole transport-failed batch of 500
        let mut input = candidates("tok", 2);
        input.push(NeighborCandidate {
            token: "stale-1".into(),
            distance_meters: None,
        });
        // Pad so the net batch stands alone
        input.extend(candidates("tok2", 497));
        input.extend(candidates("net", 500));

        let total = input.len();
        let report = dispatch(&RuleProvider, &event("SOS"), input).await.unwrap();

        assert_eq!(report.total(), total);
    }

    /// Mock whose batch task panics for tokens prefixed `crash`.
    #[derive(Clone)]
    struct CrashingProvider;

    impl PushProvider for CrashingProvider {
        async fn send_multicast(
            &self,
            request: MulticastRequest,
        ) -> Result<MulticastResponse, ProviderError> {
            if request.registration_ids.iter().any(|t| t.starts_with("crash")) {
                panic!("provider blew up mid-batch");
            }

            let results: Vec<MulticastResult> = request
                .registration_ids
                .iter()
                .map(|t| MulticastResult {
                    message_id: Some(format!("msg-{t}")),
                    error: None,
                })
                .collect();
            Ok(MulticastResponse {
                success: results.len(),
                failure: 0,
                results,
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_counts_batch_whose_task_panics() {
        // First batch succeeds; the second batch's task dies before
        // returning. Its tokens must still show up as failures.
        let mut input = candidates("tok", 500);
        input.extend(candidates("crash", 500));

        let report = dispatch(&CrashingProvider, &event("SOS"), input)
            .await
            .unwrap();

        assert_eq!(report.success_count, 500);
        assert_eq!(report.failure_count, 500);
        assert_eq!(report.total(), 1000);
    }
}
