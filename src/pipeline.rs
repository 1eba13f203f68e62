//! Two-branch fanout orchestration for one validated alert.
//!
//! Once validation passes, the broadcast branch and the resolve-then-push
//! branch run concurrently and fail independently:
//!
//! - broadcast errors are demoted to a warning carried in the outcome;
//! - resolution or dispatch errors fail the invocation, leaving any
//!   already-delivered broadcast untouched.
//!
//! One invocation per alert; no state is shared across alerts. The run
//! completes or fails; cancellation, timeouts, and retries belong to an
//! external supervisor.

use tracing::{info, warn};

use crate::broadcast::AlertPublisher;
use crate::error::FanoutError;
use crate::geo::{DEFAULT_RADIUS_METERS, GeoPoint, NeighborResolver};
use crate::model::{DeliveryReport, EmergencyEvent};
use crate::push::{self, PushProvider};

/// Result of one pipeline invocation.
#[derive(Debug)]
pub struct AlertOutcome {
    /// Delivery accounting from the push branch.
    pub report: DeliveryReport,

    /// Set when the broadcast branch failed; informational only.
    pub broadcast_warning: Option<String>,
}

/// Run the full fanout for one validated event.
pub async fn run_alert<R, B, P>(
    resolver: &R,
    publisher: &B,
    provider: &P,
    event: &EmergencyEvent,
) -> Result<AlertOutcome, FanoutError>
where
    R: NeighborResolver,
    B: AlertPublisher,
    P: PushProvider + Clone + Send + Sync + 'static,
{
    let broadcast_branch = async { publisher.publish(event).await };

    let push_branch = async {
        let origin = GeoPoint {
            latitude: event.latitude,
            longitude: event.longitude,
        };
        let candidates = resolver
            .resolve(origin, DEFAULT_RADIUS_METERS, &event.reporter_id)
            .await?;

        info!(
            alert_id = %event.alert_id,
            candidates = candidates.len(),
            "Neighbors resolved"
        );

        push::dispatch(provider, event, candidates).await
    };

    // Neither branch blocks or aborts the other.
    let (broadcast_result, push_result) = tokio::join!(broadcast_branch, push_branch);

    let broadcast_warning = match broadcast_result {
        Ok(outcome) => {
            info!(
                alert_id = %event.alert_id,
                receivers = outcome.receiver_count,
                "Alert broadcast to live observers"
            );
            None
        }
        Err(e) => {
            warn!(alert_id = %event.alert_id, error = %e, "Broadcast failed; push unaffected");
            Some(e.to_string())
        }
    };

    let report = push_result?;

    Ok(AlertOutcome {
        report,
        broadcast_warning,
    })
}
