//! Realtime broadcast of validated alerts to live observers.
//!
//! The publisher is the fire-and-forget side channel of the pipeline:
//! dispatch-console map clients subscribe and receive every validated event
//! with no per-subscriber acknowledgment (at-most-once, best effort).
//! Publish failures are demoted to warnings by the pipeline and never touch
//! the push branch. The transport carrying frames to remote observers is an
//! external collaborator; this core owns the channel.

use std::future::Future;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::FanoutError;
use crate::model::EmergencyEvent;

/// Well-known event name carried on the broadcast channel.
pub const ALERT_EVENT_NAME: &str = "sos_alert";

/// Frame delivered to every live subscriber.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMessage {
    /// Frame discriminator, always `"broadcast"`.
    #[serde(rename = "type")]
    pub frame_type: &'static str,

    /// Event name, always [`ALERT_EVENT_NAME`].
    pub event: &'static str,

    /// The validated alert.
    pub payload: EmergencyEvent,
}

impl BroadcastMessage {
    pub fn new(event: EmergencyEvent) -> Self {
        Self {
            frame_type: "broadcast",
            event: ALERT_EVENT_NAME,
            payload: event,
        }
    }
}

/// Result of one publish call.
#[derive(Debug, Clone, Copy)]
pub struct PublishOutcome {
    /// Number of live subscribers that received the frame.
    pub receiver_count: usize,
}

/// Publishes validated alerts onto the observer channel.
pub trait AlertPublisher: Send + Sync {
    /// Publish one event, best-effort. Zero live subscribers is a success.
    fn publish(
        &self,
        event: &EmergencyEvent,
    ) -> impl Future<Output = Result<PublishOutcome, FanoutError>> + Send;
}

/// In-process publisher over a single well-known tokio broadcast channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ChannelPublisher {
    /// Create a publisher whose channel buffers up to `capacity` frames
    /// per lagging subscriber before dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a live observer. Every frame published after this call is
    /// delivered to the returned receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }
}

impl AlertPublisher for ChannelPublisher {
    async fn publish(&self, event: &EmergencyEvent) -> Result<PublishOutcome, FanoutError> {
        let message = BroadcastMessage::new(event.clone());

        // send() errs only when no receiver exists; per the contract that
        // is a valid broadcast to zero observers, not a failure.
        let receiver_count = self.sender.send(message).unwrap_or(0);

        debug!(
            alert_id = %event.alert_id,
            receiver_count,
            "Alert broadcast published"
        );

        Ok(PublishOutcome { receiver_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, RawAlertRequest};
    use chrono::Utc;

    fn event() -> EmergencyEvent {
        EmergencyEvent::from_request(
            RawAlertRequest {
                alert_id: Some("A1".into()),
                latitude: Some(10.0),
                longitude: Some(20.0),
                victim_id: Some("U1".into()),
                kind: Some("SOS".into()),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_succeeds() {
        let publisher = ChannelPublisher::new(16);

        let outcome = publisher.publish(&event()).await.unwrap();
        assert_eq!(outcome.receiver_count, 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_frame() {
        let publisher = ChannelPublisher::new(16);
        let mut rx_a = publisher.subscribe();
        let mut rx_b = publisher.subscribe();

        let outcome = publisher.publish(&event()).await.unwrap();
        assert_eq!(outcome.receiver_count, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.frame_type, "broadcast");
            assert_eq!(frame.event, ALERT_EVENT_NAME);
            assert_eq!(frame.payload.alert_id, "A1");
            assert_eq!(frame.payload.kind, AlertKind::Sos);
        }
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = BroadcastMessage::new(event());
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["type"], "broadcast");
        assert_eq!(json["event"], "sos_alert");
        assert_eq!(json["payload"]["alert_id"], "A1");
        assert_eq!(json["payload"]["latitude"], 10.0);
    }
}
