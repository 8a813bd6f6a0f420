// Duel event fan-out.
//
// The engine publishes "duel changed" notifications into a broadcast
// channel and never blocks on (or fails because of) delivery; the
// WebSocket layer subscribes and forwards to connected clients.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::metrics;

/// Closed set of event names published by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelEventName {
    GameStarted,
    FirstGuess,
    BothGuessed,
    Timeout,
    NextRound,
    DuelFinished,
}

impl DuelEventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GameStarted => "game_started",
            Self::FirstGuess => "first_guess",
            Self::BothGuessed => "both_guessed",
            Self::Timeout => "timeout",
            Self::NextRound => "next_round",
            Self::DuelFinished => "duel_finished",
        }
    }
}

/// One published notification.
#[derive(Debug, Clone, Serialize)]
pub struct DuelEvent {
    pub duel_id: String,
    pub action: DuelEventName,
    pub payload: Value,
}

/// Fire-and-forget publisher over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DuelEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a duel event. Send errors (no subscribers) are ignored;
    /// delivery is best-effort by contract.
    pub fn publish(&self, duel_id: &str, action: DuelEventName, payload: Value) {
        let event = DuelEvent {
            duel_id: duel_id.to_string(),
            action,
            payload,
        };
        tracing::debug!(duel_id, action = action.as_str(), "publishing duel event");
        metrics::EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[action.as_str()])
            .inc();
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DuelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish("duel-1", DuelEventName::GameStarted, json!({}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.duel_id, "duel-1");
        assert_eq!(event.action, DuelEventName::GameStarted);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let publisher = EventPublisher::new(8);
        // No receiver exists; publish must not panic or error.
        publisher.publish("duel-2", DuelEventName::Timeout, json!({"round": 3}));
    }

    #[tokio::test]
    async fn test_payload_passthrough() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(
            "duel-3",
            DuelEventName::DuelFinished,
            json!({"final_scores": {"player1": 12000, "player2": 9500}}),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["final_scores"]["player1"], 12000);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(DuelEventName::BothGuessed.as_str(), "both_guessed");
        assert_eq!(DuelEventName::NextRound.as_str(), "next_round");
    }
}
