//! Operator control channel
//!
//! Control signals arrive on a pub/sub topic and set in-memory flags that the
//! scheduler polls before every phase and every batch item. The most recent
//! signal always wins.

use cadenza_common::events::{EnrichmentEvent, EventBus};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerResult, MessageBroker, CONTROL_TOPIC};
use crate::models::ControlSignal;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ControlFlags {
    paused: AtomicBool,
    stop_requested: AtomicBool,
}

/// Shared pause/stop flags
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    flags: Arc<ControlFlags>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, signal: ControlSignal) {
        let (paused, stop) = match signal {
            ControlSignal::Pause => (true, false),
            ControlSignal::Resume => (false, false),
            ControlSignal::Stop => (false, true),
        };
        self.flags.paused.store(paused, Ordering::SeqCst);
        self.flags.stop_requested.store(stop, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::SeqCst)
    }

    /// Acknowledge a stop once the cycle has halted
    pub fn clear_stop(&self) {
        self.flags.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Signal that should halt the running cycle, if any
    pub fn halt_signal(&self) -> Option<ControlSignal> {
        if self.stop_requested() {
            Some(ControlSignal::Stop)
        } else if self.is_paused() {
            Some(ControlSignal::Pause)
        } else {
            None
        }
    }
}

/// Parse a control message: a bare word (`pause`) or a JSON object with a
/// `signal` or `action` field
pub fn parse_signal(raw: &str) -> Option<ControlSignal> {
    if let Ok(signal) = raw.parse() {
        return Some(signal);
    }

    let value: Value = serde_json::from_str(raw).ok()?;
    let word = match &value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map
            .get("signal")
            .or_else(|| map.get("action"))
            .and_then(Value::as_str)?,
        _ => return None,
    };
    word.parse().ok()
}

/// Publish a signal to every orchestrator instance
pub async fn publish_signal(broker: &dyn MessageBroker, signal: ControlSignal) -> BrokerResult<usize> {
    let message = serde_json::json!({ "signal": signal }).to_string();
    broker.publish(CONTROL_TOPIC, &message).await
}

fn handle_message(raw: &str, state: &ControlState, event_bus: &EventBus) {
    match parse_signal(raw) {
        Some(signal) => {
            info!(signal = %signal, "Control signal received");
            state.apply(signal);
            event_bus.emit_lossy(EnrichmentEvent::ControlSignalReceived {
                signal: signal.to_string(),
                timestamp: Utc::now(),
            });
        }
        None => warn!("Ignoring unrecognized control message: {}", raw),
    }
}

/// Start listening for control signals
///
/// The first subscription is made before returning so that signals published
/// afterwards are not missed. If the subscription ends, the listener
/// resubscribes until `cancel` fires.
pub async fn spawn_control_listener(
    broker: Arc<dyn MessageBroker>,
    state: ControlState,
    event_bus: EventBus,
    cancel: CancellationToken,
) -> BrokerResult<JoinHandle<()>> {
    let mut subscription = broker.subscribe(CONTROL_TOPIC).await?;
    info!(topic = CONTROL_TOPIC, "Listening for control signals");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Control listener shutting down");
                    if let Err(e) = subscription.close().await {
                        debug!("Control unsubscribe failed: {}", e);
                    }
                    return;
                }
                message = subscription.next_message() => {
                    if let Some(raw) = message {
                        handle_message(&raw, &state, &event_bus);
                        continue;
                    }
                }
            }

            warn!("Control subscription ended, resubscribing");
            subscription = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
                match broker.subscribe(CONTROL_TOPIC).await {
                    Ok(s) => break s,
                    Err(e) => warn!("Control resubscribe failed: {}", e),
                }
            };
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[test]
    fn test_last_signal_wins() {
        let state = ControlState::new();
        assert_eq!(state.halt_signal(), None);

        state.apply(ControlSignal::Pause);
        assert_eq!(state.halt_signal(), Some(ControlSignal::Pause));

        state.apply(ControlSignal::Stop);
        assert!(!state.is_paused());
        assert_eq!(state.halt_signal(), Some(ControlSignal::Stop));

        state.apply(ControlSignal::Resume);
        assert_eq!(state.halt_signal(), None);

        state.apply(ControlSignal::Stop);
        state.clear_stop();
        assert_eq!(state.halt_signal(), None);
    }

    #[test]
    fn test_parse_signal_formats() {
        assert_eq!(parse_signal("pause"), Some(ControlSignal::Pause));
        assert_eq!(parse_signal(r#"{"signal":"resume"}"#), Some(ControlSignal::Resume));
        assert_eq!(parse_signal(r#"{"action":"stop"}"#), Some(ControlSignal::Stop));
        assert_eq!(parse_signal(r#""pause""#), Some(ControlSignal::Pause));
        assert_eq!(parse_signal(r#"{"signal":"reboot"}"#), None);
        assert_eq!(parse_signal("[1,2]"), None);
    }

    #[tokio::test]
    async fn test_listener_applies_published_signals() {
        let broker = InMemoryBroker::new();
        let state = ControlState::new();
        let event_bus = EventBus::new(16);
        let mut events = event_bus.subscribe();
        let cancel = CancellationToken::new();

        let handle = spawn_control_listener(
            Arc::new(broker.clone()),
            state.clone(),
            event_bus.clone(),
            cancel.clone(),
        )
        .await
        .unwrap();

        publish_signal(&broker, ControlSignal::Pause).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "ControlSignalReceived");
        assert!(state.is_paused());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(broker.active_subscriptions(), 0);
    }
}
