//! Event types for the Cadenza event system
//!
//! Provides the shared enrichment event definitions and the `EventBus` used to
//! fan them out to in-process listeners (SSE streams, notifiers, tests).

mod enrichment_types;

pub use enrichment_types::{
    CircuitState, EnrichmentPhase, FailureTally, PhaseCounts, PhaseProgress, PhaseTally,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Enrichment event types
///
/// Events are broadcast via `EventBus` and serialize to tagged JSON for SSE
/// transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnrichmentEvent {
    /// A cycle began executing phases
    CycleStarted {
        cycle_id: Uuid,
        /// "scheduled", "immediate" or "full"
        mode: String,
        timestamp: DateTime<Utc>,
    },

    /// One phase of a cycle finished (or was skipped)
    PhaseCompleted {
        cycle_id: Uuid,
        tally: PhaseTally,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A cycle finished, either after all phases or halted by a control signal
    CycleCompleted {
        cycle_id: Uuid,
        phases: Vec<PhaseTally>,
        /// Control signal that halted the cycle early, if any
        halted_by: Option<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Aggregate progress changed since the last report
    ProgressUpdated {
        phases: Vec<PhaseProgress>,
        core_complete: bool,
        fully_complete: bool,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker changed state
    CircuitStateChanged {
        phase: EnrichmentPhase,
        old_state: CircuitState,
        new_state: CircuitState,
        failure_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A subject failed one enrichment step
    SubjectFailed {
        phase: EnrichmentPhase,
        entity_id: String,
        entity_name: String,
        error_code: String,
        /// True when the subject reached terminal `failed`
        permanent: bool,
        timestamp: DateTime<Utc>,
    },

    /// An operator control signal was received
    ControlSignalReceived {
        signal: String,
        timestamp: DateTime<Utc>,
    },

    /// All enrichment finished without failures in this session
    EnrichmentComplete {
        artists: u64,
        tracks: u64,
        audio_analyzed: u64,
        vibe_embedded: u64,
        timestamp: DateTime<Utc>,
    },

    /// All enrichment finished, but some subjects failed
    EnrichmentCompletedWithErrors {
        artists: u64,
        tracks: u64,
        audio_analyzed: u64,
        vibe_embedded: u64,
        failures: Vec<FailureTally>,
        timestamp: DateTime<Utc>,
    },
}

impl EnrichmentEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            EnrichmentEvent::CycleStarted { .. } => "CycleStarted",
            EnrichmentEvent::PhaseCompleted { .. } => "PhaseCompleted",
            EnrichmentEvent::CycleCompleted { .. } => "CycleCompleted",
            EnrichmentEvent::ProgressUpdated { .. } => "ProgressUpdated",
            EnrichmentEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
            EnrichmentEvent::SubjectFailed { .. } => "SubjectFailed",
            EnrichmentEvent::ControlSignalReceived { .. } => "ControlSignalReceived",
            EnrichmentEvent::EnrichmentComplete { .. } => "EnrichmentComplete",
            EnrichmentEvent::EnrichmentCompletedWithErrors { .. } => {
                "EnrichmentCompletedWithErrors"
            }
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper over a tokio broadcast channel. Slow subscribers lag and lose
/// the oldest events rather than blocking emitters.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EnrichmentEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use cadenza_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EnrichmentEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EnrichmentEvent,
    ) -> Result<usize, broadcast::error::SendError<EnrichmentEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EnrichmentEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_event(signal: &str) -> EnrichmentEvent {
        EnrichmentEvent::ControlSignalReceived {
            signal: signal.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_eventbus_new() {
        let bus = EventBus::new(100);
        assert_eq!(bus.capacity(), 100);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_eventbus_emit_without_subscribers_errors() {
        let bus = EventBus::new(10);
        assert!(bus.emit(control_event("pause")).is_err());
        // Lossy variant must not panic
        bus.emit_lossy(control_event("pause"));
    }

    #[test]
    fn test_eventbus_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(control_event("stop")).expect("emit should succeed");

        assert_eq!(rx1.try_recv().unwrap().event_type(), "ControlSignalReceived");
        assert_eq!(rx2.try_recv().unwrap().event_type(), "ControlSignalReceived");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EnrichmentEvent::CircuitStateChanged {
            phase: EnrichmentPhase::VibeEmbedding,
            old_state: CircuitState::Closed,
            new_state: CircuitState::Open,
            failure_count: 3,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).expect("Serialization should succeed");
        assert!(json.contains("\"type\":\"CircuitStateChanged\""));
        assert!(json.contains("\"phase\":\"vibe_embedding\""));
        assert!(json.contains("\"new_state\":\"open\""));

        let back: EnrichmentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "CircuitStateChanged");
    }

    #[test]
    fn test_phase_order_and_classification() {
        assert_eq!(EnrichmentPhase::ALL[0], EnrichmentPhase::ArtistMetadata);
        assert_eq!(EnrichmentPhase::ALL[4], EnrichmentPhase::SubscriptionRefresh);
        assert!(EnrichmentPhase::TrackTags.is_metadata());
        assert!(EnrichmentPhase::AudioAnalysis.is_async());
        assert!(!EnrichmentPhase::SubscriptionRefresh.is_async());
        assert!(!EnrichmentPhase::SubscriptionRefresh.is_metadata());
    }

    #[test]
    fn test_phase_counts_outstanding() {
        let counts = PhaseCounts {
            total: 10,
            pending: 3,
            processing: 2,
            completed: 4,
            failed: 1,
        };
        assert_eq!(counts.outstanding(), 5);
    }
}
