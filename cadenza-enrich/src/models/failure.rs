//! Failure records

use cadenza_common::events::EnrichmentPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityType, Subject};
use crate::error::{ErrorCode, ItemError};

/// One per-item failure buffered during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: EnrichmentPhase,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub code: ErrorCode,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(phase: EnrichmentPhase, subject: &Subject, error: &ItemError) -> Self {
        Self {
            phase,
            entity_type: subject.entity_type,
            entity_id: subject.id.clone(),
            entity_name: subject.name.clone(),
            code: error.code,
            message: error.message.clone(),
        }
    }
}

/// Entry written to the durable failure log
#[derive(Debug, Clone)]
pub struct NewFailure {
    /// `artist`, `track`, `subscription` or `system`
    pub entity_type: String,
    pub entity_id: String,
    /// Phase that failed; `None` for cycle-level entries
    pub phase: Option<EnrichmentPhase>,
    pub entity_name: String,
    pub error_message: String,
    pub error_code: ErrorCode,
    pub metadata: Option<serde_json::Value>,
}

impl NewFailure {
    pub fn from_phase_failure(failure: &PhaseFailure) -> Self {
        Self {
            entity_type: failure.entity_type.as_str().to_string(),
            entity_id: failure.entity_id.clone(),
            phase: Some(failure.phase),
            entity_name: failure.entity_name.clone(),
            error_message: failure.message.clone(),
            error_code: failure.code,
            metadata: Some(serde_json::json!({ "phase": failure.phase })),
        }
    }
}

/// Row of the durable failure log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub phase: Option<String>,
    pub entity_name: String,
    pub error_message: String,
    pub error_code: String,
    pub metadata: Option<serde_json::Value>,
    pub attempts: u32,
    pub resolved: bool,
    pub skipped: bool,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}
