//! Cycle scheduling types and the persisted cycle state

use cadenza_common::events::{EnrichmentPhase, PhaseProgress, PhaseTally};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::PhaseFailure;

/// How a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Periodic tick: skipped while another cycle runs or too soon after one
    Scheduled,
    /// Operator request: waits for an in-flight cycle, ignores spacing
    Immediate,
    /// Like `Immediate`, but drains each phase over repeated batches
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Scheduled => "scheduled",
            RunMode::Immediate => "immediate",
            RunMode::Full => "full",
        }
    }

    pub fn bypasses_guards(&self) -> bool {
        !matches!(self, RunMode::Scheduled)
    }
}

/// Operator control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Pause => "pause",
            ControlSignal::Resume => "resume",
            ControlSignal::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(ControlSignal::Pause),
            "resume" => Ok(ControlSignal::Resume),
            "stop" => Ok(ControlSignal::Stop),
            other => Err(format!("unknown control signal '{}'", other)),
        }
    }
}

/// Scheduler status persisted between cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Orchestrator state, persisted as JSON in the settings table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleState {
    pub status: CycleStatus,
    pub current_phase: Option<EnrichmentPhase>,
    pub last_cycle_id: Option<Uuid>,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_finished_at: Option<DateTime<Utc>>,
    pub progress: Vec<PhaseProgress>,
    /// No actionable metadata work remains
    pub core_complete: bool,
    /// Core complete and no audio or vibe work outstanding
    pub fully_complete: bool,
    /// Completion notification sent for the current session
    pub completion_notified: bool,
    /// Derived caches cleared for the current session
    pub caches_invalidated: bool,
    /// Per-item failures since new work last arrived
    pub session_failures: u64,
    pub consecutive_system_failures: u32,
}

impl CycleState {
    pub fn total_work(&self) -> u64 {
        self.progress.iter().map(|p| p.counts.total).sum()
    }
}

/// Why a requested cycle did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    TooSoon,
    Paused,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum CycleOutcome {
    Completed,
    Halted(ControlSignal),
    Skipped(SkipReason),
    Errored(String),
}

/// Result of one `run_cycle` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Option<Uuid>,
    pub mode: RunMode,
    pub outcome: CycleOutcome,
    pub phases: Vec<PhaseTally>,
    pub failures: Vec<PhaseFailure>,
}

impl CycleReport {
    pub fn skipped(mode: RunMode, reason: SkipReason) -> Self {
        Self {
            cycle_id: None,
            mode,
            outcome: CycleOutcome::Skipped(reason),
            phases: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn ran(&self) -> bool {
        !matches!(self.outcome, CycleOutcome::Skipped(_))
    }

    /// Subjects processed by one phase (0 if the phase did not run)
    pub fn processed(&self, phase: EnrichmentPhase) -> usize {
        self.phases
            .iter()
            .filter(|t| t.phase == phase)
            .map(|t| t.processed)
            .sum()
    }

    pub fn total_processed(&self) -> usize {
        self.phases.iter().map(|t| t.processed).sum()
    }

    pub fn phase(&self, phase: EnrichmentPhase) -> Option<&PhaseTally> {
        self.phases.iter().find(|t| t.phase == phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signal_parse() {
        assert_eq!("PAUSE".parse::<ControlSignal>(), Ok(ControlSignal::Pause));
        assert_eq!(" stop ".parse::<ControlSignal>(), Ok(ControlSignal::Stop));
        assert!("restart".parse::<ControlSignal>().is_err());
    }

    #[test]
    fn test_cycle_state_tolerates_missing_fields() {
        let state: CycleState = serde_json::from_str(r#"{"status":"paused"}"#).unwrap();
        assert_eq!(state.status, CycleStatus::Paused);
        assert!(!state.completion_notified);
        assert!(state.progress.is_empty());
    }

    #[test]
    fn test_skipped_report() {
        let report = CycleReport::skipped(RunMode::Scheduled, SkipReason::AlreadyRunning);
        assert!(!report.ran());
        assert_eq!(report.total_processed(), 0);
    }
}
