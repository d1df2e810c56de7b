//! Domain models for the enrichment orchestrator

mod cycle;
mod failure;
mod status;
mod subject;

pub use cycle::{
    ControlSignal, CycleOutcome, CycleReport, CycleState, CycleStatus, RunMode, SkipReason,
};
pub use failure::{FailureRecord, NewFailure, PhaseFailure};
pub use status::{EnrichmentStatus, StatusDimension};
pub use subject::{EntityType, Subject, WorkItem};
