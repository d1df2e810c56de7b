//! # Cadenza Common Library
//!
//! Shared code for the Cadenza services:
//! - Common error type
//! - Enrichment event types and the `EventBus`
//! - Bootstrap configuration loading
//! - Catalog database initialization

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
