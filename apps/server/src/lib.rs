//! Cinder: referential-integrity-aware delete-expunge for FHIR resource stores.
//!
//! `DELETE /fhir/{type}?...&_expunge=true` resolves the matching resources, refuses the
//! request when anything outside the set still references them, and otherwise removes
//! them physically in batches through an asynchronous job.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod services;
pub mod state;
pub mod workers;

pub use error::{Error, Result};
