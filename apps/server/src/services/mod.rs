//! Business logic layer
//!
//! The delete-expunge engine: reference lookups, conflict detection, batch planning,
//! batch execution, job orchestration and outcome reporting.

pub mod conflicts;
pub mod delete_expunge;
pub mod executor;
pub mod indexing;
pub mod orchestrator;
pub mod outcome;
pub mod planner;
pub mod reference_index;

pub use conflicts::ConflictDetector;
pub use delete_expunge::DeleteExpungeService;
pub use executor::DeleteExpungeExecutor;
pub use orchestrator::JobOrchestrator;
pub use outcome::OutcomeReporter;
pub use reference_index::ReferenceIndex;
