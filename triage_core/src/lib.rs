#![forbid(unsafe_code)]

//! Core domain model and business logic for the clinic triage engine.
//!
//! This crate provides:
//! - Domain types (patients, doctors, appointments, history records)
//! - Storage traits with in-memory implementations
//! - Priority queue, doctor registry and appointment state machine
//! - Attention orchestrator with completion timers
//! - Persistence (history journal, CSV export, clinic snapshot)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod store;
pub mod queue;
pub mod registry;
pub mod appointment;
pub mod journal;
pub mod history;
pub mod export;
pub mod snapshot;
pub mod events;
pub mod orchestrator;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use appointment::ScheduleRequest;
pub use events::EngineEvent;
pub use export::export_history_csv;
pub use history::HistoryStack;
pub use journal::{HistorySink, JsonlSink};
pub use snapshot::ClinicSnapshot;
pub use orchestrator::{
    Attention, AttentionPolicy, Orchestrator, OrchestratorBuilder, RecoveryReport, TriageRow,
};
