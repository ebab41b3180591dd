//! Observability experiments engine.
//!
//! Given a declarative experiment specification, oxn orchestrates a
//! containerized system under experiment (SUE), applies a scripted sequence of
//! fault-injection treatments, generates synthetic load, captures metric and
//! trace telemetry over an observation window, aligns treatment intervals with
//! the captured data, and produces a statistical report on the interaction
//! between each treatment and each response.

pub mod accounting;
pub mod backends;
pub mod cli;
pub mod engine;
pub mod error;
pub mod loadgen;
pub mod observer;
pub mod orchestrator;
pub mod report;
pub mod responses;
pub mod runner;
pub mod spec;
pub mod store;
pub mod treatments;
pub mod util;
pub mod validation;

pub use engine::Engine;
pub use error::{
    LoadGenError, MetricBackendError, OrchestrationError, OxnError, StoreError, TraceBackendError,
};
pub use spec::ExperimentSpec;
