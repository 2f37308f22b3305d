//! Deterministic decision logic for the dermatology report pipeline.
//!
//! This crate holds everything the orchestrator decides without touching the
//! network, the clock, or a store:
//!
//! - [`classification`]: classifier results and primary/secondary arbitration
//! - [`retry`]: error classes, the per-model retry policy and backoff formula
//! - [`ladder`]: ordered candidate-model ladders loaded from configuration
//! - [`attempt`]: per-attempt telemetry records and sinks
//!
//! The async side (generation calls, stage chaining, persistence) lives in
//! `derm-agents` and drives these types.

#![allow(clippy::uninlined_format_args)]

pub mod attempt;
pub mod classification;
pub mod ladder;
pub mod retry;

pub use attempt::{AttemptLog, AttemptOutcome, AttemptSink, GenerationAttemptRecord};
pub use classification::{arbitrate, ArbitrationOutcome, ClassificationInvalid, ClassificationResult};
pub use ladder::ModelLadder;
pub use retry::{decide, ErrorClass, PolicyError, RetryDecision, RetryPolicy};
