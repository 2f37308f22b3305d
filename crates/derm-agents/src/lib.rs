//! Dermatology report orchestrator.
//!
//! Turns one skin image plus two classifier opinions into a four-part
//! diagnostic bundle (verification, diagnosis, report, advisory) by chaining
//! generation calls, each protected by a per-stage model fallback ladder.
//!
//! ```text
//! ImageSource ─► Classifier ×2 ─► arbitrate ─► Verify ─► Diagnose ─► Report ─► Advisory
//!                                                 │          │          │          │
//!                                                 └──── ModelFallbackExecutor ─────┘
//!                                                                │
//!                                                        GenerationService
//! ContextStore ◄── bundle + latest context ◄── DiagnosticPipeline
//! ContextStore ──► latest context ──► FollowUpService
//! ```
//!
//! Pure decision logic (arbitration, retry policy, ladders, attempt records)
//! lives in the `coordination` crate.

pub mod classifier;
pub mod config;
pub mod errors;
pub mod executor;
pub mod follow_up;
pub mod gemini;
pub mod generation;
pub mod image_source;
pub mod pipeline;
pub mod prompts;
pub mod store;
pub mod telemetry;
pub mod types;

pub use classifier::{Classifier, HttpClassifier, StaticClassifier};
pub use config::{ConfigError, PipelineConfig};
pub use errors::{
    ClassificationError, ExecutorError, GenerationError, ImageFetchError, PipelineError,
    StoreError,
};
pub use executor::ModelFallbackExecutor;
pub use follow_up::FollowUpService;
pub use gemini::GeminiClient;
pub use generation::{GenerationRequest, GenerationService, Prompt};
pub use pipeline::{DiagnosticPipeline, PipelineState};
pub use store::{ContextStore, FileContextStore, InMemoryContextStore, StoredRecord};
pub use types::{DiagnosticBundle, ImageInput, LatestContext, StageName, StageResult};
