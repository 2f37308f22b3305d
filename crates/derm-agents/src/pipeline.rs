//! Four-stage diagnostic chain.
//!
//! ## Lifecycle
//!
//! ```text
//! Start → Verify → Diagnose → Report → Advisory → Persisted
//!            \         \          \         \
//!             └─────────┴──────────┴─────────┴──→ Failed(stage)
//! ```
//!
//! Each stage builds its prompt from the typed results of earlier stages and
//! runs it through the [`ModelFallbackExecutor`]. There is no retry at this
//! level: one stage failure ends the run and nothing is written. On success
//! the bundle is written first, then the latest-context slot.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use coordination::{arbitrate, ArbitrationOutcome, ClassificationResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::errors::{ExecutorError, PipelineError};
use crate::executor::ModelFallbackExecutor;
use crate::generation::{GenerationRequest, Prompt};
use crate::prompts;
use crate::store::{
    bundle_key, validate_patient_ref, SharedContextStore, StoredRecord, LATEST_KEY,
};
use crate::types::{DiagnosticBundle, ImageInput, StageName, StageResult};

// ── State ────────────────────────────────────────────────────────────────────

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    Running(StageName),
    Persisting,
    Persisted,
    Failed(StageName),
}

impl PipelineState {
    /// Successor after the current step succeeds. Terminal states stay put.
    pub fn advance(self) -> Self {
        match self {
            Self::Start => Self::Running(StageName::Verify),
            Self::Running(StageName::Verify) => Self::Running(StageName::Diagnose),
            Self::Running(StageName::Diagnose) => Self::Running(StageName::Report),
            Self::Running(StageName::Report) => Self::Running(StageName::Advisory),
            Self::Running(StageName::Advisory) => Self::Persisting,
            Self::Persisting => Self::Persisted,
            terminal @ (Self::Persisted | Self::Failed(_)) => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Persisted | Self::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Running(stage) => write!(f, "running:{stage}"),
            Self::Persisting => write!(f, "persisting"),
            Self::Persisted => write!(f, "persisted"),
            Self::Failed(stage) => write!(f, "failed:{stage}"),
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Runs the stage chain for one request at a time; share it behind `Arc` to
/// serve concurrent requests.
pub struct DiagnosticPipeline {
    executor: Arc<ModelFallbackExecutor>,
    store: SharedContextStore,
    config: Arc<PipelineConfig>,
}

impl DiagnosticPipeline {
    pub fn new(
        executor: Arc<ModelFallbackExecutor>,
        store: SharedContextStore,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            executor,
            store,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Classify `image` with both classifiers concurrently, then [`Self::run`].
    /// The first classifier error ends the call without waiting for the other.
    pub async fn classify_and_run(
        &self,
        patient_ref: &str,
        image: &ImageInput,
        first: &dyn Classifier,
        second: &dyn Classifier,
        cancel: &CancellationToken,
    ) -> Result<DiagnosticBundle, PipelineError> {
        check_patient_ref(patient_ref)?;
        let (a, b) = tokio::try_join!(first.classify(image), second.classify(image))?;
        debug!(
            first = first.name(),
            first_result = %a,
            second = second.name(),
            second_result = %b,
            "Classification complete"
        );
        self.run(patient_ref, image, (a, b), cancel).await
    }

    /// Run all four stages and persist the bundle.
    pub async fn run(
        &self,
        patient_ref: &str,
        image: &ImageInput,
        classifications: (ClassificationResult, ClassificationResult),
        cancel: &CancellationToken,
    ) -> Result<DiagnosticBundle, PipelineError> {
        check_patient_ref(patient_ref)?;
        let started = Instant::now();
        let arbitration = arbitrate(classifications.0, classifications.1);
        let mut state = PipelineState::Start;
        info!(
            patient_ref,
            primary = %arbitration.primary,
            secondary = %arbitration.secondary,
            "Pipeline run starting"
        );

        state = state.advance();
        let verify = self
            .run_stage(StageName::Verify, prompts::verify_prompt(), image, cancel)
            .await
            .inspect_err(|e| log_failure(state, e))?;

        state = state.advance();
        let diagnose = self
            .run_stage(
                StageName::Diagnose,
                prompts::diagnose_prompt(&arbitration, &verify),
                image,
                cancel,
            )
            .await
            .inspect_err(|e| log_failure(state, e))?;

        state = state.advance();
        let report = self
            .run_stage(
                StageName::Report,
                prompts::report_prompt(&arbitration, &diagnose),
                image,
                cancel,
            )
            .await
            .inspect_err(|e| log_failure(state, e))?;

        state = state.advance();
        let advisory = self
            .run_stage(
                StageName::Advisory,
                prompts::advisory_prompt(&arbitration, &report, &diagnose),
                image,
                cancel,
            )
            .await
            .inspect_err(|e| log_failure(state, e))?;

        if cancel.is_cancelled() {
            let err = PipelineError::Cancelled(StageName::Advisory);
            log_failure(state, &err);
            return Err(err);
        }

        state = state.advance();
        debug!(state = %state, "All stages complete");
        let bundle = assemble(patient_ref, image, arbitration, verify, diagnose, report, advisory);
        self.persist(&bundle).await?;

        state = state.advance();
        info!(
            patient_ref,
            run_id = %bundle.run_id,
            state = %state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run complete"
        );
        Ok(bundle)
    }

    fn stage_request(&self, stage: StageName, prompt: Prompt, image: &ImageInput) -> GenerationRequest {
        let prompt = if stage.attaches_image() {
            prompt.with_image(image.clone())
        } else {
            prompt
        };
        let search = self.config.generation.search_grounding
            && matches!(stage, StageName::Report | StageName::Advisory);
        GenerationRequest::new(prompt, self.config.models.for_stage(stage).clone())
            .with_generation_config(self.config.sampling.for_stage(stage).clone())
            .with_safety(self.config.safety.clone())
            .with_search(search)
            .with_label(stage.to_string())
    }

    async fn run_stage(
        &self,
        stage: StageName,
        prompt: Prompt,
        image: &ImageInput,
        cancel: &CancellationToken,
    ) -> Result<StageResult, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(stage));
        }
        let request = self.stage_request(stage, prompt, image);
        let started = Instant::now();
        match self.executor.execute(&request, cancel).await {
            Ok(text) => {
                debug!(
                    stage = %stage,
                    chars = text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stage complete"
                );
                Ok(StageResult::new(stage, text))
            }
            Err(ExecutorError::Cancelled) => Err(PipelineError::Cancelled(stage)),
            Err(cause) => Err(PipelineError::StageFailed { stage, cause }),
        }
    }

    async fn persist(&self, bundle: &DiagnosticBundle) -> Result<(), PipelineError> {
        let key = bundle_key(&bundle.patient_ref, &bundle.run_id);
        self.store
            .put(&key, &StoredRecord::Bundle(bundle.clone()))
            .await
            .inspect_err(|e| error!(key = %key, error = %e, "Failed to store bundle"))?;
        self.store
            .put(LATEST_KEY, &StoredRecord::LatestContext(bundle.latest_context()))
            .await
            .inspect_err(|e| error!(key = LATEST_KEY, error = %e, "Failed to store latest context"))?;
        debug!(key = %key, "Persisted bundle and latest context");
        Ok(())
    }
}

fn assemble(
    patient_ref: &str,
    image: &ImageInput,
    arbitration: ArbitrationOutcome,
    verify: StageResult,
    diagnose: StageResult,
    report: StageResult,
    advisory: StageResult,
) -> DiagnosticBundle {
    DiagnosticBundle {
        run_id: Uuid::new_v4(),
        patient_ref: patient_ref.to_string(),
        image_ref: image.source.clone(),
        timestamp: Utc::now(),
        arbitration,
        verify_text: verify.text,
        diagnosis_text: diagnose.text,
        report_text: report.text,
        advisory_text: advisory.text,
    }
}

fn check_patient_ref(patient_ref: &str) -> Result<(), PipelineError> {
    validate_patient_ref(patient_ref).map_err(|_| {
        let err = PipelineError::InvalidPatientRef(patient_ref.to_string());
        error!(error = %err, "Pipeline run rejected");
        err
    })
}

fn log_failure(state: PipelineState, err: &PipelineError) {
    let failed = match err.stage() {
        Some(stage) => PipelineState::Failed(stage),
        None => state,
    };
    error!(state = %failed, error = %err, "Pipeline run failed");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use coordination::{ModelLadder, RetryPolicy};
    use mockall::mock;

    use super::*;
    use crate::config::StageModels;
    use crate::errors::{ClassificationError, GenerationError, StoreError};
    use crate::generation::GenerationService;
    use crate::store::{ContextStore, InMemoryContextStore, StoreResult};

    mock! {
        pub Scorer {}

        #[async_trait]
        impl Classifier for Scorer {
            async fn classify(&self, image: &ImageInput) -> Result<ClassificationResult, ClassificationError>;
        }
    }

    /// Answers with the stage label; records each request it sees.
    #[derive(Default)]
    struct StageEcho {
        seen: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl GenerationService for StageEcho {
        async fn generate(&self, _model: &str, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(format!("{} output", request.label))
        }
    }

    /// Cancels `token` when the `at` stage is called. With `block` the call
    /// then waits for the token; otherwise it still answers normally.
    struct CancelAt {
        at: &'static str,
        block: bool,
        token: CancellationToken,
        seen: Mutex<Vec<String>>,
    }

    impl CancelAt {
        fn new(at: &'static str, block: bool, token: &CancellationToken) -> Self {
            Self {
                at,
                block,
                token: token.clone(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationService for CancelAt {
        async fn generate(&self, _model: &str, request: &GenerationRequest) -> Result<String, GenerationError> {
            self.seen.lock().unwrap().push(request.label.clone());
            if request.label == self.at {
                self.token.cancel();
                if self.block {
                    std::future::pending::<()>().await;
                }
            }
            Ok(format!("{} output", request.label))
        }
    }

    /// Answers after a fixed delay, like a slow model server.
    struct SlowScorer(Duration);

    #[async_trait]
    impl Classifier for SlowScorer {
        async fn classify(&self, _image: &ImageInput) -> Result<ClassificationResult, ClassificationError> {
            tokio::time::sleep(self.0).await;
            Ok(ClassificationResult::new("Melanoma", 0.9))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ContextStore for FailingStore {
        async fn put(&self, key: &str, _record: &StoredRecord) -> StoreResult<()> {
            Err(StoreError::Io {
                key: key.to_string(),
                source: std::io::Error::other("disk full"),
            })
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<StoredRecord>> {
            Ok(None)
        }
    }

    fn config() -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.models = StageModels::uniform(ModelLadder::new(["m"]));
        cfg.retry = RetryPolicy {
            max_attempts_per_model: 1,
            base_delay_ms: 0,
            jitter_ceiling_ms: 0,
        };
        cfg
    }

    fn pipeline(service: Arc<dyn GenerationService>, store: SharedContextStore) -> DiagnosticPipeline {
        let cfg = config();
        let executor = ModelFallbackExecutor::new(service, cfg.retry.clone());
        DiagnosticPipeline::new(Arc::new(executor), store, Arc::new(cfg))
    }

    fn image() -> ImageInput {
        ImageInput::new(vec![0x89, b'P', b'N', b'G'], "https://img.example/lesion.png")
    }

    fn scores() -> (ClassificationResult, ClassificationResult) {
        (
            ClassificationResult::new("Benign keratosis", 0.64),
            ClassificationResult::new("Melanoma", 0.81),
        )
    }

    #[test]
    fn state_machine_walks_linear_chain() {
        let mut state = PipelineState::Start;
        let mut seen = Vec::new();
        while !state.is_terminal() {
            state = state.advance();
            seen.push(state.to_string());
        }
        assert_eq!(
            seen,
            [
                "running:Verify",
                "running:Diagnose",
                "running:Report",
                "running:Advisory",
                "persisting",
                "persisted"
            ]
        );
        assert_eq!(
            PipelineState::Failed(StageName::Report).advance(),
            PipelineState::Failed(StageName::Report)
        );
    }

    #[tokio::test]
    async fn stages_attach_image_and_search_per_stage() {
        let service = Arc::new(StageEcho::default());
        let store = Arc::new(InMemoryContextStore::new());
        let p = pipeline(service.clone(), store.clone());

        let bundle = p
            .run("p-1", &image(), scores(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bundle.arbitration.primary.label, "Melanoma");
        assert_eq!(bundle.verify_text, "Verify output");
        assert_eq!(bundle.advisory_text, "Advisory output");
        assert_eq!(bundle.image_ref, "https://img.example/lesion.png");

        let seen = service.seen.lock().unwrap();
        let labels: Vec<_> = seen.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["Verify", "Diagnose", "Report", "Advisory"]);
        let images: Vec<_> = seen.iter().map(|r| r.prompt.image.is_some()).collect();
        assert_eq!(images, [true, true, true, false]);
        let search: Vec<_> = seen.iter().map(|r| r.use_search).collect();
        assert_eq!(search, [false, false, true, true]);
        assert!(seen[2].prompt.instruction.contains("Diagnose output"));
        assert!(seen[3].prompt.instruction.contains("Report output"));

        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn bundle_write_failure_fails_run() {
        let p = pipeline(Arc::new(StageEcho::default()), Arc::new(FailingStore));
        let err = p
            .run("p-1", &image(), scores(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Io { .. })));
        assert_eq!(err.stage(), None);
    }

    #[tokio::test]
    async fn cancelled_run_makes_no_calls_and_no_writes() {
        let service = Arc::new(StageEcho::default());
        let store = Arc::new(InMemoryContextStore::new());
        let p = pipeline(service.clone(), store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = p.run("p-1", &image(), scores(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(StageName::Verify)));
        assert!(service.seen.lock().unwrap().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn classify_and_run_arbitrates_mock_scores() {
        let mut a = MockScorer::new();
        a.expect_classify()
            .times(1)
            .returning(|_| Ok(ClassificationResult::new("Dermatofibroma", 0.5)));
        let mut b = MockScorer::new();
        b.expect_classify()
            .times(1)
            .returning(|_| Ok(ClassificationResult::new("Vascular Lesion", 0.5)));

        let p = pipeline(Arc::new(StageEcho::default()), Arc::new(InMemoryContextStore::new()));
        let bundle = p
            .classify_and_run("p-2", &image(), &a, &b, &CancellationToken::new())
            .await
            .unwrap();

        // Tie: the first classifier wins.
        assert_eq!(bundle.arbitration.primary.label, "Dermatofibroma");
    }

    #[tokio::test]
    async fn classifier_error_stops_before_generation() {
        let mut a = MockScorer::new();
        a.expect_classify().returning(|_| {
            Err(ClassificationError::Request {
                classifier: "a".into(),
                message: "connection refused".into(),
            })
        });
        let mut b = MockScorer::new();
        b.expect_classify()
            .returning(|_| Ok(ClassificationResult::new("Melanoma", 0.9)));

        let service = Arc::new(StageEcho::default());
        let store = Arc::new(InMemoryContextStore::new());
        let p = pipeline(service.clone(), store.clone());
        let err = p
            .classify_and_run("p-3", &image(), &a, &b, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Classification(_)));
        assert!(service.seen.lock().unwrap().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn malformed_patient_ref_is_rejected_before_any_call() {
        for patient_ref in ["", "a/b", ".", "..", "p\\1"] {
            let service = Arc::new(StageEcho::default());
            let store = Arc::new(InMemoryContextStore::new());
            let p = pipeline(service.clone(), store.clone());

            let err = p
                .run(patient_ref, &image(), scores(), &CancellationToken::new())
                .await
                .unwrap_err();

            assert!(
                matches!(&err, PipelineError::InvalidPatientRef(r) if r == patient_ref),
                "{patient_ref:?}: {err}"
            );
            assert!(service.seen.lock().unwrap().is_empty(), "{patient_ref:?}");
            assert_eq!(store.write_count(), 0);
        }
    }

    #[tokio::test]
    async fn malformed_patient_ref_skips_classifiers() {
        let mut a = MockScorer::new();
        a.expect_classify().times(0);
        let mut b = MockScorer::new();
        b.expect_classify().times(0);

        let service = Arc::new(StageEcho::default());
        let p = pipeline(service.clone(), Arc::new(InMemoryContextStore::new()));
        let err = p
            .classify_and_run("", &image(), &a, &b, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::InvalidPatientRef(_)));
        assert!(service.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_classifier_does_not_wait_for_slow_peer() {
        let mut a = MockScorer::new();
        a.expect_classify().returning(|_| {
            Err(ClassificationError::Request {
                classifier: "a".into(),
                message: "refused".into(),
            })
        });
        let b = SlowScorer(Duration::from_secs(30));

        let p = pipeline(Arc::new(StageEcho::default()), Arc::new(InMemoryContextStore::new()));
        let started = tokio::time::Instant::now();
        let err = p
            .classify_and_run("p-4", &image(), &a, &b, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Classification(_)));
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn cancellation_mid_chain_stops_at_that_stage() {
        let cancel = CancellationToken::new();
        let service = Arc::new(CancelAt::new("Diagnose", true, &cancel));
        let store = Arc::new(InMemoryContextStore::new());
        let p = pipeline(service.clone(), store.clone());

        let err = p.run("p-5", &image(), scores(), &cancel).await.unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled(StageName::Diagnose)));
        assert_eq!(*service.seen.lock().unwrap(), ["Verify", "Diagnose"]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_advisory_writes_nothing() {
        for block in [true, false] {
            let cancel = CancellationToken::new();
            let service = Arc::new(CancelAt::new("Advisory", block, &cancel));
            let store = Arc::new(InMemoryContextStore::new());
            let p = pipeline(service.clone(), store.clone());

            let err = p.run("p-6", &image(), scores(), &cancel).await.unwrap_err();

            assert!(
                matches!(err, PipelineError::Cancelled(StageName::Advisory)),
                "block={block}: {err}"
            );
            assert_eq!(service.seen.lock().unwrap().len(), 4);
            assert_eq!(store.write_count(), 0, "block={block}");
        }
    }
}
