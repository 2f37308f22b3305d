//! Model fallback executor.
//!
//! Runs one [`GenerationRequest`] against its candidate ladder:
//!
//! ```text
//! for model in ladder:
//!     for attempt in 0..max_attempts_per_model:
//!         ok            -> return text
//!         RetrySameModel -> sleep(backoff(attempt)), continue
//!         SwitchModel    -> next model
//!         Abort          -> AllModelsExhausted(last error)
//! ```
//!
//! The executor holds no per-request state. Every attempt yields one
//! [`GenerationAttemptRecord`], logged through `tracing` and forwarded to the
//! optional [`AttemptSink`].

use std::sync::Arc;
use std::time::Instant;

use coordination::{AttemptSink, GenerationAttemptRecord, RetryDecision, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ExecutorError, GenerationError};
use crate::generation::{GenerationRequest, GenerationService};

pub struct ModelFallbackExecutor {
    service: Arc<dyn GenerationService>,
    policy: RetryPolicy,
    sink: Option<Arc<dyn AttemptSink>>,
}

impl ModelFallbackExecutor {
    pub fn new(service: Arc<dyn GenerationService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            policy,
            sink: None,
        }
    }

    /// Forward every attempt record to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `request`, returning the first successful text.
    ///
    /// Cancellation is observed before each attempt, while a call is in
    /// flight (its result is discarded), and during backoff sleeps.
    pub async fn execute(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let ladder = &request.candidates;
        if ladder.is_empty() {
            warn!(label = %request.label, "No candidate models configured");
            return Err(ExecutorError::NoCandidateModels);
        }

        let max_attempts = self.policy.max_attempts_per_model.max(1);
        let mut total_attempts: u32 = 0;
        let mut last_failure: Option<(String, GenerationError)> = None;

        for (model_index, model) in ladder.iter().enumerate() {
            for attempt in 0..max_attempts {
                if cancel.is_cancelled() {
                    return Err(ExecutorError::Cancelled);
                }

                total_attempts += 1;
                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                    r = self.service.generate(model, request) => r,
                };
                let elapsed = started.elapsed();

                let err = match result {
                    Ok(text) => {
                        self.emit(&GenerationAttemptRecord::success(model, attempt, elapsed));
                        info!(
                            label = %request.label,
                            model,
                            attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Generation succeeded"
                        );
                        return Ok(text);
                    }
                    Err(err) => err,
                };

                let class = err.class();
                self.emit(&GenerationAttemptRecord::failure(
                    model,
                    attempt,
                    class,
                    elapsed,
                    err.message(),
                ));

                let decision = self
                    .policy
                    .decide(class, attempt)
                    .or_abort(ladder.has_next(model_index));
                warn!(
                    label = %request.label,
                    model,
                    attempt,
                    error_class = %class,
                    decision = %decision,
                    error = %err,
                    "Generation attempt failed"
                );
                last_failure = Some((model.to_string(), err));

                match decision {
                    RetryDecision::RetrySameModel => {
                        let delay = self.policy.backoff_delay(attempt);
                        debug!(model, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::SwitchModel => break,
                    RetryDecision::Abort => {
                        return Err(self.exhausted(ladder.len(), total_attempts, last_failure));
                    }
                }
            }
        }

        Err(self.exhausted(ladder.len(), total_attempts, last_failure))
    }

    fn exhausted(
        &self,
        models_tried: usize,
        attempts: u32,
        last_failure: Option<(String, GenerationError)>,
    ) -> ExecutorError {
        let (last_model, last_error) = last_failure.unwrap_or_else(|| {
            (
                String::new(),
                GenerationError::Unknown("no attempt was made".into()),
            )
        });
        warn!(models_tried, attempts, last_model = %last_model, "All candidate models exhausted");
        ExecutorError::AllModelsExhausted {
            models_tried,
            attempts,
            last_model,
            last_error,
        }
    }

    fn emit(&self, record: &GenerationAttemptRecord) {
        if let Some(sink) = &self.sink {
            sink.record(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use coordination::{AttemptLog, AttemptOutcome, ModelLadder};

    use super::*;
    use crate::generation::Prompt;

    /// Replays a fixed script of results per model and records every call.
    #[derive(Default)]
    struct ScriptedService {
        scripts: Mutex<HashMap<String, VecDeque<Result<String, GenerationError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn script(self, model: &str, results: Vec<Result<String, GenerationError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(model.to_string(), results.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn generate(
            &self,
            model: &str,
            _request: &GenerationRequest,
        ) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push(model.to_string());
            self.scripts
                .lock()
                .unwrap()
                .get_mut(model)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Err(GenerationError::Unknown("script exhausted".into())))
        }
    }

    fn request(models: &[&str]) -> GenerationRequest {
        GenerationRequest::new(Prompt::text("sys", "msg"), ModelLadder::new(models.iter().copied()))
            .with_label("test")
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts_per_model: 3,
            base_delay_ms: 1_000,
            jitter_ceiling_ms: 500,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quota_switches_and_transient_retries_on_same_model() {
        let service = Arc::new(
            ScriptedService::default()
                .script("m1", vec![Err(GenerationError::Quota("429".into()))])
                .script(
                    "m2",
                    vec![
                        Err(GenerationError::Transient("503".into())),
                        Err(GenerationError::Transient("503".into())),
                        Ok("m2 text".into()),
                    ],
                )
                .script("m3", vec![Ok("m3 text".into())]),
        );
        let log = Arc::new(AttemptLog::new());
        let executor = ModelFallbackExecutor::new(service.clone(), policy()).with_sink(log.clone());

        let started = tokio::time::Instant::now();
        let text = executor
            .execute(&request(&["m1", "m2", "m3"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(text, "m2 text");
        assert_eq!(service.calls(), ["m1", "m2", "m2", "m2"]);

        // Two backoffs on m2: 1s + 2s, each plus at most 500ms jitter.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(3_000), "{waited:?}");
        assert!(waited <= Duration::from_millis(4_000), "{waited:?}");

        let records = log.snapshot();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].outcome, AttemptOutcome::HardError);
        assert_eq!(records[1].attempt_number, 0);
        assert_eq!(records[2].outcome, AttemptOutcome::TransientError);
        assert!(records[3].is_success());
        assert_eq!(records[3].model, "m2");
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_carries_last_models_last_error() {
        let service = Arc::new(
            ScriptedService::default()
                .script("a", vec![Err(GenerationError::NotFound("no such model".into()))])
                .script(
                    "b",
                    vec![
                        Err(GenerationError::Unknown("odd 1".into())),
                        Err(GenerationError::Unknown("odd 2".into())),
                        Err(GenerationError::Transient("final".into())),
                    ],
                ),
        );
        let executor = ModelFallbackExecutor::new(service.clone(), policy());

        let err = executor
            .execute(&request(&["a", "b"]), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExecutorError::AllModelsExhausted {
                models_tried,
                attempts,
                last_model,
                last_error,
            } => {
                assert_eq!(models_tried, 2);
                assert_eq!(attempts, 4);
                assert_eq!(last_model, "b");
                assert_eq!(last_error, GenerationError::Transient("final".into()));
            }
            other => panic!("expected AllModelsExhausted, got {other:?}"),
        }
        assert_eq!(service.calls().len(), 4);
    }

    #[tokio::test]
    async fn empty_ladder_makes_no_calls() {
        let service = Arc::new(ScriptedService::default());
        let executor = ModelFallbackExecutor::new(service.clone(), policy());

        let err = executor
            .execute(&request(&[]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, ExecutorError::NoCandidateModels);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn single_attempt_policy_never_retries() {
        let service = Arc::new(
            ScriptedService::default()
                .script("only", vec![Err(GenerationError::Transient("503".into()))]),
        );
        let executor = ModelFallbackExecutor::new(
            service.clone(),
            RetryPolicy {
                max_attempts_per_model: 1,
                ..policy()
            },
        );

        let err = executor
            .execute(&request(&["only"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AllModelsExhausted { attempts: 1, .. }));
        assert_eq!(service.calls(), ["only"]);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_call() {
        let service = Arc::new(ScriptedService::default().script("m", vec![Ok("x".into())]));
        let executor = ModelFallbackExecutor::new(service.clone(), policy());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor.execute(&request(&["m"]), &cancel).await.unwrap_err();
        assert_eq!(err, ExecutorError::Cancelled);
        assert!(service.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_prevents_retry() {
        let service = Arc::new(ScriptedService::default().script(
            "m",
            vec![
                Err(GenerationError::Transient("503".into())),
                Ok("late".into()),
            ],
        ));
        let executor = ModelFallbackExecutor::new(service.clone(), policy());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let err = executor.execute(&request(&["m"]), &cancel).await.unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err, ExecutorError::Cancelled);
        assert_eq!(service.calls(), ["m"]);
    }

    /// Holds every call open until its token fires, then answers anyway.
    struct BlockUntilCancelled {
        released_by: CancellationToken,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl GenerationService for BlockUntilCancelled {
        async fn generate(
            &self,
            _model: &str,
            _request: &GenerationRequest,
        ) -> Result<String, GenerationError> {
            *self.calls.lock().unwrap() += 1;
            self.released_by.cancelled().await;
            Ok("late answer".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_call_discards_its_result() {
        let cancel = CancellationToken::new();
        let service = Arc::new(BlockUntilCancelled {
            released_by: cancel.clone(),
            calls: Mutex::new(0),
        });
        let log = Arc::new(AttemptLog::new());
        let executor = ModelFallbackExecutor::new(service.clone(), policy()).with_sink(log.clone());

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            })
        };

        let err = executor
            .execute(&request(&["m1", "m2"]), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err, ExecutorError::Cancelled);
        assert_eq!(*service.calls.lock().unwrap(), 1);
        assert_eq!(log.count(AttemptOutcome::Success), 0);
        assert!(log.is_empty());
    }
}
