//! Follow-up questions answered against the most recent completed diagnosis.
//!
//! A single generation call through the fallback executor. No chaining, and
//! a missing or unreadable latest context never fails the query.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::errors::ExecutorError;
use crate::executor::ModelFallbackExecutor;
use crate::generation::GenerationRequest;
use crate::prompts;
use crate::store::{load_latest, SharedContextStore};
use crate::types::LatestContext;

pub struct FollowUpService {
    executor: Arc<ModelFallbackExecutor>,
    store: SharedContextStore,
    config: Arc<PipelineConfig>,
}

impl FollowUpService {
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

    /// Load the latest context from the store and answer `query` against it.
    pub async fn ask(
        &self,
        query: &str,
        deep_search: bool,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let context = match load_latest(self.store.as_ref()).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Could not read latest context; answering without it");
                None
            }
        };
        self.answer_follow_up(query, context.as_ref(), deep_search, cancel)
            .await
    }

    /// Answer `query` using `context` as prompt context.
    pub async fn answer_follow_up(
        &self,
        query: &str,
        context: Option<&LatestContext>,
        deep_search: bool,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutorError> {
        let request = follow_up_request(&self.config, query, context, deep_search);
        info!(
            has_context = context.is_some(),
            deep_search,
            "Answering follow-up question"
        );
        self.executor.execute(&request, cancel).await
    }
}

/// Build the single generation request for a follow-up question.
pub fn follow_up_request(
    config: &PipelineConfig,
    query: &str,
    context: Option<&LatestContext>,
    deep_search: bool,
) -> GenerationRequest {
    let label = if deep_search {
        "follow_up_deep"
    } else {
        "follow_up"
    };
    GenerationRequest::new(
        prompts::follow_up_prompt(query, context, deep_search),
        config.models.follow_up.clone(),
    )
    .with_generation_config(config.sampling.follow_up.clone())
    .with_safety(config.safety.clone())
    .with_search(config.generation.search_grounding)
    .with_label(label)
}
