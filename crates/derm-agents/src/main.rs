//! `derm-agents` command-line entry point.
//!
//! # Usage
//!
//! ```bash
//! # Full report from a remote image, scores from two model servers
//! derm-agents --store-dir ./reports diagnose --patient p-17 \
//!     --image https://cdn.example/lesion.jpg \
//!     --classifier-a http://10.0.0.5:8001/predict --classifier-b http://10.0.0.5:8002/predict
//!
//! # Scores computed elsewhere
//! derm-agents diagnose --patient p-17 --image ./lesion.jpg \
//!     --primary "Melanoma=0.81" --secondary "Benign keratosis=0.64"
//!
//! # Follow-up against the latest stored diagnosis
//! derm-agents --store-dir ./reports ask "Which biopsy technique?" --deep
//!
//! # Models usable with the configured key
//! derm-agents models
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coordination::{AttemptLog, ClassificationResult};
use derm_agents::classifier::{Classifier, HttpClassifier, StaticClassifier};
use derm_agents::config::PipelineConfig;
use derm_agents::image_source::{AnyImageSource, ImageSource};
use derm_agents::store::{FileContextStore, InMemoryContextStore, SharedContextStore};
use derm_agents::telemetry::{init_tracing, AttemptSummary};
use derm_agents::{DiagnosticPipeline, FollowUpService, GeminiClient, ModelFallbackExecutor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "derm-agents", version, about = "Multi-stage dermatology report generator", long_about = None)]
struct Cli {
    /// TOML configuration file (env overrides still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the file-backed context store (in-memory when omitted)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the four-stage pipeline for one image and print the bundle as JSON
    Diagnose {
        /// Patient reference the bundle is stored under
        #[arg(long)]
        patient: String,

        /// Image URL (http/https) or local file path
        #[arg(long)]
        image: String,

        /// First classifier endpoint
        #[arg(long)]
        classifier_a: Option<String>,

        /// Second classifier endpoint
        #[arg(long)]
        classifier_b: Option<String>,

        /// Pre-computed first result, as <label>=<confidence>
        #[arg(long)]
        primary: Option<ClassificationResult>,

        /// Pre-computed second result, as <label>=<confidence>
        #[arg(long)]
        secondary: Option<ClassificationResult>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Answer a question against the latest stored diagnosis
    Ask {
        query: String,

        /// Use the research-oriented instruction
        #[arg(long, default_value_t = false)]
        deep: bool,
    },

    /// List models that support content generation for the configured key
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, "info");

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .require_api_key()
        .context("Generation service is not configured")?;
    let config = Arc::new(config);

    let gemini = Arc::new(GeminiClient::new(&config.generation)?);
    info!(
        base_url = %config.generation.base_url,
        verify_models = %config.models.verify,
        diagnose_models = %config.models.diagnose,
        prompt_version = derm_agents::prompts::PROMPT_VERSION,
        "derm-agents starting"
    );

    let store = open_store(cli.store_dir);
    let attempts = Arc::new(AttemptLog::new());
    let executor = Arc::new(
        ModelFallbackExecutor::new(gemini.clone(), config.retry.clone()).with_sink(attempts.clone()),
    );

    match cli.command {
        Commands::Diagnose {
            patient,
            image,
            classifier_a,
            classifier_b,
            primary,
            secondary,
            timeout_secs,
        } => {
            let (first, second) = classifiers(classifier_a, classifier_b, primary, secondary)?;
            let source = AnyImageSource::new(config.image_fetch.clone())?;
            let image = source
                .fetch(&image)
                .await
                .with_context(|| format!("Failed to load image {image}"))?;

            let cancel = cancellation(timeout_secs);
            let pipeline = DiagnosticPipeline::new(executor, store, config.clone());
            let result = pipeline
                .classify_and_run(&patient, &image, first.as_ref(), second.as_ref(), &cancel)
                .await;
            AttemptSummary::from_log(&attempts).log("diagnose");

            let bundle = result.context("Pipeline run failed")?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
        Commands::Ask { query, deep } => {
            let cancel = cancellation(None);
            let service = FollowUpService::new(executor, store, config.clone());
            let answer = service
                .ask(&query, deep, &cancel)
                .await
                .context("Follow-up query failed")?;
            AttemptSummary::from_log(&attempts).log("follow_up");
            println!("{answer}");
        }
        Commands::Models => {
            let models = gemini
                .list_models()
                .await
                .context("Failed to list models")?;
            for model in models {
                println!("{model}");
            }
        }
    }

    Ok(())
}

fn open_store(dir: Option<PathBuf>) -> SharedContextStore {
    match dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using file-backed context store");
            Arc::new(FileContextStore::new(dir))
        }
        None => {
            warn!("No --store-dir given; results are kept in memory only");
            Arc::new(InMemoryContextStore::new())
        }
    }
}

fn classifiers(
    classifier_a: Option<String>,
    classifier_b: Option<String>,
    primary: Option<ClassificationResult>,
    secondary: Option<ClassificationResult>,
) -> Result<(Box<dyn Classifier>, Box<dyn Classifier>)> {
    match (classifier_a, classifier_b, primary, secondary) {
        (Some(a), Some(b), None, None) => Ok((
            Box::new(HttpClassifier::new("classifier_a", a)?),
            Box::new(HttpClassifier::new("classifier_b", b)?),
        )),
        (None, None, Some(p), Some(s)) => Ok((
            Box::new(StaticClassifier::new("primary", p)),
            Box::new(StaticClassifier::new("secondary", s)),
        )),
        _ => bail!(
            "pass either --classifier-a and --classifier-b, or --primary and --secondary"
        ),
    }
}

/// Token cancelled on Ctrl-C and, if given, after `timeout_secs`.
fn cancellation(timeout_secs: Option<u64>) -> CancellationToken {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling run");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "Run timed out; cancelling");
            on_timeout.cancel();
        });
    }

    cancel
}
