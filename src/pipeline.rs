//! Pipeline state machine: extraction, generation, evaluation.
//!
//! ```text
//! pending --extract--> parsed --generate--> generated --judge--> evaluated
//!    \                   \                     \
//!     +-------------------+---------------------+------------> failed
//! ```
//!
//! Each stage is attempted at most once. `evaluated` and `failed` are
//! terminal. A failure keeps whatever earlier stages produced.

use crate::config::{Config, Stage};
use crate::error::{PanelExhausted, Result};
use crate::eval::{Aggregator, EvaluationResult, JudgePanel, PanelError};
use crate::extraction::{InvoiceExtractor, VisionExtractor};
use crate::generation::{InsightGenerator, InsightText, LlmInsightGenerator};
use crate::invoice::{InvoiceImage, ParsedInvoice};
use crate::llm::LlmClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Parsed,
    Generated,
    Evaluated,
    Failed,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Evaluated | PipelineStatus::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Parsed => "parsed",
            PipelineStatus::Generated => "generated",
            PipelineStatus::Evaluated => "evaluated",
            PipelineStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a run ended in `failed`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("evaluation failed: {0}")]
    EvaluationFailed(PanelExhausted),

    /// The caller aborted the run; `after` is the last completed status.
    #[error("cancelled after stage '{after}'")]
    Cancelled { after: PipelineStatus },
}

/// Everything one run has produced so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    run_id: Uuid,
    source: String,
    status: PipelineStatus,
    invoice: Option<ParsedInvoice>,
    insight: Option<InsightText>,
    evaluation: Option<EvaluationResult>,
    failure: Option<FailureReason>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Fresh `pending` state for an input.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            status: PipelineStatus::Pending,
            invoice: None,
            insight: None,
            evaluation: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn invoice(&self) -> Option<&ParsedInvoice> {
        self.invoice.as_ref()
    }

    pub fn insight(&self) -> Option<&InsightText> {
        self.insight.as_ref()
    }

    pub fn evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Move to `next` if the current status is `expected`.
    fn transition(&mut self, expected: PipelineStatus, next: PipelineStatus) -> bool {
        if self.status != expected {
            warn!(
                run_id = %self.run_id,
                from = %self.status,
                to = %next,
                "Rejected pipeline transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub(crate) fn record_parsed(&mut self, invoice: ParsedInvoice) {
        if self.transition(PipelineStatus::Pending, PipelineStatus::Parsed) {
            self.invoice = Some(invoice);
        }
    }

    pub(crate) fn record_generated(&mut self, insight: InsightText) {
        if self.transition(PipelineStatus::Parsed, PipelineStatus::Generated) {
            self.insight = Some(insight);
        }
    }

    pub(crate) fn record_evaluated(&mut self, evaluation: EvaluationResult) {
        if self.transition(PipelineStatus::Generated, PipelineStatus::Evaluated) {
            self.evaluation = Some(evaluation);
        }
    }

    pub(crate) fn fail(&mut self, reason: FailureReason) {
        if self.status.is_terminal() {
            warn!(run_id = %self.run_id, status = %self.status, "Ignoring failure on finished run");
            return;
        }
        self.status = PipelineStatus::Failed;
        self.failure = Some(reason);
        self.finished_at = Some(Utc::now());
    }
}

/// Outcome of one bounded, cancellable collaborator call.
enum StageOutcome<T> {
    Done(T),
    Failed(String),
    Cancelled,
}

/// Drives one invoice through extraction, generation and evaluation.
pub struct InvoicePipeline {
    extractor: Arc<dyn InvoiceExtractor>,
    generator: Arc<dyn InsightGenerator>,
    panel: JudgePanel,
    stage_timeout: Duration,
}

impl InvoicePipeline {
    pub fn new(
        extractor: Arc<dyn InvoiceExtractor>,
        generator: Arc<dyn InsightGenerator>,
        panel: JudgePanel,
    ) -> Self {
        Self {
            extractor,
            generator,
            panel,
            stage_timeout: Duration::from_secs(120),
        }
    }

    /// Bound the extraction and generation calls.
    pub fn with_stage_timeout(mut self, stage_timeout: Duration) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    /// Wire the LLM-backed collaborators from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let extractor = VisionExtractor::new(LlmClient::new(config.llm_for(Stage::Extraction))?);
        let generator =
            LlmInsightGenerator::new(Arc::new(LlmClient::new(config.llm_for(Stage::Generation))?));
        let panel = JudgePanel::from_config(
            &config.panel,
            Arc::new(LlmClient::new(config.llm_for(Stage::Evaluation))?),
        )?;

        Ok(Self::new(Arc::new(extractor), Arc::new(generator), panel)
            .with_stage_timeout(config.pipeline.stage_timeout()))
    }

    pub fn panel(&self) -> &JudgePanel {
        &self.panel
    }

    /// Run to a terminal state.
    pub async fn run(&self, image: &InvoiceImage) -> PipelineState {
        self.run_with_cancellation(image, &CancellationToken::new())
            .await
    }

    /// Load the image at `path`, then run. An unreadable image is an
    /// extraction failure.
    pub async fn run_path(&self, path: &Path, cancel: &CancellationToken) -> PipelineState {
        match InvoiceImage::load_async(path).await {
            Ok(image) => self.run_with_cancellation(&image, cancel).await,
            Err(e) => {
                let mut state = PipelineState::new(path.display().to_string());
                warn!(run_id = %state.run_id(), error = %e, "Invoice image unreadable");
                state.fail(FailureReason::ExtractionFailed(e.to_string()));
                state
            }
        }
    }

    /// Run to a terminal state, stopping early if `cancel` fires.
    pub async fn run_with_cancellation(
        &self,
        image: &InvoiceImage,
        cancel: &CancellationToken,
    ) -> PipelineState {
        let mut state = PipelineState::new(image.label());
        let span = info_span!("pipeline", run_id = %state.run_id(), source = %state.source());

        async {
            if let Err(reason) = self.drive(&mut state, image, cancel).await {
                warn!(reason = %reason, after = ?state.status(), "Pipeline failed");
                state.fail(reason);
            } else if let Some(evaluation) = state.evaluation() {
                info!(
                    aggregate = evaluation.aggregate_score(),
                    verdicts = evaluation.verdicts().len(),
                    failed_judges = evaluation.failed_count(),
                    "Pipeline evaluated"
                );
            }
        }
        .instrument(span)
        .await;

        state
    }

    async fn drive(
        &self,
        state: &mut PipelineState,
        image: &InvoiceImage,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), FailureReason> {
        let invoice = match self.bounded(cancel, self.extractor.parse(image)).await {
            StageOutcome::Done(invoice) => invoice,
            StageOutcome::Failed(msg) => return Err(FailureReason::ExtractionFailed(msg)),
            StageOutcome::Cancelled => return Err(cancelled(state)),
        };

        let total_check = invoice.total_check();
        if total_check.is_mismatch() {
            warn!(?total_check, "Grand total disagrees with line items");
        }
        info!(
            invoice_id = %invoice.invoice_id(),
            line_items = invoice.line_items.len(),
            "Invoice parsed"
        );
        state.record_parsed(invoice.clone());

        let insight = match self.bounded(cancel, self.generator.generate(&invoice)).await {
            StageOutcome::Done(insight) => insight,
            StageOutcome::Failed(msg) => return Err(FailureReason::GenerationFailed(msg)),
            StageOutcome::Cancelled => return Err(cancelled(state)),
        };

        if insight.invoice_id() != invoice.invoice_id() {
            return Err(FailureReason::GenerationFailed(format!(
                "insight text belongs to invoice '{}', expected '{}'",
                insight.invoice_id(),
                invoice.invoice_id()
            )));
        }
        info!(insights = insight.len(), "Insights generated");
        state.record_generated(insight.clone());

        let panel_result = match self.panel.score(&invoice, &insight, cancel).await {
            Ok(result) => result,
            Err(PanelError::Exhausted(exhausted)) => {
                return Err(FailureReason::EvaluationFailed(exhausted));
            }
            Err(PanelError::Cancelled) => return Err(cancelled(state)),
        };

        state.record_evaluated(Aggregator::aggregate(&panel_result));
        Ok(())
    }

    /// Race a collaborator call against the stage timeout and cancellation.
    async fn bounded<T, F>(&self, cancel: &CancellationToken, call: F) -> StageOutcome<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => StageOutcome::Cancelled,
            outcome = tokio::time::timeout(self.stage_timeout, call) => match outcome {
                Ok(Ok(value)) => StageOutcome::Done(value),
                Ok(Err(e)) => StageOutcome::Failed(e.to_string()),
                Err(_) => StageOutcome::Failed(format!("timed out after {:?}", self.stage_timeout)),
            },
        }
    }
}

fn cancelled(state: &PipelineState) -> FailureReason {
    FailureReason::Cancelled {
        after: state.status(),
    }
}

/// Single entry point: run the full sequence for the image at `path`.
pub async fn run_pipeline(pipeline: &InvoicePipeline, path: &Path) -> PipelineState {
    pipeline.run_path(path, &CancellationToken::new()).await
}
