//! Invoice Insight Evaluator - an LLM pipeline scored by a panel of LLM judges.
//!
//! A scanned invoice goes through three stages:
//! 1. Extraction: a vision model turns the image into a [`ParsedInvoice`]
//! 2. Generation: a model writes short [`InsightText`] about the invoice
//! 3. Evaluation: a [`JudgePanel`] scores the insights concurrently and the
//!    [`Aggregator`] combines the verdicts into one score in [0, 1]
//!
//! Any stage may fail; the run then ends in `failed` with the reason kept,
//! and no later stage is attempted. A judge that times out or answers with
//! garbage is recorded and the remaining verdicts still count.
//!
//! # Quick Start
//!
//! ```no_run
//! use invoice_insight_eval::{
//!     config::Config,
//!     persistence::{EvaluationRecord, save_record},
//!     pipeline::{InvoicePipeline, PipelineStatus, run_pipeline},
//! };
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let pipeline = InvoicePipeline::from_config(&config)?;
//!     let state = run_pipeline(&pipeline, Path::new("invoice.png")).await;
//!
//!     if state.status() != PipelineStatus::Evaluated {
//!         println!("run failed: {:?}", state.failure());
//!         return Ok(());
//!     }
//!
//!     if let Some(record) = EvaluationRecord::from_state(&state) {
//!         println!("aggregate score: {:.3}", record.evaluation.aggregate_score());
//!         save_record(&record, Path::new("results/invoice.json"))?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **InvoiceExtractor / InsightGenerator**: stage traits, LLM-backed by default
//! - **Judge**: one scoring strategy per quality dimension
//! - **JudgePanel**: concurrent fan-out with per-judge timeouts
//! - **InvoicePipeline**: the state machine driving one run
//! - **BatchRunner**: many runs over a directory with bounded concurrency

pub mod batch;
pub mod config;
pub mod error;
pub mod eval;
pub mod extraction;
pub mod generation;
pub mod invoice;
pub mod llm;
pub mod persistence;
pub mod pipeline;

// Re-export commonly used types
pub use batch::{BatchReport, BatchRunner, collect_images};
pub use config::Config;
pub use error::{InsightEvalError, JudgeError, PanelExhausted, Result};
pub use eval::{Aggregator, EvaluationResult, Judge, JudgeKind, JudgePanel, Verdict};
pub use extraction::{InvoiceExtractor, VisionExtractor};
pub use generation::{InsightGenerator, InsightText, LlmInsightGenerator};
pub use invoice::{InvoiceImage, ParsedInvoice};
pub use llm::LlmClient;
pub use persistence::{EvaluationRecord, load_record, save_record};
pub use pipeline::{FailureReason, InvoicePipeline, PipelineState, PipelineStatus, run_pipeline};
