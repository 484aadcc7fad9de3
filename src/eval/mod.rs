//! Evaluation core: judges, the judge panel and the aggregator.
//!
//! This module provides:
//! - [`Judge`] strategies, one per [`JudgeKind`]
//! - [`JudgePanel`], which runs all judges concurrently and absorbs
//!   individual failures
//! - [`Aggregator`], which turns a panel result into an [`EvaluationResult`]

pub mod aggregate;
pub mod judge;
pub mod panel;

pub use aggregate::{Aggregator, EvaluationResult};
pub use judge::{
    AccuracyJudge, ClarityJudge, CompletenessJudge, ConsistencyJudge, Judge, JudgeKind, Score,
    ScoreScale, Verdict, build_judge,
};
pub use panel::{JudgeFailure, JudgeFailureKind, JudgePanel, PanelError, PanelResult};
