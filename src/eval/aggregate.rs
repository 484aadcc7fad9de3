//! Combines a panel's verdicts into one evaluation.

use super::judge::Verdict;
use super::panel::{JudgeFailure, PanelResult};
use serde::{Deserialize, Serialize};

/// Final evaluation of one pipeline run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    verdicts: Vec<Verdict>,
    aggregate_score: f64,
    failed_judges: Vec<JudgeFailure>,
}

impl EvaluationResult {
    /// Verdicts in panel order, one per judge that responded.
    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    /// Mean normalized score, in [0, 1].
    pub fn aggregate_score(&self) -> f64 {
        self.aggregate_score
    }

    pub fn failed_judges(&self) -> &[JudgeFailure] {
        &self.failed_judges
    }

    pub fn failed_count(&self) -> usize {
        self.failed_judges.len()
    }

    pub fn judge_count(&self) -> usize {
        self.verdicts.len() + self.failed_judges.len()
    }
}

/// Deterministic combination rule: arithmetic mean of normalized scores.
pub struct Aggregator;

impl Aggregator {
    /// Build the evaluation for a panel result. Pure: the same input always
    /// yields the same output.
    pub fn aggregate(panel: &PanelResult) -> EvaluationResult {
        // PanelResult is never empty, so the mean always exists.
        let aggregate_score = Self::mean_normalized(panel.verdicts()).unwrap_or(0.0);

        EvaluationResult {
            verdicts: panel.verdicts().to_vec(),
            aggregate_score,
            failed_judges: panel.failures().to_vec(),
        }
    }

    /// Mean of the normalized scores, summed in sequence order. `None` for
    /// an empty slice.
    pub fn mean_normalized(verdicts: &[Verdict]) -> Option<f64> {
        if verdicts.is_empty() {
            return None;
        }

        let sum: f64 = verdicts.iter().map(|v| v.score().normalized()).sum();
        Some((sum / verdicts.len() as f64).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JudgeError;
    use crate::eval::judge::{JudgeKind, Score, ScoreScale};

    fn verdict(kind: JudgeKind, raw: f64, scale: ScoreScale) -> Verdict {
        Verdict::new(kind, Score::new(raw, scale).unwrap(), "because", vec![]).unwrap()
    }

    fn panel(outcomes: Vec<Result<Verdict, JudgeError>>) -> PanelResult {
        PanelResult::from_outcomes(outcomes).unwrap()
    }

    #[test]
    fn test_mean_over_mixed_scales() {
        let result = Aggregator::aggregate(&panel(vec![
            Ok(verdict(JudgeKind::Accuracy, 90.0, ScoreScale::PERCENT)),
            Ok(verdict(JudgeKind::Completeness, 60.0, ScoreScale::PERCENT)),
            Ok(verdict(JudgeKind::Clarity, 4.0, ScoreScale::RUBRIC)),
        ]));

        assert!((result.aggregate_score() - (0.9 + 0.6 + 1.0) / 3.0).abs() < 1e-9);
        assert_eq!(result.judge_count(), 3);
        assert_eq!(result.failed_count(), 0);
    }

    #[test]
    fn test_single_survivor_is_its_own_mean() {
        let result = Aggregator::aggregate(&panel(vec![
            Err(JudgeError::unavailable(JudgeKind::Accuracy, "timeout")),
            Ok(verdict(JudgeKind::Clarity, 2.5, ScoreScale::RUBRIC)),
        ]));

        assert!((result.aggregate_score() - 0.5).abs() < 1e-9);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.failed_judges()[0].judge, JudgeKind::Accuracy);
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let input = panel(vec![
            Ok(verdict(JudgeKind::Accuracy, 0.1, ScoreScale::UNIT)),
            Ok(verdict(JudgeKind::Completeness, 0.7, ScoreScale::UNIT)),
            Ok(verdict(JudgeKind::Clarity, 0.3, ScoreScale::UNIT)),
        ]);

        let first = Aggregator::aggregate(&input);
        let second = Aggregator::aggregate(&input);

        assert_eq!(first, second);
        assert_eq!(
            first.aggregate_score().to_bits(),
            second.aggregate_score().to_bits()
        );
        assert_eq!(first.verdicts(), input.verdicts());
    }

    #[test]
    fn test_aggregate_stays_in_unit_range() {
        let extremes = [(0.0, 0.0), (1.0, 1.0), (100.0, 1.0), (1.0, 0.0)];
        let scales = [
            ScoreScale::UNIT,
            ScoreScale::UNIT,
            ScoreScale::PERCENT,
            ScoreScale::RUBRIC,
        ];

        for survivors in 1..=extremes.len() {
            let outcomes = extremes
                .iter()
                .zip(scales)
                .take(survivors)
                .map(|((raw, _), scale)| Ok(verdict(JudgeKind::Accuracy, *raw, scale)))
                .collect();

            let score = Aggregator::aggregate(&panel(outcomes)).aggregate_score();
            assert!((0.0..=1.0).contains(&score), "{} out of range", score);
        }
    }

    #[test]
    fn test_mean_of_nothing_is_none() {
        assert_eq!(Aggregator::mean_normalized(&[]), None);
    }
}
