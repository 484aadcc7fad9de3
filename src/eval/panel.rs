//! Judge panel: runs every configured judge on the same evidence.

use super::judge::{Judge, JudgeKind, Verdict, build_judge};
use crate::config::PanelConfig;
use crate::error::{InsightEvalError, JudgeError, PanelExhausted, Result};
use crate::generation::InsightText;
use crate::invoice::ParsedInvoice;
use crate::llm::CompletionModel;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a judge produced no verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeFailureKind {
    Unavailable,
    MalformedResponse,
}

/// A recorded judge failure. Kept in the result rather than discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeFailure {
    pub judge: JudgeKind,
    pub kind: JudgeFailureKind,
    pub message: String,
}

impl From<JudgeError> for JudgeFailure {
    fn from(err: JudgeError) -> Self {
        let message = err.to_string();
        match err {
            JudgeError::Unavailable { judge, .. } => Self {
                judge,
                kind: JudgeFailureKind::Unavailable,
                message,
            },
            JudgeError::MalformedResponse { judge, .. } => Self {
                judge,
                kind: JudgeFailureKind::MalformedResponse,
                message,
            },
        }
    }
}

/// Verdicts that survived plus the judges that failed. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelResult {
    verdicts: Vec<Verdict>,
    failures: Vec<JudgeFailure>,
}

impl PanelResult {
    /// Split per-judge outcomes, keeping panel order. Fails when no judge
    /// produced a verdict.
    pub fn from_outcomes(
        outcomes: Vec<std::result::Result<Verdict, JudgeError>>,
    ) -> std::result::Result<Self, PanelExhausted> {
        let mut verdicts = Vec::new();
        let mut failures = Vec::new();

        for outcome in outcomes {
            match outcome {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => failures.push(JudgeFailure::from(err)),
            }
        }

        if verdicts.is_empty() {
            return Err(PanelExhausted { failures });
        }

        Ok(Self { verdicts, failures })
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn failures(&self) -> &[JudgeFailure] {
        &self.failures
    }

    /// Total judges that were asked.
    pub fn judge_count(&self) -> usize {
        self.verdicts.len() + self.failures.len()
    }
}

/// Why the panel produced no result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PanelError {
    #[error(transparent)]
    Exhausted(#[from] PanelExhausted),

    #[error("panel cancelled before all judges finished")]
    Cancelled,
}

/// A fixed set of judges evaluated together.
pub struct JudgePanel {
    judges: Vec<Arc<dyn Judge>>,
    judge_timeout: Duration,
}

impl JudgePanel {
    /// Create a panel. At least one judge is required.
    pub fn new(judges: Vec<Arc<dyn Judge>>, judge_timeout: Duration) -> Result<Self> {
        if judges.is_empty() {
            return Err(InsightEvalError::InvalidConfig(
                "a judge panel needs at least one judge".to_string(),
            ));
        }

        Ok(Self {
            judges,
            judge_timeout,
        })
    }

    /// Build the configured LLM-backed judges, all sharing one model.
    pub fn from_config(config: &PanelConfig, model: Arc<dyn CompletionModel>) -> Result<Self> {
        let judges = config
            .judges
            .iter()
            .map(|kind| build_judge(*kind, Arc::clone(&model)))
            .collect();

        Self::new(judges, config.judge_timeout())
    }

    pub fn judge_count(&self) -> usize {
        self.judges.len()
    }

    pub fn kinds(&self) -> Vec<JudgeKind> {
        self.judges.iter().map(|j| j.kind()).collect()
    }

    /// Run every judge concurrently and wait for all of them.
    ///
    /// Each call is bounded by the judge timeout; a timeout counts as
    /// [`JudgeError::Unavailable`]. Cancelling `cancel` drops the
    /// outstanding calls.
    pub async fn score(
        &self,
        invoice: &ParsedInvoice,
        insight: &InsightText,
        cancel: &CancellationToken,
    ) -> std::result::Result<PanelResult, PanelError> {
        let start = Instant::now();
        let timeout = self.judge_timeout;

        info!(judges = self.judges.len(), "Running judge panel");

        let calls: Vec<_> = self
            .judges
            .iter()
            .map(|judge| {
                let judge = Arc::clone(judge);

                async move {
                    let kind = judge.kind();
                    let started = Instant::now();

                    let outcome =
                        match tokio::time::timeout(timeout, judge.evaluate(invoice, insight)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(JudgeError::unavailable(
                                kind,
                                format!("timed out after {:?}", timeout),
                            )),
                        };

                    let latency_ms = started.elapsed().as_millis() as u64;
                    match &outcome {
                        Ok(verdict) => debug!(
                            judge = %kind,
                            score = verdict.score().normalized(),
                            latency_ms,
                            "Judge returned a verdict"
                        ),
                        Err(e) => warn!(judge = %kind, error = %e, latency_ms, "Judge failed"),
                    }

                    outcome
                }
            })
            .collect();

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Judge panel cancelled");
                return Err(PanelError::Cancelled);
            }
            outcomes = join_all(calls) => outcomes,
        };

        let result = PanelResult::from_outcomes(outcomes)?;

        info!(
            verdicts = result.verdicts().len(),
            failures = result.failures().len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Judge panel complete"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::judge::{Score, ScoreScale};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Judge with a fixed behaviour.
    struct FixedJudge {
        kind: JudgeKind,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    enum Behaviour {
        Score(f64),
        Unavailable,
        Malformed,
        Hang,
    }

    impl FixedJudge {
        fn arc(kind: JudgeKind, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Judge for FixedJudge {
        fn kind(&self) -> JudgeKind {
            self.kind
        }

        async fn evaluate(
            &self,
            _invoice: &ParsedInvoice,
            _insight: &InsightText,
        ) -> std::result::Result<Verdict, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Score(s) => Verdict::new(
                    self.kind,
                    Score::new(s, ScoreScale::UNIT).unwrap(),
                    "fixed",
                    vec![],
                ),
                Behaviour::Unavailable => Err(JudgeError::unavailable(self.kind, "down")),
                Behaviour::Malformed => Err(JudgeError::malformed(self.kind, "not json")),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(JudgeError::unavailable(self.kind, "unreachable"))
                }
            }
        }
    }

    fn evidence() -> (ParsedInvoice, InsightText) {
        let insight = InsightText::new("INV-1", vec!["Total is 10.00.".to_string()]).unwrap();
        (ParsedInvoice::default(), insight)
    }

    fn panel(judges: Vec<Arc<FixedJudge>>) -> JudgePanel {
        let judges = judges.into_iter().map(|j| j as Arc<dyn Judge>).collect();
        JudgePanel::new(judges, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_empty_panel_is_rejected() {
        assert!(JudgePanel::new(Vec::new(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_judge_failure_from_error() {
        let failure = JudgeFailure::from(JudgeError::malformed(JudgeKind::Clarity, "bad"));
        assert_eq!(failure.judge, JudgeKind::Clarity);
        assert_eq!(failure.kind, JudgeFailureKind::MalformedResponse);
        assert!(failure.message.contains("bad"));
    }

    #[tokio::test]
    async fn test_counts_add_up_with_mixed_outcomes() {
        let panel = panel(vec![
            FixedJudge::arc(JudgeKind::Accuracy, Behaviour::Score(0.9)),
            FixedJudge::arc(JudgeKind::Completeness, Behaviour::Malformed),
            FixedJudge::arc(JudgeKind::Clarity, Behaviour::Unavailable),
        ]);
        let (invoice, insight) = evidence();

        let result = panel
            .score(&invoice, &insight, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.verdicts().len(), 1);
        assert_eq!(result.failures().len(), 2);
        assert_eq!(result.judge_count(), panel.judge_count());
        assert_eq!(result.failures()[0].judge, JudgeKind::Completeness);
        assert_eq!(result.failures()[1].kind, JudgeFailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unavailable() {
        let panel = panel(vec![
            FixedJudge::arc(JudgeKind::Accuracy, Behaviour::Hang),
            FixedJudge::arc(JudgeKind::Completeness, Behaviour::Score(0.5)),
        ]);
        let (invoice, insight) = evidence();

        let result = panel
            .score(&invoice, &insight, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.verdicts()[0].judge(), JudgeKind::Completeness);
        assert_eq!(result.failures()[0].judge, JudgeKind::Accuracy);
        assert_eq!(result.failures()[0].kind, JudgeFailureKind::Unavailable);
        assert!(result.failures()[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_all_failed_is_exhausted() {
        let panel = panel(vec![
            FixedJudge::arc(JudgeKind::Accuracy, Behaviour::Unavailable),
            FixedJudge::arc(JudgeKind::Clarity, Behaviour::Malformed),
        ]);
        let (invoice, insight) = evidence();

        let err = panel
            .score(&invoice, &insight, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PanelError::Exhausted(exhausted) => assert_eq!(exhausted.failures.len(), 2),
            other => panic!("expected exhausted panel, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_panel() {
        let hanging = FixedJudge::arc(JudgeKind::Accuracy, Behaviour::Hang);
        let panel = JudgePanel::new(vec![hanging.clone() as Arc<dyn Judge>], Duration::from_secs(30))
            .unwrap();
        let (invoice, insight) = evidence();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = panel.score(&invoice, &insight, &cancel).await.unwrap_err();
        assert_eq!(err, PanelError::Cancelled);
        assert_eq!(hanging.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_every_judge_is_called_once() {
        let judges = vec![
            FixedJudge::arc(JudgeKind::Accuracy, Behaviour::Score(0.2)),
            FixedJudge::arc(JudgeKind::Completeness, Behaviour::Score(0.4)),
            FixedJudge::arc(JudgeKind::Clarity, Behaviour::Score(0.6)),
        ];
        let panel = panel(judges.clone());
        let (invoice, insight) = evidence();

        let result = panel
            .score(&invoice, &insight, &CancellationToken::new())
            .await
            .unwrap();

        assert!(judges.iter().all(|j| j.calls.load(Ordering::SeqCst) == 1));
        let order: Vec<_> = result.verdicts().iter().map(Verdict::judge).collect();
        assert_eq!(order, panel.kinds());
    }
}
