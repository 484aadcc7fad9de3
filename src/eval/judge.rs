//! LLM-as-Judge scoring strategies.
//!
//! Every judge implements [`Judge`] and is identified by a [`JudgeKind`].
//! The set of kinds is closed; [`build_judge`] maps a kind to its strategy.

use crate::error::JudgeError;
use crate::generation::InsightText;
use crate::invoice::{ParsedInvoice, TotalCheck};
use crate::llm::{CompletionModel, Prompts, extract_json};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// The closed set of judge strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeKind {
    /// Claims in the insights match the invoice's numbers.
    Accuracy,
    /// Insights cover the invoice's salient fields.
    Completeness,
    /// Readability and structure of the insights alone.
    Clarity,
    /// Structured fields agree with the raw transcription.
    Consistency,
}

impl JudgeKind {
    /// Panel used when nothing is configured.
    pub const DEFAULT_PANEL: [JudgeKind; 3] =
        [JudgeKind::Accuracy, JudgeKind::Completeness, JudgeKind::Clarity];

    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Accuracy => "accuracy",
            JudgeKind::Completeness => "completeness",
            JudgeKind::Clarity => "clarity",
            JudgeKind::Consistency => "consistency",
        }
    }
}

impl fmt::Display for JudgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared range of a judge's raw score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreScale {
    pub min: f64,
    pub max: f64,
}

impl ScoreScale {
    pub const UNIT: ScoreScale = ScoreScale { min: 0.0, max: 1.0 };
    pub const PERCENT: ScoreScale = ScoreScale { min: 0.0, max: 100.0 };
    pub const RUBRIC: ScoreScale = ScoreScale { min: 1.0, max: 4.0 };
}

/// A raw score together with its scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredScore")]
pub struct Score {
    raw: f64,
    scale: ScoreScale,
}

/// Wire form of [`Score`]; checked before it becomes one.
#[derive(Deserialize)]
struct StoredScore {
    raw: f64,
    scale: ScoreScale,
}

impl TryFrom<StoredScore> for Score {
    type Error = String;

    fn try_from(stored: StoredScore) -> Result<Self, Self::Error> {
        let ScoreScale { min, max } = stored.scale;
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(format!("invalid score scale [{}, {}]", min, max));
        }
        // NaN fails both comparisons.
        if !(stored.raw >= min && stored.raw <= max) {
            return Err(format!("score {} outside [{}, {}]", stored.raw, min, max));
        }
        Ok(Self {
            raw: stored.raw,
            scale: stored.scale,
        })
    }
}

impl Score {
    /// Build a score, clamping into the scale. Returns `None` for NaN.
    pub fn new(raw: f64, scale: ScoreScale) -> Option<Self> {
        if raw.is_nan() {
            return None;
        }
        Some(Self {
            raw: raw.clamp(scale.min, scale.max),
            scale,
        })
    }

    pub fn raw(&self) -> f64 {
        self.raw
    }

    pub fn scale(&self) -> ScoreScale {
        self.scale
    }

    /// The score mapped onto [0, 1].
    pub fn normalized(&self) -> f64 {
        let span = self.scale.max - self.scale.min;
        if span <= 0.0 {
            return 0.0;
        }
        ((self.raw - self.scale.min) / span).clamp(0.0, 1.0)
    }
}

/// One judge's verdict on one (invoice, insight) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredVerdict")]
pub struct Verdict {
    judge: JudgeKind,
    score: Score,
    rationale: String,
    findings: Vec<String>,
}

#[derive(Deserialize)]
struct StoredVerdict {
    judge: JudgeKind,
    score: Score,
    rationale: String,
    findings: Vec<String>,
}

impl TryFrom<StoredVerdict> for Verdict {
    type Error = String;

    fn try_from(stored: StoredVerdict) -> Result<Self, Self::Error> {
        Verdict::new(stored.judge, stored.score, stored.rationale, stored.findings)
            .map_err(|e| e.to_string())
    }
}

impl Verdict {
    /// Create a verdict. An empty rationale makes the response malformed.
    pub fn new(
        judge: JudgeKind,
        score: Score,
        rationale: impl Into<String>,
        findings: Vec<String>,
    ) -> Result<Self, JudgeError> {
        let rationale = rationale.into().trim().to_string();
        if rationale.is_empty() {
            return Err(JudgeError::malformed(judge, "empty rationale"));
        }
        Ok(Self {
            judge,
            score,
            rationale,
            findings,
        })
    }

    pub fn judge(&self) -> JudgeKind {
        self.judge
    }

    pub fn score(&self) -> Score {
        self.score
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn findings(&self) -> &[String] {
        &self.findings
    }
}

/// A scoring strategy. Implementations must not share mutable state so that
/// a panel can run them concurrently.
#[async_trait]
pub trait Judge: Send + Sync {
    fn kind(&self) -> JudgeKind;

    async fn evaluate(
        &self,
        invoice: &ParsedInvoice,
        insight: &InsightText,
    ) -> Result<Verdict, JudgeError>;
}

/// Build the LLM-backed judge for a kind.
pub fn build_judge(kind: JudgeKind, model: Arc<dyn CompletionModel>) -> Arc<dyn Judge> {
    match kind {
        JudgeKind::Accuracy => Arc::new(AccuracyJudge::new(model)),
        JudgeKind::Completeness => Arc::new(CompletenessJudge::new(model)),
        JudgeKind::Clarity => Arc::new(ClarityJudge::new(model)),
        JudgeKind::Consistency => Arc::new(ConsistencyJudge::new(model)),
    }
}

/// Send a prompt; any transport or API error makes the judge unavailable.
async fn ask(
    model: &dyn CompletionModel,
    kind: JudgeKind,
    prompt: &str,
) -> Result<String, JudgeError> {
    model
        .complete(Some(Prompts::system_judge()), prompt)
        .await
        .map_err(|e| JudgeError::unavailable(kind, e.to_string()))
}

/// Parse a judge's JSON answer.
fn parse_response<T: DeserializeOwned>(kind: JudgeKind, response: &str) -> Result<T, JudgeError> {
    let json_str = extract_json(response);
    serde_json::from_str(&json_str).map_err(|e| {
        JudgeError::malformed(
            kind,
            format!(
                "{}. Response: {}",
                e,
                response.chars().take(200).collect::<String>()
            ),
        )
    })
}

/// Accept `80`, `80.5` or `"80"` for score fields.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(n)) => Some(n),
        Some(NumberOrText::Text(s)) => s.trim().trim_end_matches('%').parse().ok(),
        None => None,
    })
}

fn score_or_malformed(kind: JudgeKind, raw: f64, scale: ScoreScale) -> Result<Score, JudgeError> {
    Score::new(raw, scale).ok_or_else(|| JudgeError::malformed(kind, "score is not a number"))
}

/// Share of `part` in `part + rest`, on the percent scale.
fn percent(part: usize, rest: usize) -> Option<f64> {
    let total = part + rest;
    (total > 0).then(|| 100.0 * part as f64 / total as f64)
}

/// Checks insight claims against the invoice's numeric fields.
pub struct AccuracyJudge {
    model: Arc<dyn CompletionModel>,
}

impl AccuracyJudge {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    fn computed_checks(invoice: &ParsedInvoice) -> String {
        let line_sum = invoice
            .line_sum()
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "unknown".to_string());

        let total_check = match invoice.total_check() {
            TotalCheck::Consistent { .. } => "grand total matches the line items".to_string(),
            TotalCheck::Mismatch { difference, .. } => format!(
                "grand total differs from the line items by {:.2}",
                difference
            ),
            TotalCheck::Unverifiable => "grand total cannot be checked".to_string(),
        };

        format!("Sum of line totals: {}\nTotal check: {}", line_sum, total_check)
    }

    fn parse_verdict(response: &str) -> Result<Verdict, JudgeError> {
        const KIND: JudgeKind = JudgeKind::Accuracy;

        #[derive(Deserialize)]
        struct RawInsightLabel {
            #[serde(default)]
            insight: Option<usize>,
            label: String,
            #[serde(default)]
            issue: Option<String>,
        }

        #[derive(Deserialize)]
        struct RawAccuracy {
            #[serde(default)]
            explanation: String,
            #[serde(default)]
            per_insight: Vec<RawInsightLabel>,
            #[serde(default, deserialize_with = "lenient_number")]
            accuracy_score: Option<f64>,
        }

        let raw: RawAccuracy = parse_response(KIND, response)?;

        let mut factual = 0usize;
        let mut partial = 0usize;
        let mut findings = Vec::new();

        for (i, item) in raw.per_insight.iter().enumerate() {
            let number = item.insight.unwrap_or(i + 1);
            match item.label.trim().to_lowercase().as_str() {
                "factual" => factual += 1,
                "partial" => partial += 1,
                "hallucinated" => {}
                other => {
                    return Err(JudgeError::malformed(
                        KIND,
                        format!("unknown label '{}' for insight {}", other, number),
                    ));
                }
            }
            if let Some(issue) = item.issue.as_deref().filter(|s| !s.trim().is_empty()) {
                findings.push(format!("insight {} ({}): {}", number, item.label.trim(), issue));
            }
        }

        let raw_score = if raw.per_insight.is_empty() {
            raw.accuracy_score
                .ok_or_else(|| JudgeError::malformed(KIND, "no per-insight labels or accuracy_score"))?
        } else {
            100.0 * (factual as f64 + 0.5 * partial as f64) / raw.per_insight.len() as f64
        };

        Verdict::new(
            KIND,
            score_or_malformed(KIND, raw_score, ScoreScale::PERCENT)?,
            raw.explanation,
            findings,
        )
    }
}

#[async_trait]
impl Judge for AccuracyJudge {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Accuracy
    }

    async fn evaluate(
        &self,
        invoice: &ParsedInvoice,
        insight: &InsightText,
    ) -> Result<Verdict, JudgeError> {
        let prompt = Prompts::judge_accuracy()
            .replace("{invoice}", &invoice.prompt_block())
            .replace("{checks}", &Self::computed_checks(invoice))
            .replace("{insights}", &insight.numbered());

        let response = ask(self.model.as_ref(), self.kind(), &prompt).await?;
        Self::parse_verdict(&response)
    }
}

/// Checks that the insights address the invoice's salient fields.
pub struct CompletenessJudge {
    model: Arc<dyn CompletionModel>,
}

impl CompletenessJudge {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    fn parse_verdict(response: &str) -> Result<Verdict, JudgeError> {
        const KIND: JudgeKind = JudgeKind::Completeness;

        #[derive(Deserialize)]
        struct RawCompleteness {
            #[serde(default)]
            explanation: String,
            #[serde(default)]
            covered: Vec<String>,
            #[serde(default)]
            missing: Vec<String>,
            #[serde(default, deserialize_with = "lenient_number")]
            completeness_score: Option<f64>,
        }

        let raw: RawCompleteness = parse_response(KIND, response)?;

        let raw_score = percent(raw.covered.len(), raw.missing.len())
            .or(raw.completeness_score)
            .ok_or_else(|| JudgeError::malformed(KIND, "no coverage lists or completeness_score"))?;

        let findings = raw
            .missing
            .iter()
            .map(|field| format!("missing: {}", field))
            .collect();

        Verdict::new(
            KIND,
            score_or_malformed(KIND, raw_score, ScoreScale::PERCENT)?,
            raw.explanation,
            findings,
        )
    }
}

#[async_trait]
impl Judge for CompletenessJudge {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Completeness
    }

    async fn evaluate(
        &self,
        invoice: &ParsedInvoice,
        insight: &InsightText,
    ) -> Result<Verdict, JudgeError> {
        let salient = invoice
            .salient_fields()
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::judge_completeness()
            .replace("{invoice}", &invoice.prompt_block())
            .replace("{salient}", &salient)
            .replace("{insights}", &insight.numbered());

        let response = ask(self.model.as_ref(), self.kind(), &prompt).await?;
        Self::parse_verdict(&response)
    }
}

/// Scores readability and structure of the insights, ignoring the invoice.
pub struct ClarityJudge {
    model: Arc<dyn CompletionModel>,
}

impl ClarityJudge {
    const CRITERIA: [&'static str; 4] = ["clarity", "specificity", "diversity", "actionability"];

    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    fn level(label: &str) -> Option<f64> {
        match label.trim().to_lowercase().as_str() {
            "excellent" => Some(4.0),
            "good" => Some(3.0),
            "fair" => Some(2.0),
            "poor" => Some(1.0),
            _ => None,
        }
    }

    fn parse_verdict(response: &str) -> Result<Verdict, JudgeError> {
        const KIND: JudgeKind = JudgeKind::Clarity;

        #[derive(Deserialize)]
        struct RawClarity {
            #[serde(default)]
            explanation: String,
            clarity: String,
            specificity: String,
            diversity: String,
            actionability: String,
        }

        let raw: RawClarity = parse_response(KIND, response)?;
        let labels = [&raw.clarity, &raw.specificity, &raw.diversity, &raw.actionability];

        let mut total = 0.0;
        let mut findings = Vec::with_capacity(labels.len());
        for (criterion, label) in Self::CRITERIA.iter().zip(labels) {
            let level = Self::level(label).ok_or_else(|| {
                JudgeError::malformed(KIND, format!("unknown {} level '{}'", criterion, label))
            })?;
            total += level;
            findings.push(format!("{}: {}", criterion, label.trim().to_lowercase()));
        }

        Verdict::new(
            KIND,
            score_or_malformed(KIND, total / labels.len() as f64, ScoreScale::RUBRIC)?,
            raw.explanation,
            findings,
        )
    }
}

#[async_trait]
impl Judge for ClarityJudge {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Clarity
    }

    async fn evaluate(
        &self,
        _invoice: &ParsedInvoice,
        insight: &InsightText,
    ) -> Result<Verdict, JudgeError> {
        let prompt = Prompts::judge_clarity().replace("{insights}", &insight.numbered());

        let response = ask(self.model.as_ref(), self.kind(), &prompt).await?;
        Self::parse_verdict(&response)
    }
}

/// Compares the structured fields with the extractor's raw transcription.
pub struct ConsistencyJudge {
    model: Arc<dyn CompletionModel>,
}

impl ConsistencyJudge {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    fn parse_verdict(response: &str) -> Result<Verdict, JudgeError> {
        const KIND: JudgeKind = JudgeKind::Consistency;

        #[derive(Deserialize)]
        struct RawMismatch {
            field: String,
            #[serde(default)]
            structured: Option<String>,
            #[serde(default)]
            raw: Option<String>,
        }

        #[derive(Deserialize)]
        struct RawConsistency {
            #[serde(default)]
            explanation: String,
            #[serde(default)]
            matches: Vec<serde_json::Value>,
            #[serde(default)]
            mismatches: Vec<RawMismatch>,
            #[serde(default, deserialize_with = "lenient_number")]
            score: Option<f64>,
        }

        let raw: RawConsistency = parse_response(KIND, response)?;

        let raw_score = percent(raw.matches.len(), raw.mismatches.len())
            .or(raw.score)
            .ok_or_else(|| JudgeError::malformed(KIND, "no comparison lists or score"))?;

        let findings = raw
            .mismatches
            .iter()
            .map(|m| {
                format!(
                    "{}: structured {} vs raw {}",
                    m.field,
                    m.structured.as_deref().unwrap_or("(absent)"),
                    m.raw.as_deref().unwrap_or("(absent)")
                )
            })
            .collect();

        Verdict::new(
            KIND,
            score_or_malformed(KIND, raw_score, ScoreScale::PERCENT)?,
            raw.explanation,
            findings,
        )
    }
}

#[async_trait]
impl Judge for ConsistencyJudge {
    fn kind(&self) -> JudgeKind {
        JudgeKind::Consistency
    }

    async fn evaluate(
        &self,
        invoice: &ParsedInvoice,
        _insight: &InsightText,
    ) -> Result<Verdict, JudgeError> {
        if invoice.raw_text.trim().is_empty() {
            return Err(JudgeError::unavailable(
                self.kind(),
                "no raw transcription to compare against",
            ));
        }

        let prompt = Prompts::judge_consistency()
            .replace("{invoice}", &invoice.prompt_block())
            .replace("{raw_text}", &invoice.raw_text);

        let response = ask(self.model.as_ref(), self.kind(), &prompt).await?;
        Self::parse_verdict(&response)
    }
}
