//! Generation stage: [`ParsedInvoice`] to [`InsightText`].

use crate::error::{InsightEvalError, Result};
use crate::invoice::ParsedInvoice;
use crate::llm::{CompletionModel, Prompts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Generated analysis for one invoice. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightText {
    invoice_id: String,
    insights: Vec<String>,
}

impl InsightText {
    /// Create insight text for the invoice with the given identity.
    /// Blank entries are dropped; an empty result is an error.
    pub fn new(invoice_id: impl Into<String>, insights: Vec<String>) -> Result<Self> {
        let insights: Vec<String> = insights
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if insights.is_empty() {
            return Err(InsightEvalError::Generation(
                "insight text must contain at least one insight".to_string(),
            ));
        }

        Ok(Self {
            invoice_id: invoice_id.into(),
            insights,
        })
    }

    /// Identity of the invoice these insights were generated from.
    pub fn invoice_id(&self) -> &str {
        &self.invoice_id
    }

    pub fn insights(&self) -> &[String] {
        &self.insights
    }

    pub fn len(&self) -> usize {
        self.insights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insights.is_empty()
    }

    /// Numbered list, one insight per line, as shown to judges.
    pub fn numbered(&self) -> String {
        self.insights
            .iter()
            .enumerate()
            .map(|(i, insight)| format!("  Insight {}: {}", i + 1, insight))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Produces insight text for a parsed invoice.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, invoice: &ParsedInvoice) -> Result<InsightText>;
}

/// Generator backed by a chat model.
pub struct LlmInsightGenerator {
    model: Arc<dyn CompletionModel>,
}

impl LlmInsightGenerator {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl InsightGenerator for LlmInsightGenerator {
    async fn generate(&self, invoice: &ParsedInvoice) -> Result<InsightText> {
        let prompt = Prompts::generate_insights().replace("{invoice}", &invoice.prompt_block());

        let response = self
            .model
            .complete(Some(Prompts::system_financial_analyst()), &prompt)
            .await?;

        let insights = parse_insights(&response);
        tracing::debug!(
            model = self.model.model_name(),
            insights = insights.len(),
            "Insights generated"
        );

        InsightText::new(invoice.invoice_id(), insights)
    }
}

/// Split a numbered-list answer into individual insights.
///
/// Leading numbering ("1.", "2)", "10.") and bullet markers are stripped.
pub fn parse_insights(response: &str) -> Vec<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(strip_marker)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_marker(line: &str) -> &str {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && digits < 3 {
        let rest = &line[digits..];
        // "10.5% ..." is a figure, not a marker; markers end at whitespace.
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            if stripped.is_empty() || stripped.starts_with(char::is_whitespace) {
                return stripped.trim();
            }
        }
    }

    for bullet in ["- ", "* ", "• "] {
        if let Some(stripped) = line.strip_prefix(bullet) {
            return stripped.trim();
        }
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::LineItem;
    use std::sync::Mutex;

    struct CannedModel {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionModel for CannedModel {
        async fn complete(&self, _system: Option<&str>, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(self.answer.clone())
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn test_parse_insights_strips_numbering() {
        let response = "1. Total is $100.\n2) Two items billed.\n\n10. Paid on time.\n- Bullet insight";
        let insights = parse_insights(response);
        assert_eq!(
            insights,
            vec![
                "Total is $100.",
                "Two items billed.",
                "Paid on time.",
                "Bullet insight"
            ]
        );
    }

    #[test]
    fn test_parse_insights_keeps_leading_amounts() {
        let insights = parse_insights("2024 spend is concentrated in one vendor.");
        assert_eq!(insights, vec!["2024 spend is concentrated in one vendor."]);
    }

    #[test]
    fn test_parse_insights_keeps_decimal_figures() {
        let insights = parse_insights("10.5% of spend went to toner.\n3) 2.5 boxes short.");
        assert_eq!(
            insights,
            vec!["10.5% of spend went to toner.", "2.5 boxes short."]
        );
    }

    #[test]
    fn test_insight_text_rejects_empty() {
        assert!(InsightText::new("INV-1", vec![" ".to_string()]).is_err());
        let text = InsightText::new("INV-1", vec!["a".to_string(), "".to_string()]).unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text.numbered(), "  Insight 1: a");
    }

    #[tokio::test]
    async fn test_llm_generator_ties_text_to_invoice() {
        let model = Arc::new(CannedModel {
            answer: "1. Acme billed 100.00 USD.\n2. Paper and toner split evenly.".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmInsightGenerator::new(model.clone());

        let invoice = ParsedInvoice {
            vendor: Some("Acme".to_string()),
            invoice_number: Some("INV-9".to_string()),
            line_items: vec![LineItem::new("Paper", 1.0, 100.0, 100.0)],
            grand_total: Some(100.0),
            ..Default::default()
        };

        let text = generator.generate(&invoice).await.unwrap();
        assert_eq!(text.invoice_id(), "INV-9");
        assert_eq!(text.len(), 2);
        assert!(model.prompts.lock().unwrap()[0].contains("Vendor: Acme"));
    }

    #[tokio::test]
    async fn test_llm_generator_empty_answer_is_error() {
        let model = Arc::new(CannedModel {
            answer: "   ".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmInsightGenerator::new(model);

        let result = generator.generate(&ParsedInvoice::default()).await;
        assert!(matches!(result, Err(InsightEvalError::Generation(_))));
    }
}
