//! Extraction stage: invoice image to [`ParsedInvoice`].
//!
//! The pipeline only sees the [`InvoiceExtractor`] trait. [`VisionExtractor`]
//! implements it with a single multimodal chat completion that transcribes
//! the image and returns the fields as JSON.

use crate::error::{InsightEvalError, Result};
use crate::invoice::{InvoiceImage, LineItem, ParsedInvoice};
use crate::llm::{LlmClient, Prompts, extract_json};
use async_trait::async_trait;
use serde::Deserialize;

/// Turns an invoice image into structured fields.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InvoiceExtractor: Send + Sync {
    async fn parse(&self, image: &InvoiceImage) -> Result<ParsedInvoice>;
}

/// Extractor backed by a vision-capable chat model.
pub struct VisionExtractor {
    client: LlmClient,
}

impl VisionExtractor {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Parse the model's JSON answer into a [`ParsedInvoice`].
    fn parse_extraction_response(response: &str) -> Result<ParsedInvoice> {
        let json_str = extract_json(response);

        #[derive(Deserialize)]
        struct RawInvoice {
            #[serde(default)]
            raw_text: Option<String>,
            #[serde(default)]
            vendor: Option<String>,
            #[serde(default)]
            invoice_number: Option<String>,
            #[serde(default)]
            date: Option<String>,
            #[serde(default)]
            currency: Option<String>,
            #[serde(default)]
            line_items: Vec<LineItem>,
            #[serde(default)]
            subtotal: Option<f64>,
            #[serde(default)]
            tax: Option<f64>,
            #[serde(default)]
            grand_total: Option<f64>,
            #[serde(default)]
            payment_terms: Option<String>,
        }

        let raw: RawInvoice = serde_json::from_str(&json_str).map_err(|e| {
            InsightEvalError::Extraction(format!(
                "Failed to parse extraction response: {}. Response: {}",
                e,
                response.chars().take(200).collect::<String>()
            ))
        })?;

        let invoice = ParsedInvoice {
            vendor: non_blank(raw.vendor),
            invoice_number: non_blank(raw.invoice_number),
            date: non_blank(raw.date),
            currency: non_blank(raw.currency),
            line_items: raw
                .line_items
                .into_iter()
                .filter(|item| !item.description.trim().is_empty())
                .collect(),
            subtotal: raw.subtotal,
            tax: raw.tax,
            grand_total: raw.grand_total,
            payment_terms: non_blank(raw.payment_terms),
            raw_text: raw.raw_text.unwrap_or_default(),
        };

        if invoice.line_items.is_empty()
            && invoice.grand_total.is_none()
            && invoice.raw_text.trim().is_empty()
        {
            return Err(InsightEvalError::Extraction(
                "No invoice data found in image".to_string(),
            ));
        }

        Ok(invoice)
    }
}

#[async_trait]
impl InvoiceExtractor for VisionExtractor {
    async fn parse(&self, image: &InvoiceImage) -> Result<ParsedInvoice> {
        let response = self
            .client
            .complete_with_image(
                Some(Prompts::system_invoice_reader()),
                image,
                Prompts::extract_invoice(),
            )
            .await?;

        let invoice = Self::parse_extraction_response(&response)?;

        tracing::debug!(
            source = %image.label(),
            line_items = invoice.line_items.len(),
            total_check = ?invoice.total_check(),
            "Invoice extracted"
        );

        Ok(invoice)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extraction_response() {
        let response = r#"```json
{
    "raw_text": "ACME SUPPLIES Invoice INV-7 ...",
    "vendor": "Acme Supplies",
    "invoice_number": "INV-7",
    "date": "2024-05-02",
    "currency": "EUR",
    "line_items": [
        {"description": "Chairs", "quantity": 4, "unit_price": 50.0, "line_total": 200.0},
        {"description": "  ", "quantity": null, "unit_price": null, "line_total": null}
    ],
    "subtotal": 200.0,
    "tax": 38.0,
    "grand_total": 238.0,
    "payment_terms": ""
}
```"#;
        let invoice = VisionExtractor::parse_extraction_response(response).unwrap();

        assert_eq!(invoice.vendor.as_deref(), Some("Acme Supplies"));
        assert_eq!(invoice.line_items.len(), 1);
        assert_eq!(invoice.payment_terms, None);
        assert!(!invoice.total_check().is_mismatch());
        assert!(invoice.raw_text.starts_with("ACME"));
    }

    #[test]
    fn test_parse_extraction_response_rejects_garbage() {
        let err = VisionExtractor::parse_extraction_response("I cannot read this image.").unwrap_err();
        assert!(matches!(err, InsightEvalError::Extraction(_)));
    }

    #[test]
    fn test_parse_extraction_response_rejects_empty_invoice() {
        let err = VisionExtractor::parse_extraction_response(r#"{"line_items": []}"#).unwrap_err();
        assert!(matches!(err, InsightEvalError::Extraction(_)));
    }
}
