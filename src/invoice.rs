//! Invoice representation.
//!
//! [`InvoiceImage`] is the raw extraction input; [`ParsedInvoice`] is the
//! structured result the extractor produces and every later stage reads.

use crate::error::{InsightEvalError, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Allowed difference between the grand total and the sum of line totals.
pub const TOTAL_TOLERANCE: f64 = 0.01;

/// Image file extensions accepted as invoice scans.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// A scanned invoice image held in memory.
#[derive(Debug, Clone)]
pub struct InvoiceImage {
    /// Where the image came from (file path or upload name).
    pub source: PathBuf,
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// MIME type, e.g. "image/png".
    pub mime_type: String,
}

impl InvoiceImage {
    /// Load an image file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let mime_type = mime_type_for(path).ok_or_else(|| InsightEvalError::InvalidImage {
            path: path.to_path_buf(),
            reason: format!("unsupported extension (expected one of {:?})", IMAGE_EXTENSIONS),
        })?;

        let bytes = std::fs::read(path).map_err(|e| InsightEvalError::io(path, e))?;

        if bytes.is_empty() {
            return Err(InsightEvalError::InvalidImage {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }

        Ok(Self {
            source: path.to_path_buf(),
            bytes,
            mime_type: mime_type.to_string(),
        })
    }

    /// [`InvoiceImage::load`] on the blocking pool, for use inside async tasks.
    pub async fn load_async(path: &Path) -> Result<Self> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::load(&owned))
            .await
            .map_err(|e| InsightEvalError::io(path, std::io::Error::other(e)))?
    }

    /// Build an image from bytes already in memory.
    pub fn from_bytes(
        source: impl Into<PathBuf>,
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Base64 data URL for multimodal chat messages.
    pub fn data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, encoded)
    }

    /// Short label for logs and reports.
    pub fn label(&self) -> String {
        self.source.display().to_string()
    }
}

/// Guess the MIME type from the file extension.
pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// One line of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub line_total: Option<f64>,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: f64, unit_price: f64, line_total: f64) -> Self {
        Self {
            description: description.into(),
            quantity: Some(quantity),
            unit_price: Some(unit_price),
            line_total: Some(line_total),
        }
    }

    /// The printed line total, or quantity × unit price when it is missing.
    pub fn effective_total(&self) -> Option<f64> {
        self.line_total.or(match (self.quantity, self.unit_price) {
            (Some(q), Some(p)) => Some(q * p),
            _ => None,
        })
    }
}

/// Outcome of comparing the grand total with the line items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalCheck {
    /// Grand total matches the line sum (optionally plus tax).
    Consistent { line_sum: f64 },
    /// Grand total disagrees with the line sum.
    Mismatch {
        line_sum: f64,
        grand_total: f64,
        difference: f64,
    },
    /// Not enough data to check.
    Unverifiable,
}

impl TotalCheck {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, TotalCheck::Mismatch { .. })
    }
}

/// Structured invoice produced by the extraction stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedInvoice {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default)]
    pub tax: Option<f64>,
    #[serde(default)]
    pub grand_total: Option<f64>,
    #[serde(default)]
    pub payment_terms: Option<String>,
    /// Everything the extractor read off the image, unstructured.
    #[serde(default)]
    pub raw_text: String,
}

impl ParsedInvoice {
    /// Identity used to tie insight text to this invoice: the invoice number
    /// when printed, otherwise a content hash.
    pub fn invoice_id(&self) -> String {
        if let Some(number) = self.invoice_number.as_deref().map(str::trim) {
            if !number.is_empty() {
                return number.to_string();
            }
        }
        format!("hash-{}", self.content_digest())
    }

    /// First 16 hex chars of a SHA-256 over the identifying fields. Saved
    /// records carry this id, so the field layout must not change.
    fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |name: &str, value: &str| {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        };

        field("vendor", self.vendor.as_deref().unwrap_or(""));
        field("date", self.date.as_deref().unwrap_or(""));
        field("currency", self.currency.as_deref().unwrap_or(""));
        for item in &self.line_items {
            field("item", &item.description);
            field("total", &amount_bits(item.effective_total()));
        }
        field("grand_total", &amount_bits(self.grand_total));
        field("raw_text", &self.raw_text);

        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    /// Sum of the line totals that are known.
    pub fn line_sum(&self) -> Option<f64> {
        let totals: Vec<f64> = self
            .line_items
            .iter()
            .filter_map(LineItem::effective_total)
            .collect();

        if totals.is_empty() {
            None
        } else {
            Some(totals.iter().sum())
        }
    }

    /// Check the grand total against the line items. Never fails; a
    /// disagreement is reported as [`TotalCheck::Mismatch`].
    pub fn total_check(&self) -> TotalCheck {
        let (Some(line_sum), Some(grand_total)) = (self.line_sum(), self.grand_total) else {
            return TotalCheck::Unverifiable;
        };

        let difference = grand_total - line_sum;
        if difference.abs() <= TOTAL_TOLERANCE {
            return TotalCheck::Consistent { line_sum };
        }

        if let Some(tax) = self.tax {
            if (difference - tax).abs() <= TOTAL_TOLERANCE {
                return TotalCheck::Consistent { line_sum };
            }
        }

        TotalCheck::Mismatch {
            line_sum,
            grand_total,
            difference,
        }
    }

    /// Data points an insight set is expected to address.
    pub fn salient_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();

        if let Some(vendor) = &self.vendor {
            fields.push(format!("vendor: {}", vendor));
        }
        if let Some(number) = &self.invoice_number {
            fields.push(format!("invoice number: {}", number));
        }
        if let Some(date) = &self.date {
            fields.push(format!("date: {}", date));
        }
        if let Some(total) = self.grand_total {
            fields.push(format!("grand total: {}", self.money(total)));
        }
        if let Some(currency) = &self.currency {
            fields.push(format!("currency: {}", currency));
        }
        if let Some(tax) = self.tax {
            fields.push(format!("tax: {}", self.money(tax)));
        }
        if let Some(terms) = &self.payment_terms {
            fields.push(format!("payment terms: {}", terms));
        }
        for item in &self.line_items {
            fields.push(format!("line item: {}", item.description));
        }
        if let TotalCheck::Mismatch {
            line_sum,
            grand_total,
            ..
        } = self.total_check()
        {
            fields.push(format!(
                "anomaly: grand total {} differs from line item sum {}",
                self.money(grand_total),
                self.money(line_sum)
            ));
        }

        fields
    }

    /// Plain-text rendering used inside prompts.
    pub fn prompt_block(&self) -> String {
        let mut out = String::new();
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "(not printed)".to_string());

        let _ = writeln!(out, "Vendor: {}", or_unknown(&self.vendor));
        let _ = writeln!(out, "Invoice number: {}", or_unknown(&self.invoice_number));
        let _ = writeln!(out, "Date: {}", or_unknown(&self.date));
        let _ = writeln!(out, "Currency: {}", or_unknown(&self.currency));
        let _ = writeln!(out, "Line items:");

        if self.line_items.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for (i, item) in self.line_items.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. {} | qty {} | unit {} | total {}",
                i + 1,
                item.description,
                fmt_opt(item.quantity),
                fmt_opt(item.unit_price),
                fmt_opt(item.effective_total())
            );
        }

        let _ = writeln!(out, "Subtotal: {}", fmt_opt(self.subtotal));
        let _ = writeln!(out, "Tax: {}", fmt_opt(self.tax));
        let _ = writeln!(out, "Grand total: {}", fmt_opt(self.grand_total));
        let _ = write!(out, "Payment terms: {}", or_unknown(&self.payment_terms));

        out
    }

    fn money(&self, amount: f64) -> String {
        match &self.currency {
            Some(currency) => format!("{:.2} {}", amount, currency),
            None => format!("{:.2}", amount),
        }
    }
}

fn amount_bits(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:016x}", v.to_bits()))
        .unwrap_or_default()
}

fn fmt_opt(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_invoice() -> ParsedInvoice {
        ParsedInvoice {
            vendor: Some("Acme Supplies".to_string()),
            invoice_number: Some("INV-1001".to_string()),
            date: Some("2024-03-01".to_string()),
            currency: Some("USD".to_string()),
            line_items: vec![
                LineItem::new("Paper", 10.0, 5.0, 50.0),
                LineItem::new("Toner", 2.0, 25.0, 50.0),
            ],
            grand_total: Some(100.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_total_check_consistent() {
        let invoice = sample_invoice();
        assert_eq!(
            invoice.total_check(),
            TotalCheck::Consistent { line_sum: 100.0 }
        );
    }

    #[test]
    fn test_total_check_accepts_tax() {
        let mut invoice = sample_invoice();
        invoice.tax = Some(8.0);
        invoice.grand_total = Some(108.0);
        assert!(!invoice.total_check().is_mismatch());
    }

    #[test]
    fn test_total_check_flags_mismatch() {
        let mut invoice = sample_invoice();
        invoice.grand_total = Some(120.0);

        match invoice.total_check() {
            TotalCheck::Mismatch { difference, .. } => assert!((difference - 20.0).abs() < 1e-9),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert!(invoice.salient_fields().iter().any(|f| f.starts_with("anomaly:")));
    }

    #[test]
    fn test_total_check_unverifiable_without_total() {
        let mut invoice = sample_invoice();
        invoice.grand_total = None;
        assert_eq!(invoice.total_check(), TotalCheck::Unverifiable);
    }

    #[test]
    fn test_effective_total_derived_from_quantity() {
        let item = LineItem {
            description: "Widget".to_string(),
            quantity: Some(3.0),
            unit_price: Some(2.5),
            line_total: None,
        };
        assert_eq!(item.effective_total(), Some(7.5));
    }

    #[test]
    fn test_invoice_id_prefers_number() {
        let invoice = sample_invoice();
        assert_eq!(invoice.invoice_id(), "INV-1001");

        let mut anonymous = sample_invoice();
        anonymous.invoice_number = Some("  ".to_string());
        let id = anonymous.invoice_id();
        assert!(id.starts_with("hash-"));
        assert_eq!(id, anonymous.clone().invoice_id());
    }

    #[test]
    fn test_invoice_id_digest_is_pinned() {
        let mut anonymous = sample_invoice();
        anonymous.invoice_number = None;
        assert_eq!(anonymous.invoice_id(), "hash-30a3b855d2c47488");

        anonymous.grand_total = Some(101.0);
        assert_ne!(anonymous.invoice_id(), "hash-30a3b855d2c47488");
    }

    #[test]
    fn test_prompt_block_lists_items() {
        let block = sample_invoice().prompt_block();
        assert!(block.contains("Vendor: Acme Supplies"));
        assert!(block.contains("1. Paper | qty 10.00 | unit 5.00 | total 50.00"));
        assert!(block.contains("Grand total: 100.00"));
    }

    #[test]
    fn test_deserialize_with_nulls() {
        let json = r#"{"vendor": null, "line_items": [{"description": "Fee", "line_total": 12.5}], "grand_total": 12.5}"#;
        let invoice: ParsedInvoice = serde_json::from_str(json).unwrap();
        assert!(invoice.vendor.is_none());
        assert_eq!(invoice.line_items[0].quantity, None);
        assert_eq!(invoice.total_check(), TotalCheck::Consistent { line_sum: 12.5 });
    }

    #[test]
    fn test_image_load_rejects_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("invoice.txt");
        std::fs::write(&path, b"not an image").unwrap();

        let err = InvoiceImage::load(&path).unwrap_err();
        assert!(matches!(err, InsightEvalError::InvalidImage { .. }));
    }

    #[test]
    fn test_image_load_missing_and_empty() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            InvoiceImage::load(&dir.path().join("missing.png")),
            Err(InsightEvalError::Io { .. })
        ));

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            InvoiceImage::load(&empty),
            Err(InsightEvalError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_image_load_and_data_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.JPG");
        std::fs::write(&path, b"abc").unwrap();

        let image = InvoiceImage::load(&path).unwrap();
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.data_url(), "data:image/jpeg;base64,YWJj");
    }

    #[tokio::test]
    async fn test_image_load_async_reads_off_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, b"abc").unwrap();

        let image = InvoiceImage::load_async(&path).await.unwrap();
        assert_eq!(image.bytes, b"abc");
        assert_eq!(image.source, path);

        let missing = InvoiceImage::load_async(&dir.path().join("missing.png")).await;
        assert!(matches!(missing, Err(InsightEvalError::Io { .. })));
    }
}
