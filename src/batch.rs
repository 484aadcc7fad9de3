//! Batch runner: the full pipeline over a directory of invoice scans.

use crate::error::{InsightEvalError, Result};
use crate::invoice::IMAGE_EXTENSIONS;
use crate::persistence::{EvaluationRecord, SaveFormat, save_to_dir_async};
use crate::pipeline::{InvoicePipeline, PipelineState, PipelineStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Collect invoice images under `dir`, sorted by path.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(InsightEvalError::io(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }

    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_image(p))
        .collect();

    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// One summary row per input image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub file: String,
    pub run_id: String,
    pub status: PipelineStatus,
    /// Failure reason, for runs that did not reach `evaluated`.
    pub error: Option<String>,
    pub insights_count: Option<usize>,
    pub aggregate_score: Option<f64>,
    /// Normalized score per judge that returned a verdict.
    pub judge_scores: BTreeMap<String, f64>,
    pub failed_judges: Vec<String>,
    /// Where the full evaluation record was saved, if it was.
    pub record_path: Option<PathBuf>,
}

impl BatchEntry {
    fn from_state(file: String, state: &PipelineState) -> Self {
        let evaluation = state.evaluation();

        Self {
            file,
            run_id: state.run_id().to_string(),
            status: state.status(),
            error: state.failure().map(|f| f.to_string()),
            insights_count: state.insight().map(|i| i.len()),
            aggregate_score: evaluation.map(|e| e.aggregate_score()),
            judge_scores: evaluation
                .map(|e| {
                    e.verdicts()
                        .iter()
                        .map(|v| (v.judge().to_string(), v.score().normalized()))
                        .collect()
                })
                .unwrap_or_default(),
            failed_judges: evaluation
                .map(|e| {
                    e.failed_judges()
                        .iter()
                        .map(|f| f.judge.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            record_path: None,
        }
    }
}

/// Aggregated batch results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub evaluated: usize,
    pub failed: usize,
    /// Mean aggregate score over evaluated runs.
    pub mean_aggregate: Option<f64>,
    pub entries: Vec<BatchEntry>,
    pub total_time_secs: f64,
}

impl BatchReport {
    fn new(started_at: DateTime<Utc>, entries: Vec<BatchEntry>, total_time_secs: f64) -> Self {
        let scores: Vec<f64> = entries.iter().filter_map(|e| e.aggregate_score).collect();
        let evaluated = entries
            .iter()
            .filter(|e| e.status == PipelineStatus::Evaluated)
            .count();

        Self {
            started_at,
            total: entries.len(),
            evaluated,
            failed: entries.len() - evaluated,
            mean_aggregate: if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            },
            entries,
            total_time_secs,
        }
    }

    /// Print summary to stdout.
    pub fn print_summary(&self) {
        println!("\n============== Batch Results ==============");
        println!("{:<28} {:>9} {:>9} {:>8}", "File", "Status", "Score", "Failed");
        println!("{}", "-".repeat(57));
        for entry in &self.entries {
            let score = entry
                .aggregate_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<28} {:>9} {:>9} {:>8}",
                truncate(&entry.file, 28),
                entry.status.to_string(),
                score,
                entry.failed_judges.len()
            );
        }
        println!("{}", "-".repeat(57));
        println!(
            "Evaluated: {}/{}   Failed: {}",
            self.evaluated, self.total, self.failed
        );
        if let Some(mean) = self.mean_aggregate {
            println!("Mean aggregate score: {:.3}", mean);
        }
        println!("Total time: {:.1}s", self.total_time_secs);
        println!("===========================================\n");
    }

    /// Write `summary_<timestamp>.json` into `dir`.
    pub fn save_summary(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| InsightEvalError::io(dir, e))?;

        let path = dir.join(format!(
            "summary_{}.json",
            self.started_at.format("%Y%m%d_%H%M%S")
        ));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| InsightEvalError::Serialization(e.to_string()))?;
        fs::write(&path, json).map_err(|e| InsightEvalError::io(&path, e))?;

        Ok(path)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}

/// Runs one pipeline per image with bounded concurrency.
pub struct BatchRunner {
    pipeline: Arc<InvoicePipeline>,
    concurrency: usize,
    output: Option<(PathBuf, SaveFormat)>,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<InvoicePipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            output: None,
        }
    }

    /// Save a record for every evaluated run into `dir`.
    pub fn with_output(mut self, dir: impl Into<PathBuf>, format: SaveFormat) -> Self {
        self.output = Some((dir.into(), format));
        self
    }

    /// Run every image. Entries come back in input order. A failed run
    /// never stops the batch; cancelling `cancel` fails the remaining runs.
    pub async fn run(&self, images: &[PathBuf], cancel: &CancellationToken) -> BatchReport {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            images = images.len(),
            concurrency = self.concurrency,
            "Starting batch"
        );

        let entries: Vec<BatchEntry> = stream::iter(images)
            .map(|path| async move {
                let state = self.pipeline.run_path(path, cancel).await;
                self.summarize(path, &state).await
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let report = BatchReport::new(started_at, entries, start.elapsed().as_secs_f64());
        info!(
            evaluated = report.evaluated,
            failed = report.failed,
            "Batch complete"
        );
        report
    }

    async fn summarize(&self, path: &Path, state: &PipelineState) -> BatchEntry {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut entry = BatchEntry::from_state(file, state);

        if let (Some((dir, format)), Some(record)) =
            (&self.output, EvaluationRecord::from_state(state))
        {
            match save_to_dir_async(record, dir.clone(), *format).await {
                Ok(saved) => entry.record_path = Some(saved),
                Err(e) => warn!(file = %entry.file, error = %e, "Failed to save evaluation record"),
            }
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JudgeError;
    use crate::eval::{Judge, JudgeKind, JudgePanel, Score, ScoreScale, Verdict};
    use crate::extraction::InvoiceExtractor;
    use crate::generation::{InsightGenerator, InsightText};
    use crate::invoice::{InvoiceImage, LineItem, ParsedInvoice};
    use crate::persistence::load_record;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FileNameExtractor;

    #[async_trait]
    impl InvoiceExtractor for FileNameExtractor {
        async fn parse(&self, image: &InvoiceImage) -> Result<ParsedInvoice> {
            let name = image
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.starts_with("blank") {
                return Err(InsightEvalError::Extraction("no text found".to_string()));
            }
            Ok(ParsedInvoice {
                invoice_number: Some(name),
                line_items: vec![LineItem::new("Hours", 2.0, 50.0, 100.0)],
                grand_total: Some(100.0),
                ..Default::default()
            })
        }
    }

    struct OneLineGenerator;

    #[async_trait]
    impl InsightGenerator for OneLineGenerator {
        async fn generate(&self, invoice: &ParsedInvoice) -> Result<InsightText> {
            InsightText::new(invoice.invoice_id(), vec!["Two hours billed.".to_string()])
        }
    }

    struct HalfJudge;

    #[async_trait]
    impl Judge for HalfJudge {
        fn kind(&self) -> JudgeKind {
            JudgeKind::Clarity
        }

        async fn evaluate(
            &self,
            _invoice: &ParsedInvoice,
            _insight: &InsightText,
        ) -> std::result::Result<Verdict, JudgeError> {
            Verdict::new(
                JudgeKind::Clarity,
                Score::new(0.5, ScoreScale::UNIT).unwrap(),
                "average",
                vec![],
            )
        }
    }

    fn pipeline() -> Arc<InvoicePipeline> {
        let panel = JudgePanel::new(vec![Arc::new(HalfJudge) as Arc<dyn Judge>], Duration::from_secs(1)).unwrap();
        Arc::new(InvoicePipeline::new(
            Arc::new(FileNameExtractor),
            Arc::new(OneLineGenerator),
            panel,
        ))
    }

    fn write_images(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), [0x89, 0x50, 0x4e, 0x47]).unwrap();
        }
    }

    #[test]
    fn test_collect_images_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), &["b.PNG", "a.jpg", "notes.txt"]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        write_images(&dir.path().join("nested"), &["c.webp"]);

        let images = tokio_test::assert_ok!(collect_images(dir.path()));
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();

        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.webp"]);
    }

    #[test]
    fn test_collect_images_missing_dir() {
        tokio_test::assert_err!(collect_images(Path::new("/nonexistent/scans")));
    }

    #[tokio::test]
    async fn test_batch_keeps_going_after_failure() {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), &["inv-1.png", "blank.png", "inv-2.jpg"]);
        let images = collect_images(dir.path()).unwrap();
        let out = dir.path().join("results");

        let runner = BatchRunner::new(pipeline(), 2).with_output(&out, SaveFormat::Json);
        let report = runner.run(&images, &CancellationToken::new()).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.entries[0].file, "blank.png");
        assert!(report.entries[0].error.as_deref().unwrap().contains("extraction failed"));
        assert!(report.entries[0].record_path.is_none());
        assert!((report.mean_aggregate.unwrap() - 0.5).abs() < 1e-9);

        let saved = report.entries[1].record_path.as_ref().unwrap();
        let record = load_record(saved).unwrap();
        assert_eq!(record.evaluation.verdicts().len(), 1);

        let summary = report.save_summary(&out).unwrap();
        let name = summary.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("summary_") && name.ends_with(".json"));
    }

    #[tokio::test]
    async fn test_cancelled_batch_fails_every_run() {
        let dir = TempDir::new().unwrap();
        write_images(dir.path(), &["inv-1.png", "inv-2.png"]);
        let images = collect_images(dir.path()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = BatchRunner::new(pipeline(), 1).run(&images, &cancel).await;

        assert_eq!(report.evaluated, 0);
        assert!(report.mean_aggregate.is_none());
        assert!(report
            .entries
            .iter()
            .all(|e| e.status == PipelineStatus::Failed));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short.png", 28), "short.png");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
    }
}
