//! Invoice Insight Evaluator CLI
//!
//! Runs the extraction, generation and judge-panel pipeline on invoice scans.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use invoice_insight_eval::{
    batch::{BatchRunner, collect_images},
    config::{Config, Stage},
    llm::LlmClient,
    persistence::{EvaluationRecord, SaveFormat, load_record, record_exists, record_size, save_to_dir},
    pipeline::{InvoicePipeline, PipelineState, PipelineStatus},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Invoice Insight Evaluator - LLM insights on invoices, scored by a judge panel
#[derive(Parser)]
#[command(name = "invoice-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Bincode,
}

impl From<Format> for SaveFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => SaveFormat::Json,
            Format::Bincode => SaveFormat::Bincode,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on one invoice image
    Run {
        /// Path to the invoice image (png, jpg, jpeg, webp, gif)
        image: PathBuf,

        /// Directory to save the evaluation record into
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Record format when saving
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,

        /// Print the final pipeline state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline on every invoice image in a directory
    Batch {
        /// Directory containing invoice images
        dir: PathBuf,

        /// Directory for evaluation records and the summary
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Number of invoices processed at once (defaults to config)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Record format when saving
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
    },

    /// Display a saved evaluation record
    Show {
        /// Path to the record file (.json or .bin)
        record: PathBuf,

        /// Output as JSON instead of a formatted report
        #[arg(long)]
        json: bool,
    },

    /// Test LLM connection for each stage
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            image,
            output,
            format,
            json,
        } => cmd_run(image, output, format.into(), json).await,
        Commands::Batch {
            dir,
            output,
            concurrency,
            format,
        } => cmd_batch(dir, output, concurrency, format.into()).await,
        Commands::Show { record, json } => cmd_show(record, json),
        Commands::Test => cmd_test().await,
    }
}

/// `RUST_LOG` directives when set; otherwise DEBUG with `--verbose`, WARN without.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let fallback = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    EnvFilter::builder()
        .with_default_directive(fallback.into())
        .parse_lossy(rust_log.unwrap_or_default())
}

fn load_config() -> Result<Config> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Token cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

async fn cmd_run(
    image: PathBuf,
    output: Option<PathBuf>,
    format: SaveFormat,
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    let pipeline = InvoicePipeline::from_config(&config).context("Failed to build pipeline")?;

    if !json {
        println!("Evaluating invoice: {}", image.display());
        println!("  Extraction model: {}", config.llm_for(Stage::Extraction).model);
        println!("  Generation model: {}", config.llm_for(Stage::Generation).model);
        println!(
            "  Judge model:      {} ({} judges)",
            config.llm_for(Stage::Evaluation).model,
            pipeline.panel().judge_count()
        );
    }

    let start = Instant::now();
    let state = pipeline.run_path(&image, &cancel_on_ctrl_c()).await;
    let duration = start.elapsed();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("Failed to serialize state")?
        );
    } else {
        print_state(&state);
        println!("\nFinished in {:.2?}", duration);
    }

    if let (Some(dir), Some(record)) = (output, EvaluationRecord::from_state(&state)) {
        let path = save_to_dir(&record, &dir, format).context("Failed to save record")?;
        if !json {
            println!("Record saved to: {}", path.display());
        }
    }

    if state.status() == PipelineStatus::Failed {
        std::process::exit(1);
    }

    Ok(())
}

async fn cmd_batch(
    dir: PathBuf,
    output: PathBuf,
    concurrency: Option<usize>,
    format: SaveFormat,
) -> Result<()> {
    let config = load_config()?;
    let images = collect_images(&dir).context("Failed to read image directory")?;

    if images.is_empty() {
        println!("No invoice images found in {}", dir.display());
        return Ok(());
    }

    let concurrency = concurrency.unwrap_or(config.batch.concurrency);
    println!(
        "Processing {} invoices from {} ({} at a time)",
        images.len(),
        dir.display(),
        concurrency
    );

    let pipeline = InvoicePipeline::from_config(&config).context("Failed to build pipeline")?;
    let runner = BatchRunner::new(Arc::new(pipeline), concurrency).with_output(&output, format);

    let report = runner.run(&images, &cancel_on_ctrl_c()).await;
    report.print_summary();

    let summary = report
        .save_summary(&output)
        .context("Failed to save batch summary")?;
    println!("Results saved to {}", output.display());
    println!("Summary: {}", summary.display());

    Ok(())
}

fn cmd_show(record_path: PathBuf, json: bool) -> Result<()> {
    if !record_exists(&record_path) {
        anyhow::bail!("Record not found at '{}'.", record_path.display());
    }

    let record = load_record(&record_path).context("Failed to load evaluation record")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).context("Failed to serialize record")?
        );
        return Ok(());
    }

    let size = record_size(&record_path)?;

    println!("Evaluation Record");
    println!("{}", "─".repeat(60));
    println!("  Run:          {}", record.run_id);
    println!("  Source:       {}", record.source);
    println!("  Recorded at:  {}", record.recorded_at);
    println!("  File size:    {:.1} KB", size as f64 / 1024.0);
    println!();
    println!("{}", record.invoice.prompt_block());
    println!();
    println!("Insights:");
    println!("{}", record.insight.numbered());
    println!();
    print_evaluation(&record.evaluation);

    Ok(())
}

fn print_state(state: &PipelineState) {
    println!("{}", "─".repeat(60));
    println!("Run {} ended in '{}'", state.run_id(), state.status());

    if let Some(invoice) = state.invoice() {
        println!(
            "  Invoice:  {} ({} line items)",
            invoice.invoice_id(),
            invoice.line_items.len()
        );
    }

    if let Some(insight) = state.insight() {
        println!("\nInsights:");
        println!("{}", insight.numbered());
    }

    if let Some(evaluation) = state.evaluation() {
        println!();
        print_evaluation(evaluation);
    }

    if let Some(failure) = state.failure() {
        println!("\nFailure: {}", failure);
    }
    println!("{}", "─".repeat(60));
}

fn print_evaluation(evaluation: &invoice_insight_eval::EvaluationResult) {
    println!(
        "Evaluation: {:.3} aggregate ({} of {} judges responded)",
        evaluation.aggregate_score(),
        evaluation.verdicts().len(),
        evaluation.judge_count()
    );

    for verdict in evaluation.verdicts() {
        let score = verdict.score();
        println!(
            "  {:<13} {:>6.2} / {:<5} ({:.3})",
            verdict.judge().as_str(),
            score.raw(),
            score.scale().max,
            score.normalized()
        );
        println!("    {}", verdict.rationale());
        for finding in verdict.findings() {
            println!("    - {}", finding);
        }
    }

    for failure in evaluation.failed_judges() {
        println!("  {:<13} failed: {}", failure.judge.as_str(), failure.message);
    }
}

async fn cmd_test() -> Result<()> {
    println!("Testing LLM connection...\n");

    let config = Config::load().context("Failed to load configuration")?;

    println!("Configuration:");
    println!("  API Base:  {}", config.llm.api_base);
    println!(
        "  API Key:   {}...",
        config.llm.api_key.chars().take(8).collect::<String>()
    );
    println!();

    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    for stage in [Stage::Extraction, Stage::Generation, Stage::Evaluation] {
        let llm = config.llm_for(stage);
        print!("  {:<12} {:<24} ", format!("{:?}", stage), llm.model);

        let client = LlmClient::new(llm).context("Failed to build LLM client")?;
        match client.test_connection().await {
            Ok(()) => println!("ok"),
            Err(e) => println!("failed: {}", e),
        }
    }

    Ok(())
}
