//! Chunkwise: document analysis over a remote language model
//!
//! Analyze, question or summarize text documents of any size. Documents
//! that fit one model call are sent whole; larger ones are split into
//! budgeted chunks, analyzed concurrently and merged into one answer.
//!
//! Features:
//! - Key point / entity / theme extraction, Q&A and executive summaries
//! - Structure-preserving chunking with overlap for large documents
//! - Prompt caching for repeated prefixes
//! - Degraded-coverage reporting when some chunks fail
//! - Graceful signal handling (Ctrl+C cancels in-flight calls)

use anyhow::{Context, Result};
use chunkwise::{
    config::{self, Settings},
    doc::{read_document, AnalysisTask, DocumentAnalyzer},
    report::{self, OutputFormat},
    AnalysisError, AnthropicClient, BackoffConfig, ConsoleProgressReporter, JsonProgressReporter,
    ModelClient, ProgressCallback, ProgressEvent, ProgressEventType, RetryingClient,
    ShutdownSignal,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Chunkwise: analyze documents of any size with a language model
///
/// # Examples
///
/// Extract key points, entities and themes:
///   chunkwise analyze report.md
///
/// Ask a question:
///   chunkwise ask contract.txt "Who are the parties?"
///
/// Executive summary as JSON:
///   chunkwise summarize notes.md -o json
#[derive(Parser, Debug)]
#[command(name = "chunkwise")]
#[command(version)]
#[command(about = "Map-reduce document analysis over a remote language model")]
#[command(
    long_about = "Chunkwise runs analysis tasks (analyze, ask, summarize) over text documents. \
Documents that exceed a single call's budget are split into chunks, analyzed concurrently \
and reduced into one answer that states how much of the document it covers."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Model to use (overrides the configured model)
    #[arg(short = 'm', long, global = true, value_name = "MODEL_ID")]
    model: Option<String>,

    /// Output format for results (text, json, or markdown)
    #[arg(short = 'o', long, global = true, value_enum, default_value_t = OutputFormat::Text, value_name = "FORMAT")]
    output_format: OutputFormat,

    /// Maximum concurrent chunk calls
    #[arg(short = 'j', long, global = true, value_name = "N")]
    concurrency: Option<usize>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Verbose logging and per-chunk progress
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Stream model output to stderr as it arrives
    #[arg(long, global = true)]
    stream: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract key points, entities and themes
    Analyze {
        /// Document to analyze
        file: PathBuf,
    },

    /// Ask a question about a document
    Ask {
        /// Document to question
        file: PathBuf,

        /// The question
        question: String,
    },

    /// Produce an executive summary
    Summarize {
        /// Document to summarize
        file: PathBuf,
    },

    /// Manage settings (~/.chunkwise/config.json, or $CHUNKWISE_DIR)
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Create a default settings file
    Init,

    /// Show the effective settings
    Show,

    /// Set one setting (model, temperature, max_tokens, api_key, concurrency_cap)
    Set { key: String, value: String },
}

const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(600);

fn create_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Drives a spinner from progress events
struct SpinnerReporter {
    spinner: ProgressBar,
}

impl ProgressCallback for SpinnerReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        match event.event_type {
            ProgressEventType::Started => self.spinner.set_message("Loading document..."),
            ProgressEventType::DirectCall => self.spinner.set_message("Analyzing document..."),
            ProgressEventType::Splitting => self.spinner.set_message("Splitting document..."),
            ProgressEventType::Mapping => self
                .spinner
                .set_message(format!("Analyzing {} chunks...", event.total_chunks)),
            ProgressEventType::ChunkComplete | ProgressEventType::ChunkFailed => {
                self.spinner.inc(1);
                self.spinner.set_message(format!(
                    "Analyzed {}/{} chunks...",
                    self.spinner.position(),
                    event.total_chunks
                ));
            }
            ProgressEventType::Reducing => self.spinner.set_message("Merging results..."),
            ProgressEventType::Completed
            | ProgressEventType::Failed
            | ProgressEventType::Cancelled => self.spinner.finish_and_clear(),
            ProgressEventType::ChunkStarted => {}
        }
    }
}

fn print_header(no_color: bool) {
    let version = env!("CARGO_PKG_VERSION");
    let header = format!("Chunkwise v{}", version);

    if no_color {
        eprintln!("{}", header);
        eprintln!("{}", "=".repeat(header.len()));
    } else {
        eprintln!("{}", header.bright_cyan().bold());
        eprintln!("{}", "═".repeat(header.len()).cyan());
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    let path = config::config_path();
    match action {
        ConfigAction::Init => {
            Settings::init_at(&path)?;
            println!("Created {}", path.display());
        }
        ConfigAction::Show => {
            let settings = Settings::load_from(&path)?;
            let mut shown = settings.redacted();
            if std::env::var(config::API_KEY_ENV).is_ok_and(|k| !k.trim().is_empty()) {
                shown.api_key = Some(format!("(from {})", config::API_KEY_ENV));
            }
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfigAction::Set { key, value } => {
            Settings::set_value_at(&path, &key, &value)?;
            println!("Set {} in {}", key, path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    // Quiet by default, only show warnings
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let (file, task) = match args.command {
        Command::Config { action } => return run_config(action),
        Command::Analyze { file } => (file, AnalysisTask::Analyze),
        Command::Ask { file, question } => (file, AnalysisTask::ask(question)),
        Command::Summarize { file } => (file, AnalysisTask::Summarize),
    };

    let document = read_document(&file)?;

    let settings = Settings::load().context("Failed to load settings")?;
    let mut analyzer_config = settings.analyzer_config();
    if let Some(ref model) = args.model {
        analyzer_config.model = model.clone();
    }
    if let Some(concurrency) = args.concurrency {
        analyzer_config.concurrency_cap = concurrency;
    }
    analyzer_config.stream = args.stream;
    debug!("Analyzer config: {:?}", analyzer_config);

    let api_key = settings.api_key().with_context(|| {
        format!(
            "No API key found. Set {} or run `chunkwise config set api_key <KEY>`",
            config::API_KEY_ENV
        )
    })?;
    // Map calls carry their own timeout; direct and synthesis calls may run longer
    let transport_timeout = analyzer_config.call_timeout().max(TRANSPORT_TIMEOUT);
    let transport = AnthropicClient::new(api_key, transport_timeout)?;
    let client: Arc<dyn ModelClient> =
        Arc::new(RetryingClient::new(transport, BackoffConfig::default()));

    // Set up signal handling for graceful shutdown
    let shutdown_signal = ShutdownSignal::new();
    if let Err(e) = shutdown_signal.install_handlers() {
        warn!("Failed to install signal handlers: {}", e);
    }

    let text_output = args.output_format == OutputFormat::Text;
    let mut spinner = None;
    let progress: Option<Arc<dyn ProgressCallback>> = if args.verbose {
        if text_output {
            Some(Arc::new(ConsoleProgressReporter::new(!args.no_color, true)))
        } else {
            Some(Arc::new(JsonProgressReporter))
        }
    } else if text_output && !args.stream {
        let pb = create_spinner();
        spinner = Some(pb.clone());
        Some(Arc::new(SpinnerReporter { spinner: pb }))
    } else {
        None
    };

    if text_output {
        print_header(args.no_color);
    }

    let mut analyzer = DocumentAnalyzer::new(analyzer_config, client)?
        .with_shutdown_signal(shutdown_signal.clone());
    if let Some(progress) = progress {
        analyzer = analyzer.with_progress(progress);
    }
    if args.stream {
        analyzer = analyzer.with_delta_sink(Arc::new(|delta: &str| {
            eprint!("{}", delta);
            let _ = std::io::stderr().flush();
        }));
    }

    let outcome = analyzer
        .run_task(&document.text, &document.source, task)
        .await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    if args.stream {
        eprintln!();
    }

    match outcome {
        Ok(result) => {
            let rendered = report::render(&result, args.output_format, !args.no_color)?;
            println!("{}", rendered.trim_end());
            Ok(())
        }
        Err(AnalysisError::Cancelled { completed, total }) => {
            eprintln!(
                "Cancelled after {}/{} chunks; partial results discarded",
                completed, total
            );
            std::process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}
