//! Chunkwise Core Library
//!
//! Structured document analysis over a remote language model, for documents
//! of any size. This library provides:
//!
//! - **Length Estimation**: Approximate model-context cost of text
//! - **Chunking**: Budgeted, structure-preserving splits with overlap
//! - **Prompt Building**: Stable cacheable prefixes with per-chunk suffixes
//! - **Map-Reduce**: Bounded-concurrency per-chunk calls and deterministic merging
//! - **Model Clients**: Anthropic Messages API client and a retry wrapper
//! - **Signal Handling**: Graceful cancellation on SIGINT
//! - **Progress Callbacks**: Real-time progress reporting

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod client;
pub mod config;
pub mod doc;
pub mod error;
pub mod report;

pub use client::{AnthropicClient, DeltaFn, ModelClient, ModelRequest, ModelResponse, RetryingClient};
pub use config::{AnalyzerConfig, Settings};
pub use doc::{AnalysisTask, DocumentAnalyzer, FinalResult, RunState};
pub use error::{AnalysisError, ClientError, ConfigError, DocumentError};

/// Configuration for backoff strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Maximum number of retries
    pub max_retries: u32,

    /// Add randomness to delays (jitter)
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Calculate delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64);

        let delay = if self.jitter {
            // Up to 25% jitter
            let jitter = delay * 0.25 * rand_f64();
            delay + jitter
        } else {
            delay
        };

        Duration::from_millis(delay as u64)
    }
}

/// Cheap random f64 in [0, 1] from the clock; only used for jitter
fn rand_f64() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    (nanos as f64) / (u32::MAX as f64)
}

/// How often in-flight work polls for cancellation
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Signal handler for graceful shutdown
#[derive(Clone)]
pub struct ShutdownSignal {
    /// Flag indicating shutdown was requested
    shutdown: Arc<AtomicBool>,
    /// Flag indicating interrupt was requested (Ctrl+C)
    interrupted: Arc<AtomicBool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Check if interrupt (Ctrl+C) was received
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        while !self.is_shutdown() {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    /// Install signal handlers (call once at startup)
    pub fn install_handlers(&self) -> anyhow::Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let interrupted = Arc::clone(&self.interrupted);

        ctrlc::set_handler(move || {
            if !shutdown.load(Ordering::SeqCst) {
                eprintln!("\n⚠️  Interrupt received - cancelling in-flight model calls...");
                interrupted.store(true, Ordering::SeqCst);
                shutdown.store(true, Ordering::SeqCst);
            } else {
                // Second interrupt
                eprintln!("\n⛔ Force exit requested!");
                std::process::exit(130);
            }
        })?;

        Ok(())
    }
}

/// Progress event for callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    /// Chunk the event refers to (0-based), if any
    pub chunk: Option<usize>,
    /// Number of chunks in the run (1 for direct runs, 0 before splitting)
    pub total_chunks: usize,
    /// Timestamp (unix epoch millis)
    pub timestamp_ms: u64,
    pub message: Option<String>,
}

/// Types of progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressEventType {
    /// Document loaded, run starting
    Started,
    /// Document fits one call
    DirectCall,
    /// Document is being split
    Splitting,
    /// Map stage starting
    Mapping,
    ChunkStarted,
    ChunkComplete,
    ChunkFailed,
    /// Reduce stage starting
    Reducing,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressEvent {
    pub fn new(event_type: ProgressEventType, total_chunks: usize) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        Self {
            event_type,
            chunk: None,
            total_chunks,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            message: None,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Trait for progress callbacks
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// Console progress reporter with colored output (stderr)
pub struct ConsoleProgressReporter {
    use_colors: bool,
    verbose: bool,
}

impl ConsoleProgressReporter {
    pub fn new(use_colors: bool, verbose: bool) -> Self {
        Self {
            use_colors,
            verbose,
        }
    }

    /// Line for `event`, or `None` when the event is not shown
    pub fn format_event(&self, event: &ProgressEvent) -> Option<String> {
        let chunk = event.chunk.map(|c| c + 1).unwrap_or(0);
        let detail = event.message.as_deref().unwrap_or("");

        let msg = match event.event_type {
            ProgressEventType::Started => format!("📄 Loaded {}", detail),
            ProgressEventType::DirectCall => "🎯 Document fits in one call".to_string(),
            ProgressEventType::Splitting => "✂️  Document exceeds the single-call budget, splitting".to_string(),
            ProgressEventType::Mapping => format!("🗺️  Analyzing {} chunks", event.total_chunks),
            ProgressEventType::ChunkStarted => {
                if !self.verbose {
                    return None;
                }
                format!("  📍 Chunk {}/{} started", chunk, event.total_chunks)
            }
            ProgressEventType::ChunkComplete => {
                format!("  ✅ Chunk {}/{} done", chunk, event.total_chunks)
            }
            ProgressEventType::ChunkFailed => {
                format!("  ❌ Chunk {}/{} failed: {}", chunk, event.total_chunks, detail)
            }
            ProgressEventType::Reducing => "🔗 Merging partial results".to_string(),
            ProgressEventType::Completed => format!("🎉 Analysis complete {}", detail),
            ProgressEventType::Failed => format!("💔 Analysis failed: {}", detail),
            ProgressEventType::Cancelled => "⚠️  Analysis cancelled".to_string(),
        };
        Some(msg)
    }
}

impl ProgressCallback for ConsoleProgressReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        use colored::Colorize;

        let Some(msg) = self.format_event(event) else {
            return;
        };

        if self.use_colors {
            let colored_msg = match event.event_type {
                ProgressEventType::Started | ProgressEventType::Completed => msg.green().bold(),
                ProgressEventType::DirectCall
                | ProgressEventType::Splitting
                | ProgressEventType::Mapping
                | ProgressEventType::Reducing => msg.cyan(),
                ProgressEventType::ChunkStarted => msg.dimmed(),
                ProgressEventType::ChunkComplete => msg.green(),
                ProgressEventType::ChunkFailed | ProgressEventType::Failed => msg.red().bold(),
                ProgressEventType::Cancelled => msg.yellow(),
            };
            eprintln!("{}", colored_msg);
        } else {
            eprintln!("{}", msg);
        }
    }
}

/// JSON progress reporter for machine consumption (stderr)
pub struct JsonProgressReporter;

impl ProgressCallback for JsonProgressReporter {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            eprintln!("{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_config() {
        let config = BackoffConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            multiplier: 2.0,
            max_retries: 5,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(10000)); // Capped at max
    }

    #[test]
    fn test_backoff_jitter_stays_within_a_quarter() {
        let config = BackoffConfig {
            initial_delay_ms: 1000,
            jitter: true,
            ..Default::default()
        };
        let delay = config.delay_for_attempt(1);
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_shutdown_signal_is_shared_between_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutdown());
        signal.mark_interrupted();
        assert!(clone.is_shutdown());
        assert!(clone.is_interrupted());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_shutdown() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.request_shutdown();
        });
        tokio::time::timeout(Duration::from_secs(2), signal.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_console_reporter_hides_chunk_starts_unless_verbose() {
        let event = ProgressEvent::new(ProgressEventType::ChunkStarted, 3).with_chunk(0);
        assert!(ConsoleProgressReporter::new(false, false).format_event(&event).is_none());
        assert_eq!(
            ConsoleProgressReporter::new(false, true).format_event(&event).as_deref(),
            Some("  📍 Chunk 1/3 started")
        );
    }

    #[test]
    fn test_progress_event_serializes() {
        let event = ProgressEvent::new(ProgressEventType::ChunkFailed, 4)
            .with_chunk(2)
            .with_message("timeout");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"ChunkFailed\""));
        assert!(json.contains("\"chunk\":2"));
    }
}
