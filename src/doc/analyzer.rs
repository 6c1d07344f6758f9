//! Document analyzer: the single entry point of a run
//!
//! A run moves through `Loaded → (Direct | Splitting → Mapping → Reducing)
//! → Completed | Failed`. Small documents get exactly one model call; larger
//! ones are split, mapped chunk by chunk and reduced into one answer.

use crate::client::ModelClient;
use crate::config::AnalyzerConfig;
use crate::doc::aggregator::{Aggregator, DeltaSink};
use crate::doc::chunker::{DefaultChunker, DocumentChunker};
use crate::doc::document::read_document;
use crate::doc::mapper::MapStage;
use crate::doc::parse::parse_response;
use crate::doc::prompt::PromptBuilder;
use crate::doc::types::{
    calculate_cost, AnalysisTask, ChunkFailure, Coverage, Details, Document, FinalResult, Payload,
    TokenUsage,
};
use crate::error::{AnalysisError, Result};
use crate::{ProgressCallback, ProgressEvent, ProgressEventType, ShutdownSignal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// State of an analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Loaded,
    Direct,
    Splitting,
    Mapping,
    Reducing,
    Completed,
    Failed,
}

/// Merged output of either path, before bookkeeping
struct Outcome {
    payload: Payload,
    details: Details,
    coverage: Coverage,
    map_reduce: bool,
    synthesized: bool,
    forced_split: bool,
    warnings: Vec<String>,
    usage: TokenUsage,
}

/// Runs analysis tasks over documents
pub struct DocumentAnalyzer {
    config: AnalyzerConfig,
    client: Arc<dyn ModelClient>,
    chunker: Box<dyn DocumentChunker>,
    shutdown_signal: Option<ShutdownSignal>,
    progress: Option<Arc<dyn ProgressCallback>>,
    on_delta: Option<DeltaSink>,
    state: Mutex<RunState>,
}

impl DocumentAnalyzer {
    /// Create an analyzer; fails if `config` is inconsistent
    pub fn new(config: AnalyzerConfig, client: Arc<dyn ModelClient>) -> Result<Self> {
        config.validate()?;
        let chunker = Box::new(DefaultChunker::new(config.chunk_strategy));
        Ok(Self {
            config,
            client,
            chunker,
            shutdown_signal: None,
            progress: None,
            on_delta: None,
            state: Mutex::new(RunState::Loaded),
        })
    }

    pub fn with_chunker(mut self, chunker: Box<dyn DocumentChunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Receive streamed text of direct and synthesis calls (when `stream` is on)
    pub fn with_delta_sink(mut self, sink: DeltaSink) -> Self {
        self.on_delta = Some(sink);
        self
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// State the most recent run reached
    pub fn state(&self) -> RunState {
        self.state.lock().map(|s| *s).unwrap_or(RunState::Failed)
    }

    fn transition(&self, state: RunState) {
        debug!("Run state -> {:?}", state);
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.on_progress(&event);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown_signal
            .as_ref()
            .map(ShutdownSignal::is_shutdown)
            .unwrap_or(false)
    }

    /// Load `path` and run `task` over it
    pub async fn run_file(&self, path: &Path, task: AnalysisTask) -> Result<FinalResult> {
        let document = read_document(path)?;
        self.run_task(&document.text, &document.source, task).await
    }

    /// Run `task` over `document_text`
    pub async fn run_task(
        &self,
        document_text: &str,
        source_name: &str,
        task: AnalysisTask,
    ) -> Result<FinalResult> {
        let start = Instant::now();
        let document = Document::new(source_name, document_text);
        self.transition(RunState::Loaded);

        info!(
            "Running {} on {} ({} words, ~{} units)",
            task.kind(),
            document.source,
            document.word_count,
            document.units
        );
        self.emit(
            ProgressEvent::new(ProgressEventType::Started, 0).with_message(format!(
                "{} ({} words, ~{} units)",
                document.source, document.word_count, document.units
            )),
        );

        let kind = task.kind();
        match self.execute(&document, task).await {
            Ok(outcome) => {
                self.transition(RunState::Completed);
                let duration_ms = start.elapsed().as_millis() as u64;
                let result = FinalResult {
                    task: kind,
                    payload: outcome.payload,
                    details: outcome.details,
                    coverage: outcome.coverage,
                    map_reduce: outcome.map_reduce,
                    synthesized: outcome.synthesized,
                    forced_split: outcome.forced_split,
                    warnings: outcome.warnings,
                    usage: outcome.usage,
                    cost_usd: calculate_cost(&self.config.model, outcome.usage),
                    model: self.config.model.clone(),
                    source: document.source.clone(),
                    word_count: document.word_count,
                    unit_estimate: document.units,
                    duration_ms,
                };

                info!(
                    "Completed {} (coverage {}, {} input / {} output tokens, {:.1}s)",
                    kind,
                    result.coverage,
                    result.usage.input_tokens,
                    result.usage.output_tokens,
                    duration_ms as f64 / 1000.0
                );
                self.emit(
                    ProgressEvent::new(ProgressEventType::Completed, result.coverage.chunks_total)
                        .with_message(format!(
                            "({} chunks, {:.1}s)",
                            result.coverage,
                            duration_ms as f64 / 1000.0
                        )),
                );
                Ok(result)
            }
            Err(e) => {
                self.transition(RunState::Failed);
                if let AnalysisError::Cancelled { total, .. } = &e {
                    warn!("{}", e);
                    self.emit(ProgressEvent::new(ProgressEventType::Cancelled, *total));
                } else {
                    error!("Analysis failed: {}", e);
                    self.emit(ProgressEvent::new(ProgressEventType::Failed, 0).with_message(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, document: &Document, task: AnalysisTask) -> Result<Outcome> {
        if let AnalysisTask::Ask { question } = &task {
            if question.trim().is_empty() {
                return Err(AnalysisError::InvalidTask(
                    "ask requires a non-empty question".to_string(),
                ));
            }
        }
        if document.is_blank() {
            return Err(AnalysisError::EmptyInput {
                source_name: document.source.clone(),
            });
        }

        let prompts = PromptBuilder::new(task, &self.config);

        if document.units <= self.config.single_call_budget {
            self.run_direct(document, &prompts).await
        } else {
            self.run_map_reduce(document, &prompts).await
        }
    }

    async fn run_direct(&self, document: &Document, prompts: &PromptBuilder) -> Result<Outcome> {
        self.transition(RunState::Direct);
        info!(
            "~{} units fits the single-call budget of {}; one call",
            document.units, self.config.single_call_budget
        );
        self.emit(ProgressEvent::new(ProgressEventType::DirectCall, 1));

        let request = prompts.direct(&document.text);
        let call = async {
            match (&self.on_delta, request.options.stream) {
                (Some(sink), true) => self.client.send_streaming(&request, &**sink).await,
                _ => self.client.send(&request).await,
            }
        };

        let response = match &self.shutdown_signal {
            Some(signal) => tokio::select! {
                response = call => response,
                _ = signal.cancelled() => {
                    return Err(AnalysisError::Cancelled { completed: 0, total: 1 });
                }
            },
            None => call.await,
        };

        let response = response.map_err(|e| {
            warn!("Direct call failed: {}", e);
            AnalysisError::TotalReductionFailure {
                failed: 1,
                total: 1,
                failures: vec![ChunkFailure::from(&e)],
            }
        })?;

        let mut warnings = Vec::new();
        if response.is_truncated() {
            warnings.push("Output hit the model's output limit; the result is truncated".to_string());
        }

        let (payload, details) = parse_response(prompts.task(), &response.text);
        Ok(Outcome {
            payload,
            details,
            coverage: Coverage::full(1),
            map_reduce: false,
            synthesized: true,
            forced_split: false,
            warnings,
            usage: response.usage,
        })
    }

    async fn run_map_reduce(&self, document: &Document, prompts: &PromptBuilder) -> Result<Outcome> {
        self.transition(RunState::Splitting);
        info!(
            "~{} units exceeds the single-call budget of {}; splitting",
            document.units, self.config.single_call_budget
        );
        self.emit(ProgressEvent::new(ProgressEventType::Splitting, 0));

        let chunks = self.chunker.split(&document.text, self.config.chunk_budget())?;
        if chunks.is_empty() {
            return Err(AnalysisError::EmptyInput {
                source_name: document.source.clone(),
            });
        }
        let total = chunks.len();
        let forced_count = chunks.iter().filter(|c| c.forced).count();

        self.transition(RunState::Mapping);
        self.emit(ProgressEvent::new(ProgressEventType::Mapping, total));

        let mut stage = MapStage::from_config(&self.config);
        if let Some(signal) = &self.shutdown_signal {
            stage = stage.with_shutdown_signal(signal.clone());
        }
        if let Some(progress) = &self.progress {
            stage = stage.with_progress(progress.clone());
        }
        let partials = stage.run(prompts, &chunks, self.client.clone()).await;

        if self.is_cancelled() {
            let completed = partials.iter().filter(|p| !p.is_failed()).count();
            return Err(AnalysisError::Cancelled { completed, total });
        }

        self.transition(RunState::Reducing);
        self.emit(ProgressEvent::new(ProgressEventType::Reducing, total));

        let mut aggregator = Aggregator::new();
        if let Some(sink) = &self.on_delta {
            aggregator = aggregator.with_delta_sink(sink.clone());
        }
        let reduction = aggregator.reduce(prompts, partials, &*self.client).await?;

        let mut warnings = Vec::new();
        if forced_count > 0 {
            warnings.push(format!(
                "{} of {} chunks were split mid-paragraph or mid-line; context may be cut at those boundaries",
                forced_count, total
            ));
        }
        warnings.extend(reduction.warnings);

        Ok(Outcome {
            payload: reduction.payload,
            details: reduction.details,
            coverage: reduction.coverage,
            map_reduce: true,
            synthesized: reduction.synthesized,
            forced_split: forced_count > 0,
            warnings,
            usage: reduction.usage,
        })
    }
}
