//! Map stage: one bounded-concurrency model call per chunk
//!
//! Calls are spawned as tokio tasks gated by a semaphore. Each result lands
//! in the slot of its chunk index, so output order never depends on
//! completion order. A failing call only ever affects its own slot.

use crate::client::{ModelClient, ModelRequest, ModelResponse};
use crate::config::AnalyzerConfig;
use crate::doc::parse::parse_response;
use crate::doc::prompt::PromptBuilder;
use crate::doc::types::{Chunk, ChunkFailure, FailureKind, PartialResult};
use crate::{ProgressCallback, ProgressEvent, ProgressEventType, ShutdownSignal};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Runs per-chunk analysis calls
pub struct MapStage {
    concurrency_cap: usize,
    call_timeout: Duration,
    shutdown_signal: Option<ShutdownSignal>,
    progress: Option<Arc<dyn ProgressCallback>>,
}

impl MapStage {
    pub fn new(concurrency_cap: usize, call_timeout: Duration) -> Self {
        Self {
            concurrency_cap: concurrency_cap.max(1),
            call_timeout,
            shutdown_signal: None,
            progress: None,
        }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self::new(config.concurrency_cap, config.call_timeout())
    }

    /// Abandon in-flight calls once `signal` fires
    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Analyze every chunk; returns one partial per chunk, in chunk order
    pub async fn run(
        &self,
        prompts: &PromptBuilder,
        chunks: &[Chunk],
        client: Arc<dyn ModelClient>,
    ) -> Vec<PartialResult> {
        let total = chunks.len();
        let task = prompts.task();
        let start = Instant::now();

        info!(
            "Mapping {} chunks (concurrency {}, timeout {:?})",
            total, self.concurrency_cap, self.call_timeout
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency_cap));
        let mut handles = Vec::with_capacity(total);

        for chunk in chunks {
            let request = prompts.build(chunk, total);
            let index = chunk.index;
            let semaphore = semaphore.clone();
            let client = client.clone();
            let timeout = self.call_timeout;
            let shutdown_signal = self.shutdown_signal.clone();
            let progress = self.progress.clone();

            let handle = tokio::spawn(async move {
                let call = call_chunk(&*client, &request, semaphore, timeout, index, total, progress.as_deref());
                let outcome = match shutdown_signal {
                    Some(signal) => tokio::select! {
                        outcome = call => outcome,
                        _ = signal.cancelled() => {
                            Err(ChunkFailure::new(FailureKind::Cancelled, "run cancelled"))
                        }
                    },
                    None => call.await,
                };

                if let Some(progress) = progress.as_deref() {
                    let event = match &outcome {
                        Ok(_) => ProgressEvent::new(ProgressEventType::ChunkComplete, total)
                            .with_chunk(index),
                        Err(failure) => ProgressEvent::new(ProgressEventType::ChunkFailed, total)
                            .with_chunk(index)
                            .with_message(failure.to_string()),
                    };
                    progress.on_progress(&event);
                }

                outcome
            });

            handles.push((index, handle));
        }

        let mut slots: Vec<Option<PartialResult>> = vec![None; total];
        let kind = task.kind();
        let shape = task.output_shape();

        for (index, handle) in handles {
            let partial = match handle.await {
                Ok(Ok(response)) => {
                    let truncated = response.is_truncated();
                    if truncated {
                        warn!("Chunk {} hit the output limit; its result is truncated", index + 1);
                    }
                    let (payload, details) = parse_response(task, &response.text);
                    PartialResult::success(index, kind, payload)
                        .with_details(details)
                        .with_usage(response.usage)
                        .with_truncated(truncated)
                }
                Ok(Err(failure)) => {
                    warn!("Chunk {} failed: {}", index + 1, failure);
                    PartialResult::failure(index, kind, shape, failure)
                }
                Err(e) => {
                    warn!("Chunk {} task panicked: {}", index + 1, e);
                    PartialResult::failure(
                        index,
                        kind,
                        shape,
                        ChunkFailure::new(FailureKind::Fatal, format!("task panicked: {}", e)),
                    )
                }
            };

            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(partial);
            }
        }

        let partials: Vec<PartialResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    PartialResult::failure(
                        index,
                        kind,
                        shape,
                        ChunkFailure::new(FailureKind::Fatal, "no result recorded"),
                    )
                })
            })
            .collect();

        let failed = partials.iter().filter(|p| p.is_failed()).count();
        info!(
            "Map stage finished: {}/{} chunks succeeded in {:.1}s",
            total - failed,
            total,
            start.elapsed().as_secs_f64()
        );

        partials
    }
}

/// One gated, time-limited call
async fn call_chunk(
    client: &dyn ModelClient,
    request: &ModelRequest,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    index: usize,
    total: usize,
    progress: Option<&dyn ProgressCallback>,
) -> Result<ModelResponse, ChunkFailure> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| ChunkFailure::new(FailureKind::Fatal, e.to_string()))?;

    debug!("Chunk {}/{} call started", index + 1, total);
    if let Some(progress) = progress {
        progress.on_progress(&ProgressEvent::new(ProgressEventType::ChunkStarted, total).with_chunk(index));
    }

    match tokio::time::timeout(timeout, client.send(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(ChunkFailure::from(&e)),
        Err(_) => Err(ChunkFailure::new(
            FailureKind::Timeout,
            format!("no response within {}s", timeout.as_secs_f64()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::types::{AnalysisTask, ItemKind, Payload};
    use crate::error::ClientError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the excerpt back; fails or stalls on marked excerpts
    struct Scripted {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let text = request.user_text();
            let stall = text.contains("STALL");
            tokio::time::sleep(if stall { Duration::from_secs(30) } else { self.delay }).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if text.contains("FAIL") {
                return Err(ClientError::Fatal("boom".to_string()));
            }
            let body = text.split("\n\n").nth(1).unwrap_or("").to_string();
            Ok(ModelResponse::new(format!("{{\"section_summary\": \"{}\"}}", body)))
        }
    }

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(i, t, 0..t.len(), 0))
            .collect()
    }

    fn builder(task: AnalysisTask) -> PromptBuilder {
        PromptBuilder::new(task, &AnalyzerConfig::default())
    }

    #[tokio::test]
    async fn test_results_are_slotted_by_index() {
        let stage = MapStage::new(4, Duration::from_secs(5));
        let client: Arc<dyn ModelClient> = Arc::new(Scripted::new(Duration::from_millis(5)));
        let partials = stage
            .run(&builder(AnalysisTask::Summarize), &chunks(&["a", "b", "c"]), client)
            .await;

        let texts: Vec<_> = partials
            .iter()
            .map(|p| p.payload.as_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(partials.iter().enumerate().all(|(i, p)| p.chunk_index == i));
    }

    /// Later excerpts answer first; records the order calls complete in
    struct InverseDelay {
        completed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelClient for InverseDelay {
        async fn send(&self, request: &ModelRequest) -> Result<ModelResponse, ClientError> {
            let text = request.user_text();
            // "Excerpt N of M:\n\n<body>"
            let header = text.lines().next().unwrap_or("");
            let numbers: Vec<u64> = header
                .trim_end_matches(':')
                .split_whitespace()
                .filter_map(|w| w.parse().ok())
                .collect();
            let (n, m) = (numbers[0], numbers[1]);
            tokio::time::sleep(Duration::from_millis((m - n + 1) * 25)).await;

            let body = text.split("\n\n").nth(1).unwrap_or("").to_string();
            self.completed.lock().unwrap().push(body.clone());
            Ok(ModelResponse::new(format!("{{\"section_summary\": \"{}\"}}", body)))
        }
    }

    #[tokio::test]
    async fn test_order_holds_when_later_chunks_finish_first() {
        let client = Arc::new(InverseDelay {
            completed: std::sync::Mutex::new(Vec::new()),
        });
        let stage = MapStage::new(4, Duration::from_secs(5));
        let partials = stage
            .run(
                &builder(AnalysisTask::Summarize),
                &chunks(&["one", "two", "three", "four"]),
                client.clone(),
            )
            .await;

        assert_eq!(
            *client.completed.lock().unwrap(),
            vec!["four", "three", "two", "one"]
        );
        let texts: Vec<_> = partials
            .iter()
            .map(|p| p.payload.as_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three", "four"]);
        assert!(partials.iter().enumerate().all(|(i, p)| p.chunk_index == i));
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let stage = MapStage::new(2, Duration::from_secs(5));
        let client: Arc<dyn ModelClient> = Arc::new(Scripted::new(Duration::from_millis(1)));
        let partials = stage
            .run(&builder(AnalysisTask::Summarize), &chunks(&["ok", "FAIL", "fine"]), client)
            .await;

        assert!(!partials[0].is_failed());
        assert!(partials[1].is_failed());
        assert_eq!(partials[1].error.as_ref().unwrap().kind, FailureKind::Fatal);
        assert!(partials[1].payload.is_empty());
        assert!(!partials[2].is_failed());
    }

    #[tokio::test]
    async fn test_timeout_becomes_chunk_failure() {
        let stage = MapStage::new(2, Duration::from_millis(50));
        let client: Arc<dyn ModelClient> = Arc::new(Scripted::new(Duration::from_millis(1)));
        let partials = stage
            .run(&builder(AnalysisTask::Summarize), &chunks(&["STALL", "quick"]), client)
            .await;

        assert_eq!(partials[0].error.as_ref().unwrap().kind, FailureKind::Timeout);
        assert!(!partials[1].is_failed());
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let scripted = Arc::new(Scripted::new(Duration::from_millis(20)));
        let stage = MapStage::new(2, Duration::from_secs(5));
        let texts: Vec<String> = (0..8).map(|i| format!("part {}", i)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let partials = stage
            .run(&builder(AnalysisTask::Summarize), &chunks(&refs), scripted.clone())
            .await;

        assert_eq!(partials.len(), 8);
        let max = scripted.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "max in flight was {}", max);
        assert!(max >= 1);
    }

    #[tokio::test]
    async fn test_cancellation_flags_in_flight_calls() {
        let signal = ShutdownSignal::new();
        let stage = MapStage::new(4, Duration::from_secs(60)).with_shutdown_signal(signal.clone());
        let client: Arc<dyn ModelClient> = Arc::new(Scripted::new(Duration::from_millis(1)));

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.request_shutdown();
        });

        let partials = stage
            .run(&builder(AnalysisTask::Summarize), &chunks(&["STALL", "STALL"]), client)
            .await;

        assert!(partials
            .iter()
            .all(|p| p.error.as_ref().map(|e| e.kind) == Some(FailureKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_analyze_output_is_parsed_into_items() {
        struct Fixed;

        #[async_trait]
        impl ModelClient for Fixed {
            async fn send(&self, _request: &ModelRequest) -> Result<ModelResponse, ClientError> {
                let mut response = ModelResponse::new(
                    r#"{"key_points": ["kp"], "entities": ["Acme"], "themes": []}"#,
                );
                response.stop_reason = Some("max_tokens".to_string());
                Ok(response)
            }
        }

        let stage = MapStage::new(1, Duration::from_secs(5));
        let partials = stage
            .run(&builder(AnalysisTask::Analyze), &chunks(&["x"]), Arc::new(Fixed))
            .await;

        assert!(partials[0].truncated);
        match &partials[0].payload {
            Payload::Items(_) => {
                assert_eq!(partials[0].payload.items_of(ItemKind::Entity), vec!["Acme"]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
