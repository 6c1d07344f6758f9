//! Reduce stage: merge per-chunk partials into one result
//!
//! Structured lists are merged deterministically. Text results are combined
//! by one synthesis call, degrading to labeled concatenation when that call
//! fails. Partials are always processed in chunk order.

use crate::client::{DeltaFn, ModelClient};
use crate::doc::parse::{parse_answer, parse_summary, strip_bullet};
use crate::doc::prompt::{chunk_label, PromptBuilder};
use crate::doc::types::{
    AnalysisTask, ChunkFailure, Coverage, Details, Item, ItemKind, PartialResult, Payload, TokenUsage,
};
use crate::error::{AnalysisError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callback receiving streamed synthesis text
pub type DeltaSink = Arc<DeltaFn<'static>>;

/// Output of the reduce stage
#[derive(Debug, Clone)]
pub struct Reduction {
    pub payload: Payload,
    pub details: Details,
    pub coverage: Coverage,
    /// False when synthesis failed and partials were concatenated
    pub synthesized: bool,
    pub warnings: Vec<String>,
    /// Map usage plus synthesis usage
    pub usage: TokenUsage,
}

/// Merges partial results
#[derive(Default)]
pub struct Aggregator {
    on_delta: Option<DeltaSink>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream synthesis output to `sink` when the request asks for streaming
    pub fn with_delta_sink(mut self, sink: DeltaSink) -> Self {
        self.on_delta = Some(sink);
        self
    }

    /// Reduce `partials` (any order) into one result
    pub async fn reduce(
        &self,
        prompts: &PromptBuilder,
        mut partials: Vec<PartialResult>,
        client: &dyn ModelClient,
    ) -> Result<Reduction> {
        partials.sort_by_key(|p| p.chunk_index);

        let total = partials.len();
        let failed_chunks: Vec<usize> = partials
            .iter()
            .filter(|p| p.is_failed())
            .map(|p| p.chunk_index)
            .collect();

        if failed_chunks.len() == total {
            let failures: Vec<ChunkFailure> = partials.iter().filter_map(|p| p.error.clone()).collect();
            return Err(AnalysisError::TotalReductionFailure {
                failed: total,
                total,
                failures,
            });
        }

        let coverage = Coverage {
            chunks_total: total,
            chunks_succeeded: total - failed_chunks.len(),
            failed_chunks,
        };

        let mut warnings = coverage_warnings(&partials, &coverage);
        let mut usage = TokenUsage::default();
        for partial in &partials {
            usage.add(partial.usage);
        }

        let succeeded: Vec<&PartialResult> = partials.iter().filter(|p| !p.is_failed()).collect();

        let (payload, details, synthesized) = match prompts.task() {
            AnalysisTask::Analyze => (
                Payload::Items(merge_items(&succeeded)),
                merge_overviews(&succeeded),
                true,
            ),
            task @ (AnalysisTask::Ask { .. } | AnalysisTask::Summarize) => {
                let texts: Vec<(usize, &str)> = succeeded
                    .iter()
                    .filter_map(|p| p.payload.as_text().map(|t| (p.chunk_index, t)))
                    .filter(|(_, t)| !t.trim().is_empty())
                    .collect();

                match texts.as_slice() {
                    [] => {
                        warnings.push("No chunk produced any output".to_string());
                        (Payload::Text(String::new()), Details::default(), true)
                    }
                    [(index, only)] => {
                        let details = succeeded
                            .iter()
                            .find(|p| p.chunk_index == *index)
                            .map(|p| p.details.clone())
                            .unwrap_or_default();
                        (Payload::Text(only.to_string()), details, true)
                    }
                    _ => {
                        let fallback = fallback_details(task, &succeeded);
                        let (text, details, synthesized) = self
                            .synthesize(prompts, task, &texts, total, client, &mut usage, &mut warnings)
                            .await;
                        (Payload::Text(text), prefer(details, fallback), synthesized)
                    }
                }
            }
        };

        info!(
            "Reduced {} partials (coverage {}, synthesized: {})",
            total, coverage, synthesized
        );

        Ok(Reduction {
            payload,
            details,
            coverage,
            synthesized,
            warnings,
            usage,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn synthesize(
        &self,
        prompts: &PromptBuilder,
        task: &AnalysisTask,
        texts: &[(usize, &str)],
        total: usize,
        client: &dyn ModelClient,
        usage: &mut TokenUsage,
        warnings: &mut Vec<String>,
    ) -> (String, Details, bool) {
        let Some(request) = prompts.synthesis(texts, total) else {
            return (concatenate(texts), Details::default(), false);
        };

        debug!("Synthesizing {} partial results", texts.len());
        let response = match (&self.on_delta, request.options.stream) {
            (Some(sink), true) => client.send_streaming(&request, &**sink).await,
            _ => client.send(&request).await,
        };

        match response {
            Ok(response) => {
                usage.add(response.usage);
                if response.is_truncated() {
                    warnings.push("Synthesis hit the output limit; the result is truncated".to_string());
                }
                let (text, details) = match task {
                    AnalysisTask::Ask { .. } => parse_answer(&response.text),
                    AnalysisTask::Analyze | AnalysisTask::Summarize => parse_summary(&response.text),
                };
                (text, details, true)
            }
            Err(e) => {
                warn!("Synthesis failed, falling back to concatenation: {}", e);
                warnings.push(format!(
                    "Synthesis failed ({}); showing per-chunk results in order",
                    e
                ));
                (concatenate(texts), Details::default(), false)
            }
        }
    }
}

/// Per-chunk analyze overviews in chunk order
fn merge_overviews(partials: &[&PartialResult]) -> Details {
    let overviews: Vec<&str> = partials
        .iter()
        .filter_map(|p| p.details.summary.as_deref())
        .collect();
    Details {
        summary: (!overviews.is_empty()).then(|| overviews.join("\n\n")),
        ..Default::default()
    }
}

/// Details assembled from the partials alone, used where synthesis gave none
///
/// Quotes are deduped in chunk order. Sections are the per-chunk summaries.
fn fallback_details(task: &AnalysisTask, partials: &[&PartialResult]) -> Details {
    match task {
        AnalysisTask::Analyze => merge_overviews(partials),
        AnalysisTask::Ask { .. } => {
            let mut seen = HashSet::new();
            let source_quotes = partials
                .iter()
                .flat_map(|p| p.details.source_quotes.iter())
                .filter(|quote| seen.insert(normalize(quote)))
                .cloned()
                .collect();
            Details {
                source_quotes,
                ..Default::default()
            }
        }
        AnalysisTask::Summarize => Details {
            sections: partials
                .iter()
                .filter_map(|p| p.payload.as_text())
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            ..Default::default()
        },
    }
}

/// Field-wise `primary`, falling back to `fallback` where `primary` is empty
fn prefer(primary: Details, fallback: Details) -> Details {
    Details {
        summary: primary.summary.or(fallback.summary),
        confidence: primary.confidence.or(fallback.confidence),
        source_quotes: if primary.source_quotes.is_empty() {
            fallback.source_quotes
        } else {
            primary.source_quotes
        },
        sections: if primary.sections.is_empty() {
            fallback.sections
        } else {
            primary.sections
        },
    }
}

fn coverage_warnings(partials: &[PartialResult], coverage: &Coverage) -> Vec<String> {
    let mut warnings = Vec::new();

    if !coverage.is_complete() {
        let failed = coverage
            .failed_chunks
            .iter()
            .map(|i| (i + 1).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        warnings.push(format!(
            "Degraded coverage: {} chunks analyzed; chunk(s) {} failed and are missing from the result",
            coverage, failed
        ));
    }

    for partial in partials {
        if let Some(error) = &partial.error {
            warnings.push(format!("Chunk {} failed: {}", partial.chunk_index + 1, error));
        } else if partial.truncated {
            warnings.push(format!(
                "Chunk {} output was truncated at the output limit",
                partial.chunk_index + 1
            ));
        }
    }

    warnings
}

/// Ordered `[Chunk N]`-labeled concatenation
fn concatenate(texts: &[(usize, &str)]) -> String {
    texts
        .iter()
        .map(|(index, text)| format!("{}\n{}", chunk_label(*index), text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Dedup key: trimmed, bullet-free, whitespace-collapsed, lowercase
pub fn normalize(text: &str) -> String {
    strip_bullet(text.trim())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Concatenate items in chunk order, dropping repeats per kind
fn merge_items(partials: &[&PartialResult]) -> Vec<Item> {
    let mut seen: HashSet<(ItemKind, String)> = HashSet::new();
    let mut merged = Vec::new();
    let mut original = 0;

    for partial in partials {
        for item in partial.payload.items() {
            original += 1;
            let key = normalize(&item.text);
            if key.is_empty() {
                continue;
            }
            if seen.insert((item.kind, key)) {
                merged.push(Item::new(item.kind, item.text.trim()));
            } else {
                debug!("Deduped {:?}: {}", item.kind, item.text);
            }
        }
    }

    debug!("Merged {} items into {}", original, merged.len());

    // Group by kind, keeping first-seen order within each kind
    ItemKind::ALL
        .iter()
        .flat_map(|kind| merged.iter().filter(move |item| item.kind == *kind).cloned())
        .collect()
}
