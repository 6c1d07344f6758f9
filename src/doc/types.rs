//! Core types for document analysis

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Characters per estimated unit
pub const CHARS_PER_UNIT: usize = 4;

/// Estimate the model-context cost of `text` in units (approximate: chars / 4, rounded up)
///
/// Rounding up keeps the estimate of a concatenation at or below the sum of
/// the estimates of its parts, so additive budget checks never overshoot.
pub fn estimate_units(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_UNIT - 1) / CHARS_PER_UNIT
}

/// Kind of analysis task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Analyze,
    Ask,
    Summarize,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Analyze => "analyze",
            TaskKind::Ask => "ask",
            TaskKind::Summarize => "summarize",
        };
        f.write_str(name)
    }
}

/// Shape of a task's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Free-form text
    Text,
    /// List of key points, entities and themes
    StructuredList,
}

/// An analysis task, immutable for the duration of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnalysisTask {
    /// Extract key points, entities and themes
    Analyze,
    /// Answer a question about the document
    Ask { question: String },
    /// Produce an executive summary
    Summarize,
}

impl AnalysisTask {
    pub fn ask(question: impl Into<String>) -> Self {
        AnalysisTask::Ask {
            question: question.into(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            AnalysisTask::Analyze => TaskKind::Analyze,
            AnalysisTask::Ask { .. } => TaskKind::Ask,
            AnalysisTask::Summarize => TaskKind::Summarize,
        }
    }

    pub fn output_shape(&self) -> OutputShape {
        match self {
            AnalysisTask::Analyze => OutputShape::StructuredList,
            AnalysisTask::Ask { .. } | AnalysisTask::Summarize => OutputShape::Text,
        }
    }

    /// Question text for `Ask`, `None` otherwise
    pub fn question(&self) -> Option<&str> {
        match self {
            AnalysisTask::Ask { question } => Some(question),
            AnalysisTask::Analyze | AnalysisTask::Summarize => None,
        }
    }
}

/// A loaded document
#[derive(Debug, Clone)]
pub struct Document {
    /// Source identifier (path or name)
    pub source: String,

    /// Raw text
    pub text: String,

    /// Estimated size in units
    pub units: usize,

    /// Whitespace-separated word count
    pub word_count: usize,
}

impl Document {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            source: source.into(),
            units: estimate_units(&text),
            word_count: text.split_whitespace().count(),
            text,
        }
    }

    /// Whether the document has anything besides whitespace
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A bounded contiguous span of a document sized to fit one model call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in the chunk sequence (0-based)
    pub index: usize,

    /// Text of the chunk, including any overlap with the previous chunk
    pub text: String,

    /// Byte offset of `text` in the document
    pub start: usize,

    /// Byte offset one past the end of `text` in the document
    pub end: usize,

    /// Leading bytes of `text` repeated from the previous chunk
    pub overlap: usize,

    /// A boundary inside this chunk was placed mid-structure
    pub forced: bool,

    /// Estimated size in units
    pub units: usize,
}

impl Chunk {
    pub fn new(index: usize, document: &str, span: Range<usize>, overlap: usize) -> Self {
        let text = document[span.clone()].to_string();
        let units = estimate_units(&text);
        Self {
            index,
            text,
            start: span.start,
            end: span.end,
            overlap,
            forced: false,
            units,
        }
    }

    pub fn with_forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    /// Whether this chunk begins with content from the previous chunk
    pub fn overlaps_previous(&self) -> bool {
        self.overlap > 0
    }

    /// Document span not shared with the previous chunk
    pub fn fresh_span(&self) -> Range<usize> {
        self.start + self.overlap..self.end
    }

    /// Text not shared with the previous chunk
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }
}

/// Kind of a structured item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    KeyPoint,
    Entity,
    Theme,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::KeyPoint, ItemKind::Entity, ItemKind::Theme];

    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::KeyPoint => "Key points",
            ItemKind::Entity => "Entities",
            ItemKind::Theme => "Themes",
        }
    }
}

/// One extracted key point, entity or theme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    pub text: String,
}

impl Item {
    pub fn new(kind: ItemKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Payload of a partial or final result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Items(Vec<Item>),
}

impl Payload {
    pub fn empty_for(shape: OutputShape) -> Self {
        match shape {
            OutputShape::Text => Payload::Text(String::new()),
            OutputShape::StructuredList => Payload::Items(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.trim().is_empty(),
            Payload::Items(items) => items.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Items(_) => None,
        }
    }

    pub fn items(&self) -> &[Item] {
        match self {
            Payload::Items(items) => items,
            Payload::Text(_) => &[],
        }
    }

    /// Items of one kind, in order
    pub fn items_of(&self, kind: ItemKind) -> Vec<&str> {
        self.items()
            .iter()
            .filter(|item| item.kind == kind)
            .map(|item| item.text.as_str())
            .collect()
    }
}

/// Confidence the model reports for an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Lenient parse of a model-reported label
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        f.write_str(label)
    }
}

/// Structured fields that accompany the main payload
///
/// `summary` belongs to analyze, `confidence` and `source_quotes` to ask,
/// `sections` to summarize. Fields of other tasks stay empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    /// Brief overview of the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,

    /// Verbatim quotes supporting an answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_quotes: Vec<String>,

    /// Per-section summaries in document order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
}

impl Details {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.confidence.is_none()
            && self.source_quotes.is_empty()
            && self.sections.is_empty()
    }
}

/// Why a chunk call produced no result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Fatal,
    Timeout,
    Cancelled,
}

/// Failure recorded on a partial result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ChunkFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ClientError> for ChunkFailure {
    fn from(error: &ClientError) -> Self {
        match error {
            ClientError::Transient(_) => ChunkFailure::new(FailureKind::Transient, error.to_string()),
            ClientError::Fatal(_) => ChunkFailure::new(FailureKind::Fatal, error.to_string()),
        }
    }
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Token accounting reported by the model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Per-chunk output of the map stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Chunk the result originates from
    pub chunk_index: usize,

    pub task: TaskKind,

    pub payload: Payload,

    pub details: Details,

    /// The model stopped on its output limit
    pub truncated: bool,

    /// Set when the call failed; the payload is then empty
    pub error: Option<ChunkFailure>,

    pub usage: TokenUsage,
}

impl PartialResult {
    pub fn success(chunk_index: usize, task: TaskKind, payload: Payload) -> Self {
        Self {
            chunk_index,
            task,
            payload,
            details: Details::default(),
            truncated: false,
            error: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn failure(chunk_index: usize, task: TaskKind, shape: OutputShape, error: ChunkFailure) -> Self {
        Self {
            chunk_index,
            task,
            payload: Payload::empty_for(shape),
            details: Details::default(),
            truncated: false,
            error: Some(error),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// How much of the document contributed to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    /// Indices (0-based) of chunks whose call failed
    pub failed_chunks: Vec<usize>,
}

impl Coverage {
    pub fn full(chunks_total: usize) -> Self {
        Self {
            chunks_total,
            chunks_succeeded: chunks_total,
            failed_chunks: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_succeeded == self.chunks_total
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chunks_succeeded, self.chunks_total)
    }
}

/// Final result of one analysis run; the only value returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub task: TaskKind,

    pub payload: Payload,

    #[serde(default)]
    pub details: Details,

    pub coverage: Coverage,

    /// Whether the document went through split/map/reduce
    pub map_reduce: bool,

    /// False when a multi-chunk synthesis fell back to labeled concatenation
    pub synthesized: bool,

    /// Whether any chunk boundary was forced mid-structure
    pub forced_split: bool,

    /// Degraded-coverage and fallback notes
    pub warnings: Vec<String>,

    pub usage: TokenUsage,

    /// Estimated cost in USD
    pub cost_usd: f64,

    pub model: String,

    pub source: String,

    pub word_count: usize,

    /// Estimated document size in units
    pub unit_estimate: usize,

    pub duration_ms: u64,
}

impl FinalResult {
    /// Number of chunks processed (attempted)
    pub fn chunks_processed(&self) -> usize {
        self.coverage.chunks_total
    }

    /// True when some part of the document is missing from the answer
    pub fn is_degraded(&self) -> bool {
        !self.coverage.is_complete()
    }
}

/// Price per million tokens (input, output) in USD
pub fn model_pricing(model: &str) -> Option<(f64, f64)> {
    let model = model.to_lowercase();
    if model.contains("opus") {
        Some((15.0, 75.0))
    } else if model.contains("sonnet") {
        Some((3.0, 15.0))
    } else if model.contains("haiku") {
        Some((0.80, 4.0))
    } else {
        None
    }
}

/// Estimated cost of `usage` on `model`; unknown models cost 0
pub fn calculate_cost(model: &str, usage: TokenUsage) -> f64 {
    match model_pricing(model) {
        Some((input, output)) => {
            (usage.input_tokens as f64 * input + usage.output_tokens as f64 * output) / 1_000_000.0
        }
        None => 0.0,
    }
}
