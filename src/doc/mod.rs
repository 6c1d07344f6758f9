//! Document analysis engine
//!
//! Splits documents that exceed a single call's budget, analyzes each chunk
//! and reduces the partial results into one answer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DocumentAnalyzer                        │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐  │
//! │  │ Estimate │──▶│ Chunker  │──▶│ MapStage │──▶│Aggregator │  │
//! │  └──────────┘   └──────────┘   └──────────┘   └───────────┘  │
//! │       │               PromptBuilder ─┘              │        │
//! │       └──────────── direct (one call) ──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod analyzer;
pub mod chunker;
pub mod document;
pub mod mapper;
pub mod parse;
pub mod prompt;
pub mod types;

pub use aggregator::{Aggregator, DeltaSink, Reduction};
pub use analyzer::{DocumentAnalyzer, RunState};
pub use chunker::{ChunkBudget, ChunkStrategy, DefaultChunker, DocumentChunker};
pub use document::{read_document, SUPPORTED_EXTENSIONS};
pub use mapper::MapStage;
pub use prompt::PromptBuilder;
pub use types::{
    calculate_cost, estimate_units, AnalysisTask, Chunk, ChunkFailure, Confidence, Coverage,
    Details, Document, FailureKind, FinalResult, Item, ItemKind, OutputShape, PartialResult, Payload, TaskKind,
    TokenUsage,
};
