//! Cache-aware prompt construction
//!
//! Every request is split into a stable system prefix, identical for all
//! calls of one phase of a run, and a variable user suffix. The prefix is
//! built once per run and shared as an `Arc<str>`; when caching is enabled
//! the request carries a cache boundary so the provider can reuse it.

use crate::client::{CacheBoundary, Message, ModelRequest, RequestOptions};
use crate::config::AnalyzerConfig;
use crate::doc::types::{AnalysisTask, Chunk};
use std::sync::Arc;

const JSON_ONLY: &str = "Return ONLY valid JSON";

/// Label used for a chunk in synthesis input and fallback output (1-based)
pub fn chunk_label(index: usize) -> String {
    format!("[Chunk {}]", index + 1)
}

/// Phase of a run a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Whole document in one call
    Direct,
    /// One call per chunk
    Map,
    /// Merge of per-chunk text results
    Synthesis,
}

/// Builds requests for one task
pub struct PromptBuilder {
    task: AnalysisTask,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    map_output_tokens: u32,
    stream: bool,
    cache_prompts: bool,
    map_prefix: Arc<str>,
}

impl PromptBuilder {
    pub fn new(task: AnalysisTask, config: &AnalyzerConfig) -> Self {
        let map_prefix = Arc::from(map_instructions(&task));
        Self {
            task,
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            map_output_tokens: config.map_output_tokens,
            stream: config.stream,
            cache_prompts: config.cache_prompts,
            map_prefix,
        }
    }

    pub fn task(&self) -> &AnalysisTask {
        &self.task
    }

    /// Shared prefix of every map request of this run
    pub fn map_prefix(&self) -> Arc<str> {
        Arc::clone(&self.map_prefix)
    }

    fn options(&self, phase: Phase) -> RequestOptions {
        let (max_output, stream) = match phase {
            Phase::Map => (self.map_output_tokens, false),
            Phase::Direct | Phase::Synthesis => (self.max_output_tokens, self.stream),
        };
        RequestOptions {
            model: self.model.clone(),
            max_output,
            temperature: self.temperature,
            stream,
        }
    }

    fn boundary(&self) -> Option<CacheBoundary> {
        self.cache_prompts.then_some(CacheBoundary::Ephemeral)
    }

    /// Map request for one chunk
    pub fn build(&self, chunk: &Chunk, total_chunks: usize) -> ModelRequest {
        ModelRequest {
            system: self.map_prefix(),
            cache_boundary: self.boundary(),
            messages: vec![Message::user(format!(
                "Excerpt {} of {}:\n\n{}",
                chunk.index + 1,
                total_chunks,
                chunk.text
            ))],
            options: self.options(Phase::Map),
        }
    }

    /// Single request over the whole document
    ///
    /// For `Ask` the document goes in the cached prefix and the question in
    /// the suffix, so follow-up questions on the same document reuse it.
    pub fn direct(&self, document: &str) -> ModelRequest {
        match &self.task {
            AnalysisTask::Ask { question } => ModelRequest {
                system: Arc::from(format!(
                    "Document content:\n\n{}\n\n{}",
                    document, ASK_DIRECT
                )),
                cache_boundary: self.boundary(),
                messages: vec![Message::user(question.trim())],
                options: self.options(Phase::Direct),
            },
            AnalysisTask::Analyze => ModelRequest {
                system: Arc::from(ANALYZE_DIRECT),
                cache_boundary: None,
                messages: vec![Message::user(document)],
                options: self.options(Phase::Direct),
            },
            AnalysisTask::Summarize => ModelRequest {
                system: Arc::from(SUMMARIZE_DIRECT),
                cache_boundary: None,
                messages: vec![Message::user(document)],
                options: self.options(Phase::Direct),
            },
        }
    }

    /// Synthesis request over ordered `(chunk_index, text)` partials
    ///
    /// `None` for tasks whose partials are merged without a model call.
    pub fn synthesis(&self, partials: &[(usize, &str)], total_chunks: usize) -> Option<ModelRequest> {
        let system = match &self.task {
            AnalysisTask::Analyze => return None,
            AnalysisTask::Ask { question } => format!(
                "You are given partial answers to a question. Each was written from one \
                 excerpt of a larger document ({} excerpts in total).\n\n\
                 Question: {}\n\n\
                 Some excerpts may not contain the answer; ignore partial answers that \
                 say so. Combine the rest into one coherent answer. {}:\n\
                 {{\n  \"answer\": \"Your answer here\",\n  \"confidence\": \"high|medium|low\",\n  \
                 \"source_quotes\": [\"Relevant quote\"]\n}}\n",
                total_chunks,
                question.trim(),
                JSON_ONLY
            ),
            AnalysisTask::Summarize => format!(
                "You are given summaries of different sections of a document, in document \
                 order. Synthesize them into a cohesive executive summary. {}:\n\
                 {{\n  \"executive_summary\": \"Cohesive executive summary\",\n  \
                 \"sections\": [\"Section 1 summary\", \"Section 2 summary\"]\n}}\n",
                JSON_ONLY
            ),
        };

        let body = partials
            .iter()
            .map(|(index, text)| format!("{}\n{}", chunk_label(*index), text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        Some(ModelRequest {
            system: Arc::from(system),
            cache_boundary: None,
            messages: vec![Message::user(body)],
            options: self.options(Phase::Synthesis),
        })
    }
}

const ANALYZE_DIRECT: &str = "You are a document analysis expert. Analyze the provided document \
and return a JSON object with your findings.\n\n\
Return ONLY valid JSON in this exact format:\n\
{\n  \"summary\": \"Brief overview of the document\",\n  \
\"key_points\": [\"Point 1\", \"Point 2\"],\n  \"entities\": [\"Entity 1\", \"Entity 2\"],\n  \
\"themes\": [\"Theme 1\", \"Theme 2\"]\n}\n";

const ASK_DIRECT: &str = "Answer questions about the document above. Return ONLY valid JSON:\n\
{\n  \"answer\": \"Your answer here\",\n  \"confidence\": \"high|medium|low\",\n  \
\"source_quotes\": [\"Relevant quote from the document\"]\n}\n";

const SUMMARIZE_DIRECT: &str = "You are an expert summarizer. Create an executive summary of the \
provided document. Return ONLY valid JSON:\n\
{\n  \"executive_summary\": \"Concise executive summary\",\n  \
\"sections\": [\"Section 1 summary\", \"Section 2 summary\"]\n}\n";

/// Stable instructions for per-chunk calls
fn map_instructions(task: &AnalysisTask) -> String {
    match task {
        AnalysisTask::Analyze => format!(
            "You are a document analysis expert. You will receive one excerpt of a larger \
             document. Extract the key points, entities and themes present in this excerpt \
             only; do not guess about the rest of the document. {}:\n\
             {{\n  \"summary\": \"Brief overview of this excerpt\",\n  \
             \"key_points\": [\"Point 1\"],\n  \"entities\": [\"Entity 1\"],\n  \
             \"themes\": [\"Theme 1\"]\n}}\n",
            JSON_ONLY
        ),
        AnalysisTask::Ask { question } => format!(
            "You will receive one excerpt of a larger document.\n\n\
             Question: {}\n\n\
             Answer using only this excerpt. If the excerpt does not contain enough \
             information, say so explicitly and set \"sufficient\" to false. {}:\n\
             {{\n  \"answer\": \"Your answer here\",\n  \"sufficient\": true,\n  \
             \"source_quotes\": [\"Relevant quote from this excerpt\"]\n}}\n",
            question.trim(),
            JSON_ONLY
        ),
        AnalysisTask::Summarize => format!(
            "Summarize this section of a larger document. Focus on key information, main \
             arguments, and important details of this excerpt only. {}:\n\
             {{\n  \"section_summary\": \"Summary of this section\"\n}}\n",
            JSON_ONLY
        ),
    }
}
