//! Budgeted document chunking
//!
//! Documents are walked as structural units (paragraphs, falling back to
//! lines, falling back to fixed-size windows) and packed into chunks whose
//! estimated size stays within the per-call budget. Chunks may start with a
//! short overlap from the end of the previous chunk.

use crate::doc::types::{estimate_units, Chunk, CHARS_PER_UNIT};
use crate::error::{AnalysisError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, warn};

lazy_static! {
    static ref PARAGRAPH_BREAK: Regex =
        Regex::new(r"\r?\n(?:[ \t]*\r?\n)+").expect("Invalid paragraph regex");
}

/// Strategy for detecting structural units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Paragraphs, then lines, then fixed-size windows
    #[default]
    Structural,

    /// Whitespace-aligned fixed-size windows, ignoring structure
    FixedSize,
}

/// Size limits for one split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBudget {
    /// Maximum estimated units per chunk, overlap included
    pub max_units: usize,

    /// Units of trailing context carried into the next chunk
    pub overlap_units: usize,
}

impl ChunkBudget {
    pub fn new(max_units: usize, overlap_units: usize) -> Self {
        Self {
            max_units,
            overlap_units,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_units == 0 {
            return Err(AnalysisError::InvalidConfig(
                "max_unit_budget must be greater than zero".to_string(),
            ));
        }
        if self.overlap_units >= self.max_units {
            return Err(AnalysisError::InvalidConfig(format!(
                "overlap_units ({}) must be smaller than max_unit_budget ({})",
                self.overlap_units, self.max_units
            )));
        }
        Ok(())
    }

    /// Window size for force-split text, leaving room for a full overlap
    fn window_units(&self) -> usize {
        self.max_units - self.overlap_units
    }

    /// Overlap that still fits in front of a piece of `next_units`
    fn overlap_for(&self, next_units: usize) -> usize {
        self.overlap_units.min(self.max_units.saturating_sub(next_units))
    }
}

/// Trait for document chunkers
pub trait DocumentChunker: Send + Sync {
    /// Split `text` into an ordered chunk sequence within `budget`
    fn split(&self, text: &str, budget: ChunkBudget) -> Result<Vec<Chunk>>;

    /// Estimate units in content
    fn estimate_units(&self, text: &str) -> usize {
        estimate_units(text)
    }
}

/// A contiguous run of the document that is never split further
#[derive(Debug, Clone, PartialEq, Eq)]
struct Piece {
    range: Range<usize>,
    forced: bool,
}

/// Default chunker implementation
#[derive(Debug, Clone, Default)]
pub struct DefaultChunker {
    strategy: ChunkStrategy,
}

impl DefaultChunker {
    pub fn new(strategy: ChunkStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ChunkStrategy {
        self.strategy
    }

    /// Top-level structural units; they tile `text` exactly
    fn structural_units(&self, text: &str) -> Vec<Range<usize>> {
        let whole = 0..text.len();
        if self.strategy == ChunkStrategy::FixedSize {
            return vec![whole];
        }

        let paragraphs = paragraph_ranges(text);
        if paragraphs.len() > 1 {
            return paragraphs;
        }

        let lines = line_ranges(text, whole.clone());
        if lines.len() > 1 {
            return lines;
        }

        vec![whole]
    }

    /// Break units into pieces no larger than `max_units`
    ///
    /// A unit within budget is kept whole. Only a unit that alone exceeds the
    /// budget descends to lines, and only a line that alone exceeds it is
    /// force-split into windows.
    fn pieces(&self, text: &str, budget: ChunkBudget) -> Vec<Piece> {
        let window_units = budget.window_units();
        let mut pieces = Vec::new();

        for unit in self.structural_units(text) {
            if estimate_units(&text[unit.clone()]) <= budget.max_units {
                pieces.push(Piece {
                    range: unit,
                    forced: false,
                });
                continue;
            }

            if self.strategy == ChunkStrategy::FixedSize {
                pieces.extend(force_windows(text, unit, window_units));
                continue;
            }

            let lines = line_ranges(text, unit.clone());
            if lines.len() > 1 {
                for line in lines {
                    if estimate_units(&text[line.clone()]) <= budget.max_units {
                        pieces.push(Piece {
                            range: line,
                            forced: false,
                        });
                    } else {
                        pieces.extend(force_windows(text, line, window_units));
                    }
                }
            } else {
                pieces.extend(force_windows(text, unit, window_units));
            }
        }

        pieces
    }
}

impl DocumentChunker for DefaultChunker {
    fn split(&self, text: &str, budget: ChunkBudget) -> Result<Vec<Chunk>> {
        budget.validate()?;

        if text.is_empty() {
            return Ok(Vec::new());
        }

        let pieces = self.pieces(text, budget);
        let mut chunks: Vec<Chunk> = Vec::new();

        // Current chunk: text[chunk_start..end], first `overlap` bytes repeated
        let mut chunk_start = 0;
        let mut overlap = 0;
        let mut end = 0;
        let mut forced = false;
        let mut has_content = false;

        for piece in pieces {
            if has_content {
                let accumulated = estimate_units(&text[chunk_start..end]);
                let next = estimate_units(&text[piece.range.clone()]);

                if accumulated + next > budget.max_units {
                    chunks.push(
                        Chunk::new(chunks.len(), text, chunk_start..end, overlap).with_forced(forced),
                    );

                    let fresh = chunk_start + overlap..end;
                    chunk_start = overlap_start(text, fresh, budget.overlap_for(next));
                    overlap = end - chunk_start;
                    forced = false;
                }
            }

            end = piece.range.end;
            forced |= piece.forced;
            has_content = true;
        }

        if has_content {
            chunks.push(Chunk::new(chunks.len(), text, chunk_start..end, overlap).with_forced(forced));
        }

        let forced_count = chunks.iter().filter(|c| c.forced).count();
        if forced_count > 0 {
            warn!(
                "{} of {} chunks were force-split mid-structure",
                forced_count,
                chunks.len()
            );
        }
        debug!(
            "Split {} bytes into {} chunks (budget {} units, overlap {} units, {:?})",
            text.len(),
            chunks.len(),
            budget.max_units,
            budget.overlap_units,
            self.strategy
        );

        Ok(chunks)
    }
}

/// Paragraph ranges; each paragraph keeps its trailing blank-line separator
fn paragraph_ranges(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;

    for m in PARAGRAPH_BREAK.find_iter(text) {
        // Leading blank lines join the first paragraph
        if m.start() == 0 {
            continue;
        }
        ranges.push(start..m.end());
        start = m.end();
    }

    if start < text.len() {
        ranges.push(start..text.len());
    }

    ranges
}

/// Line ranges inside `range`; each line keeps its trailing newline
fn line_ranges(text: &str, range: Range<usize>) -> Vec<Range<usize>> {
    let slice = &text[range.clone()];
    let mut ranges = Vec::new();
    let mut start = range.start;

    for (i, _) in slice.match_indices('\n') {
        let line_end = range.start + i + 1;
        ranges.push(start..line_end);
        start = line_end;
    }

    if start < range.end {
        ranges.push(start..range.end);
    }

    ranges
}

/// Force-split `range` into windows of at most `max_units`, cutting at the
/// nearest whitespace at or before each window boundary
fn force_windows(text: &str, range: Range<usize>, max_units: usize) -> Vec<Piece> {
    let max_chars = (max_units * CHARS_PER_UNIT).max(1);
    let mut pieces = Vec::new();
    let mut pos = range.start;

    while pos < range.end {
        let rest = &text[pos..range.end];

        let limit = match rest.char_indices().nth(max_chars) {
            Some((limit, _)) => limit,
            None => {
                pieces.push(Piece {
                    range: pos..range.end,
                    forced: true,
                });
                break;
            }
        };

        let boundary_is_space = rest[limit..]
            .chars()
            .next()
            .map_or(false, char::is_whitespace);

        let cut = if boundary_is_space {
            limit
        } else {
            rest[..limit]
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(limit)
        };

        pieces.push(Piece {
            range: pos..pos + cut,
            forced: true,
        });
        pos += cut;
    }

    pieces
}

/// Start of the trailing `overlap_units` of `region`, snapped forward to a word start
fn overlap_start(text: &str, region: Range<usize>, overlap_units: usize) -> usize {
    if overlap_units == 0 || region.is_empty() {
        return region.end;
    }

    let region_text = &text[region.clone()];
    let max_chars = overlap_units * CHARS_PER_UNIT;
    let char_count = region_text.chars().count();

    if char_count <= max_chars {
        return region.start;
    }

    let skip = char_count - max_chars;
    let mut start = region.start
        + region_text
            .char_indices()
            .nth(skip)
            .map(|(i, _)| i)
            .unwrap_or(region_text.len());

    let mid_word = text[..start]
        .chars()
        .next_back()
        .map_or(false, |c| !c.is_whitespace());

    if mid_word {
        if let Some((i, c)) = text[start..region.end]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
        {
            start += i + c.len_utf8();
        }
    }

    start
}
