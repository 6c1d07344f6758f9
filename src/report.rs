//! Rendering of final results for the terminal

use crate::doc::types::{Details, FinalResult, ItemKind, Payload, TaskKind};
use clap::ValueEnum;
use colored::Colorize;

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable text output (default)
    #[default]
    Text,
    /// JSON output for programmatic consumption
    Json,
    /// Markdown formatted output
    Markdown,
}

/// Render `result` in `format`
pub fn render(result: &FinalResult, format: OutputFormat, use_colors: bool) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(result),
        OutputFormat::Markdown => Ok(render_markdown(result)),
        OutputFormat::Text => Ok(render_text(result, use_colors)),
    }
}

fn title(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Analyze => "Document Analysis",
        TaskKind::Ask => "Answer",
        TaskKind::Summarize => "Executive Summary",
    }
}

fn chunk_summary(result: &FinalResult) -> String {
    if result.map_reduce {
        format!("{} (map-reduce)", result.coverage)
    } else {
        format!("{} (single call)", result.coverage)
    }
}

fn render_text(result: &FinalResult, use_colors: bool) -> String {
    let mut out = String::new();
    let heading = title(result.task);

    if use_colors {
        out.push_str(&format!("{}\n\n", heading.yellow().bold()));
    } else {
        out.push_str(&format!("{}\n\n", heading));
    }

    let label = |text: &str| {
        if use_colors {
            format!("{}\n", text.cyan().bold())
        } else {
            format!("{}\n", text)
        }
    };

    if let Some(summary) = &result.details.summary {
        out.push_str(&format!("{}\n\n", summary.trim()));
    }

    match &result.payload {
        Payload::Text(text) => {
            out.push_str(text.trim());
            out.push('\n');
        }
        Payload::Items(_) => {
            for kind in ItemKind::ALL {
                let items = result.payload.items_of(kind);
                if items.is_empty() {
                    continue;
                }
                out.push_str(&label(&format!("{}:", kind.label())));
                for item in items {
                    out.push_str(&format!("  • {}\n", item));
                }
                out.push('\n');
            }
        }
    }

    let details = &result.details;
    if let Some(confidence) = details.confidence {
        out.push_str(&format!("\nConfidence: {}\n", confidence));
    }
    if !details.source_quotes.is_empty() {
        out.push('\n');
        out.push_str(&label("Sources:"));
        for quote in &details.source_quotes {
            out.push_str(&format!("  > {}\n", quote));
        }
    }
    if !details.sections.is_empty() {
        out.push('\n');
        out.push_str(&label("Sections:"));
        for (i, section) in details.sections.iter().enumerate() {
            out.push_str(&format!("  {}. {}\n", i + 1, section));
        }
    }

    let meta = format!(
        "\nSource: {} ({} words, ~{} units)\nModel: {} | Chunks: {} | Tokens: {} in / {} out | Cost: ${:.4} | {:.1}s",
        result.source,
        result.word_count,
        result.unit_estimate,
        result.model,
        chunk_summary(result),
        result.usage.input_tokens,
        result.usage.output_tokens,
        result.cost_usd,
        result.duration_ms as f64 / 1000.0
    );
    if use_colors {
        out.push_str(&format!("{}\n", meta.dimmed()));
    } else {
        out.push_str(&format!("{}\n", meta));
    }

    if !result.warnings.is_empty() {
        out.push('\n');
        for warning in &result.warnings {
            let line = format!("⚠️  {}", warning);
            if use_colors {
                out.push_str(&format!("{}\n", line.yellow()));
            } else {
                out.push_str(&format!("{}\n", line));
            }
        }
    }

    out
}

fn render_markdown(result: &FinalResult) -> String {
    let mut out = format!("## {}\n\n", title(result.task));

    if let Some(summary) = &result.details.summary {
        out.push_str(&format!("{}\n\n", summary.trim()));
    }

    match &result.payload {
        Payload::Text(text) => {
            out.push_str(text.trim());
            out.push_str("\n\n");
        }
        Payload::Items(_) => {
            for kind in ItemKind::ALL {
                let items = result.payload.items_of(kind);
                if items.is_empty() {
                    continue;
                }
                out.push_str(&format!("### {}\n\n", kind.label()));
                for item in items {
                    out.push_str(&format!("- {}\n", item));
                }
                out.push('\n');
            }
        }
    }

    out.push_str(&details_markdown(&result.details));

    out.push_str("| Metric | Value |\n");
    out.push_str("|--------|-------|\n");
    out.push_str(&format!("| Source | {} |\n", result.source));
    out.push_str(&format!("| Words | {} |\n", result.word_count));
    out.push_str(&format!("| Model | {} |\n", result.model));
    out.push_str(&format!("| Chunks | {} |\n", chunk_summary(result)));
    out.push_str(&format!(
        "| Tokens | {} in / {} out |\n",
        result.usage.input_tokens, result.usage.output_tokens
    ));
    out.push_str(&format!("| Cost | ${:.4} |\n", result.cost_usd));

    if !result.warnings.is_empty() {
        out.push_str("\n### Warnings\n\n");
        for warning in &result.warnings {
            out.push_str(&format!("- {}\n", warning));
        }
    }

    out
}

/// Confidence, sources and sections as markdown blocks
fn details_markdown(details: &Details) -> String {
    let mut out = String::new();
    if let Some(confidence) = details.confidence {
        out.push_str(&format!("**Confidence:** {}\n\n", confidence));
    }
    if !details.source_quotes.is_empty() {
        out.push_str("### Sources\n\n");
        for quote in &details.source_quotes {
            out.push_str(&format!("> {}\n\n", quote));
        }
    }
    if !details.sections.is_empty() {
        out.push_str("### Sections\n\n");
        for (i, section) in details.sections.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, section));
        }
        out.push('\n');
    }
    out
}
