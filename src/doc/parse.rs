//! Lenient parsing of model responses
//!
//! Models are asked for JSON but often wrap it in code fences or prose, or
//! skip it entirely. Parsing never fails: anything unusable degrades to a
//! plain-text reading of the response.

use crate::doc::types::{AnalysisTask, Confidence, Details, Item, ItemKind, Payload};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref BULLET_PREFIX: Regex =
        Regex::new(r"^\s*(?:[-*•+]|\d+[.)])\s+").expect("Invalid bullet regex");
}

/// Extract the JSON portion of a model response
pub fn extract_json(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let content_start = start + 7;
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return &response[start..=end];
            }
        }
    }
    response.trim()
}

/// Remove a leading list marker (`-`, `*`, `•`, `1.`, `2)`)
pub fn strip_bullet(line: &str) -> &str {
    match BULLET_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line.trim_start(),
    }
}

/// Parse a response into the payload shape of `task` plus its structured fields
pub fn parse_response(task: &AnalysisTask, response: &str) -> (Payload, Details) {
    match task {
        AnalysisTask::Analyze => {
            let (items, details) = parse_analysis(response);
            (Payload::Items(items), details)
        }
        AnalysisTask::Ask { .. } => {
            let (answer, details) = parse_answer(response);
            (Payload::Text(answer), details)
        }
        AnalysisTask::Summarize => {
            let (summary, details) = parse_summary(response);
            (Payload::Text(summary), details)
        }
    }
}

fn parse_object(response: &str) -> Option<Value> {
    serde_json::from_str::<Value>(extract_json(response))
        .ok()
        .filter(Value::is_object)
}

fn json_key(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::KeyPoint => "key_points",
        ItemKind::Entity => "entities",
        ItemKind::Theme => "themes",
    }
}

/// Items from `{key_points, entities, themes}`, or bullet lines as key points
pub fn parse_items(response: &str) -> Vec<Item> {
    let Some(parsed) = parse_object(response) else {
        return bullet_items(response);
    };

    let mut items = Vec::new();
    for kind in ItemKind::ALL {
        let Some(values) = parsed[json_key(kind)].as_array() else {
            continue;
        };
        for value in values {
            // Entities sometimes come back as {"name": .., "type": ..}
            let text = match value {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => value["name"].as_str().or_else(|| value["text"].as_str()),
                _ => None,
            };
            if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
                items.push(Item::new(kind, text));
            }
        }
    }
    items
}

fn bullet_items(response: &str) -> Vec<Item> {
    response
        .lines()
        .filter(|line| BULLET_PREFIX.is_match(line))
        .map(|line| strip_bullet(line).trim())
        .filter(|text| !text.is_empty())
        .map(|text| Item::new(ItemKind::KeyPoint, text))
        .collect()
}

/// Items plus the `summary` overview
pub fn parse_analysis(response: &str) -> (Vec<Item>, Details) {
    let summary = parse_object(response)
        .and_then(|parsed| parsed["summary"].as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    (
        parse_items(response),
        Details {
            summary,
            ..Default::default()
        },
    )
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Answer text from `{answer, confidence, source_quotes}`
pub fn parse_answer(response: &str) -> (String, Details) {
    let Some(parsed) = parse_object(response) else {
        return (response.trim().to_string(), Details::default());
    };
    let Some(answer) = parsed["answer"].as_str() else {
        return (response.trim().to_string(), Details::default());
    };

    let details = Details {
        confidence: parsed["confidence"].as_str().and_then(Confidence::parse),
        source_quotes: string_list(&parsed["source_quotes"]),
        ..Default::default()
    };
    (answer.trim().to_string(), details)
}

/// Summary text from `{executive_summary, sections}` or `{section_summary}`
pub fn parse_summary(response: &str) -> (String, Details) {
    let Some(parsed) = parse_object(response) else {
        return (response.trim().to_string(), Details::default());
    };

    let lead = ["executive_summary", "section_summary", "summary"]
        .iter()
        .find_map(|key| parsed[*key].as_str());
    let Some(lead) = lead else {
        return (response.trim().to_string(), Details::default());
    };

    let mut sections = Vec::new();
    if let Some(values) = parsed["sections"].as_array() {
        for section in values {
            let (title, summary) = match section {
                Value::String(s) => ("", s.trim()),
                _ => (
                    section["title"].as_str().unwrap_or("").trim(),
                    section["summary"].as_str().unwrap_or("").trim(),
                ),
            };
            if summary.is_empty() {
                continue;
            }
            if title.is_empty() {
                sections.push(summary.to_string());
            } else {
                sections.push(format!("{}: {}", title, summary));
            }
        }
    }

    (
        lead.trim().to_string(),
        Details {
            sections,
            ..Default::default()
        },
    )
}
