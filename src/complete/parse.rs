//! Recovery of the structured payload from raw model text
//!
//! Models wrap their JSON in prose, fences or a `---JSON---` marker and
//! occasionally leave trailing commas. We look for the object in that order,
//! repair what is cheap to repair, and fail the turn when nothing parses.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::StructuredReply;
use crate::error::{Error, Result};

const JSON_MARKER: &str = "---JSON---";

/// Keys that carry turn signals rather than extracted fields in the flat shape
const SIGNAL_KEYS: &[&str] = &[
    "reply_text",
    "message",
    "status",
    "status_suggestion",
    "qualification_flag",
    "summary",
    "is_hot_lead",
    "confidence",
    "client_name",
    "phone",
    "extracted_fields",
    "reasoning",
];

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap())
}

fn fence_strip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```(?:json)?.*?```").unwrap())
}

/// Drop commas that directly precede `}` or `]`, leaving string contents alone
fn strip_trailing_commas(body: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Candidate JSON texts in priority order
fn candidates(text: &str) -> Vec<String> {
    let mut found = Vec::new();

    if let Some(pos) = text.find(JSON_MARKER) {
        let rest = &text[pos + JSON_MARKER.len()..];
        let rest = rest.split(JSON_MARKER).next().unwrap_or(rest);
        if rest.contains('{') {
            found.push(rest.trim().to_string());
        }
    }

    if let Some(caps) = fence_pattern().captures(text) {
        if let Some(block) = caps.get(1) {
            found.push(block.as_str().to_string());
        }
    }

    if let (Some(first), Some(last)) = (text.find('{'), text.rfind('}')) {
        if first < last {
            found.push(text[first..=last].to_string());
        }
    }

    found
}

fn outermost_object(candidate: &str) -> &str {
    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(first), Some(last)) if first < last => &candidate[first..=last],
        _ => candidate,
    }
}

/// Find and parse the first JSON object in `text`
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for candidate in candidates(text) {
        let body = outermost_object(&candidate);
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
            return Some(map);
        }
        let repaired = strip_trailing_commas(body);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(Value::Object(map)) => {
                debug!("Recovered model JSON after trailing-comma repair");
                return Some(map);
            }
            Ok(_) => {}
            Err(e) => debug!("JSON candidate rejected: {}", e),
        }
    }
    None
}

/// Text the model wrote outside its JSON payload
fn prose_outside_json(text: &str) -> String {
    let before_marker = text.split(JSON_MARKER).next().unwrap_or(text);
    let without_fences = fence_strip_pattern().replace_all(before_marker, "");
    let clean = without_fences.trim();
    if clean.starts_with('{') && clean.ends_with('}') {
        return String::new();
    }
    match (clean.find('{'), clean.rfind('}')) {
        (Some(first), Some(last)) if first < last => clean[..first].trim().to_string(),
        _ => clean.to_string(),
    }
}

fn as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "да"),
        _ => false,
    }
}

fn as_confidence(value: Option<&Value>) -> Option<u8> {
    let raw = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    // Some models answer on a 0..1 scale
    let scaled = if raw > 0.0 && raw <= 1.0 { raw * 100.0 } else { raw };
    Some(scaled.clamp(0.0, 100.0).round() as u8)
}

/// Parse raw model output into a [`StructuredReply`]
pub fn parse_reply(raw: &str) -> Result<StructuredReply> {
    let mut object = extract_json_object(raw).ok_or_else(|| {
        warn!("Model response contained no JSON object");
        Error::CompletionFailed("response contained no parsable JSON object".to_string())
    })?;

    let reply_text = as_text(object.get("reply_text"))
        .or_else(|| as_text(object.get("message")))
        .unwrap_or_else(|| prose_outside_json(raw));

    let status_suggestion =
        as_text(object.get("status_suggestion")).or_else(|| as_text(object.get("status")));

    let extracted_fields = match object.remove("extracted_fields") {
        Some(Value::Object(fields)) => fields,
        Some(Value::Null) | None => object
            .iter()
            .filter(|(key, _)| !SIGNAL_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Some(other) => {
            return Err(Error::CompletionFailed(format!(
                "extracted_fields must be an object, got {}",
                other
            )))
        }
    };

    Ok(StructuredReply {
        reply_text,
        extracted_fields,
        status_suggestion,
        qualification_flag: as_text(object.get("qualification_flag")),
        summary: as_text(object.get("summary")),
        is_hot_lead: as_bool(object.get("is_hot_lead")),
        confidence: as_confidence(object.get("confidence")),
        client_name: as_text(object.get("client_name")),
        phone: as_text(object.get("phone")),
    })
}
