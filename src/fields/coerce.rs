//! Coercion of loosely typed model output into field values

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{FieldDef, FieldType};
use crate::error::{Error, Result};
use crate::models::FieldValue;

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"))
}

fn reject(def: &FieldDef, reason: impl Into<String>) -> Error {
    Error::SchemaValidation {
        field: def.name.clone(),
        reason: reason.into(),
    }
}

/// Coerce `raw` to the type of `def`. Null and blank strings yield `Ok(None)`.
pub fn coerce_value(def: &FieldDef, raw: &Value) -> Result<Option<FieldValue>> {
    if is_silent(raw) {
        return Ok(None);
    }

    match def.field_type {
        FieldType::Text => match raw {
            Value::String(s) => Ok(Some(FieldValue::Text(s.trim().to_string()))),
            Value::Number(n) => Ok(Some(FieldValue::Text(n.to_string()))),
            Value::Bool(b) => Ok(Some(FieldValue::Text(b.to_string()))),
            _ => Err(reject(def, "expected text")),
        },
        FieldType::Number => match raw {
            Value::Number(n) => n
                .as_f64()
                .filter(|v| v.is_finite())
                .map(|v| Some(FieldValue::Number(v)))
                .ok_or_else(|| reject(def, "number out of range")),
            Value::String(s) => parse_number(s)
                .map(|v| Some(FieldValue::Number(v)))
                .ok_or_else(|| reject(def, format!("'{}' is not a number", s))),
            _ => Err(reject(def, "expected a number")),
        },
        FieldType::Boolean => match raw {
            Value::Bool(b) => Ok(Some(FieldValue::Bool(*b))),
            Value::Number(n) if n.as_f64() == Some(1.0) => Ok(Some(FieldValue::Bool(true))),
            Value::Number(n) if n.as_f64() == Some(0.0) => Ok(Some(FieldValue::Bool(false))),
            Value::String(s) => parse_bool(s)
                .map(|b| Some(FieldValue::Bool(b)))
                .ok_or_else(|| reject(def, format!("'{}' is not yes/no", s))),
            _ => Err(reject(def, "expected yes/no")),
        },
        FieldType::Select => {
            let text = match raw {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err(reject(def, "expected one of the options")),
            };
            let wanted = text.to_lowercase();
            def.options
                .iter()
                .find(|option| option.trim().to_lowercase() == wanted)
                .map(|option| Some(FieldValue::Text(option.clone())))
                .ok_or_else(|| {
                    reject(
                        def,
                        format!("'{}' is not one of [{}]", text, def.options.join(", ")),
                    )
                })
        }
    }
}

fn is_silent(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => {
            let t = s.trim().to_lowercase();
            t.is_empty() || t == "null" || t == "none" || t == "n/a"
        }
        _ => false,
    }
}

const AREA_UNITS: &[&str] = &["кв.м.", "кв.м", "квм", "м²", "m²", "м2", "m2", "sqm"];
const CURRENCY: &[&str] = &["рублей", "руб.", "руб", "rub", "р.", "р", "₽"];

/// "300 000", "300000 руб", "50 м2", "4,5", "1,5 млн", "300к" all parse;
/// "2-3" and prose do not.
fn parse_number(raw: &str) -> Option<f64> {
    let mut compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .replace(',', ".");
    if let Some(unit) = AREA_UNITS.iter().find(|unit| compact.ends_with(*unit)) {
        compact.truncate(compact.len() - unit.len());
    }

    if let Ok(v) = compact.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    let mut matches = number_pattern().find_iter(&compact);
    let first = matches.next()?;
    if matches.next().is_some() || first.start() != 0 {
        return None;
    }
    let value = first.as_str().parse::<f64>().ok()? * magnitude(&compact[first.end()..]);
    value.is_finite().then_some(value)
}

/// Multiplier for the words that follow a number, currency ignored
fn magnitude(rest: &str) -> f64 {
    let mut word = rest.trim_start_matches('.');
    if let Some(currency) = CURRENCY.iter().find(|c| word.ends_with(*c)) {
        word = &word[..word.len() - currency.len()];
    }
    match word.trim_end_matches('.') {
        "к" | "k" | "т" | "тыс" | "тысяч" | "тысячи" | "тысяча" => 1e3,
        "млн" | "mln" | "миллион" | "миллиона" | "миллионов" => 1e6,
        _ => 1.0,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "да" | "yes" | "true" | "y" | "1" | "есть" => Some(true),
        "нет" | "no" | "false" | "n" | "0" => Some(false),
        _ => None,
    }
}
