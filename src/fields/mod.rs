//! Custom field definitions and the per-org field schema
//!
//! The schema is the set of keys the model may emit: the fixed standard
//! fields plus the org's active custom fields. Values are coerced into the
//! closed [`FieldValue`] set before they are merged into a lead.

mod coerce;

pub use coerce::coerce_value;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::FieldValue;

/// Value type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Select,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Select => "select",
            FieldType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(FieldType::Text),
            "number" => Ok(FieldType::Number),
            "select" => Ok(FieldType::Select),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            other => Err(Error::InvalidInput(format!("unknown field type '{}'", other))),
        }
    }
}

/// An operator-defined field stored per org
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: Uuid,
    pub org_id: String,
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub options: Vec<String>,
    /// Hint shown to the model next to the field
    pub description: Option<String>,
    pub active: bool,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a custom field
#[derive(Debug, Clone)]
pub struct NewCustomField {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub options: Vec<String>,
    pub description: Option<String>,
}

impl NewCustomField {
    /// Check the name pattern and the options/type pairing
    pub fn validate(&self) -> Result<()> {
        validate_field_name(&self.name)?;
        if self.label.trim().is_empty() {
            return Err(Error::InvalidInput("field label must not be empty".into()));
        }
        match self.field_type {
            FieldType::Select => {
                if self.options.iter().all(|o| o.trim().is_empty()) {
                    return Err(Error::InvalidInput(format!(
                        "select field '{}' requires options",
                        self.name
                    )));
                }
            }
            _ => {
                if !self.options.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "options are only allowed for select fields ('{}' is {})",
                        self.name, self.field_type
                    )));
                }
            }
        }
        Ok(())
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"))
}

/// Field names are canonical snake_case identifiers
pub fn validate_field_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidFieldName(name.to_string()))
    }
}

/// One key the model may emit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub label: String,
    pub field_type: FieldType,
    pub options: Vec<String>,
    pub description: Option<String>,
    pub standard: bool,
}

impl FieldDef {
    fn standard(name: &str, label: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            field_type,
            options: Vec::new(),
            description: None,
            standard: true,
        }
    }

    /// Coerce a raw model value for this field. `Ok(None)` means the model
    /// said nothing (null or blank), which never erases a stored value.
    pub fn coerce(&self, raw: &serde_json::Value) -> Result<Option<FieldValue>> {
        coerce_value(self, raw)
    }
}

/// Fields every lead carries regardless of org configuration
pub fn standard_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::standard("property_type", "Тип объекта", FieldType::Text),
        FieldDef::standard("area_sqm", "Площадь (м²)", FieldType::Number),
        FieldDef::standard("address", "Адрес", FieldType::Text),
        FieldDef::standard("renovation_type", "Тип ремонта", FieldType::Text),
        FieldDef::standard("budget", "Бюджет", FieldType::Number),
        FieldDef::standard("deadline", "Сроки", FieldType::Text),
    ]
}

/// The effective set of extractable keys for one org
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    fields: Vec<FieldDef>,
}

impl FieldSchema {
    /// Standard fields followed by active custom fields in display order.
    /// A custom field with a standard name replaces the standard definition.
    pub fn build(custom: &[CustomField]) -> Self {
        let mut fields = standard_fields();
        let mut active: Vec<&CustomField> = custom.iter().filter(|f| f.active).collect();
        active.sort_by(|a, b| a.position.cmp(&b.position).then(a.created_at.cmp(&b.created_at)));

        for field in active {
            let def = FieldDef {
                name: field.name.clone(),
                label: field.label.clone(),
                field_type: field.field_type,
                options: field.options.clone(),
                description: field.description.clone(),
                standard: false,
            };
            match fields.iter_mut().find(|f| f.name == def.name) {
                Some(existing) => *existing = def,
                None => fields.push(def),
            }
        }

        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn custom_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.standard)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Validate an operator-supplied value for a key
    pub fn validate(&self, name: &str, raw: &serde_json::Value) -> Result<Option<FieldValue>> {
        let def = self.get(name).ok_or_else(|| Error::SchemaValidation {
            field: name.to_string(),
            reason: "not in the active field schema".to_string(),
        })?;
        def.coerce(raw)
    }
}
