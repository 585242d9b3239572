//! System prompt template rendering

use crate::fields::{FieldSchema, FieldType};
use crate::models::LeadStatus;

/// Prompt used when an org has no active prompt configuration
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
Ты вежливый консультант компании по ремонту квартир и домов. \
Отвечай коротко и по делу, на языке клиента. \
Твоя задача: понять, что нужно клиенту, ответить на вопросы по услугам и ценам \
и аккуратно собрать данные для расчёта. Не обещай точную стоимость без замера.

Этапы воронки CRM:
{crm_statuses}
{custom_fields}";

const STATUSES_PLACEHOLDER: &str = "{crm_statuses}";
const FIELDS_PLACEHOLDER: &str = "{custom_fields}";

/// Human-readable meaning of a pipeline stage
pub fn status_label(status: LeadStatus) -> &'static str {
    match status {
        LeadStatus::New => "(Новый)",
        LeadStatus::Consulting => "(Консультация)",
        LeadStatus::FollowUp => "(Думает/дорого)",
        LeadStatus::Qualified => "(Есть телефон/проект)",
        LeadStatus::Measurement => "(Договорились о замере)",
        LeadStatus::Estimate => "(Подготовка сметы)",
        LeadStatus::Contract => "(Подписание договора)",
        LeadStatus::Won => "(Успешно)",
        LeadStatus::Lost => "(Отказ)",
        LeadStatus::Spam => "(Реклама/спам)",
    }
}

pub fn render_statuses() -> String {
    LeadStatus::ALL
        .iter()
        .map(|s| format!("- {} {}", s, status_label(*s)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Numbered list of the keys the model may fill
pub fn render_fields(schema: &FieldSchema) -> String {
    let mut lines = vec!["ПОЛЯ ДЛЯ СБОРА (СПРАШИВАЙ ПО КОНТЕКСТУ):".to_string()];

    for (idx, field) in schema.fields().iter().enumerate() {
        let mut line = format!("{}. **{}** (`{}`)", idx + 1, field.label, field.name);
        match field.field_type {
            FieldType::Select if !field.options.is_empty() => {
                line.push_str(&format!(" [Варианты: {}]", field.options.join(", ")));
            }
            FieldType::Boolean => line.push_str(" [Тип: да/нет]"),
            FieldType::Number => line.push_str(" [Тип: число]"),
            _ => {}
        }
        if let Some(hint) = field.description.as_deref().filter(|d| !d.trim().is_empty()) {
            line.push_str(&format!("\n   - ЦЕЛЬ/ПОДСКАЗКА: {}", hint.trim()));
        }
        lines.push(line);
    }

    lines.push(
        "Не спрашивай всё сразу. Вплетай эти вопросы в диалог, когда это уместно.".to_string(),
    );
    lines.join("\n")
}

/// Fill the placeholders. A template without `{custom_fields}` gets the
/// field list appended so the model always sees the allowed keys.
pub fn render_template(template: &str, schema: &FieldSchema) -> String {
    let fields = render_fields(schema);
    let mut rendered = template.replace(STATUSES_PLACEHOLDER, &render_statuses());
    if rendered.contains(FIELDS_PLACEHOLDER) {
        rendered = rendered.replace(FIELDS_PLACEHOLDER, &fields);
    } else {
        rendered.push_str("\n\n");
        rendered.push_str(&fields);
    }
    rendered.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::CustomField;
    use chrono::Utc;
    use uuid::Uuid;

    fn schema_with_select() -> FieldSchema {
        FieldSchema::build(&[CustomField {
            id: Uuid::new_v4(),
            org_id: "org".into(),
            name: "wall_material".into(),
            label: "Материал стен".into(),
            field_type: FieldType::Select,
            options: vec!["кирпич".into(), "панель".into()],
            description: Some("Нужно для сметы".into()),
            active: true,
            position: 0,
            created_at: Utc::now(),
        }])
    }

    #[test]
    fn test_default_template_fills_placeholders() {
        let rendered = render_template(DEFAULT_SYSTEM_PROMPT, &schema_with_select());
        assert!(!rendered.contains("{crm_statuses}"));
        assert!(!rendered.contains("{custom_fields}"));
        assert!(rendered.contains("- FOLLOW_UP (Думает/дорого)"));
        assert!(rendered.contains("**Площадь (м²)** (`area_sqm`) [Тип: число]"));
        assert!(rendered.contains("(`wall_material`) [Варианты: кирпич, панель]"));
        assert!(rendered.contains("ЦЕЛЬ/ПОДСКАЗКА: Нужно для сметы"));
    }

    #[test]
    fn test_fields_appended_without_placeholder() {
        let rendered = render_template("Ты консультант.", &FieldSchema::build(&[]));
        assert!(rendered.starts_with("Ты консультант."));
        assert!(rendered.contains("(`budget`)"));
    }
}
