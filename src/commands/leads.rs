//! Lead inspection and operator commands

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::preview;
use crate::db::{CrmDb, LeadStore, TurnEntry};
use crate::engine::Operators;
use crate::error::Result;
use crate::models::{ChatMessage, DeliveryStatus, Direction, Lead, LeadStatus, OrgContext};

/// A lead with its latest messages
#[derive(Debug, Clone, Serialize)]
pub struct LeadDetails {
    pub lead: Lead,
    pub recent: Vec<ChatMessage>,
}

pub async fn cmd_lead_list(db: &CrmDb, ctx: &OrgContext, limit: usize) -> Result<Vec<Lead>> {
    db.list_leads(ctx, limit).await
}

pub async fn cmd_lead_show(db: &CrmDb, ctx: &OrgContext, lead_id: Uuid) -> Result<LeadDetails> {
    let lead = db.get_lead(ctx, lead_id).await?;
    let recent = db.recent_messages(ctx, lead_id, 5).await?;
    Ok(LeadDetails { lead, recent })
}

pub async fn cmd_lead_history(db: &CrmDb, ctx: &OrgContext, lead_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
    db.recent_messages(ctx, lead_id, limit).await
}

pub async fn cmd_lead_turns(db: &CrmDb, ctx: &OrgContext, lead_id: Uuid) -> Result<Vec<TurnEntry>> {
    db.turns(ctx, lead_id).await
}

/// Values are read as JSON when they parse (`120`, `true`, `null`) and as
/// plain text otherwise
pub fn parse_field_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub async fn cmd_lead_edit_field(
    operators: &Operators,
    ctx: &OrgContext,
    lead_id: Uuid,
    name: &str,
    raw: &str,
) -> Result<Lead> {
    operators.edit_field(ctx, lead_id, name, &parse_field_value(raw)).await
}

pub async fn cmd_lead_release_field(operators: &Operators, ctx: &OrgContext, lead_id: Uuid, name: &str) -> Result<Lead> {
    operators.release_field(ctx, lead_id, name).await
}

pub async fn cmd_lead_set_status(
    operators: &Operators,
    ctx: &OrgContext,
    lead_id: Uuid,
    status: &str,
) -> Result<Lead> {
    let status: LeadStatus = status.parse()?;
    operators.set_status(ctx, lead_id, status).await
}

pub async fn cmd_lead_resume_ai(operators: &Operators, ctx: &OrgContext, lead_id: Uuid) -> Result<Lead> {
    operators.resume_ai(ctx, lead_id).await
}

pub async fn cmd_lead_reply(operators: &Operators, ctx: &OrgContext, lead_id: Uuid, text: &str) -> Result<ChatMessage> {
    operators.reply(ctx, lead_id, text).await
}

/// Record what the channel adapter reported for an outbound message
pub async fn cmd_mark_delivery(db: &CrmDb, ctx: &OrgContext, message_id: Uuid, status: &str) -> Result<()> {
    let status: DeliveryStatus = status.parse()?;
    db.mark_delivery(ctx, message_id, status).await
}

pub fn print_lead_list(leads: &[Lead]) {
    if leads.is_empty() {
        println!("No leads yet.");
        return;
    }
    println!("\n👥 Leads ({})\n", leads.len());
    for lead in leads {
        let name = lead.name.as_deref().unwrap_or("-");
        let channel = match (&lead.source, &lead.external_id) {
            (Some(source), Some(id)) => format!("{}:{}", source, id),
            _ => "-".to_string(),
        };
        println!(
            "  {}  {:<14} {:<18} {:<20} {}",
            lead.id,
            lead.status.as_str(),
            lead.ai_qualification_status.as_str(),
            name,
            channel
        );
    }
}

pub fn print_lead(lead: &Lead) {
    println!("\n📇 Lead {}", lead.id);
    println!("  Status: {}", lead.status);
    println!("  AI: {}", lead.ai_qualification_status.as_str());
    if let Some(name) = &lead.name {
        println!("  Name: {}", name);
    }
    if let Some(phone) = &lead.phone {
        println!("  Phone: {}", phone);
    }
    if let Some(handle) = &lead.telegram_handle {
        println!("  Telegram: {}", handle);
    }
    if let (Some(source), Some(id)) = (&lead.source, &lead.external_id) {
        println!("  Channel: {} {}", source, id);
    }
    println!("  Processed up to message #{}", lead.processed_seq);
    if lead.followup_count > 0 {
        println!("  Follow-ups sent: {}", lead.followup_count);
    }
    if let Some(summary) = &lead.ai_summary {
        println!("  Summary: {}", summary);
    }

    if !lead.extracted_data.is_empty() {
        println!("\n  Extracted data:");
        for (key, value) in &lead.extracted_data {
            let owner = if lead.human_edited_keys.contains(key) { " (operator)" } else { "" };
            println!("    {:<20} {}{}", key, value, owner);
        }
    }
}

pub fn print_lead_details(details: &LeadDetails) {
    print_lead(&details.lead);
    if !details.recent.is_empty() {
        println!("\n  Recent messages:");
        for message in &details.recent {
            println!("    {}", message_line(message, 100));
        }
    }
}

pub fn print_history(messages: &[ChatMessage]) {
    if messages.is_empty() {
        println!("No messages.");
        return;
    }
    for message in messages {
        println!("{}", message_line(message, 400));
    }
}

pub fn print_turns(turns: &[TurnEntry]) {
    if turns.is_empty() {
        println!("No qualification turns recorded.");
        return;
    }
    for turn in turns {
        print!(
            "{}  #{:<4} {:<10}",
            turn.created_at.format("%Y-%m-%d %H:%M:%S"),
            turn.seq,
            turn.kind.as_str()
        );
        if let Some(kind) = &turn.error_kind {
            print!(" error={}", kind);
        }
        if let Some(status) = turn.trace.status_changed_to {
            print!(" status->{}", status);
        }
        if !turn.trace.applied_fields.is_empty() {
            print!(" fields={}", turn.trace.applied_fields.join(","));
        }
        if !turn.trace.dropped_fields.is_empty() {
            let dropped: Vec<&str> = turn.trace.dropped_fields.iter().map(|d| d.field.as_str()).collect();
            print!(" dropped={}", dropped.join(","));
        }
        if let Some(degraded) = &turn.trace.retrieval_degraded {
            print!(" degraded={}", degraded);
        }
        println!();
    }
}

pub fn print_chat_message(message: &ChatMessage) {
    println!("✓ Queued message {} (#{})", message.id, message.seq);
}

fn message_line(message: &ChatMessage, max_chars: usize) -> String {
    let arrow = match message.direction {
        Direction::Inbound => "←",
        Direction::Outbound => "→",
    };
    let sender = message.sender_name.as_deref().unwrap_or("");
    let delivery = message
        .delivery_status
        .map(|d| format!(" [{}]", d.as_str()))
        .unwrap_or_default();
    format!(
        "#{:<4} {} {} {}{}: {}",
        message.seq,
        message.created_at.format("%m-%d %H:%M"),
        arrow,
        sender,
        delivery,
        preview(&message.content, max_chars)
    )
}
