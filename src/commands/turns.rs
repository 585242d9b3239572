//! Inbound message and qualification turn commands

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::db::CrmDb;
use crate::engine::{QualificationEngine, TurnOutcome};
use crate::error::{Error, Result};
use crate::models::{Contact, Direction, InboundMessage, LeadRef, OrgContext, StoredInbound, TurnKind};

/// Where an inbound message comes from
#[derive(Debug, Clone)]
pub enum InboundTarget {
    Lead(Uuid),
    Chat { source: String, chat_id: String },
}

/// Everything `leadq inbound` needs to build an [`InboundMessage`]
#[derive(Debug, Clone)]
pub struct InboundArgs {
    pub target: InboundTarget,
    pub text: String,
    /// Channel message id; a fresh one is generated when absent
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub contact: Contact,
}

impl InboundArgs {
    fn into_message(self) -> InboundMessage {
        let lead = match self.target {
            InboundTarget::Lead(id) => LeadRef::Id(id),
            InboundTarget::Chat { source, chat_id } => LeadRef::Channel {
                source,
                external_id: chat_id,
            },
        };
        InboundMessage {
            lead,
            content: self.text,
            media_url: None,
            sender_name: self.sender.or_else(|| self.contact.name.clone()),
            channel_message_id: self
                .message_id
                .unwrap_or_else(|| format!("cli-{}", Uuid::new_v4())),
            timestamp: Some(Utc::now()),
            contact: self.contact,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundReport {
    pub stored: StoredInbound,
    pub outcome: TurnOutcome,
}

pub async fn cmd_inbound(engine: &QualificationEngine, ctx: &OrgContext, args: InboundArgs) -> Result<InboundReport> {
    let (stored, outcome) = engine.ingest_and_qualify(ctx, args.into_message()).await?;
    info!(
        "Message #{} of lead {} finished as {}",
        stored.seq,
        stored.lead_id,
        outcome.kind.as_str()
    );
    Ok(InboundReport { stored, outcome })
}

/// Run a turn for a stored message, by default the lead's latest inbound one
pub async fn cmd_process(
    engine: &QualificationEngine,
    db: &CrmDb,
    ctx: &OrgContext,
    lead_id: Uuid,
    message_id: Option<Uuid>,
) -> Result<TurnOutcome> {
    let message_id = match message_id {
        Some(id) => id,
        None => db
            .recent_messages(ctx, lead_id, 50)
            .await?
            .iter()
            .rev()
            .find(|m| m.direction == Direction::Inbound)
            .map(|m| m.id)
            .ok_or_else(|| Error::MessageNotFound(format!("no inbound message for lead {}", lead_id)))?,
    };
    engine.process_inbound(ctx, lead_id, message_id).await
}

pub fn print_turn_outcome(outcome: &TurnOutcome) {
    let marker = match outcome.kind {
        TurnKind::Applied => "✓",
        TurnKind::Failed => "✗",
        _ => "•",
    };
    println!(
        "{} Turn for message #{} of lead {}: {}",
        marker,
        outcome.seq,
        outcome.lead_id,
        outcome.kind.as_str()
    );
    if let Some(reason) = &outcome.reason {
        println!("  Reason: {}", reason);
    }
    if let Some(status) = outcome.applied_status {
        println!("  Status → {}", status);
    }
    if let Some(qualification) = outcome.qualification_changed_to {
        println!("  AI → {}", qualification.as_str());
    }
    if !outcome.applied_fields.is_empty() {
        println!("  Fields: {}", outcome.applied_fields.join(", "));
    }
    if let Some(reply) = &outcome.reply_text {
        println!("\n{}", reply);
    }
}

pub fn print_inbound_report(report: &InboundReport) {
    if !report.stored.created {
        println!("• Message was already stored as #{}", report.stored.seq);
    }
    print_turn_outcome(&report.outcome);
}
