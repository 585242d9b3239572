//! Operator actions on a lead
//!
//! These share the engine's per-lead locks, so an operator edit never
//! interleaves with an AI merge on the same lead.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{LeadLocks, QualificationEngine};
use crate::db::LeadStore;
use crate::error::{Error, Result};
use crate::fields::FieldSchema;
use crate::knowledge::KnowledgeBase;
use crate::models::{ChatMessage, DeliveryStatus, Lead, LeadStatus, OrgContext, OutboundMessage, QualificationStatus};
use crate::notify::{LeadUpdate, Notifier};

#[derive(Clone)]
pub struct Operators {
    leads: Arc<dyn LeadStore>,
    locks: LeadLocks,
    notifier: Arc<dyn Notifier>,
    knowledge: KnowledgeBase,
}

impl Operators {
    pub fn new(engine: &QualificationEngine, knowledge: KnowledgeBase) -> Self {
        Self {
            leads: engine.leads().clone(),
            locks: engine.locks().clone(),
            notifier: engine.notifier().clone(),
            knowledge,
        }
    }

    /// Set an extracted field by hand. The key becomes operator-owned and
    /// the agent stops proposing values for it. A null value clears it.
    pub async fn edit_field(&self, ctx: &OrgContext, lead_id: Uuid, name: &str, raw: &Value) -> Result<Lead> {
        let schema = FieldSchema::build(&self.leads.custom_fields(&ctx.org_id).await?);
        let value = schema.validate(name, raw)?;

        self.mutate(ctx, lead_id, vec![name.to_string()], |lead| {
            match value {
                Some(value) => {
                    lead.extracted_data.insert(name.to_string(), value);
                }
                None => {
                    lead.extracted_data.remove(name);
                }
            }
            lead.human_edited_keys.insert(name.to_string());
            Ok(())
        })
        .await
    }

    /// Hand a field back to the agent
    pub async fn release_field(&self, ctx: &OrgContext, lead_id: Uuid, name: &str) -> Result<Lead> {
        self.mutate(ctx, lead_id, Vec::new(), |lead| {
            if lead.human_edited_keys.remove(name) {
                Ok(())
            } else {
                Err(Error::InvalidInput(format!("field '{}' is not operator-owned", name)))
            }
        })
        .await
    }

    /// Humans may move a lead to any status
    pub async fn set_status(&self, ctx: &OrgContext, lead_id: Uuid, status: LeadStatus) -> Result<Lead> {
        self.mutate(ctx, lead_id, Vec::new(), |lead| {
            lead.status = status;
            Ok(())
        })
        .await
    }

    /// Let the agent answer again after a handoff
    pub async fn resume_ai(&self, ctx: &OrgContext, lead_id: Uuid) -> Result<Lead> {
        self.mutate(ctx, lead_id, Vec::new(), |lead| {
            lead.ai_qualification_status = QualificationStatus::InProgress;
            Ok(())
        })
        .await
    }

    /// Queue an operator reply for delivery and remember it for retrieval
    pub async fn reply(&self, ctx: &OrgContext, lead_id: Uuid, text: &str) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("reply text is empty".to_string()));
        }

        let message = {
            let _guard = self.locks.acquire(lead_id).await?;
            let lead = self.leads.get_lead(ctx, lead_id).await?;
            self.leads
                .append_outbound(
                    lead.id,
                    &OutboundMessage {
                        content: text.to_string(),
                        sender_name: Some(actor_name(ctx).to_string()),
                        ai_metadata: None,
                    },
                    DeliveryStatus::Pending,
                )
                .await?
        };
        info!("Operator {} replied to lead {}", actor_name(ctx), lead_id);

        self.knowledge.remember_operator_message(ctx, lead_id, text).await;
        Ok(message)
    }

    async fn mutate<F>(&self, ctx: &OrgContext, lead_id: Uuid, fields: Vec<String>, change: F) -> Result<Lead>
    where
        F: FnOnce(&mut Lead) -> Result<()>,
    {
        let _guard = self.locks.acquire(lead_id).await?;
        let mut lead = self.leads.get_lead(ctx, lead_id).await?;
        change(&mut lead)?;
        self.leads.save_lead(&lead).await?;

        self.notifier.lead_updated(&LeadUpdate {
            org_id: lead.org_id.clone(),
            lead_id,
            status: lead.status,
            qualification: lead.ai_qualification_status,
            applied_fields: fields,
            reply_message_id: None,
            actor: actor_name(ctx).to_string(),
        });
        Ok(lead)
    }
}

fn actor_name(ctx: &OrgContext) -> &str {
    ctx.operator_name().unwrap_or("system")
}
