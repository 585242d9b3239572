//! Extraction and qualification engine
//!
//! One turn per inbound message: retrieve knowledge, assemble the prompt,
//! ask the model, then merge the structured answer into the lead under the
//! lead's lock. The slow part (retrieval and completion) runs unlocked; the
//! merge re-reads the lead and the watermark before it commits, so the
//! highest sequence number always wins.

mod locks;
mod merge;
mod operators;
mod status;

pub use locks::LeadLocks;
pub use merge::{merge_extracted, MergeReport};
pub use operators::Operators;
pub use status::{decide_status, needs_handoff, StatusDecision};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::complete::CompletionGateway;
use crate::config::{Config, EngineConfig};
use crate::db::{CommitResult, LeadStore, TurnCommit, TurnRecord};
use crate::error::{Error, Result};
use crate::fields::FieldSchema;
use crate::models::{
    AiTrace, ChatMessage, Direction, InboundMessage, Lead, LeadStatus, OrgContext,
    OutboundMessage, QualificationStatus, StoredInbound, TraceChunk, TurnKind,
};
use crate::notify::{LeadUpdate, LogNotifier, Notifier};
use crate::prompt::{PromptAssembler, PromptInput};
use crate::retrieve::RetrievalPlanner;

/// Sender name on AI replies
pub const AI_SENDER: &str = "AI Agent";

/// What one call to [`QualificationEngine::process_inbound`] did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub kind: TurnKind,
    pub lead_id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
    pub replied_with_message_id: Option<Uuid>,
    pub reply_text: Option<String>,
    pub applied_status: Option<LeadStatus>,
    pub applied_fields: Vec<String>,
    pub qualification_changed_to: Option<QualificationStatus>,
    /// Failure or skip reason
    pub reason: Option<String>,
}

impl TurnOutcome {
    fn new(kind: TurnKind, message: &ChatMessage) -> Self {
        Self {
            kind,
            lead_id: message.lead_id,
            message_id: message.id,
            seq: message.seq,
            replied_with_message_id: None,
            reply_text: None,
            applied_status: None,
            applied_fields: Vec::new(),
            qualification_changed_to: None,
            reason: None,
        }
    }

    fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Clone)]
pub struct QualificationEngine {
    leads: Arc<dyn LeadStore>,
    retrieval: RetrievalPlanner,
    prompts: PromptAssembler,
    completion: CompletionGateway,
    notifier: Arc<dyn Notifier>,
    locks: LeadLocks,
    history_window: usize,
    config: EngineConfig,
}

impl QualificationEngine {
    pub fn new(
        leads: Arc<dyn LeadStore>,
        retrieval: RetrievalPlanner,
        completion: CompletionGateway,
        config: &Config,
    ) -> Self {
        Self {
            leads,
            retrieval,
            prompts: PromptAssembler::new(&config.prompt),
            completion,
            notifier: Arc::new(LogNotifier),
            locks: LeadLocks::new(
                Duration::from_millis(config.engine.lock_timeout_ms),
                config.engine.lock_attempts,
            ),
            history_window: config.prompt.history_window,
            config: config.engine.clone(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn leads(&self) -> &Arc<dyn LeadStore> {
        &self.leads
    }

    pub fn completion(&self) -> &CompletionGateway {
        &self.completion
    }

    pub fn locks(&self) -> &LeadLocks {
        &self.locks
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Durably store an inbound message. Storage runs on its own task, so it
    /// completes even when the caller stops waiting.
    pub async fn ingest(&self, ctx: &OrgContext, message: InboundMessage) -> Result<StoredInbound> {
        let leads = self.leads.clone();
        let task_ctx = ctx.clone();
        let stored = tokio::spawn(async move { leads.store_inbound(&task_ctx, &message).await })
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

        if stored.created {
            debug!(
                "Stored inbound message {} as #{} for lead {}",
                stored.message_id, stored.seq, stored.lead_id
            );
        } else {
            debug!("Inbound message {} was already stored", stored.message_id);
        }
        Ok(stored)
    }

    /// Store, then qualify. Dropping the returned future after storage
    /// leaves the message pending for the sweep.
    pub async fn ingest_and_qualify(
        &self,
        ctx: &OrgContext,
        message: InboundMessage,
    ) -> Result<(StoredInbound, TurnOutcome)> {
        let stored = self.ingest(ctx, message).await?;
        let outcome = self.process_inbound(ctx, stored.lead_id, stored.message_id).await?;
        Ok((stored, outcome))
    }

    /// Run one qualification turn for a stored inbound message.
    ///
    /// Gateway failures and lock contention do not fail the call: they come
    /// back as a `Failed` outcome with the watermark untouched, leaving the
    /// message to the sweep. Errors are reserved for bad input and storage
    /// failures.
    pub async fn process_inbound(
        &self,
        ctx: &OrgContext,
        lead_id: Uuid,
        message_id: Uuid,
    ) -> Result<TurnOutcome> {
        let message = self.leads.get_message(ctx, message_id).await?;
        if message.lead_id != lead_id {
            return Err(Error::InvalidInput(format!(
                "message {} does not belong to lead {}",
                message_id, lead_id
            )));
        }
        if message.direction != Direction::Inbound {
            return Err(Error::InvalidInput(format!(
                "message {} is not an inbound message",
                message_id
            )));
        }

        let lead = self.leads.get_lead(ctx, lead_id).await?;
        if message.seq <= lead.processed_seq {
            debug!(
                "Message #{} of lead {} is at or below watermark {}",
                message.seq, lead_id, lead.processed_seq
            );
            return Ok(TurnOutcome::new(TurnKind::Duplicate, &message));
        }
        if skip_reason(&lead).is_some() {
            let Some(_guard) = self.lock_lead(lead_id).await? else {
                return Ok(contended(&message));
            };
            let lead = self.leads.get_lead(ctx, lead_id).await?;
            if message.seq <= lead.processed_seq {
                return Ok(TurnOutcome::new(TurnKind::Superseded, &message));
            }
            if let Some(reason) = skip_reason(&lead) {
                return self.skip(ctx, &message, reason).await;
            }
            debug!("Lead {} resumed before message #{} was skipped", lead_id, message.seq);
        }

        let schema = FieldSchema::build(&self.leads.custom_fields(&ctx.org_id).await?);
        let profile = self.leads.active_prompt(&ctx.org_id).await?;
        let history = self
            .leads
            .history_before(lead_id, message.seq, self.history_window)
            .await?;

        let retrieved = self
            .retrieval
            .retrieve(ctx, Some(lead_id), &message.content, None)
            .await;
        if let Some(alert) = &retrieved.config_alert {
            self.notifier.config_alert(&ctx.org_id, alert);
        }

        let prompt = self.prompts.assemble(PromptInput {
            template: profile.as_ref().map(|p| p.system_prompt.as_str()),
            schema: &schema,
            context: &retrieved.chunks,
            history: &history,
            inbound: &message.content,
        });
        let model_override = profile.as_ref().and_then(|p| p.llm_model.as_deref());

        let mut trace = AiTrace {
            retrieved_context: prompt.included_context.iter().map(TraceChunk::from).collect(),
            retrieval_degraded: retrieved.degraded.clone(),
            model: Some(model_override.unwrap_or(self.completion.default_model()).to_string()),
            ..Default::default()
        };

        let reply = match self
            .completion
            .complete(&prompt.messages, &prompt.response_schema, model_override)
            .await
        {
            Ok(reply) => reply,
            Err(e) => return self.fail(ctx, &message, trace, e).await,
        };

        let Some(_guard) = self.lock_lead(lead_id).await? else {
            return Ok(contended(&message));
        };
        let mut lead = self.leads.get_lead(ctx, lead_id).await?;
        if message.seq <= lead.processed_seq {
            info!(
                "Turn for message #{} of lead {} superseded by #{}",
                message.seq, lead_id, lead.processed_seq
            );
            return Ok(TurnOutcome::new(TurnKind::Superseded, &message));
        }
        if let Some(reason) = skip_reason(&lead) {
            return self.skip(ctx, &message, reason).await;
        }

        let merge = merge_extracted(
            &mut lead.extracted_data,
            &lead.human_edited_keys,
            &schema,
            &reply.extracted_fields,
        );
        for dropped in &merge.dropped {
            debug!("Dropped '{}' for lead {}: {}", dropped.field, lead_id, dropped.reason);
        }

        let decision = decide_status(lead.status, reply.status_suggestion.as_deref());
        if let Some(note) = &decision.note {
            info!("Status suggestion for lead {} not applied as given: {}", lead_id, note);
            trace.ignored_status_suggestion = Some(note.clone());
        }
        if let Some(status) = decision.apply {
            lead.status = status;
            trace.status_changed_to = Some(status);
        }

        fill_blank(&mut lead.name, reply.client_name.as_deref());
        fill_blank(&mut lead.phone, reply.phone.as_deref());

        if lead.ai_qualification_status != QualificationStatus::HandoffRequired
            && needs_handoff(&reply, lead.phone.is_some(), &self.config)
        {
            info!("Lead {} handed off to an operator", lead_id);
            lead.ai_qualification_status = QualificationStatus::HandoffRequired;
            trace.qualification_changed_to = Some(QualificationStatus::HandoffRequired);
        }
        if let Some(summary) = reply.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            lead.ai_summary = Some(summary.to_string());
        }

        trace.applied_fields = merge.applied.clone();
        trace.dropped_fields = merge.dropped;

        let reply_text = reply.reply_text.trim().to_string();
        let outbound = if reply_text.is_empty() {
            None
        } else {
            Some(OutboundMessage {
                content: reply_text.clone(),
                sender_name: Some(AI_SENDER.to_string()),
                ai_metadata: Some(serde_json::to_value(&trace)?),
            })
        };

        let commit = TurnCommit {
            lead: lead.clone(),
            message_id: message.id,
            seq: message.seq,
            reply: outbound,
            trace: trace.clone(),
        };
        let stored_reply = match self.leads.apply_turn(&commit).await? {
            CommitResult::Applied { reply } => reply,
            CommitResult::Stale => {
                return Ok(TurnOutcome::new(TurnKind::Superseded, &message));
            }
        };

        let mut outcome = TurnOutcome::new(TurnKind::Applied, &message);
        outcome.replied_with_message_id = stored_reply.as_ref().map(|m| m.id);
        outcome.reply_text = stored_reply.map(|m| m.content);
        outcome.applied_status = trace.status_changed_to;
        outcome.applied_fields = merge.applied;
        outcome.qualification_changed_to = trace.qualification_changed_to;

        self.notifier.lead_updated(&LeadUpdate {
            org_id: lead.org_id.clone(),
            lead_id,
            status: lead.status,
            qualification: lead.ai_qualification_status,
            applied_fields: outcome.applied_fields.clone(),
            reply_message_id: outcome.replied_with_message_id,
            actor: "ai".to_string(),
        });
        Ok(outcome)
    }

    /// The lead's lock, or `None` when every attempt timed out
    async fn lock_lead(&self, lead_id: Uuid) -> Result<Option<OwnedMutexGuard<()>>> {
        match self.locks.acquire(lead_id).await {
            Ok(guard) => Ok(Some(guard)),
            Err(Error::ConcurrentMergeConflict(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Record a turn the agent must not answer. Caller holds the lead lock.
    async fn skip(&self, ctx: &OrgContext, message: &ChatMessage, reason: &str) -> Result<TurnOutcome> {
        debug!("Skipping message #{} of lead {}: {}", message.seq, message.lead_id, reason);
        let advanced = self
            .leads
            .record_turn(&TurnRecord {
                org_id: ctx.org_id.clone(),
                lead_id: message.lead_id,
                message_id: message.id,
                seq: message.seq,
                kind: TurnKind::Skipped,
                error_kind: Some(reason.to_string()),
                trace: AiTrace::default(),
            })
            .await?;
        let kind = if advanced {
            TurnKind::Skipped
        } else {
            TurnKind::Superseded
        };
        Ok(TurnOutcome::new(kind, message).because(reason))
    }

    /// Record a failed turn. The message stays pending.
    async fn fail(
        &self,
        ctx: &OrgContext,
        message: &ChatMessage,
        mut trace: AiTrace,
        error: Error,
    ) -> Result<TurnOutcome> {
        warn!(
            "No AI update for message #{} of lead {}: {}",
            message.seq, message.lead_id, error
        );
        trace.failure = Some(error.to_string());
        self.leads
            .record_turn(&TurnRecord {
                org_id: ctx.org_id.clone(),
                lead_id: message.lead_id,
                message_id: message.id,
                seq: message.seq,
                kind: TurnKind::Failed,
                error_kind: Some(error.kind().to_string()),
                trace,
            })
            .await?;

        self.notifier
            .turn_failed(&ctx.org_id, message.lead_id, message.id, &error);
        if error.is_config_alert() {
            self.notifier.config_alert(&ctx.org_id, &error);
        }
        Ok(TurnOutcome::new(TurnKind::Failed, message).because(error.to_string()))
    }
}

/// Nothing is recorded, so the message stays pending.
fn contended(message: &ChatMessage) -> TurnOutcome {
    let error = Error::ConcurrentMergeConflict(message.lead_id);
    warn!("Message #{} of lead {} left pending: {}", message.seq, message.lead_id, error);
    TurnOutcome::new(TurnKind::Failed, message).because(error.kind())
}

fn skip_reason(lead: &Lead) -> Option<&'static str> {
    if lead.ai_qualification_status == QualificationStatus::HandoffRequired {
        Some("handoff_required")
    } else if lead.status.is_terminal() {
        Some("lead_closed")
    } else {
        None
    }
}

fn fill_blank(slot: &mut Option<String>, proposed: Option<&str>) {
    let current_blank = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    if let Some(value) = proposed.map(str::trim).filter(|v| !v.is_empty()) {
        if current_blank {
            *slot = Some(value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complete::{PromptMessage, Role};
    use crate::models::{Contact, FieldValue, LeadRef};
    use crate::notify::{ChannelNotifier, Notification};
    use crate::testing::{ScriptedCompletion, TestEnv};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn inbound(channel_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            lead: LeadRef::Channel {
                source: "telegram".into(),
                external_id: "100500".into(),
            },
            content: text.into(),
            media_url: None,
            sender_name: Some("Иван".into()),
            channel_message_id: channel_id.into(),
            timestamp: None,
            contact: Contact {
                name: Some("Иван".into()),
                phone: None,
                telegram_handle: None,
            },
        }
    }

    /// Reads `key=value` pairs from every client message in the prompt,
    /// later messages winning, the way a model rereads the conversation.
    fn transcript_extractor(messages: &[PromptMessage]) -> Option<String> {
        let mut fields = Map::new();
        for message in messages.iter().filter(|m| m.role == Role::User) {
            for pair in message.content.split_whitespace() {
                if let Some((key, value)) = pair.split_once('=') {
                    fields.insert(key.to_string(), json!(value));
                }
            }
        }
        Some(json!({"reply_text": "Записал.", "extracted_fields": fields}).to_string())
    }

    async fn store_all(env: &TestEnv, engine: &QualificationEngine, texts: &[&str]) -> Vec<StoredInbound> {
        let mut stored = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            stored.push(engine.ingest(&env.ctx(), inbound(&format!("m{}", i + 1), text)).await.unwrap());
        }
        stored
    }

    #[tokio::test]
    async fn test_russian_scenario_extracts_and_advances_one_stage() {
        let env = TestEnv::new().await;
        let provider = Arc::new(ScriptedCompletion::replying(
            r#"{"reply_text": "Здравствуйте! Какой тип ремонта вас интересует?",
                "extracted_fields": {"area_sqm": "50м²", "budget": 300000, "deadline": null},
                "status_suggestion": "QUALIFIED", "confidence": 40}"#,
        ));
        let engine = env.engine(provider.clone());

        let (stored, outcome) = engine
            .ingest_and_qualify(&env.ctx(), inbound("m1", "Здравствуйте, хочу ремонт 50м², бюджет 300000"))
            .await
            .unwrap();

        assert_eq!(outcome.kind, TurnKind::Applied);
        assert_eq!(outcome.applied_fields, vec!["area_sqm", "budget"]);
        assert_eq!(outcome.applied_status, Some(LeadStatus::Consulting));
        assert!(outcome.replied_with_message_id.is_some());

        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.extracted_data["area_sqm"], FieldValue::Number(50.0));
        assert_eq!(lead.extracted_data["budget"], FieldValue::Number(300000.0));
        assert_eq!(lead.status, LeadStatus::Consulting);
        assert_eq!(lead.processed_seq, stored.seq);

        let messages = env.db.recent_messages(&env.ctx(), lead.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        let reply = &messages[1];
        assert_eq!(reply.direction, Direction::Outbound);
        assert_eq!(reply.sender_name.as_deref(), Some(AI_SENDER));
        let metadata = reply.ai_metadata.as_ref().unwrap();
        assert_eq!(metadata["status_changed_to"], "CONSULTING");
        assert!(metadata["ignored_status_suggestion"].as_str().unwrap().contains("QUALIFIED"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_reordered_delivery_is_idempotent() {
        let texts = [
            "area_sqm=40",
            "budget=100000",
            "area_sqm=55 deadline=май",
            "budget=250000 address=Тверская",
        ];

        let reference = TestEnv::new().await;
        let engine = reference.engine(Arc::new(ScriptedCompletion::responding(transcript_extractor)));
        let stored = store_all(&reference, &engine, &texts).await;
        for s in &stored {
            engine.process_inbound(&reference.ctx(), s.lead_id, s.message_id).await.unwrap();
        }
        let expected = reference.leads.get_lead(&reference.ctx(), stored[0].lead_id).await.unwrap();
        assert_eq!(expected.processed_seq, 4);

        let mut rng = StdRng::seed_from_u64(2024);
        for _ in 0..4 {
            let env = TestEnv::new().await;
            let engine = env.engine(Arc::new(ScriptedCompletion::responding(transcript_extractor)));
            let stored = store_all(&env, &engine, &texts).await;

            // Webhook retries: every message delivered again, some twice
            for (i, text) in texts.iter().enumerate() {
                for _ in 0..rng.gen_range(1..=2) {
                    let again = engine.ingest(&env.ctx(), inbound(&format!("m{}", i + 1), text)).await.unwrap();
                    assert!(!again.created);
                    assert_eq!(again.seq, stored[i].seq);
                }
            }

            let mut order: Vec<&StoredInbound> = stored.iter().chain(stored.iter()).collect();
            order.shuffle(&mut rng);
            for s in order {
                engine.process_inbound(&env.ctx(), s.lead_id, s.message_id).await.unwrap();
            }

            let lead = env.leads.get_lead(&env.ctx(), stored[0].lead_id).await.unwrap();
            assert_eq!(lead.extracted_data, expected.extracted_data);
            assert_eq!(lead.processed_seq, expected.processed_seq);
        }
    }

    #[tokio::test]
    async fn test_replayed_message_is_a_noop() {
        let env = TestEnv::new().await;
        let provider = Arc::new(ScriptedCompletion::responding(transcript_extractor));
        let engine = env.engine(provider.clone());
        let stored = engine.ingest(&env.ctx(), inbound("m1", "budget=1")).await.unwrap();

        let first = engine.process_inbound(&env.ctx(), stored.lead_id, stored.message_id).await.unwrap();
        let second = engine.process_inbound(&env.ctx(), stored.lead_id, stored.message_id).await.unwrap();
        assert_eq!(first.kind, TurnKind::Applied);
        assert_eq!(second.kind, TurnKind::Duplicate);
        assert_eq!(provider.calls(), 1);
        assert_eq!(env.db.recent_messages(&env.ctx(), stored.lead_id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_null_proposal_never_erases() {
        let env = TestEnv::new().await;
        let engine = env.engine(Arc::new(ScriptedCompletion::queued(&[
            r#"{"reply_text": "Понял", "extracted_fields": {"area_sqm": 72}}"#,
            r#"{"reply_text": "Хорошо", "extracted_fields": {"area_sqm": null, "budget": ""}}"#,
        ])));
        let (first, _) = engine.ingest_and_qualify(&env.ctx(), inbound("m1", "72 метра")).await.unwrap();
        let (_, outcome) = engine.ingest_and_qualify(&env.ctx(), inbound("m2", "Пока не знаю")).await.unwrap();

        assert_eq!(outcome.kind, TurnKind::Applied);
        assert!(outcome.applied_fields.is_empty());
        let lead = env.leads.get_lead(&env.ctx(), first.lead_id).await.unwrap();
        assert_eq!(lead.extracted_data["area_sqm"], FieldValue::Number(72.0));
        assert!(!lead.extracted_data.contains_key("budget"));
    }

    #[tokio::test]
    async fn test_operator_edit_wins_until_released() {
        let env = TestEnv::new().await;
        let engine = env.engine(Arc::new(ScriptedCompletion::responding(transcript_extractor)));
        let operators = Operators::new(&engine, env.knowledge.clone());

        let (stored, _) = engine.ingest_and_qualify(&env.ctx(), inbound("m1", "budget=300000")).await.unwrap();
        let lead = operators
            .edit_field(&env.operator(), stored.lead_id, "budget", &json!("500 000"))
            .await
            .unwrap();
        assert_eq!(lead.extracted_data["budget"], FieldValue::Number(500000.0));
        assert!(lead.human_edited_keys.contains("budget"));

        let (_, outcome) = engine.ingest_and_qualify(&env.ctx(), inbound("m2", "budget=350000")).await.unwrap();
        assert!(outcome.applied_fields.is_empty());
        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.extracted_data["budget"], FieldValue::Number(500000.0));

        let turns = env.db.turns(&env.ctx(), stored.lead_id).await.unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last.trace.dropped_fields[0].field, "budget");
        assert_eq!(last.trace.dropped_fields[0].reason, "edited by an operator");

        operators.release_field(&env.operator(), stored.lead_id, "budget").await.unwrap();
        let (_, outcome) = engine.ingest_and_qualify(&env.ctx(), inbound("m3", "budget=360000")).await.unwrap();
        assert_eq!(outcome.applied_fields, vec!["budget"]);
        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.extracted_data["budget"], FieldValue::Number(360000.0));
    }

    #[tokio::test]
    async fn test_status_never_regresses_or_closes() {
        let env = TestEnv::new().await;
        let engine = env.engine(Arc::new(ScriptedCompletion::queued(&[
            r#"{"reply_text": "Ок", "status_suggestion": "CONSULTING"}"#,
            r#"{"reply_text": "Ок", "status_suggestion": "WON"}"#,
            r#"{"reply_text": "Ок", "status_suggestion": "CONTRACT"}"#,
        ])));
        let operators = Operators::new(&engine, env.knowledge.clone());

        let stored = engine.ingest(&env.ctx(), inbound("m1", "Добрый день")).await.unwrap();
        operators
            .set_status(&env.operator(), stored.lead_id, LeadStatus::Measurement)
            .await
            .unwrap();

        engine.process_inbound(&env.ctx(), stored.lead_id, stored.message_id).await.unwrap();
        for id in ["m2", "m3"] {
            engine.ingest_and_qualify(&env.ctx(), inbound(id, "Договорились")).await.unwrap();
        }

        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.status, LeadStatus::Measurement);
        let turns = env.db.turns(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(turns.len(), 3);
        for turn in turns {
            assert_eq!(turn.kind, TurnKind::Applied);
            assert!(turn.trace.status_changed_to.is_none());
            assert!(turn.trace.ignored_status_suggestion.is_some());
        }
    }

    #[tokio::test]
    async fn test_completion_timeout_keeps_message_pending() {
        let env = TestEnv::new().await;
        let notifier = Arc::new(ChannelNotifier::new(16));
        let mut updates = notifier.subscribe();
        let gateway = env
            .completion(Arc::new(ScriptedCompletion::hanging()))
            .with_timeout(Duration::from_millis(50));
        let engine = env.engine_with(gateway).with_notifier(notifier.clone());

        let (stored, outcome) = engine
            .ingest_and_qualify(&env.ctx(), inbound("m1", "Сколько стоит плитка?"))
            .await
            .unwrap();

        assert_eq!(outcome.kind, TurnKind::Failed);
        assert!(outcome.replied_with_message_id.is_none());

        let messages = env.db.recent_messages(&env.ctx(), stored.lead_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Inbound);

        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.processed_seq, 0);

        let turns = env.db.turns(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(turns[0].kind, TurnKind::Failed);
        assert_eq!(turns[0].error_kind.as_deref(), Some("completion_failed"));
        assert!(turns[0].trace.failure.is_some());

        let pending = env.leads.pending_turns(Utc::now()).await.unwrap();
        assert_eq!(pending[0].message_id, stored.message_id);

        match updates.recv().await.unwrap() {
            Notification::TurnFailed { message_id, .. } => assert_eq!(message_id, stored.message_id),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_locked_lead_leaves_message_pending() {
        let mut env = TestEnv::new().await;
        env.config.engine.lock_timeout_ms = 20;
        env.config.engine.lock_attempts = 2;
        let provider = Arc::new(ScriptedCompletion::replying(r#"{"reply_text": "Здравствуйте!"}"#));
        let engine = env.engine(provider.clone());

        let first = engine.ingest(&env.ctx(), inbound("m1", "Привет")).await.unwrap();
        let guard = engine.locks().acquire(first.lead_id).await.unwrap();

        let (stored, outcome) = engine
            .ingest_and_qualify(&env.ctx(), inbound("m2", "Нужен ремонт ванной"))
            .await
            .unwrap();
        assert_eq!(outcome.kind, TurnKind::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("concurrent_merge_conflict"));
        assert!(outcome.replied_with_message_id.is_none());

        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.processed_seq, 0);
        assert!(env.db.turns(&env.ctx(), stored.lead_id).await.unwrap().is_empty());
        let pending = env
            .leads
            .pending_turns(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, stored.message_id);

        drop(guard);
        let retried = engine
            .process_inbound(&env.ctx(), stored.lead_id, stored.message_id)
            .await
            .unwrap();
        assert_eq!(retried.kind, TurnKind::Applied);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_while_waiting_for_lock_is_answered() {
        let env = TestEnv::new().await;
        let provider = Arc::new(ScriptedCompletion::replying(r#"{"reply_text": "Снова на связи"}"#));
        let engine = env.engine(provider.clone());
        let stored = engine.ingest(&env.ctx(), inbound("m1", "Вы тут?")).await.unwrap();

        let mut lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        lead.ai_qualification_status = QualificationStatus::HandoffRequired;
        env.leads.save_lead(&lead).await.unwrap();

        let guard = engine.locks().acquire(stored.lead_id).await.unwrap();
        let task = {
            let engine = engine.clone();
            let ctx = env.ctx();
            let (lead, message) = (stored.lead_id, stored.message_id);
            tokio::spawn(async move { engine.process_inbound(&ctx, lead, message).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // An operator hands the lead back while the turn waits on the lock
        lead.ai_qualification_status = QualificationStatus::InProgress;
        env.leads.save_lead(&lead).await.unwrap();
        drop(guard);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.kind, TurnKind::Applied);
        assert_eq!(outcome.reply_text.as_deref(), Some("Снова на связи"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slower_earlier_turn_is_superseded() {
        let env = TestEnv::new().await;
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let engine = env.engine(Arc::new(ScriptedCompletion::responding(move |messages| {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if last == "budget=100000" {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            transcript_extractor(messages)
        })));
        let stored = store_all(&env, &engine, &["budget=100000", "budget=200000"]).await;

        let slow = {
            let engine = engine.clone();
            let ctx = env.ctx();
            let (lead, message) = (stored[0].lead_id, stored[0].message_id);
            tokio::spawn(async move { engine.process_inbound(&ctx, lead, message).await })
        };
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let fast = engine
            .process_inbound(&env.ctx(), stored[1].lead_id, stored[1].message_id)
            .await
            .unwrap();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(fast.kind, TurnKind::Applied);
        assert_eq!(slow.kind, TurnKind::Superseded);

        let lead = env.leads.get_lead(&env.ctx(), stored[0].lead_id).await.unwrap();
        assert_eq!(lead.extracted_data["budget"], FieldValue::Number(200000.0));
        assert_eq!(lead.processed_seq, stored[1].seq);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_turns_last_sequence_wins() {
        for _ in 0..5 {
            let env = TestEnv::new().await;
            let engine = env.engine(Arc::new(ScriptedCompletion::responding(transcript_extractor)));
            let stored = store_all(&env, &engine, &["budget=100000", "budget=200000"]).await;

            let tasks: Vec<_> = stored
                .iter()
                .map(|s| {
                    let engine = engine.clone();
                    let ctx = env.ctx();
                    let (lead, message) = (s.lead_id, s.message_id);
                    tokio::spawn(async move { engine.process_inbound(&ctx, lead, message).await })
                })
                .collect();
            for task in tasks {
                task.await.unwrap().unwrap();
            }

            let lead = env.leads.get_lead(&env.ctx(), stored[0].lead_id).await.unwrap();
            assert_eq!(lead.extracted_data["budget"], FieldValue::Number(200000.0));
            assert_eq!(lead.processed_seq, stored[1].seq);
        }
    }

    #[tokio::test]
    async fn test_handoff_stops_agent_until_resumed() {
        let env = TestEnv::new().await;
        let provider = Arc::new(ScriptedCompletion::replying(
            r#"{"reply_text": "Передаю менеджеру", "client_name": "Пётр", "phone": "+79990001122",
                "is_hot_lead": true, "confidence": 80, "summary": "Готов к замеру"}"#,
        ));
        let engine = env.engine(provider.clone());
        let operators = Operators::new(&engine, env.knowledge.clone());

        let (stored, outcome) = engine
            .ingest_and_qualify(&env.ctx(), inbound("m1", "Мой телефон +79990001122"))
            .await
            .unwrap();
        assert_eq!(outcome.qualification_changed_to, Some(QualificationStatus::HandoffRequired));

        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.ai_qualification_status, QualificationStatus::HandoffRequired);
        // Name came from the channel contact and is kept; phone was empty
        assert_eq!(lead.name.as_deref(), Some("Иван"));
        assert_eq!(lead.phone.as_deref(), Some("+79990001122"));
        assert_eq!(lead.ai_summary.as_deref(), Some("Готов к замеру"));

        let (second, outcome) = engine.ingest_and_qualify(&env.ctx(), inbound("m2", "Алло?")).await.unwrap();
        assert_eq!(outcome.kind, TurnKind::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("handoff_required"));
        assert_eq!(provider.calls(), 1);
        let lead = env.leads.get_lead(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(lead.processed_seq, second.seq);

        operators.resume_ai(&env.operator(), stored.lead_id).await.unwrap();
        let (_, outcome) = engine.ingest_and_qualify(&env.ctx(), inbound("m3", "Вы тут?")).await.unwrap();
        assert_eq!(outcome.kind, TurnKind::Applied);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_prompt_profile_and_knowledge_reach_the_model() {
        let env = TestEnv::new().await;
        let provider = Arc::new(ScriptedCompletion::replying(r#"{"reply_text": "Замер бесплатный"}"#));
        let engine = env.engine(provider.clone());
        let faq = "Выезд замерщика бесплатный по всей Москве.";
        env.knowledge.ingest_text(&env.ctx(), "Замер", faq, "faq").await.unwrap();
        env.db
            .set_prompt(&env.operator(), "main", "Ты менеджер. {custom_fields}", Some("vendor/custom-model"))
            .await
            .unwrap();

        let (stored, _) = engine.ingest_and_qualify(&env.ctx(), inbound("m1", faq)).await.unwrap();

        assert_eq!(provider.models_seen(), vec!["vendor/custom-model"]);
        let prompt = provider.last_prompt().unwrap();
        assert!(prompt[0].content.starts_with("Ты менеджер."));
        assert!(prompt[1].content.contains("[1] Замер (faq"));

        let turns = env.db.turns(&env.ctx(), stored.lead_id).await.unwrap();
        assert_eq!(turns[0].trace.model.as_deref(), Some("vendor/custom-model"));
        assert_eq!(turns[0].trace.retrieved_context[0].title, "Замер");
    }

    #[tokio::test]
    async fn test_operator_reply_is_remembered_for_that_lead() {
        let env = TestEnv::new().await;
        let engine = env.engine(Arc::new(ScriptedCompletion::failing()));
        let operators = Operators::new(&engine, env.knowledge.clone());
        let stored = engine.ingest(&env.ctx(), inbound("m1", "Когда приедете?")).await.unwrap();

        let text = "Замерщик приедет в четверг к десяти утра.";
        let message = operators.reply(&env.operator(), stored.lead_id, text).await.unwrap();
        assert_eq!(message.sender_name.as_deref(), Some("anna"));
        assert_eq!(message.delivery_status, Some(crate::models::DeliveryStatus::Pending));

        let hits = env.retrieval().retrieve(&env.ctx(), Some(stored.lead_id), text, None).await;
        assert_eq!(hits.chunks[0].chunk.lead_id, Some(stored.lead_id));

        let other_lead = env.retrieval().retrieve(&env.ctx(), Some(Uuid::new_v4()), text, None).await;
        assert!(other_lead.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_message_of_other_lead_is_rejected() {
        let env = TestEnv::new().await;
        let engine = env.engine(Arc::new(ScriptedCompletion::failing()));
        let stored = engine.ingest(&env.ctx(), inbound("m1", "Привет")).await.unwrap();
        let err = engine
            .process_inbound(&env.ctx(), Uuid::new_v4(), stored.message_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
