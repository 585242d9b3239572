//! Background sweep
//!
//! Two jobs share one loop: re-running qualification for inbound messages
//! whose turn never completed, and nudging leads that went quiet after our
//! last message.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Serialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::complete::{PromptMessage, ResponseSchema};
use crate::config::FollowupConfig;
use crate::engine::{QualificationEngine, AI_SENDER};
use crate::error::Result;
use crate::models::{ChatMessage, Direction, Lead, OrgContext, OutboundMessage, QualificationStatus, TurnKind};
use crate::notify::LeadUpdate;

/// Messages of context given to the follow-up writer
const FOLLOWUP_HISTORY: usize = 10;

const FOLLOWUP_PROMPT: &str = "\
Клиент не ответил на наше последнее сообщение. Напиши короткое дружелюбное \
напоминание от имени менеджера, попытка {attempt} из {max}. \
Опирайся на переписку, не повторяй уже сказанное и не дави на клиента. \
Одно или два предложения, на языке клиента.

Переписка:
{history}";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub pending_found: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: usize,
    pub followups_sent: usize,
    pub followups_failed: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.pending_found += other.pending_found;
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors += other.errors;
        self.followups_sent += other.followups_sent;
        self.followups_failed += other.followups_failed;
    }
}

pub struct Sweeper {
    engine: QualificationEngine,
    config: FollowupConfig,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl Sweeper {
    pub fn new(engine: QualificationEngine, config: &FollowupConfig) -> Self {
        let per_minute = NonZeroU32::new(config.sends_per_minute).unwrap_or(nonzero!(1u32));
        Self {
            engine,
            config: config.clone(),
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    /// Re-run qualification for messages left pending by failed or
    /// cancelled turns
    pub async fn retry_pending(&self) -> Result<SweepReport> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.pending_min_age_secs as i64);
        let pending = self.engine.leads().pending_turns(cutoff).await?;
        let mut report = SweepReport {
            pending_found: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            debug!("No pending turns");
            return Ok(report);
        }
        info!("Retrying {} pending turns", pending.len());

        let engine = &self.engine;
        let results: Vec<_> = stream::iter(pending)
            .map(|turn| async move {
                let ctx = OrgContext::system(&turn.org_id);
                let result = engine
                    .process_inbound(&ctx, turn.lead_id, turn.message_id)
                    .await;
                (turn, result)
            })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        for (turn, result) in results {
            match result {
                Ok(outcome) => match outcome.kind {
                    TurnKind::Applied => report.applied += 1,
                    TurnKind::Failed => report.failed += 1,
                    _ => report.skipped += 1,
                },
                Err(e) => {
                    warn!("Retry of message {} for lead {} failed: {}", turn.message_id, turn.lead_id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Nudge quiet leads whose silence exceeds the threshold for the number
    /// of nudges they already got
    pub async fn send_followups(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if !self.config.enabled {
            debug!("Follow-ups disabled");
            return Ok(report);
        }

        let candidates = self
            .engine
            .leads()
            .followup_candidates(self.config.max_followups)
            .await?;
        let now = Utc::now();

        for candidate in candidates {
            let Some(threshold) = self.config.threshold_for(candidate.lead.followup_count) else {
                continue;
            };
            let silence = (now - candidate.last_message_at).to_std().unwrap_or_default();
            if silence < threshold {
                continue;
            }

            self.limiter.until_ready().await;
            match self.send_followup(&candidate.lead).await {
                Ok(Some(_)) => report.followups_sent += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!("Follow-up for lead {} failed: {}", candidate.lead.id, e);
                    report.followups_failed += 1;
                }
            }
        }

        if report.followups_sent > 0 {
            info!("Sent {} follow-ups", report.followups_sent);
        }
        Ok(report)
    }

    async fn send_followup(&self, lead: &Lead) -> Result<Option<ChatMessage>> {
        let leads = self.engine.leads();
        let history = leads.history_before(lead.id, i64::MAX, FOLLOWUP_HISTORY).await?;
        if history.is_empty() {
            return Ok(None);
        }

        let attempt = lead.followup_count + 1;
        let profile = leads.active_prompt(&lead.org_id).await?;
        let schema = ResponseSchema::new(Vec::new(), Vec::new());
        let prompt = vec![PromptMessage::system(format!(
            "{}\n\n{}",
            followup_prompt(attempt, self.config.max_followups, &history),
            schema.instructions()
        ))];

        let reply = self
            .engine
            .completion()
            .complete(&prompt, &schema, profile.as_ref().and_then(|p| p.llm_model.as_deref()))
            .await?;
        let text = clean_followup(&reply.reply_text);
        if text.is_empty() {
            debug!("Model wrote an empty follow-up for lead {}", lead.id);
            return Ok(None);
        }

        let _guard = self.engine.locks().acquire(lead.id).await?;
        let ctx = OrgContext::system(&lead.org_id);
        let fresh = leads.get_lead(&ctx, lead.id).await?;
        if fresh.last_message_at != lead.last_message_at
            || fresh.followup_count != lead.followup_count
            || fresh.ai_qualification_status != QualificationStatus::InProgress
        {
            debug!("Lead {} changed while the follow-up was written", lead.id);
            return Ok(None);
        }

        let message = leads
            .append_followup(
                lead.id,
                &OutboundMessage {
                    content: text,
                    sender_name: Some(AI_SENDER.to_string()),
                    ai_metadata: Some(json!({"type": "followup", "attempt": attempt})),
                },
            )
            .await?;
        info!("Queued follow-up #{} for lead {}", attempt, lead.id);

        self.engine.notifier().lead_updated(&LeadUpdate {
            org_id: fresh.org_id.clone(),
            lead_id: fresh.id,
            status: fresh.status,
            qualification: fresh.ai_qualification_status,
            applied_fields: Vec::new(),
            reply_message_id: Some(message.id),
            actor: "ai".to_string(),
        });
        Ok(Some(message))
    }

    /// One pass of both jobs
    pub async fn run_once(&self) -> Result<SweepReport> {
        let mut report = self.retry_pending().await?;
        report.absorb(self.send_followups().await?);
        Ok(report)
    }

    /// Sweep every `sweep_interval_secs` until the task is dropped
    pub async fn run_forever(&self) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        info!("Sweeping every {:?}", period);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) => debug!("Sweep finished: {:?}", report),
                Err(e) => error!("Sweep failed: {}", e),
            }
        }
    }
}

fn followup_prompt(attempt: u32, max: u32, history: &[ChatMessage]) -> String {
    let transcript = history
        .iter()
        .map(|m| {
            let who = match m.direction {
                Direction::Inbound => "Клиент",
                Direction::Outbound => "Менеджер",
            };
            format!("{}: {}", who, m.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n");
    FOLLOWUP_PROMPT
        .replace("{attempt}", &attempt.to_string())
        .replace("{max}", &max.to_string())
        .replace("{history}", &transcript)
}

/// Models like to wrap short messages in quotes
fn clean_followup(raw: &str) -> String {
    let mut text = raw.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('«', '»')] {
        if text.len() > 1 && text.starts_with(open) && text.ends_with(close) {
            text = text[open.len_utf8()..text.len() - close.len_utf8()].trim();
        }
    }
    text.to_string()
}
