//! CRM persistence using SQLite
//!
//! This module handles the records the qualification engine reads and writes:
//! - Leads (contact fields, pipeline status, extracted data, watermark)
//! - Chat messages (append-only, sequence numbered per lead)
//! - Custom field definitions and prompt configurations
//! - Qualification turns (applied, skipped and failed attempts)
//!
//! [`LeadStore`] is the contract the engine depends on; [`CrmDb`] is the
//! bundled implementation.

mod schema;

pub use schema::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fields::{CustomField, NewCustomField};
use crate::models::{
    format_ts, parse_ts, AiTrace, ChatMessage, Contact, DeliveryStatus, Direction, ExtractedData,
    InboundMessage, Lead, LeadRef, LeadStatus, OrgContext, OutboundMessage, StoredInbound, TurnKind,
};

/// A system prompt configuration of an org
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptProfile {
    pub id: Uuid,
    pub org_id: String,
    pub name: String,
    pub system_prompt: String,
    /// Overrides the configured completion model
    pub llm_model: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything a successful turn writes, committed together
#[derive(Debug, Clone)]
pub struct TurnCommit {
    /// Lead state after merge
    pub lead: Lead,
    pub message_id: Uuid,
    /// Inbound sequence that becomes the new watermark
    pub seq: i64,
    pub reply: Option<OutboundMessage>,
    pub trace: AiTrace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    Applied { reply: Option<ChatMessage> },
    /// The watermark already reached this sequence; nothing was written
    Stale,
}

/// A turn that did not merge anything
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub org_id: String,
    pub lead_id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
    pub kind: TurnKind,
    pub error_kind: Option<String>,
    pub trace: AiTrace,
}

/// Stored turn, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnEntry {
    pub id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
    pub kind: TurnKind,
    pub error_kind: Option<String>,
    pub trace: AiTrace,
    pub created_at: DateTime<Utc>,
}

/// Latest inbound message of a lead that has not been qualified yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTurn {
    pub lead_id: Uuid,
    pub org_id: String,
    pub message_id: Uuid,
    pub seq: i64,
}

/// Lead whose last message is ours, with the time it was sent
#[derive(Debug, Clone, PartialEq)]
pub struct FollowupCandidate {
    pub lead: Lead,
    pub last_message_at: DateTime<Utc>,
}

/// Persistence the qualification engine depends on
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Durably store an inbound message, creating the lead for a new channel
    /// chat. Idempotent on (lead, channel message id).
    async fn store_inbound(&self, ctx: &OrgContext, message: &InboundMessage) -> Result<StoredInbound>;

    async fn get_lead(&self, ctx: &OrgContext, id: Uuid) -> Result<Lead>;

    async fn get_message(&self, ctx: &OrgContext, id: Uuid) -> Result<ChatMessage>;

    /// Up to `limit` messages with a sequence below `seq`, oldest first
    async fn history_before(&self, lead_id: Uuid, seq: i64, limit: usize) -> Result<Vec<ChatMessage>>;

    /// All custom field definitions of an org, active or not
    async fn custom_fields(&self, org_id: &str) -> Result<Vec<CustomField>>;

    async fn active_prompt(&self, org_id: &str) -> Result<Option<PromptProfile>>;

    /// Commit the lead update, the watermark advance, the reply and the turn
    /// record atomically. The watermark must still be below `seq`.
    async fn apply_turn(&self, commit: &TurnCommit) -> Result<CommitResult>;

    /// Record a turn that merged nothing. Skipped turns advance the
    /// watermark; returns whether it moved.
    async fn record_turn(&self, record: &TurnRecord) -> Result<bool>;

    /// Persist operator-owned lead state. Never touches the watermark.
    async fn save_lead(&self, lead: &Lead) -> Result<()>;

    async fn append_outbound(
        &self,
        lead_id: Uuid,
        message: &OutboundMessage,
        delivery: DeliveryStatus,
    ) -> Result<ChatMessage>;

    /// Store a follow-up nudge and bump the lead's follow-up counter
    async fn append_followup(&self, lead_id: Uuid, message: &OutboundMessage) -> Result<ChatMessage>;

    /// Unqualified inbound messages stored before `older_than`
    async fn pending_turns(&self, older_than: DateTime<Utc>) -> Result<Vec<PendingTurn>>;

    /// AI-handled leads whose last message is outbound and that have had
    /// fewer than `max_followups` nudges
    async fn followup_candidates(&self, max_followups: u32) -> Result<Vec<FollowupCandidate>>;
}

#[derive(Debug, FromRow)]
struct LeadRow {
    id: String,
    org_id: String,
    name: Option<String>,
    phone: Option<String>,
    telegram_handle: Option<String>,
    source: Option<String>,
    external_id: Option<String>,
    status: String,
    extracted_data: String,
    human_edited_keys: String,
    ai_qualification_status: String,
    ai_summary: Option<String>,
    processed_seq: i64,
    followup_count: i64,
    last_message_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LeadRow {
    fn into_lead(self) -> Result<Lead> {
        let extracted_data: ExtractedData = serde_json::from_str(&self.extracted_data)?;
        let human_edited_keys: BTreeSet<String> = serde_json::from_str(&self.human_edited_keys)?;
        Ok(Lead {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            name: self.name,
            phone: self.phone,
            telegram_handle: self.telegram_handle,
            source: self.source,
            external_id: self.external_id,
            status: self.status.parse()?,
            extracted_data,
            human_edited_keys,
            ai_qualification_status: self.ai_qualification_status.parse()?,
            ai_summary: self.ai_summary,
            processed_seq: self.processed_seq,
            followup_count: self.followup_count.max(0) as u32,
            last_message_at: self.last_message_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    lead_id: String,
    seq: i64,
    direction: String,
    content: String,
    media_url: Option<String>,
    sender_name: Option<String>,
    channel_message_id: Option<String>,
    ai_metadata: Option<String>,
    delivery_status: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<ChatMessage> {
        Ok(ChatMessage {
            id: parse_uuid(&self.id)?,
            lead_id: parse_uuid(&self.lead_id)?,
            seq: self.seq,
            direction: self.direction.parse()?,
            content: self.content,
            media_url: self.media_url,
            sender_name: self.sender_name,
            channel_message_id: self.channel_message_id,
            ai_metadata: self
                .ai_metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            delivery_status: self.delivery_status.as_deref().map(str::parse).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct FieldRow {
    id: String,
    org_id: String,
    name: String,
    label: String,
    field_type: String,
    options: String,
    description: Option<String>,
    active: bool,
    position: i64,
    created_at: String,
}

impl FieldRow {
    fn into_field(self) -> Result<CustomField> {
        Ok(CustomField {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            name: self.name,
            label: self.label,
            field_type: self.field_type.parse()?,
            options: serde_json::from_str(&self.options)?,
            description: self.description,
            active: self.active,
            position: self.position,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct PromptRow {
    id: String,
    org_id: String,
    name: String,
    system_prompt: String,
    llm_model: Option<String>,
    active: bool,
    created_at: String,
}

impl PromptRow {
    fn into_profile(self) -> Result<PromptProfile> {
        Ok(PromptProfile {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            name: self.name,
            system_prompt: self.system_prompt,
            llm_model: self.llm_model.filter(|m| !m.trim().is_empty()),
            active: self.active,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct TurnRow {
    id: String,
    message_id: String,
    seq: i64,
    outcome: String,
    error_kind: Option<String>,
    trace: String,
    created_at: String,
}

#[derive(Debug, FromRow)]
struct PendingRow {
    lead_id: String,
    org_id: String,
    message_id: String,
    seq: i64,
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::InvalidInput(format!("bad id '{}': {}", raw, e)))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Append an outbound message, assigning the next sequence number
async fn insert_outbound(
    conn: &mut SqliteConnection,
    lead_id: Uuid,
    message: &OutboundMessage,
    delivery: DeliveryStatus,
    now: DateTime<Utc>,
) -> Result<ChatMessage> {
    let id = Uuid::new_v4();
    let metadata = message
        .ai_metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let (seq,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO chat_messages
            (id, lead_id, seq, direction, content, sender_name, ai_metadata, delivery_status, created_at)
        SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, 'outbound', ?, ?, ?, ?, ?
        FROM chat_messages WHERE lead_id = ?
        RETURNING seq
        "#,
    )
    .bind(id.to_string())
    .bind(lead_id.to_string())
    .bind(&message.content)
    .bind(&message.sender_name)
    .bind(&metadata)
    .bind(delivery.as_str())
    .bind(format_ts(&now))
    .bind(lead_id.to_string())
    .fetch_one(&mut *conn)
    .await?;

    Ok(ChatMessage {
        id,
        lead_id,
        seq,
        direction: Direction::Outbound,
        content: message.content.clone(),
        media_url: None,
        sender_name: message.sender_name.clone(),
        channel_message_id: None,
        ai_metadata: message.ai_metadata.clone(),
        delivery_status: Some(delivery),
        created_at: now,
    })
}

async fn insert_turn(conn: &mut SqliteConnection, record: &TurnRecord, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO qualification_turns
            (id, org_id, lead_id, message_id, seq, outcome, error_kind, trace, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&record.org_id)
    .bind(record.lead_id.to_string())
    .bind(record.message_id.to_string())
    .bind(record.seq)
    .bind(record.kind.as_str())
    .bind(&record.error_kind)
    .bind(serde_json::to_string(&record.trace)?)
    .bind(format_ts(&now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// CRM database handle
#[derive(Clone)]
pub struct CrmDb {
    pool: SqlitePool,
}

impl CrmDb {
    /// Connect to the database
    pub async fn connect(config: &Config) -> Result<Self> {
        let db_path = &config.paths.db_file;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='leads'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    /// Shared pool, also used by the SQLite knowledge store
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===== Lead Operations =====

    async fn fetch_lead(&self, id: Uuid) -> Result<Option<Lead>> {
        let row = sqlx::query_as::<_, LeadRow>("SELECT * FROM leads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(LeadRow::into_lead).transpose()
    }

    /// Find or create the lead an inbound message belongs to
    async fn resolve_lead(&self, ctx: &OrgContext, lead: &LeadRef, contact: &Contact) -> Result<Uuid> {
        match lead {
            LeadRef::Id(id) => Ok(self.get_lead(ctx, *id).await?.id),
            LeadRef::Channel {
                source,
                external_id,
            } => {
                let now = format_ts(&Utc::now());
                let created = sqlx::query(
                    r#"
                    INSERT INTO leads
                        (id, org_id, name, phone, telegram_handle, source, external_id, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(org_id, source, external_id) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&ctx.org_id)
                .bind(non_blank(&contact.name))
                .bind(non_blank(&contact.phone))
                .bind(non_blank(&contact.telegram_handle))
                .bind(source)
                .bind(external_id)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await?;

                let (id,): (String,) = sqlx::query_as(
                    "SELECT id FROM leads WHERE org_id = ? AND source = ? AND external_id = ?",
                )
                .bind(&ctx.org_id)
                .bind(source)
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;

                if created.rows_affected() > 0 {
                    info!("Created lead {} for {} chat {}", id, source, external_id);
                }
                parse_uuid(&id)
            }
        }
    }

    /// Most recently active leads of the org
    pub async fn list_leads(&self, ctx: &OrgContext, limit: usize) -> Result<Vec<Lead>> {
        let rows = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT * FROM leads WHERE org_id = ?
            ORDER BY COALESCE(last_message_at, created_at) DESC
            LIMIT ?
            "#,
        )
        .bind(&ctx.org_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeadRow::into_lead).collect()
    }

    // ===== Message Operations =====

    /// Latest `limit` messages of a lead, oldest first
    pub async fn recent_messages(&self, ctx: &OrgContext, lead_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        let lead = self.get_lead(ctx, lead_id).await?;
        self.history_before(lead.id, i64::MAX, limit).await
    }

    /// Record the delivery result of an outbound message
    pub async fn mark_delivery(&self, ctx: &OrgContext, message_id: Uuid, status: DeliveryStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages SET delivery_status = ?
            WHERE id = ? AND direction = 'outbound'
              AND lead_id IN (SELECT id FROM leads WHERE org_id = ?)
            "#,
        )
        .bind(status.as_str())
        .bind(message_id.to_string())
        .bind(&ctx.org_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    /// Qualification turns of a lead, oldest first
    pub async fn turns(&self, ctx: &OrgContext, lead_id: Uuid) -> Result<Vec<TurnEntry>> {
        let lead = self.get_lead(ctx, lead_id).await?;
        let rows = sqlx::query_as::<_, TurnRow>(
            r#"
            SELECT id, message_id, seq, outcome, error_kind, trace, created_at
            FROM qualification_turns WHERE lead_id = ?
            ORDER BY created_at, seq
            "#,
        )
        .bind(lead.id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TurnEntry {
                    id: parse_uuid(&row.id)?,
                    message_id: parse_uuid(&row.message_id)?,
                    seq: row.seq,
                    kind: row.outcome.parse()?,
                    error_kind: row.error_kind,
                    trace: serde_json::from_str(&row.trace)?,
                    created_at: parse_ts(&row.created_at)?,
                })
            })
            .collect()
    }

    // ===== Custom Field Operations =====

    pub async fn create_custom_field(&self, ctx: &OrgContext, field: &NewCustomField) -> Result<CustomField> {
        field.validate()?;

        let (position,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(position), -1) + 1 FROM custom_fields WHERE org_id = ?")
                .bind(&ctx.org_id)
                .fetch_one(&self.pool)
                .await?;

        let options: Vec<String> = field
            .options
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        let created = CustomField {
            id: Uuid::new_v4(),
            org_id: ctx.org_id.clone(),
            name: field.name.clone(),
            label: field.label.trim().to_string(),
            field_type: field.field_type,
            options,
            description: field.description.clone(),
            active: true,
            position,
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO custom_fields
                (id, org_id, name, label, field_type, options, description, active, position, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(created.id.to_string())
        .bind(&created.org_id)
        .bind(&created.name)
        .bind(&created.label)
        .bind(created.field_type.as_str())
        .bind(serde_json::to_string(&created.options)?)
        .bind(&created.description)
        .bind(created.position)
        .bind(format_ts(&created.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!("Created custom field {} ({})", created.name, created.field_type);
                Ok(created)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::InvalidInput(
                format!("custom field '{}' already exists", field.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Activate or deactivate a field. Inactive fields leave the prompt and
    /// the merge; stored values stay.
    pub async fn set_field_active(&self, ctx: &OrgContext, name: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE custom_fields SET active = ? WHERE org_id = ? AND name = ?")
            .bind(active)
            .bind(&ctx.org_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::FieldNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Delete a field definition. Values already stored on leads are kept.
    pub async fn delete_custom_field(&self, ctx: &OrgContext, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM custom_fields WHERE org_id = ? AND name = ?")
            .bind(&ctx.org_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::FieldNotFound(name.to_string()));
        }
        info!("Deleted custom field {}; stored lead values are preserved", name);
        Ok(())
    }

    // ===== Prompt Operations =====

    /// Store a new prompt configuration and make it the only active one
    pub async fn set_prompt(
        &self,
        ctx: &OrgContext,
        name: &str,
        system_prompt: &str,
        llm_model: Option<&str>,
    ) -> Result<PromptProfile> {
        if system_prompt.trim().is_empty() {
            return Err(Error::InvalidInput("system prompt must not be empty".to_string()));
        }

        let profile = PromptProfile {
            id: Uuid::new_v4(),
            org_id: ctx.org_id.clone(),
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            llm_model: llm_model.map(str::trim).filter(|m| !m.is_empty()).map(String::from),
            active: true,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE prompt_configs SET active = 0 WHERE org_id = ?")
            .bind(&ctx.org_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO prompt_configs (id, org_id, name, system_prompt, llm_model, active, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(profile.id.to_string())
        .bind(&profile.org_id)
        .bind(&profile.name)
        .bind(&profile.system_prompt)
        .bind(&profile.llm_model)
        .bind(format_ts(&profile.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Activated prompt configuration '{}' for org {}", name, ctx.org_id);
        Ok(profile)
    }
}

#[async_trait]
impl LeadStore for CrmDb {
    async fn store_inbound(&self, ctx: &OrgContext, message: &InboundMessage) -> Result<StoredInbound> {
        if message.content.trim().is_empty() && message.media_url.is_none() {
            return Err(Error::InvalidInput("inbound message has no content".to_string()));
        }
        let channel_id = message.channel_message_id.trim();
        if channel_id.is_empty() {
            return Err(Error::InvalidInput("inbound message needs a channel message id".to_string()));
        }

        let lead_id = self.resolve_lead(ctx, &message.lead, &message.contact).await?;
        let created_at = message.timestamp.unwrap_or_else(Utc::now);
        let message_id = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO chat_messages
                (id, lead_id, seq, direction, content, media_url, sender_name, channel_message_id, created_at)
            SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, 'inbound', ?, ?, ?, ?, ?
            FROM chat_messages WHERE lead_id = ?
            ON CONFLICT(lead_id, channel_message_id) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(message_id.to_string())
        .bind(lead_id.to_string())
        .bind(&message.content)
        .bind(&message.media_url)
        .bind(&message.sender_name)
        .bind(channel_id)
        .bind(format_ts(&created_at))
        .bind(lead_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((seq,)) = inserted else {
            tx.rollback().await?;
            let (id, seq): (String, i64) = sqlx::query_as(
                "SELECT id, seq FROM chat_messages WHERE lead_id = ? AND channel_message_id = ?",
            )
            .bind(lead_id.to_string())
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await?;
            debug!("Duplicate delivery of {} for lead {}", channel_id, lead_id);
            return Ok(StoredInbound {
                lead_id,
                message_id: parse_uuid(&id)?,
                seq,
                created: false,
            });
        };

        sqlx::query(
            r#"
            UPDATE leads SET
                followup_count = 0,
                last_message_at = ?,
                name = COALESCE(name, ?),
                phone = COALESCE(phone, ?),
                telegram_handle = COALESCE(telegram_handle, ?),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(format_ts(&created_at))
        .bind(non_blank(&message.contact.name))
        .bind(non_blank(&message.contact.phone))
        .bind(non_blank(&message.contact.telegram_handle))
        .bind(format_ts(&Utc::now()))
        .bind(lead_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Stored inbound message {} as seq {} for lead {}", message_id, seq, lead_id);
        Ok(StoredInbound {
            lead_id,
            message_id,
            seq,
            created: true,
        })
    }

    async fn get_lead(&self, ctx: &OrgContext, id: Uuid) -> Result<Lead> {
        let lead = self
            .fetch_lead(id)
            .await?
            .ok_or_else(|| Error::LeadNotFound(id.to_string()))?;
        ctx.ensure_owns(&lead)?;
        Ok(lead)
    }

    async fn get_message(&self, ctx: &OrgContext, id: Uuid) -> Result<ChatMessage> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT m.* FROM chat_messages m
            JOIN leads l ON l.id = m.lead_id
            WHERE m.id = ? AND l.org_id = ?
            "#,
        )
        .bind(id.to_string())
        .bind(&ctx.org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::MessageNotFound(id.to_string()))?
            .into_message()
    }

    async fn history_before(&self, lead_id: Uuid, seq: i64, limit: usize) -> Result<Vec<ChatMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM chat_messages
            WHERE lead_id = ? AND seq < ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(lead_id.to_string())
        .bind(seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn custom_fields(&self, org_id: &str) -> Result<Vec<CustomField>> {
        let rows = sqlx::query_as::<_, FieldRow>(
            "SELECT * FROM custom_fields WHERE org_id = ? ORDER BY position, created_at",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FieldRow::into_field).collect()
    }

    async fn active_prompt(&self, org_id: &str) -> Result<Option<PromptProfile>> {
        let row = sqlx::query_as::<_, PromptRow>(
            r#"
            SELECT * FROM prompt_configs
            WHERE org_id = ? AND active = 1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PromptRow::into_profile).transpose()
    }

    async fn apply_turn(&self, commit: &TurnCommit) -> Result<CommitResult> {
        let lead = &commit.lead;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE leads SET
                name = COALESCE(name, ?),
                phone = COALESCE(phone, ?),
                status = ?,
                extracted_data = ?,
                ai_qualification_status = ?,
                ai_summary = ?,
                processed_seq = ?,
                updated_at = ?
            WHERE id = ? AND org_id = ? AND processed_seq < ?
            "#,
        )
        .bind(&lead.name)
        .bind(&lead.phone)
        .bind(lead.status.as_str())
        .bind(serde_json::to_string(&lead.extracted_data)?)
        .bind(lead.ai_qualification_status.as_str())
        .bind(&lead.ai_summary)
        .bind(commit.seq)
        .bind(format_ts(&now))
        .bind(lead.id.to_string())
        .bind(&lead.org_id)
        .bind(commit.seq)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Watermark of lead {} already at or past seq {}", lead.id, commit.seq);
            return Ok(CommitResult::Stale);
        }

        let reply = match &commit.reply {
            Some(message) => {
                let stored = insert_outbound(&mut *tx, lead.id, message, DeliveryStatus::Pending, now).await?;
                sqlx::query("UPDATE leads SET last_message_at = ? WHERE id = ?")
                    .bind(format_ts(&now))
                    .bind(lead.id.to_string())
                    .execute(&mut *tx)
                    .await?;
                Some(stored)
            }
            None => None,
        };

        let record = TurnRecord {
            org_id: lead.org_id.clone(),
            lead_id: lead.id,
            message_id: commit.message_id,
            seq: commit.seq,
            kind: TurnKind::Applied,
            error_kind: None,
            trace: commit.trace.clone(),
        };
        insert_turn(&mut *tx, &record, now).await?;
        tx.commit().await?;

        Ok(CommitResult::Applied { reply })
    }

    async fn record_turn(&self, record: &TurnRecord) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let advanced = if record.kind == TurnKind::Skipped {
            sqlx::query(
                "UPDATE leads SET processed_seq = ?, updated_at = ? WHERE id = ? AND processed_seq < ?",
            )
            .bind(record.seq)
            .bind(format_ts(&now))
            .bind(record.lead_id.to_string())
            .bind(record.seq)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0
        } else {
            false
        };

        insert_turn(&mut *tx, record, now).await?;
        tx.commit().await?;
        Ok(advanced)
    }

    async fn save_lead(&self, lead: &Lead) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE leads SET
                name = COALESCE(name, ?),
                phone = COALESCE(phone, ?),
                telegram_handle = COALESCE(telegram_handle, ?),
                status = ?,
                extracted_data = ?,
                human_edited_keys = ?,
                ai_qualification_status = ?,
                ai_summary = ?,
                updated_at = ?
            WHERE id = ? AND org_id = ?
            "#,
        )
        .bind(&lead.name)
        .bind(&lead.phone)
        .bind(&lead.telegram_handle)
        .bind(lead.status.as_str())
        .bind(serde_json::to_string(&lead.extracted_data)?)
        .bind(serde_json::to_string(&lead.human_edited_keys)?)
        .bind(lead.ai_qualification_status.as_str())
        .bind(&lead.ai_summary)
        .bind(format_ts(&Utc::now()))
        .bind(lead.id.to_string())
        .bind(&lead.org_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::LeadNotFound(lead.id.to_string()));
        }
        Ok(())
    }

    async fn append_outbound(
        &self,
        lead_id: Uuid,
        message: &OutboundMessage,
        delivery: DeliveryStatus,
    ) -> Result<ChatMessage> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE leads SET last_message_at = ?, updated_at = ? WHERE id = ?")
            .bind(format_ts(&now))
            .bind(format_ts(&now))
            .bind(lead_id.to_string())
            .execute(&mut *tx)
            .await?;
        let stored = insert_outbound(&mut *tx, lead_id, message, delivery, now).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn append_followup(&self, lead_id: Uuid, message: &OutboundMessage) -> Result<ChatMessage> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE leads SET
                followup_count = followup_count + 1,
                last_message_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(format_ts(&now))
        .bind(format_ts(&now))
        .bind(lead_id.to_string())
        .execute(&mut *tx)
        .await?;
        let stored = insert_outbound(&mut *tx, lead_id, message, DeliveryStatus::Pending, now).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn pending_turns(&self, older_than: DateTime<Utc>) -> Result<Vec<PendingTurn>> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT l.id AS lead_id, l.org_id AS org_id, m.id AS message_id, m.seq AS seq
            FROM leads l
            JOIN chat_messages m ON m.lead_id = l.id
            WHERE m.direction = 'inbound'
              AND m.seq > l.processed_seq
              AND m.created_at <= ?
              AND l.ai_qualification_status = 'in_progress'
              AND m.seq = (
                  SELECT MAX(seq) FROM chat_messages
                  WHERE lead_id = l.id AND direction = 'inbound'
              )
            ORDER BY m.created_at
            "#,
        )
        .bind(format_ts(&older_than))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PendingTurn {
                    lead_id: parse_uuid(&row.lead_id)?,
                    org_id: row.org_id,
                    message_id: parse_uuid(&row.message_id)?,
                    seq: row.seq,
                })
            })
            .collect()
    }

    async fn followup_candidates(&self, max_followups: u32) -> Result<Vec<FollowupCandidate>> {
        let rows = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT l.* FROM leads l
            WHERE l.ai_qualification_status = 'in_progress'
              AND l.followup_count < ?
              AND l.last_message_at IS NOT NULL
              AND (
                  SELECT direction FROM chat_messages m
                  WHERE m.lead_id = l.id
                  ORDER BY m.seq DESC LIMIT 1
              ) = 'outbound'
            ORDER BY l.last_message_at
            "#,
        )
        .bind(max_followups as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let lead = row.into_lead()?;
            if !matches!(
                lead.status,
                LeadStatus::New | LeadStatus::Consulting | LeadStatus::FollowUp
            ) {
                continue;
            }
            if let Some(last_message_at) = lead.last_message_at {
                candidates.push(FollowupCandidate {
                    lead,
                    last_message_at,
                });
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldType;
    use crate::models::{FieldValue, QualificationStatus};
    use tempfile::TempDir;

    async fn setup_test_db() -> (CrmDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");

        let db = CrmDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        (db, tmp)
    }

    fn inbound(chat: &str, channel_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            lead: LeadRef::Channel {
                source: "telegram".into(),
                external_id: chat.into(),
            },
            content: text.into(),
            media_url: None,
            sender_name: Some("Иван".into()),
            channel_message_id: channel_id.into(),
            timestamp: None,
            contact: Contact {
                name: Some("Иван".into()),
                phone: None,
                telegram_handle: Some("@ivan".into()),
            },
        }
    }

    #[tokio::test]
    async fn test_store_inbound_creates_lead_and_numbers_messages() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        assert!(db.is_initialized().await.unwrap());

        let first = db.store_inbound(&ctx, &inbound("42", "m1", "Здравствуйте")).await.unwrap();
        let second = db.store_inbound(&ctx, &inbound("42", "m2", "Нужен ремонт")).await.unwrap();
        assert!(first.created && second.created);
        assert_eq!(first.lead_id, second.lead_id);
        assert_eq!((first.seq, second.seq), (1, 2));

        let lead = db.get_lead(&ctx, first.lead_id).await.unwrap();
        assert_eq!(lead.name.as_deref(), Some("Иван"));
        assert_eq!(lead.status, LeadStatus::New);
        assert_eq!(lead.processed_seq, 0);
        assert!(lead.last_message_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let first = db.store_inbound(&ctx, &inbound("42", "m1", "Привет")).await.unwrap();
        let again = db.store_inbound(&ctx, &inbound("42", "m1", "Привет")).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.seq, first.seq);
        assert_eq!(db.recent_messages(&ctx, first.lead_id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_other_org_cannot_read_lead() {
        let (db, _tmp) = setup_test_db().await;
        let stored = db
            .store_inbound(&OrgContext::system("a"), &inbound("1", "m1", "Привет"))
            .await
            .unwrap();
        let err = db.get_lead(&OrgContext::system("b"), stored.lead_id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = db
            .get_message(&OrgContext::system("b"), stored.message_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn test_apply_turn_guarded_by_watermark() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let stored = db.store_inbound(&ctx, &inbound("7", "m1", "50 метров")).await.unwrap();

        let mut lead = db.get_lead(&ctx, stored.lead_id).await.unwrap();
        lead.extracted_data.insert("area_sqm".into(), FieldValue::Number(50.0));
        lead.status = LeadStatus::Consulting;
        let commit = TurnCommit {
            lead: lead.clone(),
            message_id: stored.message_id,
            seq: stored.seq,
            reply: Some(OutboundMessage {
                content: "Спасибо!".into(),
                sender_name: Some("AI".into()),
                ai_metadata: Some(serde_json::json!({"applied_fields": ["area_sqm"]})),
            }),
            trace: AiTrace::default(),
        };

        let CommitResult::Applied { reply: Some(reply) } = db.apply_turn(&commit).await.unwrap() else {
            panic!("expected an applied turn with a reply");
        };
        assert_eq!(reply.seq, 2);
        assert_eq!(reply.delivery_status, Some(DeliveryStatus::Pending));

        let saved = db.get_lead(&ctx, lead.id).await.unwrap();
        assert_eq!(saved.processed_seq, 1);
        assert_eq!(saved.status, LeadStatus::Consulting);
        assert_eq!(saved.extracted_data["area_sqm"], FieldValue::Number(50.0));

        // Replaying the same sequence writes nothing
        assert_eq!(db.apply_turn(&commit).await.unwrap(), CommitResult::Stale);
        assert_eq!(db.recent_messages(&ctx, lead.id, 10).await.unwrap().len(), 2);
        assert_eq!(db.turns(&ctx, lead.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_keeps_contact_stored_after_read() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let stored = db.store_inbound(&ctx, &inbound("8", "m1", "Нужен ремонт")).await.unwrap();
        let lead = db.get_lead(&ctx, stored.lead_id).await.unwrap();
        assert!(lead.phone.is_none());

        // The channel learns the phone while the turn is still being qualified
        let mut next = inbound("8", "m2", "Позвоните мне");
        next.contact.phone = Some("+79995554433".into());
        db.store_inbound(&ctx, &next).await.unwrap();

        let commit = TurnCommit {
            lead: lead.clone(),
            message_id: stored.message_id,
            seq: stored.seq,
            reply: None,
            trace: AiTrace::default(),
        };
        assert!(matches!(db.apply_turn(&commit).await.unwrap(), CommitResult::Applied { .. }));
        let saved = db.get_lead(&ctx, lead.id).await.unwrap();
        assert_eq!(saved.phone.as_deref(), Some("+79995554433"));
        assert_eq!(saved.name.as_deref(), Some("Иван"));

        db.save_lead(&lead).await.unwrap();
        let saved = db.get_lead(&ctx, lead.id).await.unwrap();
        assert_eq!(saved.phone.as_deref(), Some("+79995554433"));
        assert_eq!(saved.telegram_handle.as_deref(), Some("@ivan"));
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_watermark_and_skipped_advances() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let stored = db.store_inbound(&ctx, &inbound("7", "m1", "Привет")).await.unwrap();

        let mut record = TurnRecord {
            org_id: "org".into(),
            lead_id: stored.lead_id,
            message_id: stored.message_id,
            seq: stored.seq,
            kind: TurnKind::Failed,
            error_kind: Some("completion_failed".into()),
            trace: AiTrace {
                failure: Some("timed out".into()),
                ..AiTrace::default()
            },
        };
        assert!(!db.record_turn(&record).await.unwrap());
        assert_eq!(db.get_lead(&ctx, stored.lead_id).await.unwrap().processed_seq, 0);

        let pending = db.pending_turns(Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, stored.message_id);

        record.kind = TurnKind::Skipped;
        record.error_kind = None;
        assert!(db.record_turn(&record).await.unwrap());
        assert_eq!(db.get_lead(&ctx, stored.lead_id).await.unwrap().processed_seq, 1);
        assert!(db.pending_turns(Utc::now()).await.unwrap().is_empty());

        let turns = db.turns(&ctx, stored.lead_id).await.unwrap();
        assert_eq!(turns[0].kind, TurnKind::Failed);
        assert_eq!(turns[0].trace.failure.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_history_window_is_chronological() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let mut last = None;
        for i in 1..=5 {
            last = Some(
                db.store_inbound(&ctx, &inbound("9", &format!("m{}", i), &format!("сообщение {}", i)))
                    .await
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        let window = db.history_before(last.lead_id, last.seq, 3).await.unwrap();
        let seqs: Vec<i64> = window.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(db.history_before(last.lead_id, last.seq, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_field_crud() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::operator("org", "anna");
        let new = NewCustomField {
            name: "rooms".into(),
            label: "Комнат".into(),
            field_type: FieldType::Number,
            options: vec![],
            description: None,
        };
        let created = db.create_custom_field(&ctx, &new).await.unwrap();
        assert_eq!(created.position, 0);
        assert!(db.create_custom_field(&ctx, &new).await.is_err());

        let bad = NewCustomField {
            name: "Rooms".into(),
            ..new.clone()
        };
        assert!(matches!(
            db.create_custom_field(&ctx, &bad).await,
            Err(Error::InvalidFieldName(_))
        ));

        db.set_field_active(&ctx, "rooms", false).await.unwrap();
        assert!(!db.custom_fields("org").await.unwrap()[0].active);
        db.delete_custom_field(&ctx, "rooms").await.unwrap();
        assert!(db.custom_fields("org").await.unwrap().is_empty());
        assert!(matches!(
            db.delete_custom_field(&ctx, "rooms").await,
            Err(Error::FieldNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_single_active_prompt() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::operator("org", "anna");
        assert!(db.active_prompt("org").await.unwrap().is_none());
        db.set_prompt(&ctx, "v1", "Ты консультант.", None).await.unwrap();
        let second = db
            .set_prompt(&ctx, "v2", "Ты вежливый консультант.", Some("openai/gpt-4o"))
            .await
            .unwrap();
        let active = db.active_prompt("org").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.llm_model.as_deref(), Some("openai/gpt-4o"));
    }

    #[tokio::test]
    async fn test_followup_candidates_and_counter_reset() {
        let (db, _tmp) = setup_test_db().await;
        let ctx = OrgContext::system("org");
        let stored = db.store_inbound(&ctx, &inbound("5", "m1", "Сколько стоит?")).await.unwrap();
        assert!(db.followup_candidates(3).await.unwrap().is_empty());

        let reply = OutboundMessage {
            content: "От 5000 за м²".into(),
            sender_name: None,
            ai_metadata: None,
        };
        db.append_outbound(stored.lead_id, &reply, DeliveryStatus::Sent).await.unwrap();
        let candidates = db.followup_candidates(3).await.unwrap();
        assert_eq!(candidates.len(), 1);

        let nudge = db.append_followup(stored.lead_id, &reply).await.unwrap();
        db.mark_delivery(&ctx, nudge.id, DeliveryStatus::Failed).await.unwrap();
        assert_eq!(db.get_lead(&ctx, stored.lead_id).await.unwrap().followup_count, 1);
        assert!(db.followup_candidates(1).await.unwrap().is_empty());

        db.store_inbound(&ctx, &inbound("5", "m2", "Дорого")).await.unwrap();
        assert_eq!(db.get_lead(&ctx, stored.lead_id).await.unwrap().followup_count, 0);

        let mut lead = db.get_lead(&ctx, stored.lead_id).await.unwrap();
        lead.ai_qualification_status = QualificationStatus::HandoffRequired;
        db.save_lead(&lead).await.unwrap();
        assert!(db.followup_candidates(3).await.unwrap().is_empty());
    }
}
