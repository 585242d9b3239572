//! Domain records shared by the store, the engine and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Pipeline stage of a lead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Consulting,
    FollowUp,
    Qualified,
    Measurement,
    Estimate,
    Contract,
    Won,
    Lost,
    Spam,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 10] = [
        LeadStatus::New,
        LeadStatus::Consulting,
        LeadStatus::FollowUp,
        LeadStatus::Qualified,
        LeadStatus::Measurement,
        LeadStatus::Estimate,
        LeadStatus::Contract,
        LeadStatus::Won,
        LeadStatus::Lost,
        LeadStatus::Spam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "NEW",
            LeadStatus::Consulting => "CONSULTING",
            LeadStatus::FollowUp => "FOLLOW_UP",
            LeadStatus::Qualified => "QUALIFIED",
            LeadStatus::Measurement => "MEASUREMENT",
            LeadStatus::Estimate => "ESTIMATE",
            LeadStatus::Contract => "CONTRACT",
            LeadStatus::Won => "WON",
            LeadStatus::Lost => "LOST",
            LeadStatus::Spam => "SPAM",
        }
    }

    /// Position in the main pipeline. FOLLOW_UP is a side channel at the
    /// CONSULTING stage; the terminal outcomes share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            LeadStatus::New => 0,
            LeadStatus::Consulting | LeadStatus::FollowUp => 1,
            LeadStatus::Qualified => 2,
            LeadStatus::Measurement => 3,
            LeadStatus::Estimate => 4,
            LeadStatus::Contract => 5,
            LeadStatus::Won | LeadStatus::Lost | LeadStatus::Spam => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Won | LeadStatus::Lost | LeadStatus::Spam)
    }

    /// Statuses that still see the early conversation (SPAM / FOLLOW_UP reachable)
    pub fn is_early(&self) -> bool {
        matches!(self, LeadStatus::New | LeadStatus::Consulting)
    }

    /// Whether the model may ever propose this status. Contracts and
    /// outcomes need a human.
    pub fn is_ai_target(&self) -> bool {
        !matches!(self, LeadStatus::Contract | LeadStatus::Won | LeadStatus::Lost)
    }

    /// Next stage of the main pipeline
    pub fn next_stage(&self) -> Option<LeadStatus> {
        match self {
            LeadStatus::New => Some(LeadStatus::Consulting),
            LeadStatus::Consulting | LeadStatus::FollowUp => Some(LeadStatus::Qualified),
            LeadStatus::Qualified => Some(LeadStatus::Measurement),
            LeadStatus::Measurement => Some(LeadStatus::Estimate),
            LeadStatus::Estimate => Some(LeadStatus::Contract),
            LeadStatus::Contract => Some(LeadStatus::Won),
            LeadStatus::Won | LeadStatus::Lost | LeadStatus::Spam => None,
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown lead status '{}'", s)))
    }
}

/// Who is currently responsible for the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationStatus {
    InProgress,
    HandoffRequired,
}

impl QualificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualificationStatus::InProgress => "in_progress",
            QualificationStatus::HandoffRequired => "handoff_required",
        }
    }
}

impl FromStr for QualificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Ok(QualificationStatus::InProgress),
            "handoff_required" | "handoff" => Ok(QualificationStatus::HandoffRequired),
            other => Err(Error::InvalidInput(format!(
                "unknown qualification status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(Error::InvalidInput(format!("unknown direction '{}'", other))),
        }
    }
}

/// Delivery state of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown delivery status '{}'",
                other
            ))),
        }
    }
}

/// A single extracted value. Closed set of variants, validated against the
/// field schema before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Number(n) => !n.is_finite(),
            FieldValue::Bool(_) => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

/// Field name to value, ordered for stable serialization
pub type ExtractedData = BTreeMap<String, FieldValue>;

/// A prospective client tracked through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub org_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub telegram_handle: Option<String>,
    /// Originating channel, e.g. "telegram" or "avito"
    pub source: Option<String>,
    /// Chat id on the originating channel
    pub external_id: Option<String>,
    pub status: LeadStatus,
    pub extracted_data: ExtractedData,
    pub human_edited_keys: BTreeSet<String>,
    pub ai_qualification_status: QualificationStatus,
    pub ai_summary: Option<String>,
    /// Highest inbound sequence already qualified
    pub processed_seq: i64,
    pub followup_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable chat message. `seq` increases monotonically per lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub seq: i64,
    pub direction: Direction,
    pub content: String,
    pub media_url: Option<String>,
    pub sender_name: Option<String>,
    pub channel_message_id: Option<String>,
    pub ai_metadata: Option<serde_json::Value>,
    pub delivery_status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
}

/// How an inbound message names its lead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadRef {
    Id(Uuid),
    Channel { source: String, external_id: String },
}

/// Contact details an adapter knows about the sender
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub telegram_handle: Option<String>,
}

/// Inbound message as delivered by a channel adapter
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub lead: LeadRef,
    pub content: String,
    pub media_url: Option<String>,
    pub sender_name: Option<String>,
    pub channel_message_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub contact: Contact,
}

/// Outbound message to append to a conversation
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub content: String,
    pub sender_name: Option<String>,
    pub ai_metadata: Option<serde_json::Value>,
}

/// Result of storing an inbound message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredInbound {
    pub lead_id: Uuid,
    pub message_id: Uuid,
    pub seq: i64,
    /// False when the same channel message id was already stored
    pub created: bool,
}

/// A knowledge chunk with its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub org_id: String,
    /// Set for lead-scoped conversational memory
    pub lead_id: Option<Uuid>,
    pub category: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A chunk returned by similarity search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
}

/// Context chunk as recorded in a trace (no embedding)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceChunk {
    pub title: String,
    pub category: String,
    pub content: String,
    pub score: f32,
}

impl From<&ScoredChunk> for TraceChunk {
    fn from(scored: &ScoredChunk) -> Self {
        Self {
            title: scored.chunk.title.clone(),
            category: scored.chunk.category.clone(),
            content: scored.chunk.content.clone(),
            score: scored.score,
        }
    }
}

/// A field the engine refused to merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedField {
    pub field: String,
    pub reason: String,
}

/// Observational record of one automated turn, stored in `ai_metadata`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiTrace {
    pub retrieved_context: Vec<TraceChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_degraded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_to: Option<LeadStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualification_changed_to: Option<QualificationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_status_suggestion: Option<String>,
    pub applied_fields: Vec<String>,
    pub dropped_fields: Vec<DroppedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// How a qualification turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Reply and merge committed
    Applied,
    /// Sequence already at or below the watermark
    Duplicate,
    /// A newer message was merged while this turn was in flight
    Superseded,
    /// Lead is handed off or closed; watermark advanced without a model call
    Skipped,
    /// Completion failed; message kept, watermark untouched
    Failed,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::Applied => "applied",
            TurnKind::Duplicate => "duplicate",
            TurnKind::Superseded => "superseded",
            TurnKind::Skipped => "skipped",
            TurnKind::Failed => "failed",
        }
    }
}

impl FromStr for TurnKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "applied" => Ok(TurnKind::Applied),
            "duplicate" => Ok(TurnKind::Duplicate),
            "superseded" => Ok(TurnKind::Superseded),
            "skipped" => Ok(TurnKind::Skipped),
            "failed" => Ok(TurnKind::Failed),
            other => Err(Error::InvalidInput(format!("unknown turn kind '{}'", other))),
        }
    }
}

/// Who performs an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Ai,
    Operator(String),
    System,
}

/// Explicit per-request auth context. Every entry point checks the org of
/// the records it touches against this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    pub org_id: String,
    pub actor: Actor,
}

impl OrgContext {
    pub fn system(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            actor: Actor::System,
        }
    }

    pub fn operator(org_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            actor: Actor::Operator(name.into()),
        }
    }

    pub fn ensure_owns(&self, lead: &Lead) -> Result<()> {
        if lead.org_id == self.org_id {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "lead {} does not belong to org {}",
                lead.id, self.org_id
            )))
        }
    }

    pub fn operator_name(&self) -> Option<&str> {
        match &self.actor {
            Actor::Operator(name) => Some(name),
            _ => None,
        }
    }
}

/// Stored timestamp format. Fixed-width micros so text order is time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("bad timestamp '{}': {}", raw, e)))
}
