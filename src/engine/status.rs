//! Guards on AI-driven state changes
//!
//! The model only ever suggests. A suggestion is applied when it moves the
//! lead forward by at most one stage, never into a stage that needs a human,
//! and never out of a closed lead.

use crate::complete::StructuredReply;
use crate::config::EngineConfig;
use crate::models::LeadStatus;

/// Outcome of weighing a status suggestion
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusDecision {
    /// New status to store, if any
    pub apply: Option<LeadStatus>,
    /// Why the suggestion was ignored or narrowed
    pub note: Option<String>,
}

impl StatusDecision {
    fn keep() -> Self {
        Self::default()
    }

    fn ignore(note: impl Into<String>) -> Self {
        Self {
            apply: None,
            note: Some(note.into()),
        }
    }

    fn advance(status: LeadStatus) -> Self {
        Self {
            apply: Some(status),
            note: None,
        }
    }
}

pub fn decide_status(current: LeadStatus, suggestion: Option<&str>) -> StatusDecision {
    let Some(raw) = suggestion.map(str::trim).filter(|s| !s.is_empty()) else {
        return StatusDecision::keep();
    };
    let target: LeadStatus = match raw.parse() {
        Ok(status) => status,
        Err(_) => return StatusDecision::ignore(format!("unknown status '{}'", raw)),
    };

    if target == current {
        return StatusDecision::keep();
    }
    if current.is_terminal() {
        return StatusDecision::ignore(format!("{}: lead is closed as {}", target, current));
    }
    if !target.is_ai_target() {
        return StatusDecision::ignore(format!("{}: requires an operator", target));
    }

    if matches!(target, LeadStatus::Spam | LeadStatus::FollowUp) {
        return if current.is_early() {
            StatusDecision::advance(target)
        } else {
            StatusDecision::ignore(format!(
                "{}: only reachable from NEW or CONSULTING, lead is {}",
                target, current
            ))
        };
    }

    if target.rank() < current.rank() {
        return StatusDecision::ignore(format!("{}: would move back from {}", target, current));
    }
    if target.rank() == current.rank() {
        // FOLLOW_UP back to CONSULTING: the client re-engaged
        return StatusDecision::advance(target);
    }

    match current.next_stage() {
        Some(next) if next == target => StatusDecision::advance(target),
        Some(next) if next.is_ai_target() => StatusDecision {
            apply: Some(next),
            note: Some(format!("{}: narrowed to {}, one stage per turn", target, next)),
        },
        _ => StatusDecision::ignore(format!("{}: no further stage for the agent", target)),
    }
}

/// Whether this reply hands the conversation to a human
pub fn needs_handoff(reply: &StructuredReply, phone_known: bool, config: &EngineConfig) -> bool {
    let flagged = reply
        .qualification_flag
        .as_deref()
        .map(|f| f.trim().eq_ignore_ascii_case("handoff_required"))
        .unwrap_or(false);
    let confidence = reply.confidence.unwrap_or(0);

    flagged
        || (reply.is_hot_lead && confidence >= config.hot_lead_confidence)
        || (phone_known && confidence >= config.phone_handoff_confidence)
}
