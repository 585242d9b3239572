//! Lead change notifications
//!
//! The engine reports every committed change, every failed turn and every
//! configuration alert to a [`Notifier`]. Consumers that want push updates
//! subscribe to a [`ChannelNotifier`].

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::models::{LeadStatus, QualificationStatus};

/// A committed change to a lead
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadUpdate {
    pub org_id: String,
    pub lead_id: Uuid,
    pub status: LeadStatus,
    pub qualification: QualificationStatus,
    pub applied_fields: Vec<String>,
    pub reply_message_id: Option<Uuid>,
    /// "ai", "system" or the operator's name
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    LeadUpdated(LeadUpdate),
    TurnFailed {
        org_id: String,
        lead_id: Uuid,
        message_id: Uuid,
        reason: String,
    },
    ConfigAlert {
        org_id: String,
        message: String,
    },
}

pub trait Notifier: Send + Sync {
    fn lead_updated(&self, update: &LeadUpdate);

    fn turn_failed(&self, org_id: &str, lead_id: Uuid, message_id: Uuid, error: &Error);

    fn config_alert(&self, org_id: &str, error: &Error);
}

/// Reports through tracing only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn lead_updated(&self, update: &LeadUpdate) {
        info!(
            "Lead {} updated by {}: status {}, {}, fields {:?}",
            update.lead_id,
            update.actor,
            update.status,
            update.qualification.as_str(),
            update.applied_fields
        );
    }

    fn turn_failed(&self, _org_id: &str, lead_id: Uuid, message_id: Uuid, error: &Error) {
        warn!(
            "Qualification of message {} for lead {} failed: {}",
            message_id, lead_id, error
        );
    }

    fn config_alert(&self, org_id: &str, error: &Error) {
        error!("Configuration alert for org {}: {}", org_id, error);
    }
}

/// Fans notifications out over a broadcast channel. Slow subscribers lose
/// the oldest notifications.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    fn publish(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            debug!("No notification subscribers");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn lead_updated(&self, update: &LeadUpdate) {
        self.publish(Notification::LeadUpdated(update.clone()));
    }

    fn turn_failed(&self, org_id: &str, lead_id: Uuid, message_id: Uuid, error: &Error) {
        self.publish(Notification::TurnFailed {
            org_id: org_id.to_string(),
            lead_id,
            message_id,
            reason: error.to_string(),
        });
    }

    fn config_alert(&self, org_id: &str, error: &Error) {
        self.publish(Notification::ConfigAlert {
            org_id: org_id.to_string(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_fans_out() {
        let notifier = ChannelNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.config_alert(
            "org",
            &Error::DimensionMismatch {
                expected: 1536,
                actual: 768,
            },
        );

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                Notification::ConfigAlert { org_id, message } => {
                    assert_eq!(org_id, "org");
                    assert!(message.contains("1536"));
                }
                other => panic!("unexpected notification {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let notifier = ChannelNotifier::new(1);
        notifier.turn_failed(
            "org",
            Uuid::new_v4(),
            Uuid::new_v4(),
            &Error::CompletionFailed("timeout".into()),
        );
    }

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::to_value(Notification::ConfigAlert {
            org_id: "org".into(),
            message: "m".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "config_alert");
    }
}
