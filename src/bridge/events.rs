//! Event multiplexer: SDK events become host notifications.
//!
//! Every open session gets one pump task reading its SDK event stream, so
//! events of a session reach the host in SDK order while sessions progress
//! independently.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{events, EventRecord};
use super::session::{Session, SessionState};
use super::Shared;
use crate::codec::{format_date, now_string, ConversationRecord, MessageRecord};
use crate::sdk::{Conversation, ConversationEvent, SdkEvent};

/// Start pumping `receiver` into host notifications for `session`
pub(crate) fn spawn_pump(
    shared: Arc<Shared>,
    session: Arc<Session>,
    mut receiver: broadcast::Receiver<SdkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => route(&shared, &session, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Session {} lagged behind, {} events dropped", session.client_id(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Event pump for {} stopped", session.client_id());
    })
}

fn route(shared: &Shared, session: &Session, event: SdkEvent) {
    let client_id = session.client_id();
    let record = match event {
        SdkEvent::Paused => {
            session.set_state(SessionState::Paused);
            EventRecord::new(events::SESSION_DISCONNECT, client_id)
        }
        SdkEvent::Resumed => {
            session.set_state(SessionState::Open);
            EventRecord::new(events::SESSION_RESUME, client_id)
        }
        SdkEvent::Offline { code, reason } => {
            warn!("Session {} dropped by server: {}", client_id, code);
            session.set_state(SessionState::Failed { code });
            let mut error = Map::new();
            error.insert("code".to_string(), Value::from(code));
            if let Some(reason) = reason {
                error.insert("message".to_string(), Value::from(reason));
            }
            EventRecord::new(events::SESSION_CLOSE, client_id).arg("error", error)
        }
        SdkEvent::Conversation {
            conversation,
            event,
        } => match translate(client_id, &conversation, event) {
            Some(record) => record,
            None => return,
        },
    };
    shared.notify(record);
}

/// Map one conversation event to its notification, if it has one
pub fn translate(
    client_id: &str,
    conversation: &Conversation,
    event: ConversationEvent,
) -> Option<EventRecord> {
    let base = |method: &str| {
        EventRecord::new(method, client_id).arg("conversationId", conversation.id.clone())
    };
    let udate = conversation
        .updated_at
        .as_ref()
        .map(format_date)
        .unwrap_or_else(now_string);

    let record = match event {
        ConversationEvent::Membership {
            change,
            members,
            operator,
        } => {
            // Personal changes always concern this client
            let delta = if change.is_bulk() {
                members
            } else {
                vec![client_id.to_string()]
            };
            base(events::CONVERSATION_MEMBERS_UPDATE)
                .arg("op", change.op())
                .arg("m", delta)
                .arg("members", conversation.members.clone())
                .opt_arg("initBy", operator)
                .arg("udate", udate)
        }
        ConversationEvent::InfoChanged {
            attributes,
            operator,
        } => base(events::CONVERSATION_DATA_UPDATE)
            .opt_arg("initBy", operator)
            .arg("attr", attributes)
            .arg("rawData", ConversationRecord::encode(conversation).to_value())
            .arg("udate", udate),
        ConversationEvent::UnreadCountUpdated => base(events::UNREAD_MESSAGE_COUNT_UPDATE)
            .arg("count", conversation.unread_count)
            .arg("mention", conversation.unread_mentioned)
            .opt_arg(
                "message",
                conversation
                    .last_message
                    .as_ref()
                    .map(|m| MessageRecord::encode(m).to_value()),
            ),
        ConversationEvent::LastMessageUpdated => {
            let message = conversation.last_message.as_ref()?;
            base(events::LAST_MESSAGE_UPDATE).arg("message", MessageRecord::encode(message).to_value())
        }
        ConversationEvent::LastDeliveredAtUpdated => base(events::LAST_RECEIPT_TIMESTAMP_UPDATE)
            .arg("maxAckTimestamp", conversation.last_delivered_at?),
        ConversationEvent::LastReadAtUpdated => base(events::LAST_RECEIPT_TIMESTAMP_UPDATE)
            .arg("maxReadTimestamp", conversation.last_read_at?),
        ConversationEvent::MessageReceived(message) => {
            base(events::MESSAGE_RECEIVE).arg("message", MessageRecord::encode(&message).to_value())
        }
        ConversationEvent::MessageUpdated {
            message,
            recalled,
            patch_code,
            patch_reason,
        } => base(events::MESSAGE_PATCH)
            .arg("message", MessageRecord::encode(&message).to_value())
            .opt_arg("recall", recalled.then_some(true))
            .opt_arg("patchCode", patch_code)
            .opt_arg("patchReason", patch_reason),
        ConversationEvent::MessageReceipt {
            message_id,
            timestamp,
            read,
        } => base(events::MESSAGE_RECEIPT)
            .arg("id", message_id)
            .opt_arg("t", timestamp)
            .arg("read", read),
    };
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{ConversationKind, Message, MessageContent, MembershipChange};
    use serde_json::json;

    fn conversation() -> Conversation {
        let mut conversation = Conversation::new("c1", ConversationKind::Group);
        conversation.members = vec!["u1".into(), "u2".into(), "u3".into()];
        conversation
    }

    #[test]
    fn test_bulk_membership_carries_delta_and_roster() {
        let record = translate(
            "u1",
            &conversation(),
            ConversationEvent::Membership {
                change: MembershipChange::MembersJoined,
                members: vec!["u3".into()],
                operator: Some("u2".into()),
            },
        )
        .unwrap();
        assert_eq!(record.method, events::CONVERSATION_MEMBERS_UPDATE);
        assert_eq!(record.args["op"], json!("members-joined"));
        assert_eq!(record.args["m"], json!(["u3"]));
        assert_eq!(record.args["members"], json!(["u1", "u2", "u3"]));
        assert_eq!(record.args["initBy"], json!("u2"));
        assert!(record.args["udate"].is_string());
    }

    #[test]
    fn test_personal_membership_targets_self() {
        let record = translate(
            "u1",
            &conversation(),
            ConversationEvent::Membership {
                change: MembershipChange::Joined,
                members: vec!["whoever".into()],
                operator: None,
            },
        )
        .unwrap();
        assert_eq!(record.args["op"], json!("joined"));
        assert_eq!(record.args["m"], json!(["u1"]));
        assert!(record.args.get("initBy").is_none());
    }

    #[test]
    fn test_recall_flag_only_on_recalls() {
        let message = Message {
            id: Some("m1".into()),
            content: MessageContent::Text("x".into()),
            ..Message::default()
        };
        let patched = translate(
            "u1",
            &conversation(),
            ConversationEvent::MessageUpdated {
                message: message.clone(),
                recalled: false,
                patch_code: None,
                patch_reason: None,
            },
        )
        .unwrap();
        assert!(patched.args.get("recall").is_none());

        let recalled = translate(
            "u1",
            &conversation(),
            ConversationEvent::MessageUpdated {
                message,
                recalled: true,
                patch_code: Some(1),
                patch_reason: Some("spam".into()),
            },
        )
        .unwrap();
        assert_eq!(recalled.args["recall"], json!(true));
        assert_eq!(recalled.args["patchReason"], json!("spam"));
    }

    #[test]
    fn test_watermarks_need_a_value() {
        let mut conversation = conversation();
        assert!(translate("u1", &conversation, ConversationEvent::LastReadAtUpdated).is_none());
        assert!(translate("u1", &conversation, ConversationEvent::LastMessageUpdated).is_none());

        conversation.last_read_at = Some(1705689600000);
        let record = translate("u1", &conversation, ConversationEvent::LastReadAtUpdated).unwrap();
        assert_eq!(record.method, events::LAST_RECEIPT_TIMESTAMP_UPDATE);
        assert_eq!(record.args["maxReadTimestamp"], json!(1705689600000i64));
    }

    #[test]
    fn test_unread_count() {
        let mut conversation = conversation();
        conversation.unread_count = 3;
        conversation.unread_mentioned = true;
        let record = translate("u1", &conversation, ConversationEvent::UnreadCountUpdated).unwrap();
        assert_eq!(
            Value::Object(record.args),
            json!({"clientId": "u1", "conversationId": "c1", "count": 3, "mention": true})
        );
    }
}
