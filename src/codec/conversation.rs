//! Conversation records.

use serde::Serialize;
use serde_json::{Map, Value};

use super::{format_date, MessageRecord};
use crate::sdk::{Conversation, ConversationKind};

/// A conversation snapshot as sent to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationRecord {
    #[serde(rename = "objectId")]
    pub id: String,
    pub conv_type: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "c", skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(rename = "m")]
    pub members: Vec<String>,
    #[serde(rename = "mu", skip_serializing_if = "Vec::is_empty")]
    pub muted_by: Vec<String>,
    #[serde(rename = "attr", skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(rename = "uniqueId", skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(rename = "tr")]
    pub transient: bool,
    #[serde(rename = "sys")]
    pub system: bool,
    #[serde(rename = "temp")]
    pub temporary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(rename = "lastMessageAt", skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
    #[serde(rename = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageRecord>,
    #[serde(rename = "unreadMessagesCount")]
    pub unread_count: u64,
    #[serde(rename = "unreadMessagesMentioned")]
    pub unread_mentioned: bool,
}

impl ConversationRecord {
    pub fn encode(conversation: &Conversation) -> Self {
        let conv_type = conversation.kind.code();
        let mut unique = conversation.unique;
        // Group conversations created with a unique id are unique even when
        // the SDK snapshot omits the flag.
        let has_unique_id = conversation
            .unique_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if unique.is_none() && conversation.kind == ConversationKind::Group && has_unique_id {
            unique = Some(true);
        }

        Self {
            id: conversation.id.clone(),
            conv_type,
            name: conversation.name.clone(),
            creator: conversation.creator.clone(),
            members: conversation.members.clone(),
            muted_by: conversation.muted_by.clone(),
            attributes: conversation.attributes.clone(),
            unique_id: conversation.unique_id.clone(),
            unique,
            transient: conversation.kind == ConversationKind::Transient,
            system: conversation.system,
            temporary: conversation.is_temporary(),
            ttl: conversation.ttl,
            created_at: conversation.created_at.as_ref().map(format_date),
            updated_at: conversation.updated_at.as_ref().map(format_date),
            last_message_at: conversation.last_message_at.as_ref().map(format_date),
            last_message: conversation.last_message.as_ref().map(MessageRecord::encode),
            unread_count: conversation.unread_count,
            unread_mentioned: conversation.unread_mentioned,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
