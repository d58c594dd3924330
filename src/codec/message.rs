//! Flat message records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::typed;
use crate::sdk::{Message, MessageContent};

/// A message as exchanged with the host.
///
/// At most one of `text`, `binary` and `typed` is produced by [`encode`];
/// when the host sends several, [`decode`] picks typed, then binary, then text.
///
/// [`encode`]: MessageRecord::encode
/// [`decode`]: MessageRecord::decode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentioned_members: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mention_all: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 on the JSON wire
    #[serde(skip_serializing_if = "Option::is_none", with = "super::base64_bytes")]
    pub binary: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typed: Option<Map<String, Value>>,
}

impl MessageRecord {
    /// Flatten an SDK message
    pub fn encode(message: &Message) -> Self {
        let mut record = Self {
            id: message.id.clone(),
            client_id: message.client_id.clone(),
            conversation_id: message.conversation_id.clone(),
            from: message.from.clone(),
            timestamp: message.timestamp,
            patch_timestamp: message.patch_timestamp,
            delivered_timestamp: message.delivered_timestamp,
            read_timestamp: message.read_timestamp,
            mentioned_members: message.mentioned_members.clone(),
            mention_all: message.mention_all,
            transient: message.transient,
            ..Self::default()
        };
        match &message.content {
            MessageContent::Typed(t) => record.typed = Some(typed::encode(t)),
            MessageContent::Binary(bytes) => record.binary = Some(bytes.clone()),
            MessageContent::Text(text) => record.text = Some(text.clone()),
            MessageContent::Empty => {}
        }
        record
    }

    /// Build the SDK message described by this record
    pub fn decode(self) -> Message {
        let content = if let Some(t) = self.typed {
            MessageContent::Typed(typed::decode(t))
        } else if let Some(bytes) = self.binary {
            MessageContent::Binary(bytes)
        } else if let Some(text) = self.text {
            MessageContent::Text(text)
        } else {
            MessageContent::Empty
        };
        Message {
            id: self.id,
            client_id: self.client_id,
            conversation_id: self.conversation_id,
            from: self.from,
            timestamp: self.timestamp,
            patch_timestamp: self.patch_timestamp,
            delivered_timestamp: self.delivered_timestamp,
            read_timestamp: self.read_timestamp,
            mentioned_members: self.mentioned_members,
            mention_all: self.mention_all,
            transient: self.transient,
            content,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
