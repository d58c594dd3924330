//! Boundary to the messaging SDK.
//!
//! The bridge treats the SDK as a black box: a factory for per-client handles
//! ([`ImSdk`]) and the operations a client can run ([`ImClient`]). Every call
//! is asynchronous and completes exactly once. Events are delivered through a
//! broadcast channel per client.

pub mod error;
pub mod memory;
pub mod message;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

pub use error::SdkError;
pub use memory::MemorySdk;
pub use message::{
    Attachment, CustomMessage, FileRef, FileSource, GeoPoint, LocationMessage, MediaMessage,
    Message, MessageContent, RecalledMessage, TextMessage, TypedFields, TypedMessage,
};

/// Prefix reserved for temporary conversation ids
pub const TEMPORARY_CONVERSATION_PREFIX: &str = "_tmp:";

/// Signature computed by the host for a privileged operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

/// Options for opening a client session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Resume an existing session instead of starting a fresh login
    pub reconnect: bool,
}

/// Conversation flavors, with their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    /// One-on-one conversation that is reused for the same member set
    Unique,
    Group,
    /// Chat room
    Transient,
    Temporary,
}

impl ConversationKind {
    pub fn code(self) -> i64 {
        match self {
            ConversationKind::Unique => 0,
            ConversationKind::Group => 1,
            ConversationKind::Transient => 2,
            ConversationKind::Temporary => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ConversationKind::Unique),
            1 => Some(ConversationKind::Group),
            2 => Some(ConversationKind::Transient),
            4 => Some(ConversationKind::Temporary),
            _ => None,
        }
    }
}

/// Parameters for creating a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub members: Vec<String>,
    pub name: Option<String>,
    pub attributes: Option<Map<String, Value>>,
    /// Lifetime in seconds, temporary conversations only
    pub ttl: Option<i64>,
}

/// Snapshot of a conversation held by the SDK
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub creator: Option<String>,
    pub members: Vec<String>,
    pub muted_by: Vec<String>,
    pub attributes: Map<String, Value>,
    pub unique_id: Option<String>,
    pub unique: Option<bool>,
    pub system: bool,
    /// Absolute expiry as reported by the SDK
    pub ttl: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message: Option<Message>,
    pub unread_count: u64,
    pub unread_mentioned: bool,
    pub last_delivered_at: Option<i64>,
    pub last_read_at: Option<i64>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, kind: ConversationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            creator: None,
            members: Vec::new(),
            muted_by: Vec::new(),
            attributes: Map::new(),
            unique_id: None,
            unique: None,
            system: false,
            ttl: None,
            created_at: None,
            updated_at: None,
            last_message_at: None,
            last_message: None,
            unread_count: 0,
            unread_mentioned: false,
            last_delivered_at: None,
            last_read_at: None,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == ConversationKind::Temporary
    }
}

/// Predicate query over conversations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationQuery {
    /// JSON-encoded predicate
    pub predicate: Option<String>,
    pub sort: Option<String>,
    pub skip: u32,
    pub limit: u32,
    pub flag: i64,
}

/// One end of a message interval
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalBound {
    pub message_id: Option<String>,
    pub timestamp: i64,
    /// Whether the bound itself is included
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryDirection {
    #[default]
    NewToOld,
    OldToNew,
}

/// Message history query
#[derive(Debug, Clone, PartialEq)]
pub enum MessageQuery {
    Interval {
        start: Option<IntervalBound>,
        end: Option<IntervalBound>,
        direction: QueryDirection,
        limit: u32,
    },
    /// Messages of one type tag, walking back from `start`
    ByType {
        type_tag: i64,
        start: Option<IntervalBound>,
        limit: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MessagePriority::High),
            2 => Some(MessagePriority::Normal),
            3 => Some(MessagePriority::Low),
            _ => None,
        }
    }
}

/// Delivery options for an outgoing message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub receipt: bool,
    pub will: bool,
    pub transient: bool,
    pub priority: Option<MessagePriority>,
    pub push_data: Option<Map<String, Value>>,
}

/// Batch membership operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    Add,
    Remove,
    Block,
    Unblock,
    Mute,
    Unmute,
}

/// Sub-batch of a member operation that failed
#[derive(Debug, Clone, PartialEq)]
pub struct MemberFailure {
    pub ids: Vec<String>,
    pub error: SdkError,
}

/// Raw outcome of a member operation, before the bridge classifies it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberOutcome {
    pub succeeded: Vec<String>,
    pub failures: Vec<MemberFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberListKind {
    Blocked,
    Muted,
}

/// One page of a member list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberPage {
    pub members: Vec<String>,
    /// Cursor for the next page, `None` at the end
    pub next: Option<String>,
}

/// Change to a single conversation attribute
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeChange {
    Set(String, Value),
    Remove(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiptTimestamps {
    pub max_read: Option<i64>,
    pub max_delivered: Option<i64>,
}

/// Membership notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Joined,
    Left,
    MembersJoined,
    MembersLeft,
    Muted,
    Unmuted,
    MembersMuted,
    MembersUnmuted,
    Blocked,
    Unblocked,
    MembersBlocked,
    MembersUnblocked,
}

impl MembershipChange {
    /// Operation name on the wire
    pub fn op(self) -> &'static str {
        match self {
            MembershipChange::Joined => "joined",
            MembershipChange::Left => "left",
            MembershipChange::MembersJoined => "members-joined",
            MembershipChange::MembersLeft => "members-left",
            MembershipChange::Muted => "muted",
            MembershipChange::Unmuted => "unmuted",
            MembershipChange::MembersMuted => "members-muted",
            MembershipChange::MembersUnmuted => "members-unmuted",
            MembershipChange::Blocked => "blocked",
            MembershipChange::Unblocked => "unblocked",
            MembershipChange::MembersBlocked => "members-blocked",
            MembershipChange::MembersUnblocked => "members-unblocked",
        }
    }

    /// Changes that concern other members rather than the current client
    pub fn is_bulk(self) -> bool {
        matches!(
            self,
            MembershipChange::MembersJoined
                | MembershipChange::MembersLeft
                | MembershipChange::MembersMuted
                | MembershipChange::MembersUnmuted
                | MembershipChange::MembersBlocked
                | MembershipChange::MembersUnblocked
        )
    }
}

/// Conversation-level notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    Membership {
        change: MembershipChange,
        /// Members the change applies to
        members: Vec<String>,
        operator: Option<String>,
    },
    InfoChanged {
        attributes: Map<String, Value>,
        operator: Option<String>,
    },
    UnreadCountUpdated,
    LastMessageUpdated,
    LastDeliveredAtUpdated,
    LastReadAtUpdated,
    MessageReceived(Message),
    MessageUpdated {
        message: Message,
        recalled: bool,
        patch_code: Option<i64>,
        patch_reason: Option<String>,
    },
    MessageReceipt {
        message_id: String,
        timestamp: Option<i64>,
        read: bool,
    },
}

/// Events the SDK emits for one client
#[derive(Debug, Clone, PartialEq)]
pub enum SdkEvent {
    /// Connection lost, the SDK is trying to recover
    Paused,
    Resumed,
    /// Session terminated by the server (kicked, logged in elsewhere, ...)
    Offline { code: i64, reason: Option<String> },
    Conversation {
        /// Snapshot taken after the change was applied
        conversation: Conversation,
        event: ConversationEvent,
    },
}

/// Entry point of the SDK: hands out per-client handles
pub trait ImSdk: Send + Sync {
    /// Build a client handle; the session is not opened yet
    fn client(&self, client_id: &str, tag: Option<&str>) -> Result<Arc<dyn ImClient>, SdkError>;
}

/// Operations available on one client session
#[async_trait]
pub trait ImClient: Send + Sync {
    fn client_id(&self) -> &str;

    fn tag(&self) -> Option<&str>;

    /// Receive the events for this client
    fn subscribe(&self) -> broadcast::Receiver<SdkEvent>;

    async fn open(&self, options: OpenOptions, signature: Option<Signature>)
        -> Result<(), SdkError>;

    async fn close(&self) -> Result<(), SdkError>;

    async fn create_conversation(
        &self,
        request: NewConversation,
        signature: Option<Signature>,
    ) -> Result<Conversation, SdkError>;

    /// Look up a conversation in the local cache
    fn cached_conversation(&self, conversation_id: &str) -> Option<Conversation>;

    /// Fetch a conversation from the server
    async fn fetch_conversation(&self, conversation_id: &str)
        -> Result<Option<Conversation>, SdkError>;

    async fn query_conversations(
        &self,
        query: ConversationQuery,
    ) -> Result<Vec<Conversation>, SdkError>;

    async fn query_temporary_conversations(
        &self,
        ids: Vec<String>,
    ) -> Result<Vec<Conversation>, SdkError>;

    /// Send a message; the returned copy carries the server-assigned fields
    async fn send_message(
        &self,
        conversation_id: &str,
        message: Message,
        options: SendOptions,
    ) -> Result<Message, SdkError>;

    async fn read(&self, conversation_id: &str) -> Result<(), SdkError>;

    async fn update_message(
        &self,
        conversation_id: &str,
        old: Message,
        new: Message,
    ) -> Result<Message, SdkError>;

    async fn recall_message(&self, conversation_id: &str, old: Message)
        -> Result<Message, SdkError>;

    async fn fetch_receipt_timestamps(
        &self,
        conversation_id: &str,
    ) -> Result<ReceiptTimestamps, SdkError>;

    async fn query_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>, SdkError>;

    async fn update_members(
        &self,
        conversation_id: &str,
        action: MemberAction,
        members: Vec<String>,
        signature: Option<Signature>,
    ) -> Result<MemberOutcome, SdkError>;

    async fn query_member_list(
        &self,
        conversation_id: &str,
        kind: MemberListKind,
        limit: u32,
        next: Option<String>,
    ) -> Result<MemberPage, SdkError>;

    /// Mute or unmute notifications for the whole conversation
    async fn set_muted(&self, conversation_id: &str, muted: bool)
        -> Result<Conversation, SdkError>;

    async fn update_attributes(
        &self,
        conversation_id: &str,
        changes: Vec<AttributeChange>,
    ) -> Result<Conversation, SdkError>;

    async fn count_members(&self, conversation_id: &str) -> Result<u64, SdkError>;
}
