//! In-process messaging backend.
//!
//! A [`MemorySdk`] is a small self-contained world: every client handle it
//! hands out talks to the same conversations, so messages sent by one client
//! reach the others through their event streams. The binary runs on it when
//! no real backend is linked, and the bridge tests drive it directly.
//!
//! Test hooks let callers script connectivity changes ([`MemorySdk::pause`],
//! [`MemorySdk::kick`]), fail or hold the next call to an operation
//! ([`MemorySdk::fail_next`], [`MemorySdk::hold`]) and reject members in
//! batch operations ([`MemorySdk::reject_member`]).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{
    AttributeChange, Conversation, ConversationEvent, ConversationKind, ConversationQuery, FileRef,
    FileSource, ImClient, ImSdk, MemberAction, MemberFailure, MemberListKind, MemberOutcome,
    MemberPage, MembershipChange, Message, MessageContent, MessageQuery, OpenOptions,
    QueryDirection, ReceiptTimestamps, RecalledMessage, SdkError, SdkEvent, SendOptions,
    Signature, TypedMessage, IntervalBound, NewConversation, TEMPORARY_CONVERSATION_PREFIX,
};

/// Operation attempted on a client that is not connected
pub const CLIENT_OFFLINE: i64 = 4104;
/// The conversation query predicate is not valid JSON
pub const INVALID_QUERY: i64 = 4302;
pub const CONVERSATION_NOT_FOUND: i64 = 4401;
/// The client is not a member of the conversation
pub const NOT_A_MEMBER: i64 = 4403;
pub const MESSAGE_NOT_FOUND: i64 = 4410;
/// Only the sender may change a message
pub const NOT_THE_SENDER: i64 = 4411;
/// A member was refused by a batch operation
pub const MEMBER_REJECTED: i64 = 4150;

const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_CONVERSATION_LIMIT: usize = 10;
const DEFAULT_MESSAGE_LIMIT: usize = 20;
const DEFAULT_MEMBER_LIMIT: usize = 50;

/// Conversation query flag: leave member lists out
const FLAG_COMPACT: i64 = 1;
/// Conversation query flag: include the last message
const FLAG_WITH_LAST_MESSAGE: i64 = 2;

struct Slot {
    events: broadcast::Sender<SdkEvent>,
    opened: bool,
    paused: bool,
    unread: HashMap<String, u64>,
    mentioned: HashSet<String>,
}

struct Stored {
    conversation: Conversation,
    messages: Vec<Message>,
    blocked: Vec<String>,
    muted: Vec<String>,
    /// Last read time per member
    reads: HashMap<String, i64>,
    /// Last time a message from each member reached someone
    delivered: HashMap<String, i64>,
}

impl Stored {
    fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            blocked: Vec::new(),
            muted: Vec::new(),
            reads: HashMap::new(),
            delivered: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct State {
    clients: HashMap<String, Slot>,
    conversations: HashMap<String, Stored>,
    rejected: HashSet<String>,
    failures: HashMap<String, SdkError>,
    holds: HashMap<String, Arc<Notify>>,
    signatures: Vec<(String, Signature)>,
    clock: i64,
}

impl State {
    /// Millisecond clock that never repeats
    fn tick(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn slot(&mut self, client_id: &str, buffer: usize) -> &mut Slot {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| Slot {
                events: broadcast::channel(buffer).0,
                opened: false,
                paused: false,
                unread: HashMap::new(),
                mentioned: HashSet::new(),
            })
    }

    fn stored(&self, conversation_id: &str) -> Result<&Stored, SdkError> {
        self.conversations
            .get(conversation_id)
            .ok_or_else(conversation_not_found)
    }

    fn stored_mut(&mut self, conversation_id: &str) -> Result<&mut Stored, SdkError> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(conversation_not_found)
    }

    /// The conversation as `client_id` sees it
    fn view(&self, conversation_id: &str, client_id: &str) -> Option<Conversation> {
        let stored = self.conversations.get(conversation_id)?;
        let mut conversation = stored.conversation.clone();
        if let Some(slot) = self.clients.get(client_id) {
            conversation.unread_count = slot.unread.get(conversation_id).copied().unwrap_or(0);
            conversation.unread_mentioned = slot.mentioned.contains(conversation_id);
        }
        conversation.last_read_at = stored
            .reads
            .iter()
            .filter(|(member, _)| member.as_str() != client_id)
            .map(|(_, at)| *at)
            .max();
        conversation.last_delivered_at = stored.delivered.get(client_id).copied();
        Some(conversation)
    }

    fn emit(&self, recipient: &str, event: SdkEvent) {
        if let Some(slot) = self.clients.get(recipient) {
            if slot.opened {
                let _ = slot.events.send(event);
            }
        }
    }

    fn notify(&self, recipient: &str, conversation_id: &str, event: ConversationEvent) {
        if let Some(conversation) = self.view(conversation_id, recipient) {
            self.emit(recipient, SdkEvent::Conversation { conversation, event });
        }
    }
}

struct World {
    state: Mutex<State>,
    event_buffer: usize,
}

impl World {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a held operation to be released, then apply scripted failures
    async fn enter(&self, operation: &str) -> Result<(), SdkError> {
        let gate = self.state().holds.remove(operation);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        match self.state().failures.remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// In-process SDK shared by all of its clients
pub struct MemorySdk {
    world: Arc<World>,
}

impl MemorySdk {
    pub fn new() -> Arc<Self> {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Create a world whose per-client event channels hold `event_buffer` events
    pub fn with_event_buffer(event_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            world: Arc::new(World {
                state: Mutex::new(State::default()),
                event_buffer: event_buffer.max(1),
            }),
        })
    }

    /// Simulate a lost connection
    pub fn pause(&self, client_id: &str) {
        let mut state = self.world.state();
        if let Some(slot) = state.clients.get_mut(client_id) {
            slot.paused = true;
        }
        state.emit(client_id, SdkEvent::Paused);
    }

    /// Simulate a recovered connection
    pub fn resume(&self, client_id: &str) {
        let mut state = self.world.state();
        if let Some(slot) = state.clients.get_mut(client_id) {
            slot.paused = false;
        }
        state.emit(client_id, SdkEvent::Resumed);
    }

    /// Terminate a session from the server side
    pub fn kick(&self, client_id: &str, code: i64, reason: Option<&str>) {
        let mut state = self.world.state();
        state.emit(
            client_id,
            SdkEvent::Offline {
                code,
                reason: reason.map(str::to_string),
            },
        );
        if let Some(slot) = state.clients.get_mut(client_id) {
            slot.opened = false;
        }
    }

    /// Push a raw event to a client
    pub fn emit(&self, client_id: &str, event: SdkEvent) {
        self.world.state().emit(client_id, event);
    }

    /// Make the next call to `operation` fail with `error`.
    ///
    /// Operation names are the [`ImClient`] method names, plus `client` for
    /// [`ImSdk::client`].
    pub fn fail_next(&self, operation: &str, error: SdkError) {
        self.world
            .state()
            .failures
            .insert(operation.to_string(), error);
    }

    /// Hold the next call to `operation` until the returned gate is notified
    pub fn hold(&self, operation: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.world
            .state()
            .holds
            .insert(operation.to_string(), gate.clone());
        gate
    }

    /// Refuse `member_id` in every batch member operation from now on
    pub fn reject_member(&self, member_id: &str) {
        self.world.state().rejected.insert(member_id.to_string());
    }

    /// Signatures presented so far, with the action they were attached to
    pub fn signatures(&self) -> Vec<(String, Signature)> {
        self.world.state().signatures.clone()
    }

    pub fn is_open(&self, client_id: &str) -> bool {
        self.world
            .state()
            .clients
            .get(client_id)
            .is_some_and(|slot| slot.opened)
    }

    /// Stored snapshot of a conversation
    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.world
            .state()
            .conversations
            .get(conversation_id)
            .map(|stored| stored.conversation.clone())
    }

    /// Store a conversation directly, bypassing any client
    pub fn seed_conversation(&self, conversation: Conversation) {
        self.world
            .state()
            .conversations
            .insert(conversation.id.clone(), Stored::new(conversation));
    }

    /// Store a message directly, bypassing any client
    pub fn seed_message(&self, conversation_id: &str, mut message: Message) -> Option<Message> {
        let mut state = self.world.state();
        let now = state.tick();
        message.conversation_id = Some(conversation_id.to_string());
        message.id.get_or_insert_with(new_id);
        message.timestamp.get_or_insert(now);
        let stored = state.conversations.get_mut(conversation_id)?;
        stored.messages.push(message.clone());
        stored.conversation.last_message = Some(message.clone());
        Some(message)
    }
}

impl ImSdk for MemorySdk {
    fn client(&self, client_id: &str, tag: Option<&str>) -> Result<Arc<dyn ImClient>, SdkError> {
        let mut state = self.world.state();
        if let Some(error) = state.failures.remove("client") {
            return Err(error);
        }
        state.slot(client_id, self.world.event_buffer);
        Ok(Arc::new(MemoryClient {
            client_id: client_id.to_string(),
            tag: tag.map(str::to_string),
            world: self.world.clone(),
        }))
    }
}

/// Client handle of a [`MemorySdk`]
pub struct MemoryClient {
    client_id: String,
    tag: Option<String>,
    world: Arc<World>,
}

impl MemoryClient {
    fn ensure_connected(&self, state: &State) -> Result<(), SdkError> {
        match state.clients.get(&self.client_id) {
            Some(slot) if slot.opened && !slot.paused => Ok(()),
            _ => Err(SdkError::new(CLIENT_OFFLINE, "client is not connected")),
        }
    }

    fn ensure_member<'a>(&self, stored: &'a Stored) -> Result<&'a Conversation, SdkError> {
        let conversation = &stored.conversation;
        if conversation.kind == ConversationKind::Transient
            || conversation.members.contains(&self.client_id)
        {
            Ok(conversation)
        } else {
            Err(SdkError::new(NOT_A_MEMBER, "not a member of the conversation"))
        }
    }

    /// Everyone but this client
    fn others(&self, conversation: &Conversation) -> Vec<String> {
        conversation
            .members
            .iter()
            .filter(|member| **member != self.client_id)
            .cloned()
            .collect()
    }

    fn find_unique(&self, state: &State, members: &[String]) -> Option<String> {
        let wanted: HashSet<&String> = members.iter().collect();
        state
            .conversations
            .values()
            .find(|stored| {
                let conversation = &stored.conversation;
                conversation.kind == ConversationKind::Unique
                    && conversation.members.iter().collect::<HashSet<_>>() == wanted
            })
            .map(|stored| stored.conversation.id.clone())
    }
}

#[async_trait]
impl ImClient for MemoryClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        let mut state = self.world.state();
        state
            .slot(&self.client_id, self.world.event_buffer)
            .events
            .subscribe()
    }

    async fn open(&self, options: OpenOptions, signature: Option<Signature>) -> Result<(), SdkError> {
        self.world.enter("open").await?;
        let mut state = self.world.state();
        if let Some(signature) = signature {
            state.signatures.push(("open".to_string(), signature));
        }
        let slot = state.slot(&self.client_id, self.world.event_buffer);
        slot.opened = true;
        slot.paused = false;
        debug!(
            "Memory client {} opened (reconnect: {})",
            self.client_id, options.reconnect
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), SdkError> {
        self.world.enter("close").await?;
        let mut state = self.world.state();
        if let Some(slot) = state.clients.get_mut(&self.client_id) {
            slot.opened = false;
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        request: NewConversation,
        signature: Option<Signature>,
    ) -> Result<Conversation, SdkError> {
        self.world.enter("create_conversation").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        if let Some(signature) = signature {
            state.signatures.push(("create".to_string(), signature));
        }

        let mut members = vec![self.client_id.clone()];
        if request.kind != ConversationKind::Transient {
            for member in request.members {
                if !members.contains(&member) {
                    members.push(member);
                }
            }
        }

        if request.kind == ConversationKind::Unique {
            if let Some(id) = self.find_unique(&state, &members) {
                return state.view(&id, &self.client_id).ok_or_else(conversation_not_found);
            }
        }

        let now = state.tick();
        let id = match request.kind {
            ConversationKind::Temporary => format!("{}{}", TEMPORARY_CONVERSATION_PREFIX, new_id()),
            _ => new_id(),
        };
        let mut conversation = Conversation::new(id.clone(), request.kind);
        conversation.name = request.name;
        conversation.creator = Some(self.client_id.clone());
        conversation.members = members;
        conversation.attributes = request.attributes.unwrap_or_default();
        conversation.created_at = Some(date(now));
        conversation.updated_at = Some(date(now));
        match request.kind {
            ConversationKind::Unique => {
                conversation.unique_id = Some(new_id());
                conversation.unique = Some(true);
            }
            ConversationKind::Temporary => conversation.ttl = request.ttl,
            _ => {}
        }

        let invited = self.others(&conversation);
        state.conversations.insert(id.clone(), Stored::new(conversation));

        for member in &invited {
            state.notify(
                member,
                &id,
                ConversationEvent::Membership {
                    change: MembershipChange::Joined,
                    members: vec![member.clone()],
                    operator: Some(self.client_id.clone()),
                },
            );
        }

        state.view(&id, &self.client_id).ok_or_else(conversation_not_found)
    }

    fn cached_conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.world.state();
        let stored = state.conversations.get(conversation_id)?;
        self.ensure_member(stored).ok()?;
        state.view(conversation_id, &self.client_id)
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, SdkError> {
        self.world.enter("fetch_conversation").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        Ok(state.view(conversation_id, &self.client_id))
    }

    async fn query_conversations(&self, query: ConversationQuery) -> Result<Vec<Conversation>, SdkError> {
        self.world.enter("query_conversations").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;

        let predicate = match query.predicate.as_deref().filter(|p| !p.is_empty()) {
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => map,
                _ => return Err(SdkError::new(INVALID_QUERY, "invalid where condition")),
            },
            None => Map::new(),
        };

        let mut found: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|stored| {
                let conversation = &stored.conversation;
                !conversation.is_temporary()
                    && (conversation.kind == ConversationKind::Transient
                        || conversation.members.contains(&self.client_id))
                    && matches_predicate(conversation, &predicate)
            })
            .filter_map(|stored| state.view(&stored.conversation.id, &self.client_id))
            .collect();

        sort_conversations(&mut found, query.sort.as_deref());

        let limit = match query.limit {
            0 => DEFAULT_CONVERSATION_LIMIT,
            n => n as usize,
        };
        let mut page: Vec<Conversation> = found
            .into_iter()
            .skip(query.skip as usize)
            .take(limit)
            .collect();
        for conversation in &mut page {
            if query.flag & FLAG_COMPACT != 0 {
                conversation.members.clear();
            }
            if query.flag & FLAG_WITH_LAST_MESSAGE == 0 {
                conversation.last_message = None;
            }
        }
        Ok(page)
    }

    async fn query_temporary_conversations(&self, ids: Vec<String>) -> Result<Vec<Conversation>, SdkError> {
        self.world.enter("query_temporary_conversations").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        Ok(ids
            .iter()
            .filter(|id| id.starts_with(TEMPORARY_CONVERSATION_PREFIX))
            .filter_map(|id| state.view(id, &self.client_id))
            .collect())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        mut message: Message,
        options: SendOptions,
    ) -> Result<Message, SdkError> {
        self.world.enter("send_message").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        let recipients = {
            let stored = state.stored(conversation_id)?;
            let conversation = self.ensure_member(stored)?;
            self.others(conversation)
        };

        let now = state.tick();
        upload(&mut message);
        message.id = Some(new_id());
        message.client_id = Some(self.client_id.clone());
        message.conversation_id = Some(conversation_id.to_string());
        message.from = Some(self.client_id.clone());
        message.timestamp = Some(now);
        if options.transient {
            message.transient = Some(true);
        }

        let mut delivered = false;
        for recipient in &recipients {
            let Some(slot) = state.clients.get_mut(recipient) else {
                continue;
            };
            if !slot.opened {
                continue;
            }
            delivered = true;
            if !options.transient {
                *slot.unread.entry(conversation_id.to_string()).or_default() += 1;
                if is_mentioned(&message, recipient) {
                    slot.mentioned.insert(conversation_id.to_string());
                }
            }
        }

        let stored = state.stored_mut(conversation_id)?;
        if !options.transient {
            stored.messages.push(message.clone());
            stored.conversation.last_message = Some(message.clone());
            stored.conversation.last_message_at = Some(date(now));
        }
        if delivered {
            stored.delivered.insert(self.client_id.clone(), now);
        }

        for recipient in &recipients {
            state.notify(
                recipient,
                conversation_id,
                ConversationEvent::MessageReceived(message.clone()),
            );
            if !options.transient {
                state.notify(recipient, conversation_id, ConversationEvent::UnreadCountUpdated);
                state.notify(recipient, conversation_id, ConversationEvent::LastMessageUpdated);
            }
        }
        if options.receipt && delivered {
            state.notify(
                &self.client_id,
                conversation_id,
                ConversationEvent::MessageReceipt {
                    message_id: message.id.clone().unwrap_or_default(),
                    timestamp: Some(now),
                    read: false,
                },
            );
            state.notify(&self.client_id, conversation_id, ConversationEvent::LastDeliveredAtUpdated);
        }

        Ok(message)
    }

    async fn read(&self, conversation_id: &str) -> Result<(), SdkError> {
        self.world.enter("read").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        let now = state.tick();

        let others = {
            let stored = state.stored_mut(conversation_id)?;
            stored.reads.insert(self.client_id.clone(), now);
            stored
                .conversation
                .members
                .iter()
                .filter(|member| **member != self.client_id)
                .cloned()
                .collect::<Vec<_>>()
        };
        let slot = state.slot(&self.client_id, self.world.event_buffer);
        slot.unread.remove(conversation_id);
        slot.mentioned.remove(conversation_id);

        state.notify(&self.client_id, conversation_id, ConversationEvent::UnreadCountUpdated);
        for member in &others {
            state.notify(member, conversation_id, ConversationEvent::LastReadAtUpdated);
        }
        Ok(())
    }

    async fn update_message(&self, conversation_id: &str, old: Message, new: Message) -> Result<Message, SdkError> {
        self.world.enter("update_message").await?;
        self.patch(conversation_id, old, move |message| {
            message.content = new.content;
            message.mentioned_members = new.mentioned_members;
            message.mention_all = new.mention_all;
        }, false)
    }

    async fn recall_message(&self, conversation_id: &str, old: Message) -> Result<Message, SdkError> {
        self.world.enter("recall_message").await?;
        self.patch(conversation_id, old, |message| {
            message.content = MessageContent::Typed(TypedMessage::Recalled(RecalledMessage::default()));
        }, true)
    }

    async fn fetch_receipt_timestamps(&self, conversation_id: &str) -> Result<ReceiptTimestamps, SdkError> {
        self.world.enter("fetch_receipt_timestamps").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        let conversation = state
            .view(conversation_id, &self.client_id)
            .ok_or_else(conversation_not_found)?;
        Ok(ReceiptTimestamps {
            max_read: conversation.last_read_at,
            max_delivered: conversation.last_delivered_at,
        })
    }

    async fn query_messages(&self, conversation_id: &str, query: MessageQuery) -> Result<Vec<Message>, SdkError> {
        self.world.enter("query_messages").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        let stored = state.stored(conversation_id)?;
        self.ensure_member(stored)?;
        Ok(select_messages(&stored.messages, &query))
    }

    async fn update_members(
        &self,
        conversation_id: &str,
        action: MemberAction,
        members: Vec<String>,
        signature: Option<Signature>,
    ) -> Result<MemberOutcome, SdkError> {
        self.world.enter("update_members").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        if let Some(signature) = signature {
            let label = match action {
                MemberAction::Add => "invite",
                MemberAction::Remove => "kick",
                MemberAction::Block => "block",
                MemberAction::Unblock => "unblock",
                MemberAction::Mute => "mute",
                MemberAction::Unmute => "unmute",
            };
            state.signatures.push((label.to_string(), signature));
        }
        self.ensure_member(state.stored(conversation_id)?)?;

        let (rejected, accepted): (Vec<String>, Vec<String>) = members
            .into_iter()
            .partition(|member| state.rejected.contains(member));

        let audience_before = state.stored(conversation_id)?.conversation.members.clone();
        {
            let now = state.tick();
            let stored = state.stored_mut(conversation_id)?;
            let roster = &mut stored.conversation.members;
            match action {
                MemberAction::Add => add_all(roster, &accepted),
                MemberAction::Remove => remove_all(roster, &accepted),
                MemberAction::Block => {
                    remove_all(roster, &accepted);
                    add_all(&mut stored.blocked, &accepted);
                }
                MemberAction::Unblock => remove_all(&mut stored.blocked, &accepted),
                MemberAction::Mute => add_all(&mut stored.muted, &accepted),
                MemberAction::Unmute => remove_all(&mut stored.muted, &accepted),
            }
            stored.conversation.updated_at = Some(date(now));
        }

        if !accepted.is_empty() {
            let (bulk, personal) = match action {
                MemberAction::Add => (MembershipChange::MembersJoined, MembershipChange::Joined),
                MemberAction::Remove => (MembershipChange::MembersLeft, MembershipChange::Left),
                MemberAction::Block => (MembershipChange::MembersBlocked, MembershipChange::Blocked),
                MemberAction::Unblock => (MembershipChange::MembersUnblocked, MembershipChange::Unblocked),
                MemberAction::Mute => (MembershipChange::MembersMuted, MembershipChange::Muted),
                MemberAction::Unmute => (MembershipChange::MembersUnmuted, MembershipChange::Unmuted),
            };
            let operator = Some(self.client_id.clone());
            let audience: Vec<&String> = audience_before
                .iter()
                .filter(|member| !accepted.contains(member))
                .collect();
            for member in audience {
                state.notify(
                    member,
                    conversation_id,
                    ConversationEvent::Membership {
                        change: bulk,
                        members: accepted.clone(),
                        operator: operator.clone(),
                    },
                );
            }
            for member in &accepted {
                state.notify(
                    member,
                    conversation_id,
                    ConversationEvent::Membership {
                        change: personal,
                        members: vec![member.clone()],
                        operator: operator.clone(),
                    },
                );
            }
        }

        let failures = if rejected.is_empty() {
            Vec::new()
        } else {
            vec![MemberFailure {
                ids: rejected,
                error: SdkError::new(MEMBER_REJECTED, "member rejected"),
            }]
        };
        Ok(MemberOutcome {
            succeeded: accepted,
            failures,
        })
    }

    async fn query_member_list(
        &self,
        conversation_id: &str,
        kind: MemberListKind,
        limit: u32,
        next: Option<String>,
    ) -> Result<MemberPage, SdkError> {
        self.world.enter("query_member_list").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        let stored = state.stored(conversation_id)?;
        let list = match kind {
            MemberListKind::Blocked => &stored.blocked,
            MemberListKind::Muted => &stored.muted,
        };

        let offset = next.and_then(|cursor| cursor.parse::<usize>().ok()).unwrap_or(0);
        let limit = match limit {
            0 => DEFAULT_MEMBER_LIMIT,
            n => n as usize,
        };
        let members: Vec<String> = list.iter().skip(offset).take(limit).cloned().collect();
        let end = offset + members.len();
        Ok(MemberPage {
            members,
            next: (end < list.len()).then(|| end.to_string()),
        })
    }

    async fn set_muted(&self, conversation_id: &str, muted: bool) -> Result<Conversation, SdkError> {
        self.world.enter("set_muted").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        let now = state.tick();
        let stored = state.stored_mut(conversation_id)?;
        let muted_by = &mut stored.conversation.muted_by;
        let me = [self.client_id.clone()];
        if muted {
            add_all(muted_by, &me);
        } else {
            remove_all(muted_by, &me);
        }
        stored.conversation.updated_at = Some(date(now));
        state
            .view(conversation_id, &self.client_id)
            .ok_or_else(conversation_not_found)
    }

    async fn update_attributes(
        &self,
        conversation_id: &str,
        changes: Vec<AttributeChange>,
    ) -> Result<Conversation, SdkError> {
        self.world.enter("update_attributes").await?;
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        self.ensure_member(state.stored(conversation_id)?)?;
        let now = state.tick();

        let mut changed = Map::new();
        let others = {
            let stored = state.stored_mut(conversation_id)?;
            let conversation = &mut stored.conversation;
            for change in changes {
                match change {
                    AttributeChange::Set(key, value) => {
                        apply_attribute(conversation, &key, Some(value.clone()));
                        changed.insert(key, value);
                    }
                    AttributeChange::Remove(key) => {
                        apply_attribute(conversation, &key, None);
                        changed.insert(key, Value::Null);
                    }
                }
            }
            conversation.updated_at = Some(date(now));
            self.others(conversation)
        };

        for member in &others {
            state.notify(
                member,
                conversation_id,
                ConversationEvent::InfoChanged {
                    attributes: changed.clone(),
                    operator: Some(self.client_id.clone()),
                },
            );
        }
        state
            .view(conversation_id, &self.client_id)
            .ok_or_else(conversation_not_found)
    }

    async fn count_members(&self, conversation_id: &str) -> Result<u64, SdkError> {
        self.world.enter("count_members").await?;
        let state = self.world.state();
        self.ensure_connected(&state)?;
        Ok(state.stored(conversation_id)?.conversation.members.len() as u64)
    }
}

impl MemoryClient {
    /// Rewrite a stored message sent by this client and tell the others
    fn patch(
        &self,
        conversation_id: &str,
        old: Message,
        apply: impl FnOnce(&mut Message),
        recalled: bool,
    ) -> Result<Message, SdkError> {
        let mut state = self.world.state();
        self.ensure_connected(&state)?;
        let now = state.tick();
        let message_id = old
            .id
            .ok_or_else(|| SdkError::new(MESSAGE_NOT_FOUND, "message not found"))?;

        let (patched, others) = {
            let stored = state.stored_mut(conversation_id)?;
            let message = stored
                .messages
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(message_id.as_str()))
                .ok_or_else(|| SdkError::new(MESSAGE_NOT_FOUND, "message not found"))?;
            if message.from.as_deref() != Some(self.client_id.as_str()) {
                return Err(SdkError::new(NOT_THE_SENDER, "only the sender can change a message"));
            }
            apply(message);
            message.patch_timestamp = Some(now);
            let patched = message.clone();
            if stored
                .conversation
                .last_message
                .as_ref()
                .is_some_and(|last| last.id == patched.id)
            {
                stored.conversation.last_message = Some(patched.clone());
            }
            let others: Vec<String> = stored
                .conversation
                .members
                .iter()
                .filter(|member| **member != self.client_id)
                .cloned()
                .collect();
            (patched, others)
        };

        for member in &others {
            state.notify(
                member,
                conversation_id,
                ConversationEvent::MessageUpdated {
                    message: patched.clone(),
                    recalled,
                    patch_code: None,
                    patch_reason: None,
                },
            );
        }
        Ok(patched)
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn date(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn conversation_not_found() -> SdkError {
    SdkError::new(CONVERSATION_NOT_FOUND, "conversation not found")
}

fn add_all(list: &mut Vec<String>, ids: &[String]) {
    for id in ids {
        if !list.contains(id) {
            list.push(id.clone());
        }
    }
}

fn remove_all(list: &mut Vec<String>, ids: &[String]) {
    list.retain(|member| !ids.contains(member));
}

fn is_mentioned(message: &Message, member: &str) -> bool {
    message.mention_all == Some(true)
        || message
            .mentioned_members
            .as_ref()
            .is_some_and(|members| members.iter().any(|m| m == member))
}

/// Turn a pending attachment into an uploaded file reference
fn upload(message: &mut Message) {
    let MessageContent::Typed(typed) = &mut message.content else {
        return;
    };
    let Some(media) = typed.media_mut() else {
        return;
    };
    let Some(attachment) = media.attachment.take() else {
        return;
    };

    let mut metadata = Map::new();
    metadata.insert("name".to_string(), Value::from(attachment.name.clone()));
    if let Some(format) = &attachment.format {
        metadata.insert("format".to_string(), Value::from(format.clone()));
    }
    let url = match &attachment.source {
        FileSource::Inline(bytes) => {
            metadata.insert("size".to_string(), Value::from(bytes.len()));
            format!("memory://files/{}", attachment.name)
        }
        FileSource::Path(path) => format!("memory://files/{}", path.display()),
        FileSource::Url(url) => url.clone(),
    };
    media.file = Some(FileRef {
        url: Some(url),
        object_id: Some(new_id()),
        metadata: Some(metadata),
        extra: Map::new(),
    });
}

/// `name`, `attr.<key>` or a bare attribute key
fn apply_attribute(conversation: &mut Conversation, key: &str, value: Option<Value>) {
    if key == "name" {
        conversation.name = value.and_then(|v| v.as_str().map(str::to_string));
        return;
    }
    let key = key.strip_prefix("attr.").unwrap_or(key);
    match value {
        Some(value) => {
            conversation.attributes.insert(key.to_string(), value);
        }
        None => {
            conversation.attributes.remove(key);
        }
    }
}

/// Equality predicate on `objectId`, `name`, `tr`, `m` (membership) and `attr.<key>`
fn matches_predicate(conversation: &Conversation, predicate: &Map<String, Value>) -> bool {
    predicate.iter().all(|(key, expected)| match key.as_str() {
        "objectId" => expected.as_str() == Some(conversation.id.as_str()),
        "name" => expected.as_str() == conversation.name.as_deref(),
        "tr" => expected.as_bool() == Some(conversation.kind == ConversationKind::Transient),
        "m" => match expected {
            Value::String(member) => conversation.members.contains(member),
            Value::Array(members) => members
                .iter()
                .filter_map(Value::as_str)
                .all(|member| conversation.members.iter().any(|m| m == member)),
            _ => false,
        },
        other => match other.strip_prefix("attr.") {
            Some(attr) => conversation.attributes.get(attr) == Some(expected),
            None => false,
        },
    })
}

/// `createdAt`, `updatedAt` or `lastMessageAt`, `-` prefix for descending.
/// Defaults to most recently updated first.
fn sort_conversations(conversations: &mut [Conversation], sort: Option<&str>) {
    let sort = sort.filter(|s| !s.is_empty()).unwrap_or("-updatedAt");
    let (descending, field) = match sort.strip_prefix('-') {
        Some(field) => (true, field),
        None => (false, sort),
    };
    let key = |conversation: &Conversation| match field {
        "createdAt" => conversation.created_at,
        "lastMessageAt" => conversation.last_message_at,
        _ => conversation.updated_at,
    };
    conversations.sort_by(|a, b| {
        let order = key(a).cmp(&key(b));
        if descending {
            order.reverse()
        } else {
            order
        }
    });
}

fn bound_ok(bound: &Option<IntervalBound>, timestamp: i64, before: bool) -> bool {
    match bound {
        Some(bound) if bound.timestamp > 0 => {
            if timestamp == bound.timestamp {
                bound.closed
            } else if before {
                timestamp < bound.timestamp
            } else {
                timestamp > bound.timestamp
            }
        }
        _ => true,
    }
}

/// Messages in chronological order
fn select_messages(messages: &[Message], query: &MessageQuery) -> Vec<Message> {
    match query {
        MessageQuery::Interval {
            start,
            end,
            direction,
            limit,
        } => {
            let limit = if *limit == 0 { DEFAULT_MESSAGE_LIMIT } else { *limit as usize };
            let newest_first = *direction == QueryDirection::NewToOld;
            let matching: Vec<&Message> = messages
                .iter()
                .filter(|m| {
                    let ts = m.timestamp.unwrap_or_default();
                    if newest_first {
                        bound_ok(start, ts, true) && bound_ok(end, ts, false)
                    } else {
                        bound_ok(start, ts, false) && bound_ok(end, ts, true)
                    }
                })
                .collect();
            if newest_first {
                let skip = matching.len().saturating_sub(limit);
                matching.into_iter().skip(skip).cloned().collect()
            } else {
                matching.into_iter().take(limit).cloned().collect()
            }
        }
        MessageQuery::ByType {
            type_tag,
            start,
            limit,
        } => {
            let limit = if *limit == 0 { DEFAULT_MESSAGE_LIMIT } else { *limit as usize };
            let matching: Vec<&Message> = messages
                .iter()
                .filter(|m| match &m.content {
                    MessageContent::Typed(typed) => typed.type_tag() == Some(*type_tag),
                    _ => false,
                })
                .filter(|m| bound_ok(start, m.timestamp.unwrap_or_default(), true))
                .collect();
            let skip = matching.len().saturating_sub(limit);
            matching.into_iter().skip(skip).cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{Attachment, MediaMessage, TextMessage};

    async fn open(sdk: &MemorySdk, id: &str) -> Arc<dyn ImClient> {
        let client = sdk.client(id, None).unwrap();
        client.open(OpenOptions::default(), None).await.unwrap();
        client
    }

    fn text(body: &str) -> Message {
        Message {
            content: MessageContent::Text(body.into()),
            ..Message::default()
        }
    }

    fn group(members: &[&str]) -> NewConversation {
        NewConversation {
            kind: ConversationKind::Group,
            members: members.iter().map(|m| m.to_string()).collect(),
            name: Some("g".into()),
            attributes: None,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_operations_need_an_open_session() {
        let sdk = MemorySdk::new();
        let client = sdk.client("a", None).unwrap();
        let err = client.count_members("nope").await.unwrap_err();
        assert_eq!(err.code, CLIENT_OFFLINE);
    }

    #[tokio::test]
    async fn test_message_reaches_other_members() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let bob = open(&sdk, "bob").await;
        let mut bob_events = bob.subscribe();

        let conversation = alice.create_conversation(group(&["bob"]), None).await.unwrap();
        assert_eq!(conversation.members, vec!["alice", "bob"]);

        let sent = alice
            .send_message(&conversation.id, text("hi"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(sent.from.as_deref(), Some("alice"));

        let mut received = None;
        while received.is_none() {
            if let SdkEvent::Conversation {
                event: ConversationEvent::MessageReceived(message),
                conversation,
            } = bob_events.recv().await.unwrap()
            {
                assert_eq!(conversation.unread_count, 1);
                received = Some(message);
            }
        }
        assert_eq!(received.unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn test_unique_conversation_is_reused() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let request = NewConversation {
            kind: ConversationKind::Unique,
            ..group(&["bob"])
        };
        let first = alice.create_conversation(request.clone(), None).await.unwrap();
        let second = alice.create_conversation(request, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.unique, Some(true));
    }

    #[tokio::test]
    async fn test_temporary_ids_carry_the_prefix() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let request = NewConversation {
            kind: ConversationKind::Temporary,
            ttl: Some(3600),
            ..group(&["bob"])
        };
        let conversation = alice.create_conversation(request, None).await.unwrap();
        assert!(conversation.id.starts_with(TEMPORARY_CONVERSATION_PREFIX));
        assert_eq!(conversation.ttl, Some(3600));

        let found = alice
            .query_temporary_conversations(vec![conversation.id.clone(), "plain".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_members_fail_in_one_batch() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        sdk.reject_member("mallory");
        let conversation = alice.create_conversation(group(&[]), None).await.unwrap();

        let outcome = alice
            .update_members(
                &conversation.id,
                MemberAction::Add,
                vec!["bob".into(), "mallory".into()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["bob"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].ids, vec!["mallory"]);
        assert_eq!(sdk.conversation(&conversation.id).unwrap().members, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_member_pages_follow_the_cursor() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let conversation = alice
            .create_conversation(group(&["b", "c", "d"]), None)
            .await
            .unwrap();
        alice
            .update_members(
                &conversation.id,
                MemberAction::Block,
                vec!["b".into(), "c".into(), "d".into()],
                None,
            )
            .await
            .unwrap();

        let first = alice
            .query_member_list(&conversation.id, MemberListKind::Blocked, 2, None)
            .await
            .unwrap();
        assert_eq!(first.members, vec!["b", "c"]);
        let second = alice
            .query_member_list(&conversation.id, MemberListKind::Blocked, 2, first.next)
            .await
            .unwrap();
        assert_eq!(second.members, vec!["d"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_attachment_is_uploaded_on_send() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let conversation = alice.create_conversation(group(&[]), None).await.unwrap();
        let message = Message {
            content: MessageContent::Typed(TypedMessage::Image(MediaMessage {
                attachment: Some(Attachment {
                    source: FileSource::Inline(vec![1, 2, 3]),
                    name: "a.png".into(),
                    keep_name: true,
                    format: Some("png".into()),
                }),
                ..MediaMessage::default()
            })),
            ..Message::default()
        };

        let sent = alice
            .send_message(&conversation.id, message, SendOptions::default())
            .await
            .unwrap();
        match sent.content {
            MessageContent::Typed(TypedMessage::Image(media)) => {
                assert!(media.attachment.is_none());
                let file = media.file.unwrap();
                assert_eq!(file.url.as_deref(), Some("memory://files/a.png"));
                assert_eq!(file.metadata.unwrap()["size"], Value::from(3));
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_queries_by_direction_and_type() {
        let sdk = MemorySdk::new();
        let alice = open(&sdk, "alice").await;
        let conversation = alice.create_conversation(group(&[]), None).await.unwrap();
        for body in ["one", "two", "three"] {
            alice
                .send_message(&conversation.id, text(body), SendOptions::default())
                .await
                .unwrap();
        }
        let typed = Message {
            content: MessageContent::Typed(TypedMessage::Text(TextMessage::default())),
            ..Message::default()
        };
        alice
            .send_message(&conversation.id, typed, SendOptions::default())
            .await
            .unwrap();

        let bodies = |messages: Vec<Message>| -> Vec<String> {
            messages
                .into_iter()
                .filter_map(|m| match m.content {
                    MessageContent::Text(t) => Some(t),
                    _ => None,
                })
                .collect()
        };

        let newest = alice
            .query_messages(
                &conversation.id,
                MessageQuery::Interval {
                    start: None,
                    end: None,
                    direction: QueryDirection::NewToOld,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);

        let oldest = alice
            .query_messages(
                &conversation.id,
                MessageQuery::Interval {
                    start: None,
                    end: None,
                    direction: QueryDirection::OldToNew,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(bodies(oldest), vec!["one", "two"]);

        let by_type = alice
            .query_messages(
                &conversation.id,
                MessageQuery::ByType {
                    type_tag: crate::sdk::message::TEXT_TAG,
                    start: None,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let sdk = MemorySdk::new();
        let client = sdk.client("a", None).unwrap();
        sdk.fail_next("open", SdkError::new(4111, "nope"));
        assert_eq!(
            client.open(OpenOptions::default(), None).await.unwrap_err().code,
            4111
        );
        client.open(OpenOptions::default(), None).await.unwrap();
        assert!(sdk.is_open("a"));
    }

    #[tokio::test]
    async fn test_kick_reports_offline() {
        let sdk = MemorySdk::new();
        let client = open(&sdk, "a").await;
        let mut events = client.subscribe();
        sdk.kick("a", 4111, Some("elsewhere"));
        assert_eq!(
            events.recv().await.unwrap(),
            SdkEvent::Offline {
                code: 4111,
                reason: Some("elsewhere".into())
            }
        );
        assert!(!sdk.is_open("a"));
    }
}
