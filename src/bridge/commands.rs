//! Conversation, message and membership commands of an open session.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::error::{BridgeError, BridgeResult};
use super::protocol::{
    BlockOp, BoundParams, Command, ConversationTarget, CreateConversationParams, MemberPageParams,
    MemberUpdateParams, MembershipOp, MuteOp, MuteToggleParams, PatchMessageParams,
    QueryConversationParams, QueryMessageParams, Response, SendMessageParams, UpdateDataParams,
};
use super::session::Session;
use super::signature::SignAction;
use super::Shared;
use crate::codec::error::ErrorRecord;
use crate::codec::{file, format_date, now_string, ConversationRecord, MessageRecord};
use crate::sdk::{
    AttributeChange, Conversation, ConversationKind, ConversationQuery, IntervalBound,
    MemberAction, MemberFailure, MemberListKind, MessagePriority, MessageQuery, NewConversation,
    QueryDirection, SendOptions, TEMPORARY_CONVERSATION_PREFIX,
};

/// Direction code for oldest-first history queries
const DIRECTION_OLD_TO_NEW: i64 = 2;

/// Outcome of a batch member operation
#[derive(Debug, Clone, PartialEq)]
pub enum MemberOperationResult {
    AllSucceeded(Vec<String>),
    PartialFailure(Vec<String>, Vec<MemberFailure>),
}

impl MemberOperationResult {
    pub fn succeeded_ids(&self) -> &[String] {
        match self {
            MemberOperationResult::AllSucceeded(ids) => ids,
            MemberOperationResult::PartialFailure(ids, _) => ids,
        }
    }

    /// `{allowedPids, failedPids?, m, udate}`
    pub fn to_value(&self, roster: Vec<String>, udate: String) -> Value {
        let mut record = Map::new();
        record.insert("allowedPids".to_string(), Value::from(self.succeeded_ids().to_vec()));
        if let MemberOperationResult::PartialFailure(_, failures) = self {
            let failed: Vec<Value> = failures
                .iter()
                .map(|failure| {
                    json!({
                        "pids": failure.ids,
                        "error": ErrorRecord::from(&failure.error),
                    })
                })
                .collect();
            record.insert("failedPids".to_string(), Value::from(failed));
        }
        record.insert("m".to_string(), Value::from(roster));
        record.insert("udate".to_string(), Value::from(udate));
        Value::Object(record)
    }
}

/// Run a session command; open and close are handled by the dispatcher
pub(crate) async fn execute(shared: &Shared, session: &Session, command: Command) -> BridgeResult<Response> {
    match command {
        Command::CreateConversation(params) => create_conversation(shared, session, params).await,
        Command::GetConversation(target) => get_conversation(session, target).await,
        Command::QueryConversation(params) => query_conversation(session, params).await,
        Command::SendMessage(params) => send_message(session, params).await,
        Command::ReadMessage(target) => {
            let conversation_id = conversation_id(&target.conversation_id)?;
            session.client().read(conversation_id).await?;
            Ok(Response::Success(json!({})))
        }
        Command::PatchMessage(params) => patch_message(session, params).await,
        Command::FetchReceiptTimestamp(target) => fetch_receipt_timestamp(session, target).await,
        Command::QueryMessage(params) => query_message(shared, session, params).await,
        Command::UpdateMembers(params) => {
            let action = match params.op {
                MembershipOp::Add => MemberAction::Add,
                MembershipOp::Remove => MemberAction::Remove,
            };
            update_members(shared, session, params, action).await
        }
        Command::UpdateBlockMembers(params) => {
            let action = match params.op {
                BlockOp::Block => MemberAction::Block,
                BlockOp::Unblock => MemberAction::Unblock,
            };
            update_members(shared, session, params, action).await
        }
        Command::UpdateMuteMembers(params) => {
            let action = match params.op {
                MuteOp::Mute => MemberAction::Mute,
                MuteOp::Unmute => MemberAction::Unmute,
            };
            update_members(shared, session, params, action).await
        }
        Command::QueryBlockedMembers(params) => {
            query_member_list(shared, session, params, MemberListKind::Blocked).await
        }
        Command::QueryMutedMembers(params) => {
            query_member_list(shared, session, params, MemberListKind::Muted).await
        }
        Command::MuteToggle(params) => mute_toggle(session, params).await,
        Command::UpdateData(params) => update_data(session, params).await,
        Command::CountMembers(target) => {
            let conversation_id = conversation_id(&target.conversation_id)?;
            let count = session.client().count_members(conversation_id).await?;
            Ok(Response::Success(Value::from(count)))
        }
        lifecycle @ (Command::OpenClient(_) | Command::CloseClient) => Err(BridgeError::Unexpected(
            format!("{} is a lifecycle command", lifecycle.name()),
        )),
    }
}

fn conversation_id(id: &str) -> BridgeResult<&str> {
    if id.is_empty() {
        Err(BridgeError::invalid("Conversation id is null or invalid."))
    } else {
        Ok(id)
    }
}

fn conversation_value(conversation: &Conversation) -> Value {
    ConversationRecord::encode(conversation).to_value()
}

fn conversations_value(conversations: &[Conversation]) -> Value {
    Value::Array(conversations.iter().map(conversation_value).collect())
}

async fn create_conversation(
    shared: &Shared,
    session: &Session,
    params: CreateConversationParams,
) -> BridgeResult<Response> {
    let kind = ConversationKind::from_code(params.conv_type).unwrap_or(ConversationKind::Group);
    let ttl = params
        .ttl
        .filter(|ttl| *ttl > 0 && kind == ConversationKind::Temporary);

    let signature = if session.sign_registry().await.conversation {
        shared
            .negotiator
            .sign_conversation(session.client_id(), None, &params.members, SignAction::Create)
            .await
    } else {
        None
    };

    let request = NewConversation {
        kind,
        members: params.members,
        name: params.name,
        attributes: params.attr,
        ttl,
    };
    let conversation = session.client().create_conversation(request, signature).await?;

    let mut record = conversation_value(&conversation);
    if let (Some(ttl), Value::Object(map)) = (ttl, &mut record) {
        map.insert("ttl".to_string(), Value::from(ttl));
    }
    Ok(Response::Success(record))
}

async fn get_conversation(session: &Session, target: ConversationTarget) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&target.conversation_id)?;
    let client = session.client();

    let conversation = match client.cached_conversation(conversation_id) {
        Some(conversation) => Some(conversation),
        None if conversation_id.starts_with(TEMPORARY_CONVERSATION_PREFIX) => client
            .query_temporary_conversations(vec![conversation_id.to_string()])
            .await?
            .into_iter()
            .next(),
        None => client.fetch_conversation(conversation_id).await?,
    };

    match conversation {
        Some(conversation) => Ok(Response::Success(conversation_value(&conversation))),
        None => Err(BridgeError::invalid("conversation not found.")),
    }
}

async fn query_conversation(session: &Session, params: QueryConversationParams) -> BridgeResult<Response> {
    let client = session.client();
    let temporary = params.temp_conv_ids.filter(|ids| !ids.is_empty());
    let conversations = match temporary {
        Some(ids) => client.query_temporary_conversations(ids).await?,
        None => {
            let query = ConversationQuery {
                predicate: params.predicate,
                sort: params.sort,
                skip: params.skip,
                limit: params.limit,
                flag: params.flag,
            };
            client.query_conversations(query).await?
        }
    };
    debug!("Query for {} matched {} conversations", session.client_id(), conversations.len());
    Ok(Response::Success(conversations_value(&conversations)))
}

async fn send_message(session: &Session, params: SendMessageParams) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    let mut message = params.message.decode();
    if let Some(file_param) = params.file {
        file::attach(&mut message, file_param);
    }

    let options = params.options.unwrap_or_default();
    let send_options = SendOptions {
        receipt: options.receipt.unwrap_or(false),
        will: options.will.unwrap_or(false),
        transient: message.transient.unwrap_or(false),
        priority: options.priority.and_then(MessagePriority::from_code),
        push_data: options.push_data,
    };

    let sent = session
        .client()
        .send_message(conversation_id, message, send_options)
        .await?;
    Ok(Response::Success(MessageRecord::encode(&sent).to_value()))
}

async fn patch_message(session: &Session, params: PatchMessageParams) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    let old = params.old_message.decode();
    let client = session.client();

    let patched = if params.recall {
        client.recall_message(conversation_id, old).await?
    } else {
        let mut new = params
            .new_message
            .ok_or_else(|| BridgeError::invalid("new message is missing."))?
            .decode();
        if let Some(file_param) = params.file {
            file::attach(&mut new, file_param);
        }
        client.update_message(conversation_id, old, new).await?
    };
    Ok(Response::Success(MessageRecord::encode(&patched).to_value()))
}

async fn fetch_receipt_timestamp(session: &Session, target: ConversationTarget) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&target.conversation_id)?;
    let timestamps = session.client().fetch_receipt_timestamps(conversation_id).await?;
    let mut record = Map::new();
    if let Some(read) = timestamps.max_read {
        record.insert("maxReadTimestamp".to_string(), Value::from(read));
    }
    if let Some(delivered) = timestamps.max_delivered {
        record.insert("maxDeliveredTimestamp".to_string(), Value::from(delivered));
    }
    Ok(Response::Success(Value::Object(record)))
}

fn bound(params: Option<BoundParams>) -> Option<IntervalBound> {
    params.map(|b| IntervalBound {
        message_id: b.id.filter(|id| !id.is_empty()),
        timestamp: b.timestamp,
        closed: b.closed,
    })
}

async fn query_message(shared: &Shared, session: &Session, params: QueryMessageParams) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    let limit = params
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(shared.config.default_query_limit);
    let start = bound(params.start);

    let query = match params.type_tag.filter(|tag| *tag != 0) {
        Some(type_tag) => MessageQuery::ByType {
            type_tag,
            start,
            limit,
        },
        None => MessageQuery::Interval {
            start,
            end: bound(params.end),
            direction: if params.direction == Some(DIRECTION_OLD_TO_NEW) {
                QueryDirection::OldToNew
            } else {
                QueryDirection::NewToOld
            },
            limit,
        },
    };

    let messages = session.client().query_messages(conversation_id, query).await?;
    let records = messages
        .iter()
        .map(|m| MessageRecord::encode(m).to_value())
        .collect();
    Ok(Response::Success(Value::Array(records)))
}

async fn update_members<Op>(
    shared: &Shared,
    session: &Session,
    params: MemberUpdateParams<Op>,
    action: MemberAction,
) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    if params.members.is_empty() {
        return Err(BridgeError::invalid("member list is empty."));
    }

    let sign_action = match action {
        MemberAction::Add => Some(SignAction::Invite),
        MemberAction::Remove => Some(SignAction::Kick),
        _ => None,
    };
    let signature = match sign_action {
        Some(sign_action) if session.sign_registry().await.conversation => {
            shared
                .negotiator
                .sign_conversation(
                    session.client_id(),
                    Some(conversation_id),
                    &params.members,
                    sign_action,
                )
                .await
        }
        _ => None,
    };

    let client = session.client();
    let outcome = client
        .update_members(conversation_id, action, params.members.clone(), signature)
        .await?;
    let result = if outcome.failures.is_empty() {
        MemberOperationResult::AllSucceeded(params.members)
    } else {
        MemberOperationResult::PartialFailure(outcome.succeeded, outcome.failures)
    };

    let roster = client
        .cached_conversation(conversation_id)
        .map(|conversation| conversation.members)
        .unwrap_or_default();
    Ok(Response::Success(result.to_value(roster, now_string())))
}

async fn query_member_list(
    shared: &Shared,
    session: &Session,
    params: MemberPageParams,
    kind: MemberListKind,
) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    let limit = params
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(shared.config.default_query_limit);
    let next = params.next.filter(|next| !next.is_empty());

    let page = session
        .client()
        .query_member_list(conversation_id, kind, limit, next)
        .await?;
    let mut record = Map::new();
    record.insert("client_ids".to_string(), Value::from(page.members));
    if let Some(next) = page.next {
        record.insert("next".to_string(), Value::from(next));
    }
    Ok(Response::Success(Value::Object(record)))
}

async fn mute_toggle(session: &Session, params: MuteToggleParams) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    let muted = params.op == MuteOp::Mute;
    let conversation = session.client().set_muted(conversation_id, muted).await?;

    let udate = conversation
        .updated_at
        .as_ref()
        .map(format_date)
        .unwrap_or_else(now_string);
    let mu: Vec<String> = if muted {
        vec![session.client_id().to_string()]
    } else {
        Vec::new()
    };
    Ok(Response::Success(json!({"udate": udate, "mu": mu})))
}

/// `{"__op": "Delete"}` removes the key, anything else sets it
fn attribute_change(key: String, value: Value) -> AttributeChange {
    let is_delete = value
        .as_object()
        .and_then(|op| op.get("__op"))
        .and_then(Value::as_str)
        == Some("Delete");
    if is_delete {
        AttributeChange::Remove(key)
    } else {
        AttributeChange::Set(key, value)
    }
}

async fn update_data(session: &Session, params: UpdateDataParams) -> BridgeResult<Response> {
    let conversation_id = conversation_id(&params.conversation_id)?;
    if params.data.is_empty() {
        return Err(BridgeError::invalid("update attributes is empty."));
    }
    let changes = params
        .data
        .into_iter()
        .map(|(key, value)| attribute_change(key, value))
        .collect();
    let conversation = session
        .client()
        .update_attributes(conversation_id, changes)
        .await?;
    Ok(Response::Success(conversation_value(&conversation)))
}
