//! Command and event records exchanged with the host.
//!
//! A host call arrives as `{method, args}`. It is validated once, here, into a
//! [`Call`]: the target client id plus one typed [`Command`] variant. Results
//! go back as a [`Response`], notifications as an [`EventRecord`].

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::signature::SignRegistry;
use crate::codec::{ErrorRecord, FileParam, MessageRecord};

pub const OPEN_CLIENT: &str = "openClient";
pub const CLOSE_CLIENT: &str = "closeClient";
pub const CREATE_CONVERSATION: &str = "createConversation";
pub const GET_CONVERSATION: &str = "getConversation";
pub const QUERY_CONVERSATION: &str = "queryConversation";
pub const SEND_MESSAGE: &str = "sendMessage";
pub const READ_MESSAGE: &str = "readMessage";
pub const PATCH_MESSAGE: &str = "patchMessage";
pub const FETCH_RECEIPT_TIMESTAMP: &str = "fetchReceiptTimestamp";
pub const QUERY_MESSAGE: &str = "queryMessage";
pub const UPDATE_MEMBERS: &str = "updateMembers";
pub const UPDATE_BLOCK_MEMBERS: &str = "updateBlockMembers";
pub const UPDATE_MUTE_MEMBERS: &str = "updateMuteMembers";
pub const QUERY_BLOCKED_MEMBERS: &str = "queryBlockedMembers";
pub const QUERY_MUTED_MEMBERS: &str = "queryMutedMembers";
pub const MUTE_TOGGLE: &str = "muteToggle";
pub const UPDATE_DATA: &str = "updateData";
pub const COUNT_MEMBERS: &str = "countMembers";

/// Notification and request names sent to the host
pub mod events {
    pub const SESSION_OPEN: &str = "onSessionOpen";
    pub const SESSION_RESUME: &str = "onSessionResume";
    pub const SESSION_DISCONNECT: &str = "onSessionDisconnect";
    pub const SESSION_CLOSE: &str = "onSessionClose";
    pub const CONVERSATION_MEMBERS_UPDATE: &str = "onConversationMembersUpdate";
    pub const CONVERSATION_DATA_UPDATE: &str = "onConversationDataUpdate";
    pub const UNREAD_MESSAGE_COUNT_UPDATE: &str = "onUnreadMessageCountUpdate";
    pub const LAST_MESSAGE_UPDATE: &str = "onLastMessageUpdate";
    pub const LAST_RECEIPT_TIMESTAMP_UPDATE: &str = "onLastReceiptTimestampUpdate";
    pub const MESSAGE_RECEIVE: &str = "onMessageReceive";
    pub const MESSAGE_PATCH: &str = "onMessagePatch";
    pub const MESSAGE_RECEIPT: &str = "onMessageReceipt";
    pub const SIGN_SESSION_OPEN: &str = "onSignSessionOpen";
    pub const SIGN_CONVERSATION: &str = "onSignConversation";
}

/// A raw host call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            method: method.into(),
            args,
        }
    }
}

/// A host call the integration should never make.
///
/// These are bugs in the host integration, not runtime conditions; the
/// bridge refuses to continue when it sees one.
#[derive(Debug, thiserror::Error)]
pub enum ContractViolation {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("malformed arguments for `{method}`: {source}")]
    MalformedArgs {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A validated host call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub client_id: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenClient(OpenClientParams),
    CloseClient,
    CreateConversation(CreateConversationParams),
    GetConversation(ConversationTarget),
    QueryConversation(QueryConversationParams),
    SendMessage(SendMessageParams),
    ReadMessage(ConversationTarget),
    PatchMessage(PatchMessageParams),
    FetchReceiptTimestamp(ConversationTarget),
    QueryMessage(QueryMessageParams),
    UpdateMembers(MemberUpdateParams<MembershipOp>),
    UpdateBlockMembers(MemberUpdateParams<BlockOp>),
    UpdateMuteMembers(MemberUpdateParams<MuteOp>),
    QueryBlockedMembers(MemberPageParams),
    QueryMutedMembers(MemberPageParams),
    MuteToggle(MuteToggleParams),
    UpdateData(UpdateDataParams),
    CountMembers(ConversationTarget),
}

#[derive(Debug, Deserialize)]
struct Target {
    #[serde(rename = "clientId")]
    client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenClientParams {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub sign_registry: Option<SignRegistry>,
    /// Resume the previous session instead of a fresh login
    #[serde(default, alias = "r")]
    pub reconnect: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreateConversationParams {
    /// 0 unique, 1 group, 2 chat room, 4 temporary
    #[serde(default)]
    pub conv_type: i64,
    #[serde(default, alias = "m")]
    pub members: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attr: Option<Map<String, Value>>,
    #[serde(default)]
    pub ttl: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTarget {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryConversationParams {
    /// JSON-encoded predicate
    #[serde(rename = "where")]
    pub predicate: Option<String>,
    pub sort: Option<String>,
    pub skip: u32,
    pub limit: u32,
    pub flag: i64,
    pub temp_conv_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub conversation_id: String,
    pub message: MessageRecord,
    #[serde(default)]
    pub file: Option<FileParam>,
    #[serde(default)]
    pub options: Option<SendOptionsParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SendOptionsParams {
    pub receipt: Option<bool>,
    pub will: Option<bool>,
    /// 1 high, 2 normal, 3 low
    pub priority: Option<i64>,
    pub push_data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMessageParams {
    pub conversation_id: String,
    pub old_message: MessageRecord,
    #[serde(default)]
    pub new_message: Option<MessageRecord>,
    #[serde(default)]
    pub recall: bool,
    #[serde(default)]
    pub file: Option<FileParam>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BoundParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, alias = "close")]
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMessageParams {
    pub conversation_id: String,
    #[serde(default)]
    pub start: Option<BoundParams>,
    #[serde(default)]
    pub end: Option<BoundParams>,
    /// 1 new to old, 2 old to new
    #[serde(default)]
    pub direction: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Non-zero restricts the query to one message type tag
    #[serde(default, rename = "type")]
    pub type_tag: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockOp {
    Block,
    Unblock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuteOp {
    Mute,
    Unmute,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberUpdateParams<Op> {
    pub conversation_id: String,
    pub op: Op,
    #[serde(default, alias = "m")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPageParams {
    pub conversation_id: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuteToggleParams {
    pub conversation_id: String,
    pub op: MuteOp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDataParams {
    pub conversation_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Call {
    /// Validate a raw host call
    pub fn parse(call: MethodCall) -> Result<Self, ContractViolation> {
        let MethodCall { method, args } = call;
        let p = Parser {
            method: &method,
            args: &args,
        };
        let command = match method.as_str() {
            OPEN_CLIENT => Command::OpenClient(p.params()?),
            CLOSE_CLIENT => Command::CloseClient,
            CREATE_CONVERSATION => Command::CreateConversation(p.params()?),
            GET_CONVERSATION => Command::GetConversation(p.params()?),
            QUERY_CONVERSATION => Command::QueryConversation(p.params()?),
            SEND_MESSAGE => Command::SendMessage(p.params()?),
            READ_MESSAGE => Command::ReadMessage(p.params()?),
            PATCH_MESSAGE => Command::PatchMessage(p.params()?),
            FETCH_RECEIPT_TIMESTAMP => Command::FetchReceiptTimestamp(p.params()?),
            QUERY_MESSAGE => Command::QueryMessage(p.params()?),
            UPDATE_MEMBERS => Command::UpdateMembers(p.params()?),
            UPDATE_BLOCK_MEMBERS => Command::UpdateBlockMembers(p.params()?),
            UPDATE_MUTE_MEMBERS => Command::UpdateMuteMembers(p.params()?),
            QUERY_BLOCKED_MEMBERS => Command::QueryBlockedMembers(p.params()?),
            QUERY_MUTED_MEMBERS => Command::QueryMutedMembers(p.params()?),
            MUTE_TOGGLE => Command::MuteToggle(p.params()?),
            UPDATE_DATA => Command::UpdateData(p.params()?),
            COUNT_MEMBERS => Command::CountMembers(p.params()?),
            _ => return Err(ContractViolation::UnknownMethod(method.clone())),
        };
        let target: Target = p.params()?;
        Ok(Self {
            client_id: target.client_id,
            command,
        })
    }
}

struct Parser<'a> {
    method: &'a str,
    args: &'a Map<String, Value>,
}

impl Parser<'_> {
    fn params<T: DeserializeOwned>(&self) -> Result<T, ContractViolation> {
        serde_json::from_value(Value::Object(self.args.clone())).map_err(|source| {
            ContractViolation::MalformedArgs {
                method: self.method.to_string(),
                source,
            }
        })
    }
}

impl Command {
    /// Method name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenClient(_) => OPEN_CLIENT,
            Command::CloseClient => CLOSE_CLIENT,
            Command::CreateConversation(_) => CREATE_CONVERSATION,
            Command::GetConversation(_) => GET_CONVERSATION,
            Command::QueryConversation(_) => QUERY_CONVERSATION,
            Command::SendMessage(_) => SEND_MESSAGE,
            Command::ReadMessage(_) => READ_MESSAGE,
            Command::PatchMessage(_) => PATCH_MESSAGE,
            Command::FetchReceiptTimestamp(_) => FETCH_RECEIPT_TIMESTAMP,
            Command::QueryMessage(_) => QUERY_MESSAGE,
            Command::UpdateMembers(_) => UPDATE_MEMBERS,
            Command::UpdateBlockMembers(_) => UPDATE_BLOCK_MEMBERS,
            Command::UpdateMuteMembers(_) => UPDATE_MUTE_MEMBERS,
            Command::QueryBlockedMembers(_) => QUERY_BLOCKED_MEMBERS,
            Command::QueryMutedMembers(_) => QUERY_MUTED_MEMBERS,
            Command::MuteToggle(_) => MUTE_TOGGLE,
            Command::UpdateData(_) => UPDATE_DATA,
            Command::CountMembers(_) => COUNT_MEMBERS,
        }
    }
}

/// Result of one command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `{}`
    Done,
    /// `{"success": ...}`
    Success(Value),
    /// `{"error": {...}}`
    Error(ErrorRecord),
}

impl Response {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Response::Done => serializer.serialize_map(Some(0))?.end(),
            Response::Success(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("success", value)?;
                map.end()
            }
            Response::Error(error) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", error)?;
                map.end()
            }
        }
    }
}

/// An unsolicited notification for the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub method: String,
    pub args: Map<String, Value>,
}

impl EventRecord {
    pub fn new(method: &str, client_id: &str) -> Self {
        let mut args = Map::new();
        args.insert("clientId".to_string(), Value::from(client_id));
        Self {
            method: method.to_string(),
            args,
        }
    }

    /// Add an argument
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Add an argument when present
    pub fn opt_arg<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.arg(key, value),
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(method: &str, args: Value) -> Result<Call, ContractViolation> {
        Call::parse(MethodCall::new(method, args))
    }

    #[test]
    fn test_parse_open_client() {
        let call = parse(
            OPEN_CLIENT,
            json!({
                "clientId": "u1",
                "tag": "mobile",
                "signRegistry": {"sessionOpen": true, "conversation": false},
                "reconnect": true
            }),
        )
        .unwrap();
        assert_eq!(call.client_id, "u1");
        match call.command {
            Command::OpenClient(params) => {
                assert_eq!(params.tag.as_deref(), Some("mobile"));
                assert!(params.reconnect);
                let sign = params.sign_registry.unwrap();
                assert!(sign.session_open);
                assert!(!sign.conversation);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_accepts_short_aliases() {
        let call = parse(OPEN_CLIENT, json!({"clientId": "u1", "r": true})).unwrap();
        assert!(matches!(call.command, Command::OpenClient(OpenClientParams { reconnect: true, .. })));

        let call = parse(
            CREATE_CONVERSATION,
            json!({"clientId": "u1", "conv_type": 1, "m": ["a", "b"]}),
        )
        .unwrap();
        match call.command {
            Command::CreateConversation(params) => assert_eq!(params.members, vec!["a", "b"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_member_ops() {
        let call = parse(
            UPDATE_BLOCK_MEMBERS,
            json!({"clientId": "u1", "conversationId": "c1", "op": "unblock", "members": ["x"]}),
        )
        .unwrap();
        assert_eq!(
            call.command,
            Command::UpdateBlockMembers(MemberUpdateParams {
                conversation_id: "c1".into(),
                op: BlockOp::Unblock,
                members: vec!["x".into()],
            })
        );
    }

    #[test]
    fn test_unknown_method_is_a_violation() {
        let err = parse("launchRockets", json!({"clientId": "u1"})).unwrap_err();
        assert!(matches!(err, ContractViolation::UnknownMethod(m) if m == "launchRockets"));
    }

    #[test]
    fn test_missing_required_fields_are_violations() {
        let err = parse(CLOSE_CLIENT, json!({})).unwrap_err();
        assert!(matches!(err, ContractViolation::MalformedArgs { .. }));

        let err = parse(SEND_MESSAGE, json!({"clientId": "u1", "conversationId": "c1"})).unwrap_err();
        assert!(matches!(err, ContractViolation::MalformedArgs { method, .. } if method == SEND_MESSAGE));

        let err = parse(
            UPDATE_MEMBERS,
            json!({"clientId": "u1", "conversationId": "c1", "op": "promote", "members": ["x"]}),
        )
        .unwrap_err();
        assert!(matches!(err, ContractViolation::MalformedArgs { .. }));
    }

    #[test]
    fn test_query_message_bounds() {
        let call = parse(
            QUERY_MESSAGE,
            json!({
                "clientId": "u1",
                "conversationId": "c1",
                "start": {"id": "m9", "timestamp": 100, "close": true},
                "direction": 2,
                "type": -2
            }),
        )
        .unwrap();
        match call.command {
            Command::QueryMessage(params) => {
                let start = params.start.unwrap();
                assert_eq!(start.id.as_deref(), Some("m9"));
                assert!(start.closed);
                assert_eq!(params.direction, Some(2));
                assert_eq!(params.type_tag, Some(-2));
                assert!(params.end.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_response_wire_shapes() {
        assert_eq!(Response::Done.to_value(), json!({}));
        assert_eq!(Response::Success(json!(3)).to_value(), json!({"success": 3}));
        assert_eq!(
            Response::Error(ErrorRecord::new(1, "boom")).to_value(),
            json!({"error": {"code": 1, "message": "boom"}})
        );
    }

    #[test]
    fn test_event_record_builder() {
        let event = EventRecord::new(events::SESSION_CLOSE, "u1")
            .opt_arg("error", Some(json!({"code": 4111})))
            .opt_arg::<String>("reason", None);
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"method": "onSessionClose", "args": {"clientId": "u1", "error": {"code": 4111}}})
        );
    }
}
