//! Host-computed signatures for privileged operations.
//!
//! When a session enables signing, the bridge asks the host for a
//! `{sign: {s, t, n}}` triple before opening the session or changing
//! conversation membership. A host that fails to produce one does not block
//! the operation: it runs unsigned and the backend decides.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::protocol::events;
use crate::host::HostChannel;
use crate::sdk::Signature;

/// Which operations a session signs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignRegistry {
    pub session_open: bool,
    pub conversation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignAction {
    Create,
    Invite,
    Kick,
}

impl SignAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SignAction::Create => "create",
            SignAction::Invite => "invite",
            SignAction::Kick => "kick",
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignAnswer {
    sign: SignTriple,
}

#[derive(Debug, Deserialize)]
struct SignTriple {
    s: String,
    t: i64,
    n: String,
}

/// Asks the host for signatures
#[derive(Clone)]
pub struct Negotiator {
    host: Arc<dyn HostChannel>,
}

impl Negotiator {
    pub fn new(host: Arc<dyn HostChannel>) -> Self {
        Self { host }
    }

    pub async fn sign_open(&self, client_id: &str) -> Option<Signature> {
        let mut args = Map::new();
        args.insert("clientId".to_string(), Value::from(client_id));
        self.request(events::SIGN_SESSION_OPEN, args).await
    }

    pub async fn sign_conversation(
        &self,
        client_id: &str,
        conversation_id: Option<&str>,
        targets: &[String],
        action: SignAction,
    ) -> Option<Signature> {
        let mut args = Map::new();
        args.insert("clientId".to_string(), Value::from(client_id));
        if let Some(conversation_id) = conversation_id {
            args.insert("conversationId".to_string(), Value::from(conversation_id));
        }
        args.insert("targetIds".to_string(), Value::from(targets.to_vec()));
        args.insert("action".to_string(), Value::from(action.as_str()));
        self.request(events::SIGN_CONVERSATION, args).await
    }

    async fn request(&self, method: &str, args: Map<String, Value>) -> Option<Signature> {
        let answer = match self.host.invoke(method, args).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Signature request {} failed, proceeding unsigned: {}", method, e);
                return None;
            }
        };

        match serde_json::from_value::<SignAnswer>(answer) {
            Ok(SignAnswer { sign }) => {
                debug!("Host signed {}", method);
                Some(Signature {
                    signature: sign.s,
                    timestamp: sign.t,
                    nonce: sign.n,
                })
            }
            Err(e) => {
                warn!("Malformed signature for {}, proceeding unsigned: {}", method, e);
                None
            }
        }
    }
}
