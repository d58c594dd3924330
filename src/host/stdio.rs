//! JSON-lines host transport over a pair of byte streams.
//!
//! Inbound lines are calls from the host or replies to our requests:
//!
//! ```text
//! {"type":"call","id":1,"method":"openClient","args":{"clientId":"u1"}}
//! {"type":"reply","id":7,"result":{"sign":{"s":"..","t":1,"n":".."}}}
//! {"type":"reply","id":8,"error":"not signed"}
//! ```
//!
//! Outbound lines are command results, notifications and requests:
//!
//! ```text
//! {"type":"result","id":1,"result":{}}
//! {"type":"event","method":"onSessionOpen","args":{"clientId":"u1"}}
//! {"type":"request","id":7,"method":"onSignSessionOpen","args":{..}}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, warn};

use super::{HostChannel, HostError};
use crate::bridge::protocol::{Call, EventRecord, MethodCall};
use crate::bridge::Bridge;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Inbound {
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

/// A line for the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Result {
        id: u64,
        result: Value,
    },
    Event {
        method: String,
        args: Map<String, Value>,
    },
    Request {
        id: u64,
        method: String,
        args: Map<String, Value>,
    },
}

/// Receiving end of the outbound lines, drained by [`serve`]
pub struct Outbox(mpsc::UnboundedReceiver<Outbound>);

type PendingRequest = oneshot::Sender<Result<Value, HostError>>;

/// Host reached over JSON lines
pub struct StdioHost {
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Requests waiting for a `reply` line, by request id
    pending: RwLock<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
}

impl StdioHost {
    pub fn channel() -> (Arc<Self>, Outbox) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            outbound,
            pending: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        });
        (host, Outbox(rx))
    }

    fn send(&self, line: Outbound) -> Result<(), HostError> {
        self.outbound.send(line).map_err(|_| HostError::Closed)
    }

    /// Handle a `reply` line
    async fn resolve(&self, id: u64, answer: Result<Value, HostError>) {
        let mut pending = self.pending.write().await;
        match pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(answer);
            }
            None => warn!("Reply for unknown host request {}", id),
        }
    }

    /// Fail every request still waiting for the host
    async fn abandon_pending(&self) {
        let mut pending = self.pending.write().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(HostError::Closed));
        }
    }
}

#[async_trait]
impl HostChannel for StdioHost {
    fn notify(&self, event: EventRecord) {
        let line = Outbound::Event {
            method: event.method,
            args: event.args,
        };
        if self.send(line).is_err() {
            debug!("Host output closed, dropping event");
        }
    }

    async fn invoke(&self, method: &str, args: Map<String, Value>) -> Result<Value, HostError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            pending.insert(id, tx);
        }

        let request = Outbound::Request {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.send(request) {
            let mut pending = self.pending.write().await;
            pending.remove(&id);
            return Err(e);
        }

        // No timeout: the host owns the request until it replies or goes away.
        rx.await.unwrap_or(Err(HostError::Closed))
    }
}

/// Pump calls from `reader` into the bridge and lines from the bridge into
/// `writer`, until the reader reaches end of input.
///
/// A call the bridge cannot accept (unknown method, malformed arguments)
/// ends the loop with an error.
pub async fn serve<R, W>(
    bridge: Arc<Bridge>,
    host: Arc<StdioHost>,
    outbox: Outbox,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(write_lines(writer, outbox.0));

    let result = read_lines(&bridge, &host, reader).await;
    host.abandon_pending().await;
    result
}

async fn read_lines<R>(bridge: &Bridge, host: &StdioHost, reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from host")?
    {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Inbound>(&line) {
            Ok(Inbound::Call { id, method, args }) => {
                let call = Call::parse(MethodCall { method, args })
                    .context("Host sent a call the bridge cannot accept")?;
                let outbound = host.outbound.clone();
                bridge
                    .submit(
                        call,
                        Box::new(move |response| {
                            let _ = outbound.send(Outbound::Result {
                                id,
                                result: response.to_value(),
                            });
                        }),
                    )
                    .await;
            }
            Ok(Inbound::Reply { id, result, error }) => {
                let answer = match error {
                    Some(message) => Err(HostError::Rejected {
                        method: format!("request {}", id),
                        message,
                    }),
                    None => Ok(result),
                };
                host.resolve(id, answer).await;
            }
            Err(e) => {
                warn!("Failed to parse host line: {} - line: {}", e, line);
            }
        }
    }

    debug!("Host input closed");
    Ok(())
}

async fn write_lines<W>(mut writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&line) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize host line: {}", e);
                continue;
            }
        };

        if let Err(e) = writer.write_all(json.as_bytes()).await {
            error!("Failed to write to host: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!("Failed to write newline to host: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush host output: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::host::immediate;
    use crate::sdk::MemorySdk;
    use serde_json::json;
    use tokio::io::{duplex, AsyncBufReadExt, DuplexStream, Lines};

    struct Harness {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
        served: tokio::task::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(sdk: Arc<MemorySdk>) -> Self {
            let (host, outbox) = StdioHost::channel();
            let bridge = Bridge::new(sdk, host.clone(), immediate(), BridgeConfig::default());
            let (input, host_reader) = duplex(64 * 1024);
            let (host_writer, output) = duplex(64 * 1024);
            let served = tokio::spawn(serve(bridge, host, outbox, host_reader, host_writer));
            Self {
                input,
                output: BufReader::new(output).lines(),
                served,
            }
        }

        async fn send(&mut self, line: Value) {
            let mut text = line.to_string();
            text.push('\n');
            self.input.write_all(text.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = self.output.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        /// Next line with the given `type`, skipping others
        async fn next_of(&mut self, kind: &str) -> Value {
            loop {
                let line = self.next().await;
                if line["type"] == kind {
                    return line;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_open_send_and_receive_over_lines() {
        let sdk = MemorySdk::new();
        let mut harness = Harness::start(sdk.clone());

        harness
            .send(json!({"type": "call", "id": 1, "method": "openClient", "args": {"clientId": "alice"}}))
            .await;
        let result = harness.next_of("result").await;
        assert_eq!(result, json!({"type": "result", "id": 1, "result": {}}));

        harness
            .send(json!({"type": "call", "id": 2, "method": "openClient", "args": {"clientId": "bob"}}))
            .await;
        assert_eq!(harness.next_of("result").await["id"], json!(2));

        harness
            .send(json!({
                "type": "call", "id": 3, "method": "createConversation",
                "args": {"clientId": "alice", "conv_type": 1, "members": ["bob"], "name": "pair"}
            }))
            .await;
        let created = harness.next_of("result").await;
        let conversation_id = created["result"]["success"]["objectId"]
            .as_str()
            .unwrap()
            .to_string();

        harness
            .send(json!({
                "type": "call", "id": 4, "method": "sendMessage",
                "args": {"clientId": "alice", "conversationId": conversation_id, "message": {"text": "hello"}}
            }))
            .await;

        let mut received = None;
        let mut sent = None;
        while received.is_none() || sent.is_none() {
            let line = harness.next().await;
            if line["type"] == "event"
                && line["method"] == "onMessageReceive"
                && line["args"]["clientId"] == "bob"
            {
                received = Some(line);
            } else if line["type"] == "result" && line["id"] == 4 {
                sent = Some(line);
            }
        }
        let received = received.unwrap();
        assert_eq!(received["args"]["conversationId"], json!(conversation_id));
        assert_eq!(received["args"]["message"]["text"], json!("hello"));
        assert_eq!(received["args"]["message"]["from"], json!("alice"));
        assert!(sent.unwrap()["result"]["success"]["id"].is_string());
    }

    #[tokio::test]
    async fn test_signature_request_round_trip() {
        let sdk = MemorySdk::new();
        let mut harness = Harness::start(sdk.clone());

        harness
            .send(json!({
                "type": "call", "id": 1, "method": "openClient",
                "args": {"clientId": "alice", "signRegistry": {"sessionOpen": true}}
            }))
            .await;

        let request = harness.next_of("request").await;
        assert_eq!(request["method"], json!("onSignSessionOpen"));
        assert_eq!(request["args"]["clientId"], json!("alice"));

        harness
            .send(json!({
                "type": "reply", "id": request["id"],
                "result": {"sign": {"s": "sig", "t": 1705689600, "n": "nonce"}}
            }))
            .await;

        let result = harness.next_of("result").await;
        assert_eq!(result["result"], json!({}));
        let signatures = sdk.signatures();
        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].1.signature, "sig");
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let sdk = MemorySdk::new();
        let mut harness = Harness::start(sdk);

        harness.input.write_all(b"not json\n\n").await.unwrap();
        harness
            .send(json!({"type": "call", "id": 9, "method": "closeClient", "args": {"clientId": "ghost"}}))
            .await;

        let result = harness.next_of("result").await;
        assert_eq!(result["id"], json!(9));
        assert_eq!(result["result"]["error"]["code"], json!(9973));
    }

    #[tokio::test]
    async fn test_unknown_method_stops_serving() {
        let sdk = MemorySdk::new();
        let mut harness = Harness::start(sdk);

        harness
            .send(json!({"type": "call", "id": 1, "method": "launchRockets", "args": {"clientId": "u"}}))
            .await;

        let outcome = harness.served.await.unwrap();
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_end_of_input_fails_pending_requests() {
        let (host, _outbox) = StdioHost::channel();
        let waiting = {
            let host = host.clone();
            tokio::spawn(async move { host.invoke("onSignConversation", Map::new()).await })
        };
        tokio::task::yield_now().await;
        while host.pending.read().await.is_empty() {
            tokio::task::yield_now().await;
        }
        host.abandon_pending().await;
        assert_eq!(waiting.await.unwrap(), Err(HostError::Closed));
    }
}
