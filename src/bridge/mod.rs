//! The bridge between a host application and the messaging SDK.
//!
//! Host calls enter through [`Bridge::handle`] (raw `{method, args}`) or
//! [`Bridge::submit`] (already validated). Each call is answered exactly once
//! through its [`Responder`], on the configured [`CompletionContext`]. SDK
//! events reach the host as notifications on the same context.

pub mod commands;
mod dispatcher;
pub mod error;
mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod signature;

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::codec::ErrorRecord;
use crate::host::{CompletionContext, HostChannel};
use crate::sdk::ImSdk;

pub use commands::MemberOperationResult;
pub use error::{BridgeError, BridgeResult};
pub use protocol::{Call, Command, ContractViolation, EventRecord, MethodCall, Response};
pub use registry::Registry;
pub use session::{Session, SessionState};
pub use signature::{Negotiator, SignAction, SignRegistry};

use dispatcher::Envelope;

/// Default number of queued commands before `submit` waits
pub const DEFAULT_COMMAND_BUFFER: usize = 64;
/// Default page size for message and member queries
pub const DEFAULT_QUERY_LIMIT: u32 = 50;

/// Receives the result of one command
pub type Responder = Box<dyn FnOnce(Response) + Send + 'static>;

/// Tunables of a bridge instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Capacity of the command queue
    pub command_buffer: usize,
    /// Page size used when a query does not name one
    pub default_query_limit: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            default_query_limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

/// State shared by the queue loop, spawned commands and event pumps
pub(crate) struct Shared {
    pub sdk: Arc<dyn ImSdk>,
    pub host: Arc<dyn HostChannel>,
    pub context: Arc<dyn CompletionContext>,
    pub registry: Registry,
    pub negotiator: Negotiator,
    pub config: BridgeConfig,
}

impl Shared {
    /// Push a notification to the host through the completion context
    pub fn notify(&self, event: EventRecord) {
        let host = self.host.clone();
        self.context.execute(Box::new(move || host.notify(event)));
    }

    /// Deliver a command result through the completion context
    pub fn complete(&self, responder: Responder, response: Response) {
        self.context.execute(Box::new(move || responder(response)));
    }
}

pub struct Bridge {
    queue: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
}

impl Bridge {
    /// Create a bridge and start its command queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        sdk: Arc<dyn ImSdk>,
        host: Arc<dyn HostChannel>,
        context: Arc<dyn CompletionContext>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.command_buffer.max(1));
        let shared = Arc::new(Shared {
            sdk,
            negotiator: Negotiator::new(host.clone()),
            host,
            context,
            registry: Registry::new(),
            config,
        });
        tokio::spawn(dispatcher::run(shared.clone(), rx));
        Arc::new(Self { queue, shared })
    }

    /// Queue a validated call
    pub async fn submit(&self, call: Call, responder: Responder) {
        if let Err(mpsc::error::SendError(envelope)) =
            self.queue.send(Envelope { call, responder }).await
        {
            warn!("Command queue is gone, rejecting {}", envelope.call.command.name());
            let error = ErrorRecord::unexpected("bridge is shut down");
            self.shared.complete(envelope.responder, Response::Error(error));
        }
    }

    /// Validate and queue a raw host call.
    ///
    /// # Panics
    ///
    /// Panics on an unknown method name or arguments that do not have the
    /// shape the method requires. Both are integration bugs in the host.
    pub async fn handle(&self, call: MethodCall, responder: Responder) {
        match Call::parse(call) {
            Ok(call) => self.submit(call, responder).await,
            Err(violation) => panic!("contract violation: {violation}"),
        }
    }

    /// Run a raw host call and wait for its result
    pub async fn call(&self, call: MethodCall) -> Response {
        let (tx, rx) = oneshot::channel();
        self.handle(
            call,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        )
        .await;
        rx.await
            .unwrap_or_else(|_| Response::Error(ErrorRecord::unexpected("result was dropped")))
    }

    pub async fn session_state(&self, client_id: &str) -> Option<SessionState> {
        let session = self.shared.registry.get(client_id).await?;
        Some(session.state())
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.shared.registry.client_ids().await
    }

    /// Close every session and forget it
    pub async fn shutdown(&self) {
        let sessions = self.shared.registry.drain().await;
        info!("Shutting down {} sessions", sessions.len());
        join_all(sessions.into_iter().map(|session| async move {
            session.stop_pump();
            if session.state().is_live() {
                if let Err(e) = session.client().close().await {
                    warn!("Failed to close session {}: {}", session.client_id(), e);
                }
            }
            session.set_state(SessionState::Closed);
        }))
        .await;
    }
}
