//! Command queue and session lifecycle.
//!
//! All commands of a bridge go through one queue. The queue loop resolves the
//! target session against the registry and spawns the SDK work, so a slow SDK
//! call never holds up later commands. Opens and closes of one session take a
//! turn in the queue loop and run one after another in that order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::commands;
use super::error::BridgeError;
use super::events::spawn_pump;
use super::protocol::{events, Call, Command, EventRecord, OpenClientParams, Response};
use super::session::{Session, SessionState};
use super::{Responder, Shared};
use crate::sdk::OpenOptions;

pub(crate) struct Envelope {
    pub call: Call,
    pub responder: Responder,
}

/// Drain the queue until every sender is gone
pub(crate) async fn run(shared: Arc<Shared>, mut queue: mpsc::Receiver<Envelope>) {
    while let Some(Envelope { call, responder }) = queue.recv().await {
        let Call { client_id, command } = call;
        debug!("Dispatching {} for {:?}", command.name(), client_id);

        if client_id.is_empty() {
            let error = BridgeError::invalid("Client id is null or invalid.");
            shared.complete(responder, Response::Error(error.to_record()));
            continue;
        }

        match command {
            Command::OpenClient(params) => {
                let created = shared
                    .registry
                    .reserve_open(&client_id, || {
                        shared
                            .sdk
                            .client(&client_id, params.tag.as_deref())
                            .map(Session::new)
                    })
                    .await;
                let session = match created {
                    Ok((session, _)) => session,
                    Err(err) => {
                        shared.complete(responder, Response::Error(BridgeError::from(err).to_record()));
                        continue;
                    }
                };
                let mut turn = session.take_turn();
                let shared = shared.clone();
                tokio::spawn(async move {
                    turn.ready().await;
                    let response = open(&shared, session, params).await;
                    shared.complete(responder, response);
                });
            }
            Command::CloseClient => {
                let Some(session) = shared.registry.get(&client_id).await else {
                    shared.complete(responder, not_found(&client_id));
                    continue;
                };
                let mut turn = session.take_turn();
                let shared = shared.clone();
                tokio::spawn(async move {
                    turn.ready().await;
                    let response = close(&shared, session).await;
                    shared.complete(responder, response);
                });
            }
            command => {
                let Some(session) = shared.registry.get(&client_id).await else {
                    shared.complete(responder, not_found(&client_id));
                    continue;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    let name = command.name();
                    let response = match commands::execute(&shared, &session, command).await {
                        Ok(response) => response,
                        Err(err) => {
                            debug!("{} for {} failed: {}", name, session.client_id(), err);
                            Response::Error(err.to_record())
                        }
                    };
                    shared.complete(responder, response);
                });
            }
        }
    }
    debug!("Command queue closed");
}

fn not_found(client_id: &str) -> Response {
    Response::Error(BridgeError::ClientNotFound(client_id.to_string()).to_record())
}

/// Open `session` unless an earlier turn already did. Runs in the session's turn.
async fn open(shared: &Arc<Shared>, session: Arc<Session>, params: OpenClientParams) -> Response {
    let client_id = session.client_id().to_string();
    if session.state().is_live() {
        debug!("Session {} already open", client_id);
        session.finish_open();
        return Response::Done;
    }
    if let Some(registry) = params.sign_registry {
        session.set_sign_registry(registry).await;
    }

    let previous = session.state();
    session.set_state(SessionState::Opening);

    let signature = if session.sign_registry().await.session_open {
        shared.negotiator.sign_open(&client_id).await
    } else {
        None
    };

    // Subscribe before opening so nothing emitted right after the open is lost
    let receiver = session.client().subscribe();
    let options = OpenOptions {
        reconnect: params.reconnect,
    };
    let opened = session.client().open(options, signature).await;
    session.finish_open();
    match opened {
        Ok(()) => {
            session.mark_opened();
            session.attach_pump(spawn_pump(shared.clone(), session.clone(), receiver));
            info!("Session {} opened", client_id);
            shared.notify(EventRecord::new(events::SESSION_OPEN, &client_id));
            Response::Done
        }
        Err(err) => {
            warn!("Failed to open session {}: {}", client_id, err);
            if session.has_been_open() {
                session.set_state(previous);
            } else {
                session.set_state(SessionState::Closed);
                // A later open still waiting for its turn keeps the entry
                shared.registry.remove_if_idle(&client_id, &session).await;
            }
            Response::Error(BridgeError::from(err).to_record())
        }
    }
}

/// Close `session`. Runs in the session's turn, after every earlier open.
async fn close(shared: &Shared, session: Arc<Session>) -> Response {
    let client_id = session.client_id().to_string();

    if let Err(err) = session.client().close().await {
        warn!("Failed to close session {}: {}", client_id, err);
        return Response::Error(BridgeError::from(err).to_record());
    }

    session.stop_pump();
    session.set_state(SessionState::Closed);
    if !shared.registry.remove_if_idle(&client_id, &session).await {
        debug!("Session {} has an open queued behind the close, keeping it", client_id);
    }
    info!("Session {} closed", client_id);
    shared.notify(EventRecord::new(events::SESSION_CLOSE, &client_id));
    Response::Done
}
