//! One client session as seen by the bridge.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use super::signature::SignRegistry;
use crate::sdk::ImClient;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    /// Connection lost, the SDK is recovering
    Paused,
    /// Dropped by the server with the given code
    Failed { code: i64 },
}

impl SessionState {
    /// Open or temporarily disconnected
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Paused)
    }
}

pub struct Session {
    client_id: String,
    client: Arc<dyn ImClient>,
    sign: RwLock<SignRegistry>,
    state: watch::Sender<SessionState>,
    ever_opened: AtomicBool,
    /// Opens dispatched but not finished yet
    pending_opens: AtomicUsize,
    /// Released when the last queued open or close is done
    last_turn: Mutex<Option<oneshot::Receiver<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(client: Arc<dyn ImClient>) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Closed);
        Arc::new(Self {
            client_id: client.client_id().to_string(),
            client,
            sign: RwLock::new(SignRegistry::default()),
            state,
            ever_opened: AtomicBool::new(false),
            pending_opens: AtomicUsize::new(0),
            last_turn: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tag(&self) -> Option<&str> {
        self.client.tag()
    }

    pub fn client(&self) -> &Arc<dyn ImClient> {
        &self.client
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub async fn sign_registry(&self) -> SignRegistry {
        *self.sign.read().await
    }

    pub async fn set_sign_registry(&self, registry: SignRegistry) {
        *self.sign.write().await = registry;
    }

    /// Record a successful open
    pub fn mark_opened(&self) {
        self.ever_opened.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Open);
    }

    pub fn has_been_open(&self) -> bool {
        self.ever_opened.load(Ordering::SeqCst)
    }

    /// Count an open that was dispatched for this session
    pub fn begin_open(&self) {
        self.pending_opens.fetch_add(1, Ordering::SeqCst);
    }

    pub fn finish_open(&self) {
        self.pending_opens.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending_opens(&self) -> usize {
        self.pending_opens.load(Ordering::SeqCst)
    }

    /// Queue behind the previous open or close of this session.
    ///
    /// Turns are handed out in call order, so lifecycle changes reach the SDK
    /// in the order the host sent them.
    pub fn take_turn(&self) -> Turn {
        let (done, released) = oneshot::channel();
        let previous = self
            .last_turn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(released);
        Turn {
            previous,
            _done: done,
        }
    }

    /// Replace the event pump, stopping the previous one
    pub fn attach_pump(&self, handle: JoinHandle<()>) {
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Place in the lifecycle queue of a session; dropping it lets the next one run
pub struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    /// Wait until every earlier turn has been dropped
    pub async fn ready(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            // The sender is only ever dropped, never used
            let _ = previous.await;
            self.previous = None;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{ImSdk, MemorySdk};

    #[tokio::test]
    async fn test_lifecycle_flags() {
        let sdk = MemorySdk::new();
        let session = Session::new(sdk.client("u1", Some("web")).unwrap());
        assert_eq!(session.client_id(), "u1");
        assert_eq!(session.tag(), Some("web"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.has_been_open());

        let mut watcher = session.watch_state();
        session.begin_open();
        session.begin_open();
        session.mark_opened();
        session.finish_open();
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), SessionState::Open);
        assert!(session.has_been_open());
        assert_eq!(session.pending_opens(), 1);
    }

    #[tokio::test]
    async fn test_turns_run_in_call_order() {
        let sdk = MemorySdk::new();
        let session = Session::new(sdk.client("u1", None).unwrap());
        let first = session.take_turn();
        let mut second = session.take_turn();
        let mut third = session.take_turn();

        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), second.ready()).await;
        assert!(waiting.is_err());

        drop(first);
        second.ready().await;
        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), third.ready()).await;
        assert!(waiting.is_err());

        drop(second);
        third.ready().await;
    }

    #[tokio::test]
    async fn test_attach_pump_aborts_previous() {
        let sdk = MemorySdk::new();
        let session = Session::new(sdk.client("u1", None).unwrap());
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        session.attach_pump(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        }));
        session.attach_pump(tokio::spawn(std::future::pending::<()>()));
        assert!(alive_rx.await.is_err());
        session.stop_pump();
    }
}
