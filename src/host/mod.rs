//! Boundary to the host application.
//!
//! The host receives notifications ([`HostChannel::notify`]), answers
//! requests ([`HostChannel::invoke`]) and decides where completions run
//! ([`CompletionContext`]).

pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::bridge::protocol::EventRecord;

pub use stdio::StdioHost;

/// Errors from a host round-trip
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    /// The channel to the host is gone
    #[error("host channel closed")]
    Closed,

    /// The host answered with an error
    #[error("host rejected {method}: {message}")]
    Rejected { method: String, message: String },

    /// The host does not handle this method
    #[error("host does not implement {0}")]
    NotImplemented(String),
}

/// Channel from the bridge to the host
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Push a notification without waiting for the host
    fn notify(&self, event: EventRecord);

    /// Call a host method and wait for its answer
    async fn invoke(&self, method: &str, args: Map<String, Value>) -> Result<Value, HostError>;
}

/// A unit of host-facing work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where host-facing completions and notifications run.
///
/// Some hosts only accept calls from one particular thread or loop; those
/// plug in a context that forwards jobs there.
pub trait CompletionContext: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs jobs on the calling task
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl CompletionContext for Immediate {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Forwards jobs to a queue drained by the host
#[derive(Debug, Clone)]
pub struct QueueContext {
    tx: mpsc::UnboundedSender<Job>,
}

impl QueueContext {
    /// Create the context and the receiving end the host drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Drain jobs in order until every sender is gone
    pub async fn run(mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            job();
        }
    }
}

impl CompletionContext for QueueContext {
    fn execute(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::warn!("Completion queue closed, dropping host job");
        }
    }
}

/// Convenience for sharing contexts
pub fn immediate() -> Arc<dyn CompletionContext> {
    Arc::new(Immediate)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording host used across the crate's tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Records notifications and answers invocations from a script
    #[derive(Default)]
    pub struct RecordingHost {
        pub events: Mutex<Vec<EventRecord>>,
        pub invocations: Mutex<Vec<(String, Map<String, Value>)>>,
        pub answers: Mutex<VecDeque<Result<Value, HostError>>>,
        events_tx: Mutex<Option<mpsc::UnboundedSender<EventRecord>>>,
    }

    impl RecordingHost {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Queue the answer for the next `invoke`
        pub fn answer(&self, answer: Result<Value, HostError>) {
            self.answers.lock().unwrap().push_back(answer);
        }

        /// Stream of notifications from now on
        pub fn event_stream(&self) -> mpsc::UnboundedReceiver<EventRecord> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events_tx.lock().unwrap() = Some(tx);
            rx
        }

        pub fn methods(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.method.clone())
                .collect()
        }

        pub fn invoked(&self) -> Vec<String> {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .map(|(m, _)| m.clone())
                .collect()
        }
    }

    #[async_trait]
    impl HostChannel for RecordingHost {
        fn notify(&self, event: EventRecord) {
            if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
                let _ = tx.send(event.clone());
            }
            self.events.lock().unwrap().push(event);
        }

        async fn invoke(&self, method: &str, args: Map<String, Value>) -> Result<Value, HostError> {
            self.invocations
                .lock()
                .unwrap()
                .push((method.to_string(), args));
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(HostError::NotImplemented(method.to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_immediate_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        Immediate.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_context_preserves_order() {
        let (context, rx) = QueueContext::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            context.execute(Box::new(move || seen.lock().unwrap().push(i)));
        }
        drop(context);
        QueueContext::run(rx).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
