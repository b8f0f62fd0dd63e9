//! Execution context: cancellation signal, worker registry and the request bus.
//!
//! A [`BridgeContext`] is created once by the process and passed by reference
//! (it is cheap to clone) into every listener, forwarder and adapter. It moves
//! through three states:
//!
//! - **Running**: the bus accepts queries.
//! - **Cancelling**: [`BridgeContext::request_stop`] closed the bus and fired
//!   the cancellation signal; workers are winding down.
//! - **Stopped**: every spawned worker has exited.

use crate::codec::{HEADER_LEN, MAX_MESSAGE_SIZE};
use crate::error::{BridgeError, BridgeResult};
use crate::messages::{AgentQuery, AgentReply};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Bus capacity. tokio channels need at least one slot; [`BridgeContext::submit`]
/// additionally waits for a consumer to take the query, so the bus behaves
/// as a rendezvous.
pub const BUS_CAPACITY: usize = 1;

/// A query on the bus, with the signal telling its producer it was taken.
struct Handoff {
    query: AgentQuery,
    taken: oneshot::Sender<()>,
}

/// Lifecycle state of a [`BridgeContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Cancelling,
    Stopped,
}

/// Shared handle on the bridge's cancellation signal, workers and bus.
#[derive(Clone)]
pub struct BridgeContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    max_message_size: usize,
    token: CancellationToken,
    tracker: TaskTracker,
    /// `None` once the bus is closed. Taking it under the lock is what makes
    /// the close happen exactly once.
    bus_tx: StdMutex<Option<mpsc::Sender<Handoff>>>,
    /// Shared by every forwarder; only one pulls at a time.
    bus_rx: Mutex<mpsc::Receiver<Handoff>>,
}

impl BridgeContext {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    /// Create a context whose connections accept frames of at most
    /// `max_message_size` bytes, prefix included.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(ContextInner {
                max_message_size: max_message_size.max(HEADER_LEN + 1),
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                bus_tx: StdMutex::new(Some(tx)),
                bus_rx: Mutex::new(rx),
            }),
        }
    }

    /// Size of the frame buffer every connection and forwarder allocates.
    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    /// Run `task` as a registered worker. It is deregistered when it
    /// completes, however it completes.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Run blocking `f` on the blocking pool as a registered worker, so
    /// [`wait`](Self::wait) also waits for it.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.tracker.spawn_blocking(f)
    }

    /// Resolves once [`request_stop`](Self::request_stop) has been called.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token cancelled together with the context, or earlier on its own.
    /// Used to tear down a single connection.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Close the bus and fire the cancellation signal.
    ///
    /// Only the first call has an effect; it returns `true`. Later or
    /// concurrent calls return `false`.
    pub fn request_stop(&self) -> bool {
        let sender = self
            .inner
            .bus_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                debug!("bridge context: stopping forwarding");
                drop(tx);
                self.inner.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until every spawned worker has exited.
    ///
    /// Listeners run until cancellation, so this only returns after
    /// [`request_stop`](Self::request_stop).
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("bridge context: all agent forwarding stopped");
    }

    pub fn state(&self) -> ContextState {
        if !self.inner.token.is_cancelled() {
            ContextState::Running
        } else if self.inner.tracker.is_empty() {
            ContextState::Stopped
        } else {
            ContextState::Cancelling
        }
    }

    /// Number of workers still registered.
    pub fn workers(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Hand a query to a consumer, waiting until one takes it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::BusClosed`] if the bridge is stopping before a consumer
    /// took the query. A query that already reached the bus stays there and
    /// is answered by a draining forwarder; otherwise it is dropped, which
    /// closes its reply receiver.
    pub async fn submit(&self, query: AgentQuery) -> BridgeResult<()> {
        let tx = self
            .inner
            .bus_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BridgeError::BusClosed)?;

        let (taken_tx, taken_rx) = oneshot::channel();
        let handoff = Handoff {
            query,
            taken: taken_tx,
        };
        tokio::select! {
            _ = self.inner.token.cancelled() => return Err(BridgeError::BusClosed),
            result = tx.send(handoff) => result.map_err(|_| BridgeError::BusClosed)?,
        }
        // Holding a sender here would keep the bus open past a stop.
        drop(tx);

        tokio::select! {
            _ = self.inner.token.cancelled() => Err(BridgeError::BusClosed),
            taken = taken_rx => taken.map_err(|_| BridgeError::BusClosed),
        }
    }

    /// Pull the next query. Returns `None` once the bus is closed and drained.
    pub async fn next_query(&self) -> Option<AgentQuery> {
        let handoff = self.inner.bus_rx.lock().await.recv().await?;
        let _ = handoff.taken.send(());
        Some(handoff.query)
    }

    /// Submit `data` and wait for its reply.
    ///
    /// For front ends that perform a synchronous exchange per request rather
    /// than running a connection pump.
    pub async fn query(&self, data: Vec<u8>) -> BridgeResult<AgentReply> {
        let (query, reply_rx) = AgentQuery::new(data);
        self.submit(query).await?;

        tokio::select! {
            _ = self.inner.token.cancelled() => Err(BridgeError::BusClosed),
            reply = reply_rx => reply.map_err(|_| BridgeError::BusClosed),
        }
    }
}

impl Default for BridgeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("state", &self.state())
            .field("max_message_size", &self.max_message_size())
            .field("workers", &self.workers())
            .finish()
    }
}
