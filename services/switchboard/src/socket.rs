//! Per-user connection handle.
//!
//! A `Socket` wraps one duplex WebSocket and serializes all outbound frames
//! through a bounded egress queue consumed by a single writer task.  That
//! single-writer discipline is what keeps frames from concurrent producers
//! (router fan-out, replay, system notices, pings) from interleaving.
//!
//! The writer task is generic over the sink so tests can drive it without a
//! network socket; the egress queue itself is directly observable in-crate.

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use sb_protocol::Role;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::debug;

/// Egress queue capacity, frames.
pub const EGRESS_CAPACITY: usize = 100;
/// Budget for enqueueing a frame and for each underlying socket write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("write timed out")]
    WriteTimeout,
    #[error("payload serialization failed")]
    InvalidPayload,
}

/// Identity installed between construction and Index registration.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub role: Role,
    pub session_id: String,
}

#[derive(Debug)]
pub struct Socket {
    conn_id: u64,
    egress_tx: mpsc::Sender<Message>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    identity: RwLock<Option<Credentials>>,
}

/// The consuming half of a socket's egress queue, run by the writer task.
pub struct EgressQueue {
    pub(crate) rx: mpsc::Receiver<Message>,
    pub(crate) close_rx: watch::Receiver<bool>,
}

impl Socket {
    /// Build a socket and its egress queue.  The caller hands the queue to
    /// [`EgressQueue::run`] on the connection's sink half.
    pub fn new() -> (Arc<Socket>, EgressQueue) {
        let (egress_tx, rx) = mpsc::channel(EGRESS_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let socket = Arc::new(Socket {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            egress_tx,
            closed: AtomicBool::new(false),
            close_tx,
            identity: RwLock::new(None),
        });
        (socket, EgressQueue { rx, close_rx })
    }

    /// Process-unique instance id; the Index compares these so a stale
    /// socket's cleanup can never evict its replacement.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Serialize `value` and enqueue the frame.  Ordering across concurrent
    /// callers is the enqueue order.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), SocketError> {
        let json = serde_json::to_string(value).map_err(|_| SocketError::InvalidPayload)?;
        self.send_frame(Message::Text(json.into())).await
    }

    /// Enqueue a raw frame (used for control pings).
    pub async fn send_frame(&self, frame: Message) -> Result<(), SocketError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SocketError::ConnectionClosed);
        }
        match self.egress_tx.send_timeout(frame, WRITE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(SocketError::WriteTimeout),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SocketError::ConnectionClosed),
        }
    }

    /// Idempotent: signals the writer task and reader to terminate.  Returns
    /// `true` only for the call that performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.close_tx.send(true);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install the authenticated identity.  Called exactly once between
    /// construction and Index registration.
    pub async fn set_credentials(&self, user_id: &str, role: Role, session_id: &str) {
        *self.identity.write().await = Some(Credentials {
            user_id: user_id.to_owned(),
            role,
            session_id: session_id.to_owned(),
        });
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.identity.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.identity.read().await.is_some()
    }
}

impl EgressQueue {
    /// The single consumer of the egress queue.
    ///
    /// Each frame gets a 5-second write budget; any write error or timeout
    /// terminates the task, so the socket is considered dead on the next
    /// send.  On termination the remaining queued frames are drained and
    /// discarded, and the sink is closed exactly once.
    pub async fn run<S>(mut self, mut sink: S)
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.close_rx.changed() => break,
                frame = self.rx.recv() => match frame {
                    Some(frame) => {
                        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(error = %e, "egress write failed");
                                break;
                            }
                            Err(_) => {
                                debug!("egress write timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                },
            }
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        let _ = sink.close().await;
    }
}
