//! Central serial event loop.
//!
//! One task drains three bounded ingress queues (messages, registrations,
//! deregistrations) and dispatches into the router and index.  All producer
//! enqueues are non-blocking; a full queue is reported as [`HubError::ChannelFull`]
//! and treated by producers as transient.
//!
//! Before routing, the sender's installed credentials overwrite `from_user`
//! and `session_id` on the message so clients cannot spoof either.

use sb_protocol::{ChatMessage, SystemFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::index::ConnectionIndex;
use crate::replay;
use crate::router::MessageRouter;
use crate::socket::Socket;
use crate::store::Store;

pub const MESSAGE_QUEUE_CAPACITY: usize = 1000;
pub const REGISTRATION_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub queue full")]
    ChannelFull,
    #[error("hub stopped")]
    Stopped,
}

/// Cloneable handle; the loop task owns the receiving ends.
#[derive(Clone)]
pub struct Hub {
    message_tx: mpsc::Sender<(Arc<Socket>, ChatMessage)>,
    register_tx: mpsc::Sender<Arc<Socket>>,
    deregister_tx: mpsc::Sender<Arc<Socket>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Hub {
    pub fn spawn(
        router: MessageRouter,
        index: Arc<ConnectionIndex>,
        store: Arc<Store>,
    ) -> Hub {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let (register_tx, register_rx) = mpsc::channel(REGISTRATION_QUEUE_CAPACITY);
        let (deregister_tx, deregister_rx) = mpsc::channel(REGISTRATION_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let hub_loop = HubLoop {
            router,
            index,
            store,
            message_rx,
            register_rx,
            deregister_rx,
            shutdown_rx,
        };
        let worker = tokio::spawn(hub_loop.run());

        Hub {
            message_tx,
            register_tx,
            deregister_tx,
            shutdown_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    pub fn submit_message(
        &self,
        sender: Arc<Socket>,
        message: ChatMessage,
    ) -> Result<(), HubError> {
        self.message_tx
            .try_send((sender, message))
            .map_err(into_hub_error)
    }

    pub fn submit_registration(&self, socket: Arc<Socket>) -> Result<(), HubError> {
        self.register_tx.try_send(socket).map_err(into_hub_error)
    }

    pub fn submit_deregistration(&self, socket: Arc<Socket>) -> Result<(), HubError> {
        self.deregister_tx.try_send(socket).map_err(into_hub_error)
    }

    /// Stop the loop.  Safe from any task; a concurrent second call is a
    /// no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loop task to finish; used during graceful shutdown.
    pub async fn join(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn into_hub_error<T>(err: mpsc::error::TrySendError<T>) -> HubError {
    match err {
        mpsc::error::TrySendError::Full(_) => HubError::ChannelFull,
        mpsc::error::TrySendError::Closed(_) => HubError::Stopped,
    }
}

struct HubLoop {
    router: MessageRouter,
    index: Arc<ConnectionIndex>,
    store: Arc<Store>,
    message_rx: mpsc::Receiver<(Arc<Socket>, ChatMessage)>,
    register_rx: mpsc::Receiver<Arc<Socket>>,
    deregister_rx: mpsc::Receiver<Arc<Socket>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HubLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                Some(socket) = self.register_rx.recv() => self.handle_registration(socket).await,
                Some(socket) = self.deregister_rx.recv() => self.index.unregister(&socket).await,
                Some((sender, message)) = self.message_rx.recv() => {
                    self.handle_message(sender, message).await;
                }
                else => break,
            }
        }
        info!("hub loop stopped");
    }

    async fn handle_registration(&self, socket: Arc<Socket>) {
        match self.index.register(socket.clone()).await {
            Ok(displaced) => {
                if let Some(stale) = displaced {
                    // Soft replacement: notify, never force-close.  The peer
                    // is expected to disconnect; otherwise its read deadline
                    // evicts it.
                    tokio::spawn(async move {
                        if let Err(e) =
                            stale.write_json(&SystemFrame::connection_replaced()).await
                        {
                            debug!(error = %e, "replacement notice not delivered");
                        }
                    });
                }
                let store = self.store.clone();
                tokio::spawn(async move {
                    replay::replay_history(&store, &socket).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "registration rejected, closing socket");
                socket.close();
            }
        }
    }

    async fn handle_message(&self, sender: Arc<Socket>, mut message: ChatMessage) {
        let Some(creds) = sender.credentials().await else {
            let frame = SystemFrame::error(
                sb_protocol::error_codes::NOT_PERMITTED,
                "socket is not authenticated",
            );
            let _ = sender.write_json(&frame).await;
            return;
        };
        message.from_user = creds.user_id.clone();
        message.session_id = creds.session_id.clone();

        match self.router.route(message).await {
            Ok(routed) => {
                debug!(message_id = %routed.id, from_user = %creds.user_id, "routed");
            }
            Err(e) => {
                warn!(from_user = %creds.user_id, error = %e, "message rejected");
                let frame = SystemFrame::error(e.code(), e.client_reason());
                if let Err(write_err) = sender.write_json(&frame).await {
                    debug!(error = %write_err, "error frame not delivered");
                }
            }
        }
    }
}
