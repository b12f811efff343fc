//! Message routing: validate, rate-check, persist, deliver.
//!
//! Persist-then-deliver is the load-bearing invariant here: no recipient may
//! observe a message the store has not acknowledged.  Delivery failures to
//! individual recipients are logged and never abort the remaining fan-out or
//! roll back persistence.

use chrono::Utc;
use sb_protocol::{error_codes, is_valid_context, ChatMessage, MessageType, Role, DEFAULT_CONTEXT,
    MAX_CONTENT_BYTES};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::index::ConnectionIndex;
use crate::rate_limit::RateLimiter;
use crate::socket::Socket;
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid context tag")]
    InvalidContext,
    #[error("sender is not connected")]
    SenderNotConnected,
    #[error("sender is not in the message's session")]
    SenderNotInSession,
    #[error("role '{role}' may not send '{kind}' messages")]
    UnauthorizedType { role: Role, kind: MessageType },
    #[error("message type requires a recipient")]
    MissingRecipient,
    #[error("recipient is not connected")]
    RecipientNotFound,
    #[error("recipient is not in this session")]
    RecipientNotInSession,
    #[error("content exceeds 64 KiB serialized")]
    ContentTooLarge,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl RouteError {
    /// Coarse error code for the system frame sent back to the sender.
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::RateLimitExceeded => error_codes::RATE_LIMITED,
            RouteError::SenderNotConnected
            | RouteError::SenderNotInSession
            | RouteError::UnauthorizedType { .. } => error_codes::NOT_PERMITTED,
            RouteError::InvalidContext
            | RouteError::MissingRecipient
            | RouteError::ContentTooLarge => error_codes::INVALID_MESSAGE,
            RouteError::RecipientNotFound
            | RouteError::RecipientNotInSession
            | RouteError::Store(_) => error_codes::DELIVERY_FAILED,
        }
    }

    /// Client-facing description; never exposes internals.
    pub fn client_reason(&self) -> &'static str {
        match self {
            RouteError::InvalidContext => "context must be 1-50 characters of [A-Za-z0-9_-]",
            RouteError::SenderNotConnected => "sender is not connected",
            RouteError::SenderNotInSession => "sender is not in this session",
            RouteError::UnauthorizedType { .. } => "this role may not send this message type",
            RouteError::MissingRecipient => "this message type requires a to_user",
            RouteError::RecipientNotFound => "recipient is not connected",
            RouteError::RecipientNotInSession => "recipient is not in this session",
            RouteError::ContentTooLarge => "message content exceeds 64 KiB",
            RouteError::RateLimitExceeded => "rate limit exceeded, slow down",
            RouteError::Store(_) => "message could not be persisted",
        }
    }
}

pub struct MessageRouter {
    index: Arc<ConnectionIndex>,
    store: Arc<Store>,
    limiter: Arc<RateLimiter>,
}

impl MessageRouter {
    pub fn new(
        index: Arc<ConnectionIndex>,
        store: Arc<Store>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        MessageRouter {
            index,
            store,
            limiter,
        }
    }

    /// Validate, rate-check, persist, then fan out.  Returns the persisted
    /// message (server id and timestamp assigned) on success.
    pub async fn route(&self, mut message: ChatMessage) -> Result<ChatMessage, RouteError> {
        message.id = Uuid::new_v4().to_string();
        message.timestamp = Some(Utc::now());

        if message.context.is_empty() {
            message.context = DEFAULT_CONTEXT.to_owned();
        }
        if !is_valid_context(&message.context) {
            return Err(RouteError::InvalidContext);
        }

        let sender = self
            .index
            .for_user(&message.from_user)
            .await
            .ok_or(RouteError::SenderNotConnected)?;
        let sender_creds = sender
            .credentials()
            .await
            .ok_or(RouteError::SenderNotConnected)?;
        if sender_creds.session_id != message.session_id {
            return Err(RouteError::SenderNotInSession);
        }

        if sender_creds.role != message.kind.sender_role() {
            return Err(RouteError::UnauthorizedType {
                role: sender_creds.role,
                kind: message.kind,
            });
        }

        let direct_recipient = if message.kind.requires_recipient() {
            let to_user = message
                .to_user
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or(RouteError::MissingRecipient)?;
            let recipient = self
                .index
                .for_user(to_user)
                .await
                .ok_or(RouteError::RecipientNotFound)?;
            let recipient_creds = recipient
                .credentials()
                .await
                .ok_or(RouteError::RecipientNotFound)?;
            if recipient_creds.session_id != message.session_id {
                return Err(RouteError::RecipientNotInSession);
            }
            Some(recipient)
        } else {
            // The fan-out kinds carry no recipient; drop any stray value.
            message.to_user = None;
            None
        };

        if message.content_size() > MAX_CONTENT_BYTES {
            return Err(RouteError::ContentTooLarge);
        }

        if !self.limiter.allow(&message.from_user) {
            return Err(RouteError::RateLimitExceeded);
        }

        // Durable before visible: a store failure means nobody sees it.
        self.store.store_message(&message).await?;

        let recipients = self.recipients(&message, direct_recipient).await;
        for recipient in &recipients {
            if let Err(e) = recipient.write_json(&message).await {
                let recipient_id = recipient
                    .credentials()
                    .await
                    .map(|c| c.user_id)
                    .unwrap_or_default();
                warn!(
                    message_id = %message.id,
                    recipient = %recipient_id,
                    error = %e,
                    "delivery failed"
                );
            }
        }
        debug!(
            message_id = %message.id,
            kind = %message.kind,
            recipients = recipients.len(),
            "message routed"
        );
        Ok(message)
    }

    async fn recipients(
        &self,
        message: &ChatMessage,
        direct: Option<Arc<Socket>>,
    ) -> Vec<Arc<Socket>> {
        if let Some(socket) = direct {
            return vec![socket];
        }
        match message.kind {
            MessageType::InstructorBroadcast => self.index.students(&message.session_id).await,
            _ => self.index.instructors(&message.session_id).await,
        }
    }
}
