// sb-protocol: Switchboard wire protocol types and serialization.
//
// All frames are JSON text.  Client-to-server frames parse as `ChatMessage`
// with a top-level `type` field; server-to-client frames are either the
// persisted `ChatMessage` or a `SystemFrame` with `type: "system"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum serialized size of a message's `content` object, in bytes.
pub const MAX_CONTENT_BYTES: usize = 65_536;

/// Context tag applied when a client sends an empty context.
pub const DEFAULT_CONTEXT: &str = "general";

// ---------------------------------------------------------------------------
// Roles and message taxonomy
// ---------------------------------------------------------------------------

/// Connection role, supplied at handshake time and fixed for the socket's
/// lifetime.  Determines permissible message types and default recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Instructor => "instructor",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six message kinds and their fixed fan-out topology.
///
/// | Kind                   | Sender role | Recipients                  | Needs `to_user` |
/// |------------------------|-------------|-----------------------------|-----------------|
/// | `instructor_inbox`     | student     | all instructors in session  | no              |
/// | `request_response`     | student     | all instructors in session  | no              |
/// | `analytics`            | student     | all instructors in session  | no              |
/// | `inbox_response`       | instructor  | one specific student        | yes             |
/// | `request`              | instructor  | one specific student        | yes             |
/// | `instructor_broadcast` | instructor  | all students in session     | no              |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    InstructorInbox,
    RequestResponse,
    Analytics,
    InboxResponse,
    Request,
    InstructorBroadcast,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::InstructorInbox,
        MessageType::RequestResponse,
        MessageType::Analytics,
        MessageType::InboxResponse,
        MessageType::Request,
        MessageType::InstructorBroadcast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::InstructorInbox => "instructor_inbox",
            MessageType::RequestResponse => "request_response",
            MessageType::Analytics => "analytics",
            MessageType::InboxResponse => "inbox_response",
            MessageType::Request => "request",
            MessageType::InstructorBroadcast => "instructor_broadcast",
        }
    }

    /// The role allowed to send this kind of message.
    pub fn sender_role(self) -> Role {
        match self {
            MessageType::InstructorInbox
            | MessageType::RequestResponse
            | MessageType::Analytics => Role::Student,
            MessageType::InboxResponse
            | MessageType::Request
            | MessageType::InstructorBroadcast => Role::Instructor,
        }
    }

    /// Whether the `to_user` field is required (direct kinds) or must be
    /// absent (fan-out kinds).
    pub fn requires_recipient(self) -> bool {
        matches!(self, MessageType::InboxResponse | MessageType::Request)
    }
}

impl std::str::FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message frame
// ---------------------------------------------------------------------------

/// A routed message, both on the wire and as persisted.
///
/// On ingest the server overrides `id`, `timestamp`, `from_user` and
/// `session_id` with authoritative values; any client-supplied values are
/// discarded.  Delivered frames carry the full persisted object including the
/// server-assigned id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned unique id.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Short categorization tag; empty on ingest means [`DEFAULT_CONTEXT`].
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub from_user: String,
    /// Present only for the direct kinds (`inbox_response`, `request`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    /// Free-form JSON object, at most [`MAX_CONTENT_BYTES`] serialized.
    pub content: serde_json::Value,
    /// Server-assigned instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Serialized size of `content` in bytes.
    pub fn content_size(&self) -> usize {
        serde_json::to_vec(&self.content).map_or(0, |bytes| bytes.len())
    }
}

// ---------------------------------------------------------------------------
// System frames (server -> client)
// ---------------------------------------------------------------------------

/// Out-of-band server frame: routing errors, replay boundaries, and the
/// connection-replaced notice.
///
/// ```json
/// {"type": "system", "context": "history_complete",
///  "content": {"event": "history_complete"}, "timestamp": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemFrame {
    /// Always `"system"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The event name, duplicated inside `content.event`.
    pub context: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SystemFrame {
    pub const KIND: &'static str = "system";

    fn new(event: &str, content: serde_json::Value) -> Self {
        SystemFrame {
            kind: SystemFrame::KIND.to_owned(),
            context: event.to_owned(),
            content,
            timestamp: Utc::now(),
        }
    }

    /// A routing failure reported back to the offending sender, at coarse
    /// granularity (see [`error_codes`]).
    pub fn error(code: &str, reason: &str) -> Self {
        SystemFrame::new(
            "error",
            serde_json::json!({ "event": "error", "code": code, "message": reason }),
        )
    }

    /// Marks the end of history replay on a fresh connection.
    pub fn history_complete() -> Self {
        SystemFrame::new(
            "history_complete",
            serde_json::json!({ "event": "history_complete" }),
        )
    }

    /// History could not be fetched; the connection stays open.
    pub fn history_unavailable() -> Self {
        SystemFrame::new(
            "history_unavailable",
            serde_json::json!({ "event": "history_unavailable" }),
        )
    }

    /// Soft notice to a socket displaced by a newer connection for the same
    /// user.  The peer is expected to disconnect on its own.
    pub fn connection_replaced() -> Self {
        SystemFrame::new(
            "session_ended",
            serde_json::json!({ "event": "session_ended", "reason": "Connection replaced" }),
        )
    }
}

/// Frozen coarse-granularity error codes carried in `SystemFrame::error`.
pub mod error_codes {
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const NOT_PERMITTED: &str = "NOT_PERMITTED";
    pub const DELIVERY_FAILED: &str = "DELIVERY_FAILED";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const SERVER_BUSY: &str = "SERVER_BUSY";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// User ids are 1-50 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_user_id(id: &str) -> bool {
    (1..=50).contains(&id.len()) && id.bytes().all(is_identifier_byte)
}

/// Context tags are 1-50 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_context(context: &str) -> bool {
    (1..=50).contains(&context.len()) && context.bytes().all(is_identifier_byte)
}
