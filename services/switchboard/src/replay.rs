//! History replay for freshly registered sockets.
//!
//! Streams the session's persisted messages in timestamp order through the
//! socket's normal egress queue, role-filtered, then marks the boundary with
//! a `history_complete` system frame.  Failures log and end the replay; they
//! never close the socket.

use sb_protocol::{ChatMessage, Role, SystemFrame};
use tracing::{debug, warn};

use crate::socket::{Credentials, Socket};
use crate::store::Store;

pub async fn replay_history(store: &Store, socket: &Socket) {
    let Some(creds) = socket.credentials().await else {
        return;
    };
    let history = match store.get_session_history(&creds.session_id).await {
        Ok(history) => history,
        Err(e) => {
            warn!(session_id = %creds.session_id, error = %e, "history fetch failed");
            let _ = socket.write_json(&SystemFrame::history_unavailable()).await;
            return;
        }
    };

    let mut delivered = 0usize;
    for message in &history {
        if !visible_to(&creds, message) {
            continue;
        }
        if let Err(e) = socket.write_json(message).await {
            warn!(
                session_id = %creds.session_id,
                user_id = %creds.user_id,
                error = %e,
                "replay aborted"
            );
            return;
        }
        delivered += 1;
    }
    if let Err(e) = socket.write_json(&SystemFrame::history_complete()).await {
        debug!(error = %e, "history_complete not delivered");
        return;
    }
    debug!(
        session_id = %creds.session_id,
        user_id = %creds.user_id,
        delivered,
        total = history.len(),
        "history replayed"
    );
}

/// Instructors see everything; students see their own sends, messages
/// addressed to them, and broadcasts (no recipient).
fn visible_to(creds: &Credentials, message: &ChatMessage) -> bool {
    match creds.role {
        Role::Instructor => true,
        Role::Student => {
            message.from_user == creds.user_id
                || message.to_user.as_deref() == Some(creds.user_id.as_str())
                || message.to_user.is_none()
        }
    }
}
