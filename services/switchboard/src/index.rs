//! Live connection registry.
//!
//! Three maps behind one lock: a global {user -> socket} map plus per-session
//! instructor and student sub-maps.  Registration displaces any prior socket
//! for the same user without closing it (the soft-replacement contract);
//! deregistration compares socket instance ids so a displaced socket's late
//! cleanup can never evict its replacement.

use sb_protocol::Role;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::socket::{Credentials, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("socket has no installed credentials")]
    NotAuthenticated,
}

#[derive(Default)]
struct Maps {
    by_user: HashMap<String, Arc<Socket>>,
    instructors: HashMap<String, HashMap<String, Arc<Socket>>>,
    students: HashMap<String, HashMap<String, Arc<Socket>>>,
}

impl Maps {
    fn role_map(&mut self, role: Role) -> &mut HashMap<String, HashMap<String, Arc<Socket>>> {
        match role {
            Role::Instructor => &mut self.instructors,
            Role::Student => &mut self.students,
        }
    }

    fn remove_role_entry(&mut self, creds: &Credentials, conn_id: u64) {
        let sessions = self.role_map(creds.role);
        if let Some(members) = sessions.get_mut(&creds.session_id) {
            if members
                .get(&creds.user_id)
                .is_some_and(|s| s.conn_id() == conn_id)
            {
                members.remove(&creds.user_id);
            }
            if members.is_empty() {
                sessions.remove(&creds.session_id);
            }
        }
    }
}

#[derive(Default)]
pub struct ConnectionIndex {
    maps: RwLock<Maps>,
}

impl ConnectionIndex {
    pub fn new() -> Self {
        ConnectionIndex::default()
    }

    /// Register an authenticated socket, returning the socket it displaced
    /// (if any) so the caller can send the soft replacement notice.  The
    /// displaced socket is not closed here.
    pub async fn register(
        &self,
        socket: Arc<Socket>,
    ) -> Result<Option<Arc<Socket>>, IndexError> {
        let creds = socket
            .credentials()
            .await
            .ok_or(IndexError::NotAuthenticated)?;
        let mut maps = self.maps.write().await;
        let displaced = maps.by_user.insert(creds.user_id.clone(), socket.clone());
        if let Some(prev) = &displaced {
            if let Some(prev_creds) = prev.credentials().await {
                maps.remove_role_entry(&prev_creds, prev.conn_id());
            }
        }
        maps.role_map(creds.role)
            .entry(creds.session_id.clone())
            .or_default()
            .insert(creds.user_id.clone(), socket.clone());
        Ok(displaced)
    }

    /// Remove a socket by instance identity.  If a newer socket has already
    /// replaced this one, no map is modified.
    pub async fn unregister(&self, socket: &Arc<Socket>) {
        let Some(creds) = socket.credentials().await else {
            return;
        };
        let mut maps = self.maps.write().await;
        let is_current = maps
            .by_user
            .get(&creds.user_id)
            .is_some_and(|current| current.conn_id() == socket.conn_id());
        if !is_current {
            return;
        }
        maps.by_user.remove(&creds.user_id);
        maps.remove_role_entry(&creds, socket.conn_id());
    }

    pub async fn for_user(&self, user_id: &str) -> Option<Arc<Socket>> {
        self.maps.read().await.by_user.get(user_id).cloned()
    }

    /// Snapshot of the session's connected instructors.
    pub async fn instructors(&self, session_id: &str) -> Vec<Arc<Socket>> {
        let maps = self.maps.read().await;
        maps.instructors
            .get(session_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the session's connected students.
    pub async fn students(&self, session_id: &str) -> Vec<Arc<Socket>> {
        let maps = self.maps.read().await;
        maps.students
            .get(session_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_in_session(&self, session_id: &str) -> Vec<Arc<Socket>> {
        let mut all = self.instructors(session_id).await;
        all.extend(self.students(session_id).await);
        all
    }

    pub async fn connection_count(&self) -> usize {
        self.maps.read().await.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(user: &str, role: Role, session: &str) -> Arc<Socket> {
        let (socket, _egress) = Socket::new();
        socket.set_credentials(user, role, session).await;
        // The egress queue is dropped; these tests only exercise registry
        // bookkeeping, never frame delivery.
        socket
    }

    #[tokio::test]
    async fn register_rejects_unauthenticated_sockets() {
        let index = ConnectionIndex::new();
        let (socket, _egress) = Socket::new();
        let err = index.register(socket).await.unwrap_err();
        assert_eq!(err, IndexError::NotAuthenticated);
    }

    #[tokio::test]
    async fn register_and_lookup_by_user_and_role() {
        let index = ConnectionIndex::new();
        let teach = connected("teach", Role::Instructor, "s1").await;
        let alice = connected("alice", Role::Student, "s1").await;
        let bob = connected("bob", Role::Student, "s1").await;
        assert!(index.register(teach.clone()).await.unwrap().is_none());
        assert!(index.register(alice.clone()).await.unwrap().is_none());
        assert!(index.register(bob.clone()).await.unwrap().is_none());

        let found = index.for_user("alice").await.expect("alice registered");
        assert_eq!(found.conn_id(), alice.conn_id());
        assert_eq!(index.instructors("s1").await.len(), 1);
        assert_eq!(index.students("s1").await.len(), 2);
        assert_eq!(index.all_in_session("s1").await.len(), 3);
        assert!(index.instructors("s2").await.is_empty());
        assert_eq!(index.connection_count().await, 3);
    }

    #[tokio::test]
    async fn second_registration_displaces_the_first() {
        let index = ConnectionIndex::new();
        let first = connected("alice", Role::Student, "s1").await;
        let second = connected("alice", Role::Student, "s1").await;
        index.register(first.clone()).await.unwrap();
        let displaced = index.register(second.clone()).await.unwrap().unwrap();
        assert_eq!(displaced.conn_id(), first.conn_id());

        let current = index.for_user("alice").await.unwrap();
        assert_eq!(current.conn_id(), second.conn_id());
        // Only one socket for the user remains anywhere in the index.
        assert_eq!(index.students("s1").await.len(), 1);
        assert_eq!(
            index.students("s1").await[0].conn_id(),
            second.conn_id()
        );
    }

    #[tokio::test]
    async fn stale_unregister_does_not_evict_the_replacement() {
        let index = ConnectionIndex::new();
        let first = connected("alice", Role::Student, "s1").await;
        let second = connected("alice", Role::Student, "s1").await;
        index.register(first.clone()).await.unwrap();
        index.register(second.clone()).await.unwrap();

        index.unregister(&first).await;
        let current = index.for_user("alice").await.expect("replacement intact");
        assert_eq!(current.conn_id(), second.conn_id());
        assert_eq!(index.students("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let index = ConnectionIndex::new();
        let socket = connected("alice", Role::Student, "s1").await;
        index.register(socket.clone()).await.unwrap();
        index.unregister(&socket).await;
        index.unregister(&socket).await;
        assert!(index.for_user("alice").await.is_none());
        assert!(index.students("s1").await.is_empty());
        assert_eq!(index.connection_count().await, 0);
    }

    #[tokio::test]
    async fn replacement_in_a_different_session_leaves_no_stale_entry() {
        let index = ConnectionIndex::new();
        let first = connected("alice", Role::Student, "s1").await;
        let second = connected("alice", Role::Student, "s2").await;
        index.register(first.clone()).await.unwrap();
        index.register(second.clone()).await.unwrap();

        assert!(index.students("s1").await.is_empty());
        assert_eq!(index.students("s2").await.len(), 1);
        assert_eq!(index.connection_count().await, 1);
    }

    #[tokio::test]
    async fn empty_session_submaps_are_dropped() {
        let index = ConnectionIndex::new();
        let socket = connected("teach", Role::Instructor, "s1").await;
        index.register(socket.clone()).await.unwrap();
        index.unregister(&socket).await;
        assert!(index.all_in_session("s1").await.is_empty());
    }
}
