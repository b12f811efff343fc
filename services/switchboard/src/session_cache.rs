//! In-memory index of active sessions.
//!
//! Backs the sub-millisecond handshake membership check.  Invariant: an entry
//! is present if and only if the session's stored status is `active`.  All
//! Store calls happen outside the lock so cache readers never serialize on
//! the persistence worker.

use chrono::Utc;
use sb_protocol::{is_valid_user_id, Role};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::store::{SessionRecord, SessionStatus, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session name must be 1-200 characters")]
    InvalidName,
    #[error("creator id is not a valid user id")]
    InvalidCreator,
    #[error("a session requires at least one enrolled student")]
    EmptyEnrollment,
    #[error("invalid student id '{0}'")]
    InvalidStudentId(String),
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already ended")]
    AlreadyEnded(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handshake-path validation failures, mapped to 404/403 at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidateError {
    #[error("session not found")]
    SessionNotFound,
    #[error("user is not enrolled in this session")]
    Unauthorized,
}

pub struct SessionCache {
    store: Arc<Store>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionCache {
    pub fn new(store: Arc<Store>) -> Self {
        SessionCache {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache contents with the store's active-session
    /// enumeration.  Called once at startup.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let active = self.store.list_active_sessions().await?;
        let count = active.len();
        let map = active
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        *self.sessions.write().await = map;
        Ok(count)
    }

    /// Validate, persist, and cache a new session.
    pub async fn create(
        &self,
        name: &str,
        created_by: &str,
        students: &[String],
    ) -> Result<SessionRecord, SessionError> {
        let name = name.trim();
        if !(1..=200).contains(&name.chars().count()) {
            return Err(SessionError::InvalidName);
        }
        if !is_valid_user_id(created_by) {
            return Err(SessionError::InvalidCreator);
        }
        let mut seen = HashSet::new();
        let mut enrolled = Vec::with_capacity(students.len());
        for id in students {
            if !is_valid_user_id(id) {
                return Err(SessionError::InvalidStudentId(id.clone()));
            }
            if seen.insert(id.as_str()) {
                enrolled.push(id.clone());
            }
        }
        if enrolled.is_empty() {
            return Err(SessionError::EmptyEnrollment);
        }

        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            created_by: created_by.to_owned(),
            students: enrolled,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
        };
        self.store.create_session(&record).await?;
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        info!(session_id = %record.id, name = %record.name, "session created");
        Ok(record)
    }

    /// End a session.  The database update precedes cache eviction so readers
    /// never see an ended session still cached.
    pub async fn terminate(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let cached = { self.sessions.read().await.get(id).cloned() };
        let mut record = match cached {
            Some(record) => record,
            None => self
                .store
                .get_session(id)
                .await?
                .ok_or_else(|| SessionError::NotFound(id.to_owned()))?,
        };
        if record.status == SessionStatus::Ended {
            return Err(SessionError::AlreadyEnded(id.to_owned()));
        }

        let end_time = Utc::now();
        let transitioned = self.store.end_session(id, end_time).await?;
        self.sessions.write().await.remove(id);
        if !transitioned {
            // Lost a race with a concurrent terminate.
            return Err(SessionError::AlreadyEnded(id.to_owned()));
        }
        record.end_time = Some(end_time);
        record.status = SessionStatus::Ended;
        info!(session_id = %id, "session ended");
        Ok(record)
    }

    /// Cache-only membership check for the connection handshake.  Instructors
    /// may join any active session; students must be enrolled.
    pub async fn validate(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), ValidateError> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or(ValidateError::SessionNotFound)?;
        match role {
            Role::Instructor => Ok(()),
            Role::Student => {
                if session.students.iter().any(|s| s == user_id) {
                    Ok(())
                } else {
                    Err(ValidateError::Unauthorized)
                }
            }
        }
    }

    /// Cache-first lookup, falling back to the store for ended sessions.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        if let Some(record) = self.sessions.read().await.get(id) {
            return Ok(Some(record.clone()));
        }
        self.store.get_session(id).await
    }

    /// Snapshot of the active sessions.
    pub async fn list(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
