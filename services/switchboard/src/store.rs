//! Embedded SQLite persistence.
//!
//! Exactly one write-worker task processes all mutations; reads run
//! concurrently against the pool.  Mutations are packaged as [`WriteCommand`]
//! values carrying a oneshot reply sender, enqueued on a bounded channel.  The
//! worker executes each command and on error waits 5 seconds and retries
//! exactly once.  Callers block up to 30 seconds overall.
//!
//! # SQLite settings
//! Applied at open: WAL journal mode, foreign_keys=ON, 5-second busy timeout,
//! pool capped by config (default 10).

use chrono::{DateTime, Utc};
use sb_protocol::{ChatMessage, MessageType};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub const WRITE_QUEUE_CAPACITY: usize = 100;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(5);
const WRITE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error("write worker is not running")]
    WorkerGone,
    #[error("store write timed out")]
    Timeout,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

/// A classroom session.  Immutable after creation except for the monotonic
/// (end_time, status) transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub students: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

// ---------------------------------------------------------------------------
// Write worker plumbing
// ---------------------------------------------------------------------------

enum WriteCommand {
    CreateSession {
        record: SessionRecord,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    /// Reply carries `true` when a row transitioned active -> ended.
    EndSession {
        id: String,
        end_time: DateTime<Utc>,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    InsertMessage {
        message: ChatMessage,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

pub struct Store {
    pool: SqlitePool,
    write_tx: mpsc::Sender<WriteCommand>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open (or create) the database, run migrations, and start the write
    /// worker.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_max)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .connect_with(options)
            .await?;

        sqlx::migrate::Migrator::new(config.migrations_path.as_path())
            .await?
            .run(&pool)
            .await?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(write_worker(pool.clone(), write_rx, shutdown_rx));

        Ok(Store {
            pool,
            write_tx,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    // -----------------------------------------------------------------------
    // Mutations (funneled through the worker)
    // -----------------------------------------------------------------------

    pub async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(
            WriteCommand::CreateSession {
                record: record.clone(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    /// Returns `true` when this call performed the active -> ended
    /// transition, `false` when the session was already ended or unknown.
    pub async fn end_session(
        &self,
        id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(
            WriteCommand::EndSession {
                id: id.to_owned(),
                end_time,
                reply,
            },
            reply_rx,
        )
        .await
    }

    pub async fn store_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(
            WriteCommand::InsertMessage {
                message: message.clone(),
                reply,
            },
            reply_rx,
        )
        .await
    }

    async fn submit<T>(
        &self,
        command: WriteCommand,
        reply_rx: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let send_and_wait = async {
            self.write_tx
                .send(command)
                .await
                .map_err(|_| StoreError::WorkerGone)?;
            reply_rx.await.map_err(|_| StoreError::WorkerGone)?
        };
        match tokio::time::timeout(WRITE_DEADLINE, send_and_wait).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    // -----------------------------------------------------------------------
    // Reads (straight to the pool)
    // -----------------------------------------------------------------------

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, created_by, student_ids, start_time, end_time, status
             FROM sessions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_session).transpose()
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, created_by, student_ids, start_time, end_time, status
             FROM sessions WHERE status = 'active' ORDER BY start_time",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_session).collect()
    }

    /// All messages for a session, timestamp ascending.  The history replay
    /// read path; backed by the (session_id, timestamp) index.
    pub async fn get_session_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, type, context, from_user, to_user, content, timestamp
             FROM messages WHERE session_id = ?1 ORDER BY timestamp ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_message).collect()
    }

    pub async fn count_messages(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Cheap reachability probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Signal the worker to drain and exit, wait for it, close the pool.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        self.pool.close().await;
        info!("store closed");
    }
}

// ---------------------------------------------------------------------------
// The single write worker
// ---------------------------------------------------------------------------

async fn write_worker(
    pool: SqlitePool,
    mut commands: mpsc::Receiver<WriteCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => execute(&pool, command).await,
                None => break,
            },
            _ = shutdown.changed() => {
                // Drain whatever is already queued, then exit.
                commands.close();
                while let Ok(command) = commands.try_recv() {
                    execute(&pool, command).await;
                }
                break;
            }
        }
    }
    info!("store write worker stopped");
}

async fn execute(pool: &SqlitePool, command: WriteCommand) {
    match command {
        WriteCommand::CreateSession { record, reply } => {
            let _ = reply.send(run_twice(|| insert_session(pool, &record)).await);
        }
        WriteCommand::EndSession {
            id,
            end_time,
            reply,
        } => {
            let _ = reply.send(run_twice(|| mark_session_ended(pool, &id, end_time)).await);
        }
        WriteCommand::InsertMessage { message, reply } => {
            let _ = reply.send(run_twice(|| insert_message(pool, &message)).await);
        }
    }
}

/// Run a mutation; on failure wait 5 s and retry exactly once.
async fn run_twice<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, "store write failed, retrying once");
            tokio::time::sleep(WRITE_RETRY_DELAY).await;
            op().await
        }
    }
}

async fn insert_session(pool: &SqlitePool, record: &SessionRecord) -> Result<(), StoreError> {
    let students = serde_json::to_string(&record.students)?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO sessions (id, name, created_by, student_ids, start_time, end_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&record.id)
    .bind(&record.name)
    .bind(&record.created_by)
    .bind(&students)
    .bind(record.start_time)
    .bind(record.end_time)
    .bind(record.status.as_str())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn mark_session_ended(
    pool: &SqlitePool,
    id: &str,
    end_time: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        "UPDATE sessions SET end_time = ?2, status = 'ended'
         WHERE id = ?1 AND status = 'active'",
    )
    .bind(id)
    .bind(end_time)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_message(pool: &SqlitePool, message: &ChatMessage) -> Result<(), StoreError> {
    let content = serde_json::to_string(&message.content)?;
    let timestamp = message.timestamp.unwrap_or_else(Utc::now);
    sqlx::query(
        "INSERT INTO messages (id, session_id, type, context, from_user, to_user, content, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(message.kind.as_str())
    .bind(&message.context)
    .bind(&message.from_user)
    .bind(&message.to_user)
    .bind(&content)
    .bind(timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn map_session(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    let students_json: String = row.try_get("student_ids")?;
    let students: Vec<String> = serde_json::from_str(&students_json)?;
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "active" => SessionStatus::Active,
        "ended" => SessionStatus::Ended,
        other => return Err(StoreError::Decode(format!("unknown session status '{other}'"))),
    };
    Ok(SessionRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_by: row.try_get("created_by")?,
        students,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status,
    })
}

fn map_message(row: &SqliteRow) -> Result<ChatMessage, StoreError> {
    let kind: String = row.try_get("type")?;
    let kind: MessageType = kind
        .parse()
        .map_err(|()| StoreError::Decode(format!("unknown message type '{kind}'")))?;
    let content_json: String = row.try_get("content")?;
    let content = serde_json::from_str(&content_json)?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        kind,
        context: row.try_get("context")?,
        from_user: row.try_get("from_user")?,
        to_user: row.try_get("to_user")?,
        content,
        timestamp: Some(row.try_get("timestamp")?),
    })
}
