//! Persistence boundary for the agent-relay broker.
//!
//! [`StorageBackend`] is the trait the router talks to; [`sqlite::SqliteStorage`]
//! is the one embedded-SQL implementation shipped here. Storage failures are
//! never fatal to a Connection — callers log and continue per the broker's
//! error-handling design; this crate only reports them faithfully.

pub mod sqlite;

pub use sqlite::SqliteStorage;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Why a session ended, per the broker's `onActive`/`onClose` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedBy {
    Agent,
    Disconnect,
    Error,
}

impl ClosedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClosedBy::Agent => "agent",
            ClosedBy::Disconnect => "disconnect",
            ClosedBy::Error => "error",
        }
    }
}

impl std::str::FromStr for ClosedBy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(ClosedBy::Agent),
            "disconnect" => Ok(ClosedBy::Disconnect),
            "error" => Ok(ClosedBy::Error),
            other => Err(StorageError::InvalidData(format!(
                "unknown closed_by value: {other}"
            ))),
        }
    }
}

/// Parameters to start a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: String,
    pub agent_name: String,
    pub cli: Option<String>,
    pub project_id: String,
    pub project_root: String,
    pub started_at: i64,
    pub resume_token: Option<String>,
}

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub cli: Option<String>,
    pub project_id: String,
    pub project_root: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub closed_by: Option<ClosedBy>,
    pub resume_token: Option<String>,
    pub summary: Option<String>,
}

/// The highest seq seen so far on one `(session, topic, peer)` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    pub agent_name: String,
    pub session_id: String,
    pub topic: Option<String>,
    pub peer: String,
    pub max_seq: i64,
}

/// A message to append to the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: String,
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub topic: Option<String>,
    pub seq: i64,
    pub body: String,
    pub data: Option<String>,
    pub thread: Option<String>,
    pub ts: i64,
    /// Whether this message was handed to a live connection at assignment
    /// time. Only delivered messages bump `stream_cursors`, since that
    /// cursor is the resume watermark: replay must cover every seq assigned
    /// while the target was offline, not just everything ever assigned.
    pub delivered: bool,
}

/// A message retrieved from the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub topic: Option<String>,
    pub seq: i64,
    pub body: String,
    pub data: Option<String>,
    pub thread: Option<String>,
    pub ts: i64,
}

/// A per-stream replay watermark: return messages on this `(topic, peer)`
/// stream strictly after `after_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamWatermark {
    pub topic: Option<String>,
    pub peer: String,
    pub after_seq: i64,
}

/// The storage interface the router and daemon bootstrap talk to.
///
/// Exactly the operations named in the external-interfaces contract:
/// `init`, `startSession`, `endSession`, `getSessionByResumeToken`,
/// `getMaxSeqByStream`, `appendMessage`, `getMessagesAfter`, `close`.
pub trait StorageBackend {
    /// Open/create the backing store, apply schema, verify integrity.
    fn init(&mut self) -> StorageResult<()>;

    fn start_session(&mut self, session: NewSession) -> StorageResult<()>;

    fn end_session(
        &mut self,
        id: &str,
        summary: Option<String>,
        closed_by: ClosedBy,
        ended_at: i64,
    ) -> StorageResult<()>;

    fn get_session_by_resume_token(&self, token: &str) -> StorageResult<Option<Session>>;

    /// Most recently started session for `agent_name`, regardless of
    /// whether it has since ended. Used to attribute durable messages to a
    /// currently-disconnected target.
    fn get_latest_session_id(&self, agent_name: &str) -> StorageResult<Option<String>>;

    fn get_max_seq_by_stream(
        &self,
        agent_name: &str,
        session_id: &str,
    ) -> StorageResult<Vec<StreamCursor>>;

    /// Highest seq assigned so far on the `(session, topic, from, to)`
    /// stream, scanning `messages` directly rather than `stream_cursors` —
    /// used to number a message addressed to a currently offline target
    /// without colliding with seqs assigned to it while it was live or
    /// during an earlier outage window. Scoped per sender, matching the
    /// per-`(topic, peer)` stream isolation `get_messages_after` replays.
    fn get_max_assigned_seq(
        &self,
        session_id: &str,
        to: &str,
        from: &str,
        topic: Option<&str>,
    ) -> StorageResult<i64>;

    fn append_message(&mut self, message: NewMessage) -> StorageResult<()>;

    /// Returns a finite, non-restartable iterator over stored messages
    /// addressed to `agent_name` in `session_id`, strictly after each
    /// stream's watermark, ordered by seq within each stream.
    fn get_messages_after(
        &self,
        agent_name: &str,
        session_id: &str,
        watermarks: &[StreamWatermark],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<StoredMessage>> + '_>>;

    fn close(&mut self) -> StorageResult<()>;
}
