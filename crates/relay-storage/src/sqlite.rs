//! `rusqlite`-backed [`StorageBackend`] implementation.
//!
//! PRAGMA hardening and the open/pragma/integrity-check/schema sequence
//! mirror the teacher's `Journal::open` and `Db::open`.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    ClosedBy, NewMessage, NewSession, Session, StorageBackend, StorageError, StorageResult,
    StoredMessage, StreamCursor, StreamWatermark,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// `None` topic is stored as `''` so it can take part in primary keys
/// without NULL-comparison surprises.
fn topic_to_db(topic: Option<&str>) -> &str {
    topic.unwrap_or("")
}

fn topic_from_db(topic: &str) -> Option<String> {
    if topic.is_empty() {
        None
    } else {
        Some(topic.to_owned())
    }
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn apply_pragmas(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn run_integrity_check(&self) -> StorageResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StorageError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

impl StorageBackend for SqliteStorage {
    fn init(&mut self) -> StorageResult<()> {
        self.apply_pragmas()?;
        self.run_integrity_check()?;
        self.apply_schema()?;
        Ok(())
    }

    fn start_session(&mut self, session: NewSession) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO sessions
                 (id, agent_name, cli, project_id, project_root, started_at, resume_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.agent_name,
                session.cli,
                session.project_id,
                session.project_root,
                session.started_at,
                session.resume_token,
            ],
        )?;
        Ok(())
    }

    fn end_session(
        &mut self,
        id: &str,
        summary: Option<String>,
        closed_by: ClosedBy,
        ended_at: i64,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?2, closed_by = ?3, summary = ?4 WHERE id = ?1",
            params![id, ended_at, closed_by.as_str(), summary],
        )?;
        Ok(())
    }

    fn get_session_by_resume_token(&self, token: &str) -> StorageResult<Option<Session>> {
        self.conn
            .query_row(
                "SELECT id, agent_name, cli, project_id, project_root, started_at, ended_at,
                        closed_by, resume_token, summary
                 FROM sessions WHERE resume_token = ?1
                 ORDER BY started_at DESC LIMIT 1",
                params![token],
                map_session,
            )
            .optional()
            .map_err(StorageError::from)
    }

    fn get_latest_session_id(&self, agent_name: &str) -> StorageResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT id FROM sessions WHERE agent_name = ?1 ORDER BY started_at DESC LIMIT 1",
                params![agent_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)
    }

    fn get_max_seq_by_stream(
        &self,
        agent_name: &str,
        session_id: &str,
    ) -> StorageResult<Vec<StreamCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_name, session_id, topic, peer, max_seq
             FROM stream_cursors WHERE agent_name = ?1 AND session_id = ?2",
        )?;
        let rows = stmt.query_map(params![agent_name, session_id], |row| {
            Ok(StreamCursor {
                agent_name: row.get(0)?,
                session_id: row.get(1)?,
                topic: topic_from_db(&row.get::<_, String>(2)?),
                peer: row.get(3)?,
                max_seq: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::from)
    }

    fn get_max_assigned_seq(
        &self,
        session_id: &str,
        to: &str,
        from: &str,
        topic: Option<&str>,
    ) -> StorageResult<i64> {
        let topic = topic_to_db(topic);
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM messages
                 WHERE session_id = ?1 AND \"to\" = ?2 AND \"from\" = ?3 AND topic = ?4",
                params![session_id, to, from, topic],
                |row| row.get(0),
            )
            .map_err(StorageError::from)
    }

    fn append_message(&mut self, message: NewMessage) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        let topic = topic_to_db(message.topic.as_deref());
        tx.execute(
            "INSERT INTO messages
                 (id, session_id, \"from\", \"to\", topic, seq, body, data, thread, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id,
                message.session_id,
                message.from,
                message.to,
                topic,
                message.seq,
                message.body,
                message.data,
                message.thread,
                message.ts,
            ],
        )?;
        if message.delivered {
            tx.execute(
                "INSERT INTO stream_cursors (agent_name, session_id, topic, peer, max_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (session_id, topic, peer)
                 DO UPDATE SET max_seq = MAX(max_seq, excluded.max_seq)",
                params![message.to, message.session_id, topic, message.from, message.seq],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_messages_after(
        &self,
        agent_name: &str,
        session_id: &str,
        watermarks: &[StreamWatermark],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<StoredMessage>> + '_>> {
        let mut all = Vec::new();
        for wm in watermarks {
            let topic = topic_to_db(wm.topic.as_deref());
            let mut stmt = self.conn.prepare(
                "SELECT id, session_id, \"from\", \"to\", topic, seq, body, data, thread, ts
                 FROM messages
                 WHERE session_id = ?1 AND \"to\" = ?2 AND \"from\" = ?3 AND topic = ?4 AND seq > ?5
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(
                params![session_id, agent_name, wm.peer, topic, wm.after_seq],
                map_message,
            )?;
            for r in rows {
                all.push(r.map_err(StorageError::from));
            }
        }
        all.sort_by(|a, b| match (a, b) {
            (Ok(x), Ok(y)) => x.ts.cmp(&y.ts).then(x.seq.cmp(&y.seq)),
            _ => std::cmp::Ordering::Equal,
        });
        Ok(Box::new(all.into_iter()))
    }

    fn close(&mut self) -> StorageResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let closed_by: Option<String> = row.get(7)?;
    Ok(Session {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        cli: row.get(2)?,
        project_id: row.get(3)?,
        project_root: row.get(4)?,
        started_at: row.get(5)?,
        ended_at: row.get(6)?,
        closed_by: closed_by.and_then(|s| s.parse().ok()),
        resume_token: row.get(8)?,
        summary: row.get(9)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from: row.get(2)?,
        to: row.get(3)?,
        topic: topic_from_db(&row.get::<_, String>(4)?),
        seq: row.get(5)?,
        body: row.get(6)?,
        data: row.get(7)?,
        thread: row.get(8)?,
        ts: row.get(9)?,
    })
}
