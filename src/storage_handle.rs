//! Async-friendly wrapper around the synchronous `relay-storage` backend.
//!
//! `rusqlite` is blocking, so every call runs inside `block_in_place` with
//! the connection behind a `std::sync::Mutex` — the Router is fully async
//! and must never stall its event loop behind a disk write.

use std::sync::Mutex;

use relay_storage::{
    ClosedBy, NewMessage, NewSession, SqliteStorage, StorageBackend, StorageError, StoredMessage,
    StreamWatermark,
};

use crate::connection::ResumeOutcome;

pub struct StorageHandle {
    inner: Mutex<SqliteStorage>,
}

impl StorageHandle {
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let mut storage = SqliteStorage::open(path)?;
        storage.init()?;
        Ok(StorageHandle {
            inner: Mutex::new(storage),
        })
    }

    pub async fn start_session(&self, session: NewSession) -> Result<(), StorageError> {
        self.with_storage(move |s| s.start_session(session)).await
    }

    pub async fn end_session(
        &self,
        id: String,
        summary: Option<String>,
        closed_by: ClosedBy,
        ended_at: i64,
    ) -> Result<(), StorageError> {
        self.with_storage(move |s| s.end_session(&id, summary, closed_by, ended_at))
            .await
    }

    pub async fn append_message(&self, message: NewMessage) -> Result<(), StorageError> {
        self.with_storage(move |s| s.append_message(message)).await
    }

    pub async fn latest_session_id(&self, agent_name: String) -> Result<Option<String>, StorageError> {
        self.with_storage(move |s| s.get_latest_session_id(&agent_name)).await
    }

    pub async fn max_seq_by_stream(
        &self,
        agent_name: String,
        session_id: String,
    ) -> Result<Vec<relay_storage::StreamCursor>, StorageError> {
        self.with_storage(move |s| s.get_max_seq_by_stream(&agent_name, &session_id))
            .await
    }

    pub async fn max_assigned_seq(
        &self,
        session_id: String,
        to: String,
        from: String,
        topic: Option<String>,
    ) -> Result<i64, StorageError> {
        self.with_storage(move |s| {
            s.get_max_assigned_seq(&session_id, &to, &from, topic.as_deref())
        })
        .await
    }

    pub async fn messages_after(
        &self,
        agent_name: String,
        session_id: String,
        watermarks: Vec<StreamWatermark>,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        self.with_storage(move |s| {
            let iter = s.get_messages_after(&agent_name, &session_id, &watermarks)?;
            iter.collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    /// Resolve a HELLO's resume token against the `sessions` + `stream_cursors`
    /// tables. Returns `None` when the token is unknown (the caller treats
    /// this as a non-fatal `RESUME_TOO_OLD`).
    pub async fn resolve_resume(
        &self,
        agent_name: &str,
        resume_token: &str,
    ) -> Option<ResumeOutcome> {
        let agent_name = agent_name.to_owned();
        let resume_token = resume_token.to_owned();
        self.with_storage(move |s| {
            let session = match s.get_session_by_resume_token(&resume_token) {
                Ok(Some(session)) if session.agent_name == agent_name => session,
                _ => return Ok(None),
            };
            let streams = s.get_max_seq_by_stream(&agent_name, &session.id)?;
            let new_token = uuid::Uuid::new_v4().to_string();
            Ok(Some(ResumeOutcome {
                session_id: session.id,
                resume_token: new_token,
                seed_sequences: streams
                    .into_iter()
                    .map(|c| (c.topic, c.peer, c.max_seq.max(0) as u64))
                    .collect(),
            }))
        })
        .await
        .ok()
        .flatten()
    }

    async fn with_storage<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteStorage) -> Result<T, StorageError> + Send,
        T: Send,
    {
        tokio::task::block_in_place(|| {
            let mut guard = self.inner.lock().unwrap();
            f(&mut guard)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(id: &str, agent: &str, resume_token: Option<&str>) -> NewSession {
        NewSession {
            id: id.to_owned(),
            agent_name: agent.to_owned(),
            cli: None,
            project_id: "proj".to_owned(),
            project_root: "/tmp/proj".to_owned(),
            started_at: 1,
            resume_token: resume_token.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn start_then_resolve_resume_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StorageHandle::open(&dir.path().join("relay.sqlite3")).unwrap();
        handle
            .start_session(new_session("sess-1", "alice", Some("tok-1")))
            .await
            .unwrap();

        let outcome = handle.resolve_resume("alice", "tok-1").await;
        assert!(outcome.is_some());
        assert_eq!(outcome.unwrap().session_id, "sess-1");

        assert!(handle.resolve_resume("bob", "tok-1").await.is_none());
    }

    #[tokio::test]
    async fn end_session_then_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StorageHandle::open(&dir.path().join("relay.sqlite3")).unwrap();
        handle
            .start_session(new_session("sess-2", "alice", None))
            .await
            .unwrap();
        handle
            .append_message(NewMessage {
                id: "m1".into(),
                session_id: "sess-2".into(),
                from: "alice".into(),
                to: "bob".into(),
                topic: None,
                seq: 1,
                body: "hi".into(),
                data: None,
                thread: None,
                ts: 10,
                delivered: true,
            })
            .await
            .unwrap();

        let msgs = handle
            .messages_after(
                "bob".into(),
                "sess-2".into(),
                vec![StreamWatermark {
                    topic: None,
                    peer: "alice".into(),
                    after_seq: 0,
                }],
            )
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);

        handle
            .end_session("sess-2".into(), Some("done".into()), ClosedBy::Agent, 20)
            .await
            .unwrap();
    }
}
