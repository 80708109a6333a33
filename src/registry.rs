//! Name -> connection registry, persisted atomically for out-of-band readers.
//!
//! Mirrors the teacher's `AppState` registries (`Arc<RwLock<HashMap<...>>>`)
//! and the write-temp-then-rename snapshot pattern used throughout the
//! workspace for files read by external processes.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// A registered agent's metadata, as reported in HELLO.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub cli: Option<String>,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Serialize)]
struct AgentsSnapshot<'a> {
    agents: Vec<&'a AgentRecord>,
}

#[derive(Serialize)]
struct ProcessingSnapshot<'a> {
    #[serde(rename = "processingAgents")]
    processing_agents: Vec<&'a str>,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
}

/// Atomically rewrite `<team_dir>/processing-state.json` with the Router's
/// current processing set. Called on a timer from the Router's snapshot task.
pub fn write_processing_snapshot(
    team_dir: &Path,
    processing: &std::collections::HashSet<String>,
    now_ms: i64,
) -> std::io::Result<()> {
    let mut names: Vec<&str> = processing.iter().map(String::as_str).collect();
    names.sort_unstable();
    let snapshot = ProcessingSnapshot {
        processing_agents: names,
        updated_at: now_ms,
    };
    write_json_atomically(&team_dir.join("processing-state.json"), &snapshot)
}

/// Concurrent agent registry with atomic snapshot persistence.
pub struct Registry {
    agents: Arc<RwLock<HashMap<String, AgentRecord>>>,
    snapshot_path: PathBuf,
}

impl Registry {
    #[must_use]
    pub fn new(team_dir: &Path) -> Self {
        Registry {
            agents: Arc::new(RwLock::new(HashMap::new())),
            snapshot_path: team_dir.join("agents.json"),
        }
    }

    /// Create or refresh an agent's record and bump `last_seen`, then
    /// atomically rewrite `agents.json`.
    pub async fn register_or_update(&self, name: &str, update: AgentUpdate, now_ms: i64) {
        {
            let mut agents = self.agents.write().await;
            agents
                .entry(name.to_owned())
                .and_modify(|rec| {
                    if update.cli.is_some() {
                        rec.cli = update.cli.clone();
                    }
                    if update.program.is_some() {
                        rec.program = update.program.clone();
                    }
                    if update.model.is_some() {
                        rec.model = update.model.clone();
                    }
                    if update.task.is_some() {
                        rec.task = update.task.clone();
                    }
                    if update.cwd.is_some() {
                        rec.cwd = update.cwd.clone();
                    }
                    rec.last_seen = now_ms;
                })
                .or_insert_with(|| AgentRecord {
                    name: name.to_owned(),
                    cli: update.cli,
                    program: update.program,
                    model: update.model,
                    task: update.task,
                    cwd: update.cwd,
                    first_seen: now_ms,
                    last_seen: now_ms,
                });
        }
        self.write_snapshot().await;
    }

    /// Update only `last_seen`, then atomically rewrite `agents.json`.
    pub async fn touch(&self, name: &str, now_ms: i64) {
        {
            let mut agents = self.agents.write().await;
            if let Some(rec) = agents.get_mut(name) {
                rec.last_seen = now_ms;
            }
        }
        self.write_snapshot().await;
    }

    #[must_use]
    pub async fn names(&self) -> Vec<String> {
        self.agents.read().await.keys().cloned().collect()
    }

    #[must_use]
    pub async fn contains(&self, name: &str) -> bool {
        self.agents.read().await.contains_key(name)
    }

    async fn write_snapshot(&self) {
        let agents = self.agents.read().await;
        let mut records: Vec<&AgentRecord> = agents.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let snapshot = AgentsSnapshot { agents: records };
        if let Err(e) = write_json_atomically(&self.snapshot_path, &snapshot) {
            tracing::warn!(error = %e, path = %self.snapshot_path.display(), "failed to write agents.json");
        }
    }
}

/// Write `value` as JSON to `path` via write-temp-then-rename, so external
/// readers never observe a partially-written file.
pub fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let json = serde_json::to_vec_pretty(value)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_or_update_creates_then_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());

        registry
            .register_or_update(
                "alice",
                AgentUpdate {
                    cli: Some("claude".to_owned()),
                    ..Default::default()
                },
                100,
            )
            .await;
        registry
            .register_or_update(
                "alice",
                AgentUpdate {
                    task: Some("fix bug".to_owned()),
                    ..Default::default()
                },
                200,
            )
            .await;

        let agents = registry.agents.read().await;
        let alice = agents.get("alice").unwrap();
        assert_eq!(alice.cli.as_deref(), Some("claude"));
        assert_eq!(alice.task.as_deref(), Some("fix bug"));
        assert_eq!(alice.first_seen, 100);
        assert_eq!(alice.last_seen, 200);
    }

    #[tokio::test]
    async fn snapshot_file_is_valid_json_after_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry
            .register_or_update("bob", AgentUpdate::default(), 1)
            .await;

        let raw = std::fs::read_to_string(dir.path().join("agents.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["agents"][0]["name"], "bob");
    }

    #[tokio::test]
    async fn touch_on_unknown_name_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        registry.touch("ghost", 5).await;
        assert!(!registry.contains("ghost").await);
    }

    #[test]
    fn processing_snapshot_is_valid_json_with_sorted_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut processing = std::collections::HashSet::new();
        processing.insert("bob".to_owned());
        processing.insert("alice".to_owned());
        write_processing_snapshot(dir.path(), &processing, 42).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("processing-state.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["processingAgents"], serde_json::json!(["alice", "bob"]));
        assert_eq!(parsed["updatedAt"], 42);
    }
}
