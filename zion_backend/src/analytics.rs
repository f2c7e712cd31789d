//! Optional run analytics.
//!
//! After every run the controller hands a read-only [`RunObservation`] to a
//! [`RunObserver`]. The observer may answer with advisory strings; the loop never
//! waits on it and never fails because of it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Past runs compared against a new prompt.
const ADVISORY_LOOKBACK: usize = 200;
const MIN_SHARED_KEYWORDS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunObservation {
    pub observation_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub plan_text: String,
    pub tool_call_count: usize,
    pub files_touched: Vec<String>,
    pub completed: bool,
    pub error_texts: Vec<String>,
}

impl RunObservation {
    pub fn new(session_id: &str, prompt: &str) -> Self {
        Self {
            observation_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            prompt: prompt.to_string(),
            plan_text: String::new(),
            tool_call_count: 0,
            files_touched: Vec::new(),
            completed: false,
            error_texts: Vec::new(),
        }
    }
}

#[async_trait]
pub trait RunObserver: Send + Sync {
    /// Record one finished run and return any advice for the operator.
    async fn observe(&self, observation: RunObservation) -> Result<Vec<String>>;
}

/// Appends observations to a SQLite file and derives advice from similar past runs.
///
/// Clones share one connection.
#[derive(Clone)]
pub struct SqliteObservationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteObservationStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open analytics db {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// `~/.zion/learning.db`.
    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::home_dir().map(|home| home.join(".zion").join("learning.db"))
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS run_observations (
                observation_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                prompt TEXT NOT NULL,
                plan_text TEXT NOT NULL,
                tool_call_count INTEGER NOT NULL,
                files_touched TEXT NOT NULL,
                completed INTEGER NOT NULL,
                error_texts TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_observations_observed_at ON run_observations(observed_at DESC)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Analytics lock poisoned: {}", e))
    }

    pub fn record(&self, observation: &RunObservation) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO run_observations
                (observation_id, session_id, observed_at, prompt, plan_text,
                 tool_call_count, files_touched, completed, error_texts)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                observation.observation_id,
                observation.session_id,
                observation.timestamp.to_rfc3339(),
                observation.prompt,
                observation.plan_text,
                observation.tool_call_count as i64,
                serde_json::to_string(&observation.files_touched)?,
                observation.completed as i64,
                serde_json::to_string(&observation.error_texts)?,
            ],
        )?;
        Ok(())
    }

    /// Most recent observations, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunObservation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT observation_id, session_id, observed_at, prompt, plan_text,
                      tool_call_count, files_touched, completed, error_texts
               FROM run_observations ORDER BY observed_at DESC LIMIT ?1"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut observations = Vec::new();
        for row in rows {
            let (id, session, at, prompt, plan, calls, files, completed, errors) = row?;
            observations.push(RunObservation {
                observation_id: id,
                session_id: session,
                timestamp: DateTime::parse_from_rfc3339(&at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                prompt,
                plan_text: plan,
                tool_call_count: calls.max(0) as usize,
                files_touched: serde_json::from_str(&files).unwrap_or_default(),
                completed: completed != 0,
                error_texts: serde_json::from_str(&errors).unwrap_or_default(),
            });
        }
        Ok(observations)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM run_observations", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    /// Advice derived from earlier runs whose prompts share keywords with this one.
    pub fn advisories(&self, observation: &RunObservation) -> Result<Vec<String>> {
        let wanted = keywords(&observation.prompt);
        if wanted.len() < MIN_SHARED_KEYWORDS {
            return Ok(Vec::new());
        }

        let mut advice = Vec::new();
        for past in self.recent(ADVISORY_LOOKBACK)? {
            if past.observation_id == observation.observation_id {
                continue;
            }
            if wanted.intersection(&keywords(&past.prompt)).count() < MIN_SHARED_KEYWORDS {
                continue;
            }
            let when = past.timestamp.format("%Y-%m-%d %H:%M");
            if !past.completed {
                let reason = past
                    .error_texts
                    .first()
                    .map(|e| e.lines().next().unwrap_or_default().to_string())
                    .unwrap_or_else(|| "no errors recorded".to_string());
                advice.push(format!(
                    "A similar request on {} did not complete ({} tool calls): {}",
                    when, past.tool_call_count, reason
                ));
            } else if !past.files_touched.is_empty() {
                advice.push(format!(
                    "A similar request on {} completed after touching: {}",
                    when,
                    past.files_touched.join(", ")
                ));
            }
            if advice.len() >= 3 {
                break;
            }
        }
        Ok(advice)
    }
}

#[async_trait]
impl RunObserver for SqliteObservationStore {
    async fn observe(&self, observation: RunObservation) -> Result<Vec<String>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let advice = store.advisories(&observation)?;
            store.record(&observation)?;
            Ok(advice)
        })
        .await
        .context("analytics task panicked")?
    }
}

fn keywords(prompt: &str) -> HashSet<String> {
    prompt
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 3)
        .map(|w| w.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(prompt: &str, completed: bool) -> RunObservation {
        let mut obs = RunObservation::new("session-1", prompt);
        obs.completed = completed;
        obs.tool_call_count = 4;
        obs.files_touched = vec!["src/app.css".into()];
        if !completed {
            obs.error_texts = vec!["Error: Marker 'body' not found in src/app.css".into()];
        }
        obs
    }

    #[test]
    fn records_and_reads_back() {
        let store = SqliteObservationStore::in_memory().unwrap();
        store.record(&observation("add dark theme styles", true)).unwrap();
        assert_eq!(store.count().unwrap(), 1);

        let recent = store.recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].files_touched, vec!["src/app.css".to_string()]);
        assert!(recent[0].completed);
    }

    #[tokio::test]
    async fn similar_failed_runs_produce_advice() {
        let store = SqliteObservationStore::in_memory().unwrap();
        store
            .observe(observation("add dark theme styles to the landing page", false))
            .await
            .unwrap();

        let advice = store
            .observe(observation("make the landing page dark theme nicer", true))
            .await
            .unwrap();
        assert_eq!(advice.len(), 1);
        assert!(advice[0].contains("did not complete"));
        assert!(advice[0].contains("Marker 'body' not found"));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn unrelated_prompts_get_no_advice() {
        let store = SqliteObservationStore::in_memory().unwrap();
        store.observe(observation("fix the parser tests", false)).await.unwrap();
        let advice = store
            .observe(observation("write deployment docs", true))
            .await
            .unwrap();
        assert!(advice.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clones_write_to_the_same_database() {
        let store = SqliteObservationStore::in_memory().unwrap();
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .observe(observation(&format!("task number {i}"), true))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn file_backed_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("learning.db");
        let store = SqliteObservationStore::open(&path).unwrap();
        store.record(&observation("anything at all", true)).unwrap();
        assert!(path.exists());
    }
}
