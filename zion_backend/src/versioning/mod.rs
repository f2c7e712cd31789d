//! Task-grouped pre-mutation backups.
//!
//! Snapshots are plain copies under `<workspace>/<backup_dir>/` and the ledger is
//! `history.json` next to them. Every mutation the agent makes inside one operator
//! instruction shares a task id, which is the unit of [`VersionStore::undo_task`].

pub mod diff;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

const LEDGER_FILE: &str = "history.json";
const MAX_MESSAGE_CHARS: usize = 100;

/// One recorded snapshot. Entries are never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub index: u64,
    pub task_id: String,
    pub timestamp: String,
    pub time_display: String,
    pub action: String,
    pub absolute_path: PathBuf,
    pub relative_path: String,
    pub backup_reference: String,
    pub message: String,
}

/// Ledger entries collapsed per task, for history listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub message: String,
    pub first_index: u64,
    pub time_display: String,
    pub files: Vec<String>,
}

/// What to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    Last,
    Index(u64),
    Reference(String),
}

#[derive(Debug, Default)]
struct Ledger {
    entries: Vec<BackupEntry>,
    task_id: Option<String>,
    message: String,
}

pub struct VersionStore {
    workspace: PathBuf,
    backup_dir: PathBuf,
    retained_tasks: usize,
    ledger: Mutex<Ledger>,
}

impl VersionStore {
    /// Open (or create) the store for `workspace`. The first creation of the backup
    /// directory also appends it to the workspace `.gitignore`.
    pub fn open(workspace: &Path, dir_name: &str, retained_tasks: usize) -> Result<Self> {
        let backup_dir = workspace.join(dir_name);
        if !backup_dir.exists() {
            std::fs::create_dir_all(&backup_dir).with_context(|| {
                format!("Failed to create backup directory {}", backup_dir.display())
            })?;
            if let Err(e) = append_gitignore(workspace, dir_name) {
                tracing::warn!("Could not update .gitignore: {}", e);
            }
        }

        let ledger_path = backup_dir.join(LEDGER_FILE);
        let entries = if ledger_path.exists() {
            let raw = std::fs::read_to_string(&ledger_path)
                .with_context(|| format!("Failed to read {}", ledger_path.display()))?;
            match serde_json::from_str::<Vec<BackupEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable ledger {}: {}", ledger_path.display(), e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        tracing::debug!(
            "Version store at {} ({} entries)",
            backup_dir.display(),
            entries.len()
        );

        Ok(Self {
            workspace: workspace.to_path_buf(),
            backup_dir,
            retained_tasks: retained_tasks.max(1),
            ledger: Mutex::new(Ledger {
                entries,
                ..Ledger::default()
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|e| anyhow::anyhow!("Version ledger lock poisoned: {}", e))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Open a task boundary. Returns the new task id.
    pub fn set_task(&self, message: &str) -> Result<String> {
        let task_id = new_task_id();
        let mut ledger = self.lock()?;
        ledger.task_id = Some(task_id.clone());
        ledger.message = message.chars().take(MAX_MESSAGE_CHARS).collect();
        tracing::debug!("Opened task {}", task_id);
        Ok(task_id)
    }

    /// Snapshot `path` before it is overwritten.
    ///
    /// Returns `None` when the file does not exist yet. Within one task, a file whose
    /// bytes still match its latest snapshot reuses that snapshot's reference.
    pub fn backup(&self, path: &Path, action: &str) -> Result<Option<String>> {
        if !path.is_file() {
            return Ok(None);
        }
        let current = std::fs::read(path)
            .with_context(|| format!("Failed to read {} for backup", path.display()))?;

        let mut ledger = self.lock()?;
        if ledger.task_id.is_none() {
            ledger.task_id = Some(new_task_id());
        }
        let task_id = ledger.task_id.clone().unwrap_or_default();

        if let Some(existing) = ledger
            .entries
            .iter()
            .rev()
            .find(|e| e.task_id == task_id && e.absolute_path == path)
        {
            let snapshot = self.backup_dir.join(&existing.backup_reference);
            if std::fs::read(&snapshot).ok().as_deref() == Some(current.as_slice()) {
                tracing::debug!("Reusing backup {} for {}", existing.backup_reference, path.display());
                return Ok(Some(existing.backup_reference.clone()));
            }
        }

        let now = Local::now();
        let index = ledger.entries.last().map(|e| e.index + 1).unwrap_or(0);
        let relative_path = path
            .strip_prefix(&self.workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        let safe_name = relative_path.replace(['/', '\\'], "_");
        let timestamp = now.format("%Y%m%d_%H%M%S_%6f").to_string();
        let reference = format!("{}_{}_{}", timestamp, index, safe_name);

        // Snapshot lands fully before the ledger mentions it.
        let snapshot = self.backup_dir.join(&reference);
        let staging = self.backup_dir.join(format!(".{}.tmp", reference));
        std::fs::write(&staging, &current)
            .with_context(|| format!("Failed to write snapshot {}", staging.display()))?;
        std::fs::rename(&staging, &snapshot)
            .with_context(|| format!("Failed to finalize snapshot {}", snapshot.display()))?;

        let message = if ledger.message.is_empty() {
            "No message".to_string()
        } else {
            ledger.message.clone()
        };
        ledger.entries.push(BackupEntry {
            index,
            task_id,
            timestamp,
            time_display: now.format("%H:%M:%S").to_string(),
            action: action.to_string(),
            absolute_path: path.to_path_buf(),
            relative_path,
            backup_reference: reference.clone(),
            message,
        });

        self.prune(&mut ledger);
        self.persist(&ledger)?;
        tracing::info!("Backed up {} as #{}", path.display(), index);
        Ok(Some(reference))
    }

    /// Drop tasks older than the retention window along with their snapshot files.
    fn prune(&self, ledger: &mut Ledger) {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for entry in &ledger.entries {
            if seen.insert(entry.task_id.clone()) {
                order.push(entry.task_id.clone());
            }
        }
        if order.len() <= self.retained_tasks {
            return;
        }

        let expired: HashSet<String> = order[..order.len() - self.retained_tasks]
            .iter()
            .cloned()
            .collect();
        ledger.entries.retain(|entry| {
            if expired.contains(&entry.task_id) {
                let _ = std::fs::remove_file(self.backup_dir.join(&entry.backup_reference));
                false
            } else {
                true
            }
        });
        tracing::debug!("Pruned {} expired task(s)", expired.len());
    }

    fn persist(&self, ledger: &Ledger) -> Result<()> {
        let path = self.backup_dir.join(LEDGER_FILE);
        let staging = self.backup_dir.join(format!(".{}.tmp", LEDGER_FILE));
        let json = serde_json::to_string_pretty(&ledger.entries)?;
        std::fs::write(&staging, json)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn find(ledger: &Ledger, target: &RestoreTarget) -> Option<BackupEntry> {
        match target {
            RestoreTarget::Last => ledger.entries.last().cloned(),
            RestoreTarget::Index(index) => {
                ledger.entries.iter().find(|e| e.index == *index).cloned()
            }
            RestoreTarget::Reference(reference) => ledger
                .entries
                .iter()
                .find(|e| &e.backup_reference == reference)
                .cloned(),
        }
    }

    fn restore_entry(&self, entry: &BackupEntry) -> Result<()> {
        let snapshot = self.backup_dir.join(&entry.backup_reference);
        let content = std::fs::read(&snapshot)
            .with_context(|| format!("Backup not found: {}", snapshot.display()))?;
        if let Some(parent) = entry.absolute_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&entry.absolute_path, content)
            .with_context(|| format!("Failed to restore {}", entry.absolute_path.display()))?;
        tracing::info!("Restored {} from #{}", entry.relative_path, entry.index);
        Ok(())
    }

    /// Overwrite the working file with a recorded snapshot.
    pub fn restore(&self, target: RestoreTarget) -> Result<BackupEntry> {
        let entry = {
            let ledger = self.lock()?;
            Self::find(&ledger, &target)
        }
        .ok_or_else(|| match &target {
            RestoreTarget::Last => anyhow::anyhow!("No backups available"),
            RestoreTarget::Index(i) => anyhow::anyhow!("Invalid backup index {}", i),
            RestoreTarget::Reference(r) => anyhow::anyhow!("Unknown backup reference {}", r),
        })?;
        self.restore_entry(&entry)?;
        Ok(entry)
    }

    pub fn undo_last(&self) -> Result<BackupEntry> {
        self.restore(RestoreTarget::Last)
    }

    /// Restore every file touched by a task, newest entry first, so each file ends
    /// at the state captured before the task's first modification of it.
    ///
    /// With no task id, the task of the most recent ledger entry is used. Every
    /// entry is attempted; if any restore fails the whole undo is an error naming
    /// the files left as they were.
    pub fn undo_task(&self, task_id: Option<&str>) -> Result<Vec<BackupEntry>> {
        let entries: Vec<BackupEntry> = {
            let ledger = self.lock()?;
            let task_id = match task_id {
                Some(id) => id.to_string(),
                None => match ledger.entries.last() {
                    Some(last) => last.task_id.clone(),
                    None => anyhow::bail!("No backups available"),
                },
            };
            ledger
                .entries
                .iter()
                .filter(|e| e.task_id == task_id)
                .cloned()
                .collect()
        };
        if entries.is_empty() {
            anyhow::bail!("No entries found for task");
        }

        let total = entries.len();
        let mut restored = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for entry in entries.into_iter().rev() {
            match self.restore_entry(&entry) {
                Ok(()) => restored.push(entry),
                Err(e) => {
                    tracing::warn!("Could not restore {}: {:#}", entry.relative_path, e);
                    failed.push(format!("{} ({:#})", entry.relative_path, e));
                }
            }
        }
        if !failed.is_empty() {
            anyhow::bail!(
                "Partial undo: restored {} of {} backups; failed: {}",
                restored.len(),
                total,
                failed.join("; ")
            );
        }
        Ok(restored)
    }

    /// Most recent `count` tasks, newest first.
    pub fn history(&self, count: usize) -> Result<Vec<TaskSummary>> {
        let ledger = self.lock()?;
        let mut tasks: Vec<TaskSummary> = Vec::new();
        for entry in &ledger.entries {
            match tasks.iter_mut().find(|t| t.task_id == entry.task_id) {
                Some(task) => {
                    if !task.files.contains(&entry.relative_path) {
                        task.files.push(entry.relative_path.clone());
                    }
                }
                None => tasks.push(TaskSummary {
                    task_id: entry.task_id.clone(),
                    message: entry.message.clone(),
                    first_index: entry.index,
                    time_display: entry.time_display.clone(),
                    files: vec![entry.relative_path.clone()],
                }),
            }
        }
        Ok(tasks.into_iter().rev().take(count).collect())
    }

    pub fn entries(&self) -> Vec<BackupEntry> {
        self.lock().map(|l| l.entries.clone()).unwrap_or_default()
    }

    pub fn entry(&self, index: u64) -> Option<BackupEntry> {
        self.lock()
            .ok()
            .and_then(|l| Self::find(&l, &RestoreTarget::Index(index)))
    }

    pub fn show_version(&self, index: u64) -> Result<String> {
        let entry = self
            .entry(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid backup index {}", index))?;
        let snapshot = self.backup_dir.join(&entry.backup_reference);
        let bytes = std::fs::read(&snapshot)
            .with_context(|| format!("Backup file not found: {}", snapshot.display()))?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Unified diff from the snapshot at `index` to the file as it is now.
    pub fn diff(&self, index: u64) -> Result<String> {
        let entry = self
            .entry(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid backup index {}", index))?;
        let backup = self.show_version(index)?;
        let current = match std::fs::read(&entry.absolute_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(_) => "(file deleted)\n".to_string(),
        };
        let text = diff::unified_diff(&backup, &current, &format!("backup #{}", index), "current");
        if text.is_empty() {
            Ok("No differences - files are identical".to_string())
        } else {
            Ok(text)
        }
    }
}

/// `YYYYmmdd_HHMMSS_<8 hex>`; the suffix keeps two tasks in the same second apart.
fn new_task_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

fn append_gitignore(workspace: &Path, dir_name: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(workspace.join(".gitignore"))?;
    writeln!(file, "\n# Zion agent backups\n{}/", dir_name)?;
    Ok(())
}
