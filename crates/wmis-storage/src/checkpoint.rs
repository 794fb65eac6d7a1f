//! Durable per-conversation anchors.
//!
//! The whole mapping lives in memory and is rewritten to a JSON file on every
//! change. The file is meant to be hand-editable: unknown fields are ignored,
//! broken entries are skipped, and an unreadable file behaves like an empty
//! one so every conversation falls back to a full collection.

use chrono::{DateTime, NaiveDateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub conversation_id: String,
    pub last_timestamp: String,
    pub last_content: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEntry {
    #[serde(alias = "last_message_time")]
    last_timestamp: String,
    #[serde(alias = "last_message_content")]
    last_content: String,
    #[serde(default)]
    updated_at: Option<String>,
}

impl CheckpointEntry {
    fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            last_timestamp: checkpoint.last_timestamp.clone(),
            last_content: checkpoint.last_content.clone(),
            updated_at: Some(checkpoint.updated_at.to_rfc3339()),
        }
    }

    fn into_checkpoint(self, conversation_id: &str) -> Checkpoint {
        let updated_at = self
            .updated_at
            .as_deref()
            .and_then(parse_updated_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Checkpoint {
            conversation_id: conversation_id.to_string(),
            last_timestamp: self.last_timestamp,
            last_content: self.last_content,
            updated_at,
        }
    }
}

/// RFC 3339, or an offset-less ISO 8601 stamp read as UTC.
fn parse_updated_at(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Checkpoint>>,
}

impl CheckpointStore {
    /// Never fails: a missing file is an empty mapping, an unreadable one is
    /// reported and then treated as empty too.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_entries(&path);
        debug!(
            event = "checkpoints_loaded",
            path = %path.display(),
            count = entries.len()
        );
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, conversation_id: &str) -> Option<Checkpoint> {
        self.lock_entries().get(conversation_id).cloned()
    }

    pub fn all(&self) -> Vec<Checkpoint> {
        self.lock_entries().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Overwrites the anchor for `conversation_id` and flushes the full
    /// mapping before returning. On a failed flush the previous anchor is
    /// restored so memory never runs ahead of disk.
    pub fn update(
        &self,
        conversation_id: &str,
        last_timestamp: &str,
        last_content: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            conversation_id: conversation_id.to_string(),
            last_timestamp: last_timestamp.to_string(),
            last_content: last_content.to_string(),
            updated_at: Utc::now(),
        };

        let mut entries = self.lock_entries();
        let previous = entries.insert(conversation_id.to_string(), checkpoint.clone());
        if let Err(err) = write_entries(&self.path, &entries) {
            match previous {
                Some(previous) => entries.insert(conversation_id.to_string(), previous),
                None => entries.remove(conversation_id),
            };
            return Err(err);
        }

        Ok(checkpoint)
    }

    pub fn remove(&self, conversation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let mut entries = self.lock_entries();
        let Some(removed) = entries.remove(conversation_id) else {
            return Ok(None);
        };
        if let Err(err) = write_entries(&self.path, &entries) {
            entries.insert(conversation_id.to_string(), removed);
            return Err(err);
        }
        Ok(Some(removed))
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, Checkpoint>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, Checkpoint> {
    let mut entries = BTreeMap::new();
    if !path.exists() {
        return entries;
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(event = "checkpoint_unreadable", path = %path.display(), error = %err);
            return entries;
        }
    };

    let raw = match serde_json::from_str::<BTreeMap<String, Value>>(&contents) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(event = "checkpoint_corrupt", path = %path.display(), error = %err);
            return entries;
        }
    };

    for (conversation_id, value) in raw {
        match serde_json::from_value::<CheckpointEntry>(value) {
            Ok(entry) => {
                let checkpoint = entry.into_checkpoint(&conversation_id);
                entries.insert(conversation_id, checkpoint);
            }
            Err(err) => {
                warn!(
                    event = "checkpoint_entry_skipped",
                    conversation_id = %conversation_id,
                    error = %err
                );
            }
        }
    }

    entries
}

fn write_entries(
    path: &Path,
    entries: &BTreeMap<String, Checkpoint>,
) -> Result<(), CheckpointError> {
    let serializable = entries
        .iter()
        .map(|(conversation_id, checkpoint)| {
            (
                conversation_id.as_str(),
                CheckpointEntry::from_checkpoint(checkpoint),
            )
        })
        .collect::<BTreeMap<_, _>>();
    let rendered = serde_json::to_string_pretty(&serializable)
        .map_err(|err| CheckpointError::Serialization(err.to_string()))?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let _lock = FlushLock::acquire(&sibling_path(path, "lock"))?;
    let temp_path = sibling_path(path, "tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(rendered.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn sibling_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Advisory lock held while the checkpoint file is rewritten, so two
/// collector processes sharing a file never interleave their flushes.
struct FlushLock {
    file: File,
}

impl FlushLock {
    fn acquire(path: &Path) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FlushLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
