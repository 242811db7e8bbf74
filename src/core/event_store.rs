//! Append-only event store with file-based persistence.
//!
//! Each execution gets its own directory holding `events.jsonl`, one
//! [`Envelope`] per line. Appends take an exclusive file lock so that
//! concurrent writers (step tasks, or a second process issuing a cancel)
//! never interleave within a line. A line left unterminated by a crashed
//! writer is cut off before the next append.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Envelope, Execution};

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Execution this log belongs to
    execution_id: Uuid,

    /// Directory containing the execution
    execution_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the event store for an execution under `base_dir`
    pub async fn open_in(base_dir: &Path, execution_id: Uuid) -> Result<Self> {
        let execution_dir = base_dir.join(execution_id.to_string());

        fs::create_dir_all(&execution_dir).await.with_context(|| {
            format!(
                "Failed to create execution directory: {}",
                execution_dir.display()
            )
        })?;

        Ok(Self::at(base_dir, execution_id))
    }

    /// Refer to an execution's store without touching the filesystem
    pub fn at(base_dir: &Path, execution_id: Uuid) -> Self {
        let execution_dir = base_dir.join(execution_id.to_string());
        let events_path = execution_dir.join("events.jsonl");

        Self {
            execution_id,
            execution_dir,
            events_path,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the execution directory
    pub fn execution_dir(&self) -> &Path {
        &self.execution_dir
    }

    /// Whether any envelope has been written
    pub fn exists(&self) -> bool {
        self.events_path.exists()
    }

    /// Append an envelope to the log as one complete line
    pub async fn append(&self, envelope: &Envelope) -> Result<()> {
        let mut line = serde_json::to_string(envelope).context("Failed to serialize envelope")?;
        line.push('\n');

        let path = self.events_path.clone();
        tokio::task::spawn_blocking(move || append_locked(&path, line.as_bytes()))
            .await
            .context("Event append task panicked")?
    }

    /// Replay all envelopes in append order.
    ///
    /// A trailing line that fails to parse is a write still in progress
    /// and is skipped. Anything unparsable before the last line is
    /// corruption and an error.
    pub async fn replay(&self) -> Result<Vec<Envelope>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut envelopes = Vec::new();
        let mut pending: Option<(usize, String, serde_json::Error)> = None;
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            if let Some((bad_line, content, err)) = pending.take() {
                anyhow::bail!(
                    "Corrupt event log {} at line {}: {} ({})",
                    self.events_path.display(),
                    bad_line,
                    err,
                    content
                );
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => pending = Some((line_no, line, err)),
            }
        }

        if let Some((bad_line, _, err)) = pending {
            warn!(
                execution_id = %self.execution_id,
                line = bad_line,
                error = %err,
                "Skipping incomplete trailing event"
            );
        }

        Ok(envelopes)
    }

    /// Replay and fold the log into an [`Execution`]
    pub async fn load(&self) -> Result<Execution> {
        let envelopes = self.replay().await?;
        Execution::from_envelopes(self.execution_id, &envelopes)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("Failed to rebuild execution {}", self.execution_id))
    }

    /// List all execution IDs under a base directory
    pub async fn list_executions(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut executions = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        executions.push(uuid);
                    }
                }
            }
        }

        Ok(executions)
    }
}

fn append_locked(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    discard_torn_tail(&mut file)
        .with_context(|| format!("Failed to repair events file: {}", path.display()))?;

    file.write_all(bytes).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;

    // Lock released on drop
    Ok(())
}

/// Truncate an unterminated last line so the next envelope starts a line
/// of its own. Caller holds the lock.
fn discard_torn_tail(file: &mut std::fs::File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut buf = vec![0u8; 4096];
    let mut end = len;
    let mut keep = 0;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    warn!(dropped_bytes = len - keep, "Discarding incomplete trailing event");
    file.set_len(keep)
}

/// Generate an idempotency key for a step execution
pub fn generate_idempotency_key(execution_id: Uuid, step_name: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", execution_id, step_name, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Message, PipelineQueue, PipelineRef};
    use serde_json::Map;
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = EventStore::open_in(temp_dir.path(), Uuid::new_v4())
            .await
            .unwrap();
        (store, temp_dir)
    }

    fn queued(target: PipelineRef, name: &str) -> Envelope {
        Message::PipelineQueued(PipelineQueue {
            pipeline: target,
            name: name.to_string(),
            args: Map::new(),
            parent_step_execution_id: None,
        })
        .to_envelope()
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());

        for i in 0..5 {
            store.append(&queued(target, &format!("p{}", i))).await.unwrap();
        }

        let envelopes = store.replay().await.unwrap();
        assert_eq!(envelopes.len(), 5);
        for (i, envelope) in envelopes.iter().enumerate() {
            assert_eq!(envelope.payload["name"], format!("p{}", i));
        }
    }

    #[tokio::test]
    async fn test_replay_missing_log_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::at(temp.path(), Uuid::new_v4());
        assert!(!store.exists());
        assert!(store.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_skipped() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());
        store.append(&queued(target, "ok")).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.events_path())
            .unwrap();
        file.write_all(b"{\"event_type\":\"pipeline_sta").unwrap();

        let envelopes = store.replay().await.unwrap();
        assert_eq!(envelopes.len(), 1);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_starts_fresh_line() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());
        store.append(&queued(target, "before")).await.unwrap();

        std::fs::OpenOptions::new()
            .append(true)
            .open(store.events_path())
            .unwrap()
            .write_all(b"{\"event_type\":\"pipeline_lo")
            .unwrap();
        store.append(&queued(target, "after")).await.unwrap();

        let envelopes = store.replay().await.unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[1].payload["name"], "after");

        let content = std::fs::read_to_string(store.events_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<Envelope>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn test_torn_first_line_is_discarded() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());
        std::fs::write(store.events_path(), b"{\"event_ty").unwrap();

        store.append(&queued(target, "only")).await.unwrap();
        let envelopes = store.replay().await.unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].payload["name"], "only");
    }

    #[tokio::test]
    async fn test_corruption_mid_log_is_an_error() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());
        store.append(&queued(target, "first")).await.unwrap();

        std::fs::OpenOptions::new()
            .append(true)
            .open(store.events_path())
            .unwrap()
            .write_all(b"garbage\n")
            .unwrap();
        store.append(&queued(target, "second")).await.unwrap();

        assert!(store.replay().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let (store, _temp) = create_test_store().await;
        let target = PipelineRef::new(store.execution_id(), Uuid::new_v4());

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let envelope = queued(target, &format!("{}-{}", i, "x".repeat(4096)));
            handles.push(tokio::spawn(async move { store.append(&envelope).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.replay().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_list_executions() {
        let temp = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        EventStore::open_in(temp.path(), a).await.unwrap();
        EventStore::open_in(temp.path(), b).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-uuid")).unwrap();

        let mut ids = EventStore::list_executions(temp.path()).await.unwrap();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_idempotency_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = generate_idempotency_key(id, "fetch", "{\"url\":\"x\"}");

        assert!(key.starts_with("550e8400-e29b-41d4-a716-446655440000:fetch:"));

        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        assert_eq!(hash_input("test input"), hash_input("test input"));
        assert_ne!(hash_input("test input"), hash_input("different input"));
        assert_eq!(hash_input("test input").len(), 16);
    }
}
