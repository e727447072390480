use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gatehouse_config::Audit as AuditConfig;
use gatehouse_contracts::AuditEvent;
use gatehouse_kernel::jcs_sha256_hex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink io failed: {0}")]
    Io(String),
    #[error("audit record encode failed: {0}")]
    Encode(String),
    #[error("audit buffer full (capacity {0})")]
    Full(usize),
    #[error("audit sqlite mirror failed: {0}")]
    Sqlite(String),
    #[error("unsupported audit sink: {0}")]
    UnsupportedSink(String),
}

/// Append-only audit recorder. `record` never fails: sink errors are
/// counted and logged, and read back through [`AuditLog::health`].
pub struct AuditLog {
    sink: AuditSink,
    health: AuditHealth,
}

pub enum AuditSink {
    Memory(MemoryAuditSink),
    Stdout,
    Jsonl(JsonlAuditSink),
}

pub const DEFAULT_MEMORY_CAPACITY: usize = 10_000;

#[derive(Default)]
struct AuditHealth {
    recorded: AtomicU64,
    failures: AtomicU64,
    mirror_failures: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

/// `failures` counts events that were lost. `mirror_failures` counts events
/// persisted to the primary sink whose SQLite mirror insert failed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditHealthSnapshot {
    pub sink: &'static str,
    pub recorded: u64,
    pub failures: u64,
    pub mirror_failures: u64,
    pub last_error: Option<String>,
}

impl AuditHealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.failures == 0 && self.mirror_failures == 0
    }
}

impl AuditLog {
    pub fn new(sink: AuditSink) -> Self {
        Self {
            sink,
            health: AuditHealth::default(),
        }
    }

    pub async fn from_config(cfg: &AuditConfig) -> Result<Self, AuditError> {
        let sink = match cfg.sink.as_str() {
            "memory" => AuditSink::Memory(MemoryAuditSink::with_capacity(cfg.memory_capacity)),
            "stdout" => AuditSink::Stdout,
            "jsonl" => {
                let path = cfg.jsonl_path.as_deref().ok_or_else(|| {
                    AuditError::UnsupportedSink("jsonl sink requires jsonl_path".to_string())
                })?;
                AuditSink::Jsonl(
                    JsonlAuditSink::open(path, cfg.hash_chain, cfg.sqlite_path.as_deref()).await?,
                )
            }
            other => return Err(AuditError::UnsupportedSink(other.to_string())),
        };
        Ok(Self::new(sink))
    }

    pub async fn record(&self, event: AuditEvent) {
        match self.sink.write(&event).await {
            Ok(None) => {
                self.health.recorded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    trace_id = %event.trace_id,
                    decision = event.decision.as_str(),
                    "audit event recorded"
                );
            }
            Ok(Some(mirror_err)) => {
                self.health.recorded.fetch_add(1, Ordering::Relaxed);
                self.health.mirror_failures.fetch_add(1, Ordering::Relaxed);
                *self.health.last_error.lock() = Some(mirror_err.to_string());
                error!(
                    trace_id = %event.trace_id,
                    action_id = %event.action_id,
                    error = %mirror_err,
                    "audit event recorded but not mirrored"
                );
            }
            Err(err) => {
                self.health.failures.fetch_add(1, Ordering::Relaxed);
                *self.health.last_error.lock() = Some(err.to_string());
                error!(
                    trace_id = %event.trace_id,
                    action_id = %event.action_id,
                    decision = event.decision.as_str(),
                    error = %err,
                    "audit event could not be persisted"
                );
            }
        }
    }

    pub fn health(&self) -> AuditHealthSnapshot {
        AuditHealthSnapshot {
            sink: self.sink.name(),
            recorded: self.health.recorded.load(Ordering::Relaxed),
            failures: self.health.failures.load(Ordering::Relaxed),
            mirror_failures: self.health.mirror_failures.load(Ordering::Relaxed),
            last_error: self.health.last_error.lock().clone(),
        }
    }

    pub fn sink(&self) -> &AuditSink {
        &self.sink
    }
}

impl AuditSink {
    pub fn name(&self) -> &'static str {
        match self {
            AuditSink::Memory(_) => "memory",
            AuditSink::Stdout => "stdout",
            AuditSink::Jsonl(_) => "jsonl",
        }
    }

    /// `Ok(Some(_))` means the event was persisted but a secondary copy
    /// failed.
    async fn write(&self, event: &AuditEvent) -> Result<Option<AuditError>, AuditError> {
        match self {
            AuditSink::Memory(sink) => sink.push(event.clone()).await.map(|()| None),
            AuditSink::Stdout => {
                let line =
                    serde_json::to_string(event).map_err(|e| AuditError::Encode(e.to_string()))?;
                println!("[AUDIT] {line}");
                Ok(None)
            }
            AuditSink::Jsonl(sink) => sink.append(event).await,
        }
    }
}

/// Bounded in-process sink. Clones share the same buffer; once `capacity`
/// events are held further writes fail with [`AuditError::Full`].
#[derive(Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    async fn push(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.lock().await;
        if events.len() >= self.capacity {
            return Err(AuditError::Full(self.capacity));
        }
        events.push(event);
        Ok(())
    }
}

struct JsonlState {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

/// Append-only JSON-lines file. With `hash_chain` each line also carries
/// `prev_hash` and `record_hash`, the SHA-256 of the JCS form of the line
/// without `record_hash`.
pub struct JsonlAuditSink {
    state: Mutex<JsonlState>,
    hash_chain: bool,
    sqlite: Option<Mutex<Connection>>,
}

impl JsonlAuditSink {
    pub async fn open(
        path: &str,
        hash_chain: bool,
        sqlite_path: Option<&str>,
    ) -> Result<Self, AuditError> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;

        let sqlite = match sqlite_path {
            Some(path) if !path.is_empty() => {
                let conn = Connection::open(path).map_err(|e| AuditError::Sqlite(e.to_string()))?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_events (
                        seq INTEGER PRIMARY KEY AUTOINCREMENT,
                        ts INTEGER NOT NULL,
                        trace_id TEXT NOT NULL,
                        user_id TEXT NOT NULL,
                        action_id TEXT NOT NULL,
                        decision TEXT NOT NULL,
                        reason TEXT,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| AuditError::Sqlite(e.to_string()))?;
                Some(Mutex::new(conn))
            }
            _ => None,
        };

        Ok(Self {
            state: Mutex::new(JsonlState { file, last_hash }),
            hash_chain,
            sqlite,
        })
    }

    /// Writes the line, then mirrors it. A mirror failure is returned as
    /// `Ok(Some(err))` because the line is already on disk.
    async fn append(&self, event: &AuditEvent) -> Result<Option<AuditError>, AuditError> {
        let mut state = self.state.lock().await;

        let mut record =
            serde_json::to_value(event).map_err(|e| AuditError::Encode(e.to_string()))?;
        let mut record_hash = None;
        if self.hash_chain {
            if let Some(obj) = record.as_object_mut() {
                obj.insert(
                    "prev_hash".to_string(),
                    state.last_hash.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }
            let hash = jcs_sha256_hex(&record).map_err(AuditError::Encode)?;
            if let Some(obj) = record.as_object_mut() {
                obj.insert("record_hash".to_string(), Value::String(hash.clone()));
            }
            record_hash = Some(hash);
        }

        let line = serde_json::to_string(&record).map_err(|e| AuditError::Encode(e.to_string()))?;
        state
            .file
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        if record_hash.is_some() {
            state.last_hash = record_hash;
        }
        drop(state);

        let Some(sqlite) = &self.sqlite else {
            return Ok(None);
        };
        let conn = sqlite.lock().await;
        let mirrored = conn.execute(
            "
            INSERT INTO audit_events
            (ts, trace_id, user_id, action_id, decision, reason, record_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                event.ts,
                event.trace_id,
                event.user_id,
                event.action_id,
                event.decision.as_str(),
                event.reason,
                line
            ],
        );
        Ok(mirrored.err().map(|e| AuditError::Sqlite(e.to_string())))
    }
}

/// Re-checks the hash chain of a JSONL audit file and returns the number of
/// records verified.
pub fn verify_audit_chain(path: &str) -> Result<usize, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut record: Value = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        let obj = record
            .as_object_mut()
            .ok_or_else(|| format!("line {} is not a JSON object", idx + 1))?;
        let record_hash = match obj.remove("record_hash") {
            Some(Value::String(hash)) => hash,
            _ => return Err(format!("line {} has no record_hash", idx + 1)),
        };
        let prev_hash = obj
            .get("prev_hash")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if count > 0 && prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                prev_hash
            ));
        }
        let expected_hash = jcs_sha256_hex(&record)
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                record_hash
            ));
        }
        prev = Some(record_hash);
        count += 1;
    }

    Ok(count)
}
