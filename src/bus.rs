use crate::errors::{EngineError, Result};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RETRIES: i64 = 3;
const MAX_ERROR_LEN: usize = 1000;

/// A dequeued bus message as handed to subscribers.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: String,
    pub msg_type: String,
    pub payload: Value,
    pub timestamp: i64,
    pub source: String,
    pub retry_count: i64,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn(BusMessage) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionId(u64);

/// Message status row, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct MessageStatus {
    pub processed: bool,
    pub retry_count: i64,
    pub error: Option<String>,
}

/// Durable at-least-once message bus backed by an embedded SQLite table.
///
/// Rows survive restarts; unprocessed rows are replayed when polling starts.
/// Handlers run sequentially per message in timestamp order; a failing
/// handler leaves the row unprocessed with bumped retry accounting, and rows
/// that exhaust their retries are dead-lettered in place.
pub struct Bus {
    conn: Mutex<Connection>,
    handlers: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_subscription: AtomicU64,
    stopped: Arc<AtomicBool>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Bus {
    pub fn open(path: &Path) -> Result<Bus> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL lets the peer read while we write; this pragma returns the
        // resulting mode as a row, so query it rather than execute it
        let _mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                source TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);
            CREATE INDEX IF NOT EXISTS idx_messages_processed ON messages(processed);
            CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);",
        )?;
        Ok(Bus {
            conn: Mutex::new(conn),
            handlers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            stopped: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
        })
    }

    /// Insert a new unprocessed message tagged as coming from this engine.
    pub fn publish(&self, msg_type: &str, payload: &Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        conn.execute(
            "INSERT INTO messages (id, type, payload, timestamp, source, processed)
             VALUES (?1, ?2, ?3, ?4, 'self', 0)",
            rusqlite::params![
                id,
                msg_type,
                serde_json::to_string(payload)?,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(id)
    }

    /// Register a handler for one message type. The returned id unsubscribes.
    pub fn subscribe(&self, msg_type: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers
                .entry(msg_type.to_string())
                .or_default()
                .push((id, handler));
        }
        id
    }

    pub fn unsubscribe(&self, msg_type: &str, id: SubscriptionId) {
        if let Ok(mut handlers) = self.handlers.lock() {
            if let Some(list) = handlers.get_mut(msg_type) {
                list.retain(|(sid, _)| *sid != id);
            }
        }
    }

    /// Replay everything unprocessed, then keep polling. Call once.
    pub fn start(bus: &Arc<Bus>) {
        let task_bus = Arc::clone(bus);
        let stopped = Arc::clone(&bus.stopped);
        let handle = tokio::spawn(async move {
            while !stopped.load(Ordering::SeqCst) {
                if let Err(e) = task_bus.drain_pending().await {
                    eprintln!("[brainsurgeon bus] poll failed: {e}");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        if let Ok(mut poller) = bus.poller.lock() {
            *poller = Some(handle);
        }
    }

    /// Stop polling and wait for the in-flight batch to finish.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let handle = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One poll: deliver every live unprocessed row in publication order.
    pub async fn drain_pending(&self) -> Result<usize> {
        let pending = self.fetch_pending()?;
        let count = pending.len();
        for message in pending {
            self.deliver(message).await?;
        }
        Ok(count)
    }

    fn fetch_pending(&self) -> Result<Vec<BusMessage>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        let mut stmt = conn.prepare(
            "SELECT id, type, payload, timestamp, source, retry_count
             FROM messages
             WHERE processed = 0 AND retry_count < ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([MAX_RETRIES], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, msg_type, payload, timestamp, source, retry_count) = row?;
            let payload = serde_json::from_str(&payload).unwrap_or(Value::Null);
            out.push(BusMessage {
                id,
                msg_type,
                payload,
                timestamp,
                source,
                retry_count,
            });
        }
        Ok(out)
    }

    async fn deliver(&self, message: BusMessage) -> Result<()> {
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .ok()
            .and_then(|map| {
                map.get(&message.msg_type)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            })
            .unwrap_or_default();

        if handlers.is_empty() {
            // nothing cares about this type; don't retain it as pending
            return self.mark_processed(&message.id);
        }

        for handler in handlers {
            if let Err(e) = handler(message.clone()).await {
                return self.record_failure(&message.id, &e.to_string());
            }
        }
        self.mark_processed(&message.id)
    }

    fn mark_processed(&self, id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        conn.execute(
            "UPDATE messages SET processed = 1, processed_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    fn record_failure(&self, id: &str, error: &str) -> Result<()> {
        let mut error = error.to_string();
        error.truncate(
            error
                .char_indices()
                .nth(MAX_ERROR_LEN)
                .map(|(i, _)| i)
                .unwrap_or(error.len()),
        );
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        conn.execute(
            "UPDATE messages SET retry_count = retry_count + 1, error = ?1 WHERE id = ?2",
            rusqlite::params![error, id],
        )?;
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<Option<MessageStatus>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        let result = conn.query_row(
            "SELECT processed, retry_count, error FROM messages WHERE id = ?1",
            [id],
            |row| {
                Ok(MessageStatus {
                    processed: row.get::<_, i64>(0)? != 0,
                    retry_count: row.get(1)?,
                    error: row.get(2)?,
                })
            },
        );
        match result {
            Ok(status) => Ok(Some(status)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unprocessed rows still eligible for delivery.
    pub fn pending_count(&self) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE processed = 0 AND retry_count < ?1",
            [MAX_RETRIES],
            |row| row.get(0),
        )?)
    }

    /// Rows that exhausted their retries and sit dead-lettered in place.
    pub fn dead_letter_count(&self) -> Result<i64> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::Internal("bus mutex poisoned".into()))?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE processed = 0 AND retry_count >= ?1",
            [MAX_RETRIES],
            |row| row.get(0),
        )?)
    }
}
