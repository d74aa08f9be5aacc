use std::collections::HashMap;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use insight_config::Config;
use rusqlite::{params, Connection};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
}

const MAX_VISIBILITY_SECS: u64 = insight_config::MAX_VISIBILITY_TIMEOUT_SECS;

/// Named FIFO work queues. A received message stays invisible until it is
/// deleted or its visibility timeout runs out, after which it is handed out
/// again.
pub enum QueueBackend {
    Memory(MemoryQueue),
    Sqlite(SqliteQueue),
}

pub struct MemoryQueue {
    visibility: Duration,
    queues: HashMap<String, Vec<MemoryEntry>>,
}

struct MemoryEntry {
    message: QueueMessage,
    received_at: Option<DateTime<Utc>>,
}

pub struct SqliteQueue {
    conn: Connection,
    visibility: Duration,
}

impl QueueBackend {
    pub fn open(cfg: &Config) -> Result<Self, QueueError> {
        let secs = cfg.queue.visibility_timeout_secs.min(MAX_VISIBILITY_SECS);
        let visibility = Duration::seconds(i64::try_from(secs).unwrap_or(0));
        if cfg.queue.kind == "sqlite" {
            let sqlite_path = cfg.store.sqlite_path.as_deref().ok_or_else(|| {
                QueueError::Backend("store.sqlite_path is required for sqlite queue".to_string())
            })?;
            Ok(QueueBackend::Sqlite(SqliteQueue::new(sqlite_path, visibility)?))
        } else {
            Ok(QueueBackend::Memory(MemoryQueue {
                visibility,
                queues: HashMap::new(),
            }))
        }
    }

    /// Enqueues `body` and returns the new message id.
    pub fn send(&mut self, queue: &str, body: &str) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        match self {
            QueueBackend::Memory(q) => {
                q.queues.entry(queue.to_string()).or_default().push(MemoryEntry {
                    message: QueueMessage {
                        message_id: message_id.clone(),
                        body: body.to_string(),
                    },
                    received_at: None,
                });
            }
            QueueBackend::Sqlite(q) => q.send(queue, &message_id, body)?,
        }
        Ok(message_id)
    }

    /// Hands out up to `max` visible messages in send order and hides them.
    pub fn receive(&mut self, queue: &str, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        match self {
            QueueBackend::Memory(q) => {
                let now = Utc::now();
                let cutoff = now - q.visibility;
                let Some(entries) = q.queues.get_mut(queue) else {
                    return Ok(Vec::new());
                };
                let batch = entries
                    .iter_mut()
                    .filter(|e| e.received_at.map_or(true, |at| at <= cutoff))
                    .take(max)
                    .map(|e| {
                        e.received_at = Some(now);
                        e.message.clone()
                    })
                    .collect();
                Ok(batch)
            }
            QueueBackend::Sqlite(q) => q.receive(queue, max),
        }
    }

    pub fn delete(&mut self, queue: &str, message_id: &str) -> Result<(), QueueError> {
        match self {
            QueueBackend::Memory(q) => {
                if let Some(entries) = q.queues.get_mut(queue) {
                    entries.retain(|e| e.message.message_id != message_id);
                }
                Ok(())
            }
            QueueBackend::Sqlite(q) => q.delete(queue, message_id),
        }
    }

    /// Messages a receive would hand out right now.
    pub fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        match self {
            QueueBackend::Memory(q) => {
                let cutoff = Utc::now() - q.visibility;
                Ok(q.queues
                    .get(queue)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| e.received_at.map_or(true, |at| at <= cutoff))
                            .count()
                    })
                    .unwrap_or(0))
            }
            QueueBackend::Sqlite(q) => q.pending_count(queue),
        }
    }
}

// Fixed width, so stored timestamps compare correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteQueue {
    fn new(path: &str, visibility: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                queue_name TEXT NOT NULL,
                body TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                received_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_messages_pending
                ON queue_messages(queue_name, received_at, seq);
            ",
        )?;
        Ok(Self { conn, visibility })
    }

    fn send(&mut self, queue: &str, message_id: &str, body: &str) -> Result<(), QueueError> {
        self.conn.execute(
            "INSERT INTO queue_messages(message_id, queue_name, body, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            params![message_id, queue, body, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn receive(&mut self, queue: &str, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        let now = Utc::now();
        let cutoff = timestamp(now - self.visibility);
        let tx = self.conn.transaction()?;
        let batch = {
            let mut stmt = tx.prepare(
                "
                SELECT message_id, body FROM queue_messages
                WHERE queue_name = ?1 AND (received_at IS NULL OR received_at <= ?2)
                ORDER BY seq
                LIMIT ?3
                ",
            )?;
            let rows = stmt.query_map(params![queue, cutoff, limit], |row| {
                Ok(QueueMessage {
                    message_id: row.get(0)?,
                    body: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let now = timestamp(now);
        for msg in &batch {
            tx.execute(
                "UPDATE queue_messages SET received_at = ?1 WHERE message_id = ?2",
                params![now, msg.message_id],
            )?;
        }
        tx.commit()?;
        Ok(batch)
    }

    fn delete(&mut self, queue: &str, message_id: &str) -> Result<(), QueueError> {
        self.conn.execute(
            "DELETE FROM queue_messages WHERE queue_name = ?1 AND message_id = ?2",
            params![queue, message_id],
        )?;
        Ok(())
    }

    fn pending_count(&self, queue: &str) -> Result<usize, QueueError> {
        let cutoff = timestamp(Utc::now() - self.visibility);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_messages
             WHERE queue_name = ?1 AND (received_at IS NULL OR received_at <= ?2)",
            params![queue, cutoff],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sqlite_config, test_config};

    #[test]
    fn memory_queue_is_fifo_and_hides_received_messages() {
        let mut queue = QueueBackend::open(&test_config()).unwrap();
        for body in ["a", "b", "c"] {
            queue.send("work", body).unwrap();
        }
        let first = queue.receive("work", 2).unwrap();
        assert_eq!(
            first.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(queue.pending_count("work").unwrap(), 1);

        let second = queue.receive("work", 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "c");
        assert!(queue.receive("work", 10).unwrap().is_empty());
        assert!(queue.receive("other", 10).unwrap().is_empty());
    }

    #[test]
    fn sqlite_queue_persists_until_received() {
        let cfg = sqlite_config("queue-persist");
        {
            let mut queue = QueueBackend::open(&cfg).unwrap();
            queue.send("work", "first").unwrap();
            queue.send("work", "second").unwrap();
        }

        let mut queue = QueueBackend::open(&cfg).unwrap();
        assert_eq!(queue.pending_count("work").unwrap(), 2);
        let batch = queue.receive("work", 1).unwrap();
        assert_eq!(batch[0].body, "first");
        queue.delete("work", &batch[0].message_id).unwrap();

        let rest = queue.receive("work", 5).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, "second");
        assert_eq!(queue.pending_count("work").unwrap(), 0);
    }

    #[test]
    fn received_message_is_redelivered_after_visibility_timeout() {
        let mut cfg = sqlite_config("queue-redeliver");
        {
            let mut queue = QueueBackend::open(&cfg).unwrap();
            queue.send("work", "orphaned").unwrap();
            let batch = queue.receive("work", 10).unwrap();
            assert_eq!(batch.len(), 1);
            assert!(queue.receive("work", 10).unwrap().is_empty());
            // Consumer goes away without deleting.
        }

        let queue = QueueBackend::open(&cfg).unwrap();
        assert_eq!(queue.pending_count("work").unwrap(), 0);
        drop(queue);

        cfg.queue.visibility_timeout_secs = 0;
        let mut queue = QueueBackend::open(&cfg).unwrap();
        assert_eq!(queue.pending_count("work").unwrap(), 1);
        let again = queue.receive("work", 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].body, "orphaned");
        queue.delete("work", &again[0].message_id).unwrap();
        assert!(queue.receive("work", 10).unwrap().is_empty());
    }

    #[test]
    fn memory_queue_redelivers_undeleted_messages() {
        let mut cfg = test_config();
        cfg.queue.visibility_timeout_secs = 0;
        let mut queue = QueueBackend::open(&cfg).unwrap();
        queue.send("work", "a").unwrap();
        queue.send("work", "b").unwrap();

        let first = queue.receive("work", 10).unwrap();
        queue.delete("work", &first[0].message_id).unwrap();

        let second = queue.receive("work", 10).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "b");
    }
}
