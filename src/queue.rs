// Durable message queue using SQLite
//
// Every logical queue is a key range in one table. Keys are compared as
// bytes, and fresh keys are UTC timestamps with a fixed nine-digit
// fraction, so iteration order is enqueue order.

use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::message::{Entry, Message};

const KEY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Render a timestamp as a queue key
pub fn timestamp_key(stamp: DateTime<Utc>) -> Vec<u8> {
    stamp.format(KEY_FORMAT).to_string().into_bytes()
}

/// Parse a timestamp key back. `None` for caller-supplied keys.
pub fn parse_timestamp_key(key: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(key).ok()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|stamp| stamp.with_timezone(&Utc))
}

/// A persistent store of named message queues
pub struct Queue {
    conn: Mutex<Connection>,
}

impl Queue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// A throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queues (
                name TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS entries (
                queue TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (queue, key)
            ) WITHOUT ROWID;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one transaction. `Ok` commits, `Err` rolls every
    /// effect of `f` back.
    pub fn process<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Tx<'_>) -> std::result::Result<T, E>,
        E: From<RelayError>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RelayError::from)?;
        let tx = Tx { tx };

        match f(&tx) {
            Ok(value) => {
                tx.tx.commit().map_err(RelayError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.tx.rollback() {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Enqueue in a transaction of its own
    pub fn enqueue(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
        self.process(|tx| tx.enqueue(queue, message))
    }

    /// Names of every queue written so far
    pub fn list_queues(&self) -> Result<Vec<String>> {
        self.process(|tx| tx.list_queues())
    }

    pub fn len(&self, queue: &str) -> Result<usize> {
        self.process(|tx| tx.len(queue))
    }

    /// Every entry of `queue`, corrupt ones reported in place
    pub fn snapshot(&self, queue: &str) -> Result<Vec<Result<Entry>>> {
        self.process(|tx| Ok(tx.fetch(queue).collect()))
    }

    #[cfg(test)]
    pub(crate) fn insert_raw_for_test(&self, queue: &str, key: &[u8], value: &[u8]) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO entries (queue, key, value) VALUES (?1, ?2, ?3)",
            params![queue, key, value],
        )
        .unwrap();
    }
}

/// An open queue transaction
pub struct Tx<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> Tx<'conn> {
    /// Store `message` under a fresh timestamp key
    pub fn enqueue(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
        let key = self.fresh_key(queue)?;
        self.re_enqueue(&key, queue, message)?;
        Ok(key)
    }

    /// Store `message` under `key`, replacing any entry already there
    pub fn re_enqueue(&self, key: &[u8], queue: &str, message: &Message) -> Result<()> {
        let value = message.to_bytes()?;

        self.tx.execute(
            "INSERT OR IGNORE INTO queues (name) VALUES (?1)",
            params![queue],
        )?;
        self.tx.execute(
            "INSERT OR REPLACE INTO entries (queue, key, value) VALUES (?1, ?2, ?3)",
            params![queue, key, value],
        )?;

        debug!(
            "Queued {} bytes in {} as {}",
            message.size(),
            queue,
            String::from_utf8_lossy(key)
        );
        Ok(())
    }

    /// Read a raw body from `reader` and enqueue it, rejecting anything
    /// larger than `limit` bytes
    pub fn enqueue_reader<R: Read>(
        &self,
        queue: &str,
        from: &str,
        to: &[String],
        reader: R,
        limit: usize,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        reader
            .take(limit as u64 + 1)
            .read_to_end(&mut body)?;
        if body.len() > limit {
            return Err(RelayError::Capacity {
                size: body.len(),
                limit,
            });
        }

        self.enqueue(queue, &Message::new(from, to.to_vec(), body))
    }

    /// First entry of `queue`, or `None` when it is empty
    pub fn dequeue(&self, queue: &str) -> Result<Option<Entry>> {
        self.fetch(queue).next().transpose()
    }

    /// Lazy ascending cursor over `queue`
    pub fn fetch(&self, queue: &str) -> Cursor<'_, 'conn> {
        Cursor {
            tx: self,
            queue: queue.to_string(),
            after: None,
            done: false,
        }
    }

    /// Cursor over the entries strictly after `key`
    pub fn fetch_after(&self, queue: &str, key: &[u8]) -> Cursor<'_, 'conn> {
        Cursor {
            tx: self,
            queue: queue.to_string(),
            after: Some(key.to_vec()),
            done: false,
        }
    }

    /// Delete a batch of keys, returning how many existed
    pub fn remove_all(&self, queue: &str, keys: &[Vec<u8>]) -> Result<usize> {
        let mut stmt = self
            .tx
            .prepare_cached("DELETE FROM entries WHERE queue = ?1 AND key = ?2")?;

        let mut removed = 0;
        for key in keys {
            removed += stmt.execute(params![queue, key])?;
        }

        debug!("Removed {} of {} keys from {}", removed, keys.len(), queue);
        Ok(removed)
    }

    pub fn len(&self, queue: &str) -> Result<usize> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM entries WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn list_queues(&self) -> Result<Vec<String>> {
        let mut stmt = self.tx.prepare("SELECT name FROM queues ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn contains(&self, queue: &str, key: &[u8]) -> Result<bool> {
        let found = self
            .tx
            .query_row(
                "SELECT 1 FROM entries WHERE queue = ?1 AND key = ?2",
                params![queue, key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn last_key(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let key = self
            .tx
            .query_row(
                "SELECT key FROM entries WHERE queue = ?1 ORDER BY key DESC LIMIT 1",
                params![queue],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    fn fresh_key(&self, queue: &str) -> Result<Vec<u8>> {
        let mut stamp = Utc::now();

        // Never sort before the newest timestamp already queued
        if let Some(last) = self.last_key(queue)?.as_deref().and_then(parse_timestamp_key) {
            if last >= stamp {
                stamp = last + Duration::nanoseconds(1);
            }
        }

        loop {
            let key = timestamp_key(stamp);
            if !self.contains(queue, &key)? {
                return Ok(key);
            }
            stamp += Duration::nanoseconds(1);
        }
    }

    fn next_row(&self, queue: &str, after: Option<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let row = match after {
            Some(after) => self
                .tx
                .prepare_cached(
                    "SELECT key, value FROM entries WHERE queue = ?1 AND key > ?2
                     ORDER BY key LIMIT 1",
                )?
                .query_row(params![queue, after], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?,
            None => self
                .tx
                .prepare_cached(
                    "SELECT key, value FROM entries WHERE queue = ?1 ORDER BY key LIMIT 1",
                )?
                .query_row(params![queue], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?,
        };
        Ok(row)
    }
}

/// Forward cursor over one queue. Borrowing the transaction keeps it from
/// outliving it. Each step re-reads the store, so entries removed earlier in
/// the same transaction are not yielded.
pub struct Cursor<'tx, 'conn> {
    tx: &'tx Tx<'conn>,
    queue: String,
    after: Option<Vec<u8>>,
    done: bool,
}

impl Cursor<'_, '_> {
    /// Key of the last entry yielded
    pub fn position(&self) -> Option<&[u8]> {
        self.after.as_deref()
    }
}

impl Iterator for Cursor<'_, '_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.tx.next_row(&self.queue, self.after.as_deref()) {
            Ok(Some((key, value))) => {
                self.after = Some(key.clone());
                Some(Message::from_bytes(&key, &value).map(|message| Entry { key, message }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
