//! The typed keyspace.
//!
//! One coarse async mutex guards the key map and the blocking-pop wait
//! queues together; every command is a critical section per affected key.
//! Stream readers that block wait on a broadcast channel the store owns —
//! `XADD` notifies while still holding the mutex, and waiters subscribe
//! before releasing it, so a wake can never slip between re-check and park.

mod geo;
mod list;
mod stream;
mod string;
mod zset;

pub use stream::{StreamEntry, StreamId};
pub(crate) use stream::parse_read_cursor;

use kv_snapshot::SnapshotRecord;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::debug;

use string::StringValue;
use zset::SortedSetValue;

/// Errors a keyspace operation can surface to a client. The `Display` text
/// is the exact wire payload placed after the `-` of a simple error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("ERR value is not a valid float")]
    NotAFloat,
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    StreamIdZero,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,
    #[error("ERR Invalid stream ID specified as stream command argument")]
    BadStreamId,
    #[error("ERR Invalid (longitude, latitude): Out of range.")]
    InvalidCoordinates,
}

/// A stored value, tagged with its type.
///
/// `Hash`, `Set`, and `VectorSet` reserve their slots in the Redis type-tag
/// space; no command constructs them yet.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Value {
    Str(StringValue),
    List(VecDeque<String>),
    Stream(stream::StreamValue),
    SortedSet(SortedSetValue),
    Hash,
    Set,
    VectorSet,
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Stream(_) => "stream",
            Value::SortedSet(_) => "zset",
            Value::Hash => "hash",
            Value::Set => "set",
            Value::VectorSet => "vectorset",
        }
    }
}

pub(crate) struct Inner {
    map: HashMap<String, Value>,
    /// One pending wake signal per blocked `BLPOP` client, FIFO per key.
    blpop_waiters: HashMap<String, VecDeque<oneshot::Sender<()>>>,
}

impl Inner {
    /// Wake at most one live waiter for `key`. Waiters that timed out have
    /// dropped their receiving end; their stale slots are discarded here so
    /// they cannot eat a wake.
    fn wake_one(&mut self, key: &str) {
        if let Some(queue) = self.blpop_waiters.get_mut(key) {
            while let Some(signal) = queue.pop_front() {
                if signal.send(()).is_ok() {
                    break;
                }
            }
            if queue.is_empty() {
                self.blpop_waiters.remove(key);
            }
        }
    }
}

pub struct KvStore {
    inner: Mutex<Inner>,
    /// Fan-out wake for every blocked stream reader, regardless of key.
    stream_wake: broadcast::Sender<()>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        let (stream_wake, _) = broadcast::channel(64);
        KvStore {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                blpop_waiters: HashMap::new(),
            }),
            stream_wake,
        }
    }

    /// `TYPE` — the tag name of the stored value, or `none`.
    pub async fn type_name(&self, key: &str) -> &'static str {
        let inner = self.inner.lock().await;
        inner.map.get(key).map_or("none", Value::type_name)
    }

    /// `KEYS` — every key. The pattern is accepted by the command layer but
    /// glob matching is not implemented; all keys are returned.
    pub async fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.map.keys().cloned().collect()
    }

    /// Load string records recovered from a snapshot. Absolute expiries are
    /// converted to remaining time-to-live; an already-past expiry becomes a
    /// zero TTL, which the lazy expiry check treats as dead on first read.
    pub async fn load_snapshot(&self, records: Vec<SnapshotRecord>) {
        let now_ms = stream::unix_time_ms();
        for record in records {
            debug!(key = %record.key, "loading snapshot record");
            match record.expires_at_ms {
                None => self.set(&record.key, record.value).await,
                Some(at_ms) => {
                    let remaining = Duration::from_millis(at_ms.saturating_sub(now_ms));
                    self.set_expire(&record.key, record.value, remaining).await;
                }
            }
        }
    }
}

/// Clamp a `[start, stop]` request with negative indexing onto `0..len`.
///
/// Shared by `LRANGE` and `ZRANGE`. Callers must still treat
/// `start >= len`, `start > stop`, or `stop < 0` as an empty range.
pub(crate) fn clamp_range(mut start: i64, mut stop: i64, len: i64) -> (i64, i64) {
    if start < 0 {
        start += len;
    }
    if start < 0 {
        start = 0;
    }
    if stop < 0 {
        stop += len;
    }
    if stop >= len {
        stop = len - 1;
    }
    (start, stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn type_names_follow_the_stored_tag() {
        let store = KvStore::new();
        assert_eq!(store.type_name("missing").await, "none");

        store.set("s", "v".to_owned()).await;
        assert_eq!(store.type_name("s").await, "string");

        store.rpush("l", vec!["a".to_owned()]).await.unwrap();
        assert_eq!(store.type_name("l").await, "list");

        store.zadd("z", "m", 1.0).await.unwrap();
        assert_eq!(store.type_name("z").await, "zset");

        store
            .xadd("st", "1-1", vec![("f".to_owned(), "v".to_owned())])
            .await
            .unwrap();
        assert_eq!(store.type_name("st").await, "stream");
    }

    #[tokio::test]
    async fn keys_returns_everything() {
        let store = KvStore::new();
        store.set("a", "1".to_owned()).await;
        store.set("b", "2".to_owned()).await;
        let mut keys = store.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn snapshot_records_respect_expiry() {
        let store = KvStore::new();
        let future_ms = stream::unix_time_ms() + 60_000;
        store
            .load_snapshot(vec![
                SnapshotRecord {
                    key: "live".to_owned(),
                    value: "here".to_owned(),
                    expires_at_ms: Some(future_ms),
                },
                SnapshotRecord {
                    key: "dead".to_owned(),
                    value: "gone".to_owned(),
                    expires_at_ms: Some(1),
                },
                SnapshotRecord {
                    key: "forever".to_owned(),
                    value: "kept".to_owned(),
                    expires_at_ms: None,
                },
            ])
            .await;
        assert_eq!(store.get("live").await, Some("here".to_owned()));
        assert_eq!(store.get("dead").await, None);
        assert_eq!(store.get("forever").await, Some("kept".to_owned()));
    }

    #[test]
    fn range_clamping() {
        assert_eq!(clamp_range(0, -1, 3), (0, 2));
        assert_eq!(clamp_range(-2, -1, 3), (1, 2));
        assert_eq!(clamp_range(-10, 10, 3), (0, 2));
        // Inverted and out-of-range requests stay detectable.
        let (start, stop) = clamp_range(2, 1, 3);
        assert!(start > stop);
        let (start, _) = clamp_range(5, 9, 3);
        assert!(start >= 3);
        let (_, stop) = clamp_range(0, -5, 3);
        assert!(stop < 0);
    }
}
