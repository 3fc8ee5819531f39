//! Append-only streams with range and blocking reads.

use std::fmt;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;

use super::{Inner, KvStore, StoreError, Value};

/// A stream entry id: `<milliseconds>-<sequence>`, ordered lexicographically
/// over the two components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    /// Field/value pairs in the order the client sent them.
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamValue {
    pub last_id: StreamId,
    /// Strictly increasing by id.
    pub entries: Vec<StreamEntry>,
}

/// How an `XADD` id argument resolves.
enum IdSpec {
    /// `*` — current time, next sequence.
    Auto,
    /// `<ms>-*` — explicit time, next sequence for that time.
    MsAuto(u64),
    /// `<ms>-<seq>` — fully explicit.
    Exact(StreamId),
}

fn parse_id_spec(spec: &str) -> Result<IdSpec, StoreError> {
    if spec == "*" {
        return Ok(IdSpec::Auto);
    }
    let Some((ms, seq)) = spec.split_once('-') else {
        return Err(StoreError::BadStreamId);
    };
    let ms = ms.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
    if seq == "*" {
        return Ok(IdSpec::MsAuto(ms));
    }
    let seq = seq.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
    Ok(IdSpec::Exact(StreamId { ms, seq }))
}

/// Parse an `XREAD` cursor: `<ms>` or `<ms>-<seq>`; a bare time reads from
/// the start of that millisecond.
pub(crate) fn parse_read_cursor(spec: &str) -> Result<StreamId, StoreError> {
    match spec.split_once('-') {
        None => {
            let ms = spec.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
            Ok(StreamId { ms, seq: 0 })
        }
        Some((ms, seq)) => {
            let ms = ms.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
            let seq = seq.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
            Ok(StreamId { ms, seq })
        }
    }
}

/// Parse an `XRANGE` bound. `-` and `+` are the extremes; a bare `<ms>`
/// defaults the sequence to 0 at the start and to the maximum at the end.
fn parse_range_bound(spec: &str, is_start: bool) -> Result<StreamId, StoreError> {
    match spec {
        "-" => Ok(StreamId { ms: 0, seq: 0 }),
        "+" => Ok(StreamId {
            ms: u64::MAX,
            seq: u64::MAX,
        }),
        _ => match spec.split_once('-') {
            None => {
                let ms = spec.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
                let seq = if is_start { 0 } else { u64::MAX };
                Ok(StreamId { ms, seq })
            }
            Some((ms, seq)) => {
                let ms = ms.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
                let seq = seq.parse::<u64>().map_err(|_| StoreError::BadStreamId)?;
                Ok(StreamId { ms, seq })
            }
        },
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl KvStore {
    /// `XADD` — resolve the id spec against the stream's last id, validate,
    /// append, and wake every blocked stream reader.
    pub async fn xadd(
        &self,
        key: &str,
        id_spec: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamId, StoreError> {
        let spec = parse_id_spec(id_spec)?;
        let mut inner = self.inner.lock().await;
        // Resolve and validate before touching the map, so a rejected id
        // does not leave an empty stream behind.
        let last = match inner.map.get(key) {
            Some(Value::Stream(stream)) => {
                (!stream.entries.is_empty()).then_some(stream.last_id)
            }
            Some(_) => return Err(StoreError::WrongType),
            None => None,
        };

        let id = match spec {
            IdSpec::Auto => {
                let now = unix_time_ms();
                match last {
                    Some(last) if last.ms == now => StreamId {
                        ms: now,
                        seq: last.seq + 1,
                    },
                    _ => StreamId { ms: now, seq: 0 },
                }
            }
            IdSpec::MsAuto(ms) => match last {
                Some(last) if last.ms == ms => StreamId {
                    ms,
                    seq: last.seq + 1,
                },
                // `0-*` on a fresh stream starts at 0-1; 0-0 is reserved.
                None if ms == 0 => StreamId { ms, seq: 1 },
                _ => StreamId { ms, seq: 0 },
            },
            IdSpec::Exact(id) => id,
        };

        if id == (StreamId { ms: 0, seq: 0 }) {
            return Err(StoreError::StreamIdZero);
        }
        if let Some(last) = last {
            if id <= last {
                return Err(StoreError::StreamIdTooSmall);
            }
        }

        let entry = inner
            .map
            .entry(key.to_owned())
            .or_insert_with(|| Value::Stream(StreamValue::default()));
        let Value::Stream(stream) = entry else {
            // The type was checked above under the same lock.
            return Err(StoreError::WrongType);
        };
        stream.entries.push(StreamEntry { id, fields });
        stream.last_id = id;
        // Fan out to all blocked XREAD waiters while still holding the lock.
        let _ = self.stream_wake.send(());
        Ok(id)
    }

    /// `XRANGE` — inclusive on both bounds, binary-searched.
    pub async fn xrange(
        &self,
        key: &str,
        start_spec: &str,
        end_spec: &str,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let start = parse_range_bound(start_spec, true)?;
        let end = parse_range_bound(end_spec, false)?;
        let inner = self.inner.lock().await;
        let stream = match inner.map.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Stream(stream)) => stream,
            Some(_) => return Err(StoreError::WrongType),
        };
        let lo = stream.entries.partition_point(|e| e.id < start);
        let hi = stream.entries.partition_point(|e| e.id <= end);
        Ok(stream.entries[lo..hi].to_vec())
    }

    /// `XREAD` without `BLOCK`: entries strictly after each cursor, or
    /// `None` when no stream has anything new.
    pub async fn xread(
        &self,
        keys: &[String],
        after: &[StreamId],
        count: Option<usize>,
    ) -> Result<Option<Vec<Vec<StreamEntry>>>, StoreError> {
        let inner = self.inner.lock().await;
        collect_new_entries(&inner, keys, after, count)
    }

    /// `XREAD BLOCK` — wait on the store's broadcast for up to `timeout`,
    /// re-checking after every wake. Returns `None` on timeout.
    pub async fn xread_block(
        &self,
        keys: &[String],
        after: &[StreamId],
        count: Option<usize>,
        timeout: Duration,
    ) -> Result<Option<Vec<Vec<StreamEntry>>>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut wake = {
                let inner = self.inner.lock().await;
                if let Some(results) = collect_new_entries(&inner, keys, after, count)? {
                    return Ok(Some(results));
                }
                // Subscribe before releasing the lock so an XADD in the gap
                // cannot be missed.
                self.stream_wake.subscribe()
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match tokio::time::timeout(deadline - now, wake.recv()).await {
                Err(_elapsed) => return Ok(None),
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                // A wake, or a lag (which only means we missed wakes and
                // should definitely re-check).
                Ok(_) => {}
            }
        }
    }
}

fn collect_new_entries(
    inner: &Inner,
    keys: &[String],
    after: &[StreamId],
    count: Option<usize>,
) -> Result<Option<Vec<Vec<StreamEntry>>>, StoreError> {
    let mut results = Vec::with_capacity(keys.len());
    let mut any = false;
    for (key, cursor) in keys.iter().zip(after) {
        let entries = match inner.map.get(key) {
            None => Vec::new(),
            Some(Value::Stream(stream)) => {
                let lo = stream.entries.partition_point(|e| e.id <= *cursor);
                let tail = &stream.entries[lo..];
                let take = count.unwrap_or(tail.len()).min(tail.len());
                tail[..take].to_vec()
            }
            Some(_) => return Err(StoreError::WrongType),
        };
        if !entries.is_empty() {
            any = true;
        }
        results.push(entries);
    }
    Ok(any.then_some(results))
}
