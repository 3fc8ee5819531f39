//! Lists: push at either end, pop at the head, blocking pop.
//!
//! # Blocking-pop wake protocol
//!
//! Pushers append under the keyspace mutex and then signal at most one
//! waiter for the key, still under the mutex. Waiters register their
//! one-shot signal *before* releasing the mutex, so any push that lands
//! after a waiter's empty-list check must observe its registration. A
//! waiter that finds the list empty after a wake (another waiter can win
//! the race) re-registers and parks again with its remaining deadline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::{KvStore, StoreError, Value, clamp_range};

impl KvStore {
    /// `RPUSH` — append, creating the list if absent. Wakes one waiter.
    pub async fn rpush(&self, key: &str, values: Vec<String>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let len = {
            let entry = inner
                .map
                .entry(key.to_owned())
                .or_insert_with(|| Value::List(VecDeque::new()));
            let Value::List(list) = entry else {
                return Err(StoreError::WrongType);
            };
            list.extend(values);
            list.len()
        };
        inner.wake_one(key);
        Ok(len)
    }

    /// `LPUSH` — prepend in reverse argument order. Wakes one waiter.
    pub async fn lpush(&self, key: &str, values: Vec<String>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let len = {
            let entry = inner
                .map
                .entry(key.to_owned())
                .or_insert_with(|| Value::List(VecDeque::new()));
            let Value::List(list) = entry else {
                return Err(StoreError::WrongType);
            };
            for value in values {
                list.push_front(value);
            }
            list.len()
        };
        inner.wake_one(key);
        Ok(len)
    }

    /// `LRANGE` with negative indexing; inverted or out-of-range requests
    /// yield an empty list.
    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let list = match inner.map.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::List(list)) => list,
            Some(_) => return Err(StoreError::WrongType),
        };
        let len = list.len() as i64;
        let (start, stop) = clamp_range(start, stop, len);
        if start >= len || start > stop || stop < 0 {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(usize::try_from(start).expect("clamped to >= 0"))
            .take(usize::try_from(stop - start + 1).expect("start <= stop"))
            .cloned()
            .collect())
    }

    pub async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        match inner.map.get(key) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// `LPOP` — remove and return the head, or `None` on empty/absent.
    pub async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.map.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(list.pop_front()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// `LPOP key n` — up to `n` head elements; `None` on empty/absent.
    pub async fn lpop_n(&self, key: &str, n: usize) -> Result<Option<Vec<String>>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.map.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => {
                if list.is_empty() {
                    return Ok(None);
                }
                let n = n.min(list.len());
                Ok(Some(list.drain(..n).collect()))
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// `BLPOP` — pop the head, waiting up to `timeout` for a push if the
    /// list is empty. `None` timeout means wait indefinitely.
    pub async fn blpop(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<String>, StoreError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let signal = {
                let mut inner = self.inner.lock().await;
                match inner.map.get_mut(key) {
                    Some(Value::List(list)) => {
                        if let Some(head) = list.pop_front() {
                            return Ok(Some(head));
                        }
                    }
                    Some(_) => return Err(StoreError::WrongType),
                    None => {}
                }
                let (tx, rx) = oneshot::channel();
                inner
                    .blpop_waiters
                    .entry(key.to_owned())
                    .or_default()
                    .push_back(tx);
                rx
            };

            match deadline {
                None => {
                    // Sender dropped without firing cannot happen while the
                    // store is alive, but a spurious wake only costs a
                    // re-check.
                    let _ = signal.await;
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    if tokio::time::timeout(deadline - now, signal).await.is_err() {
                        // Timed out. The wake we may have consumed between
                        // expiry and dropping the receiver is recovered by
                        // one last pop attempt.
                        let mut inner = self.inner.lock().await;
                        if let Some(Value::List(list)) = inner.map.get_mut(key) {
                            if let Some(head) = list.pop_front() {
                                return Ok(Some(head));
                            }
                        }
                        return Ok(None);
                    }
                }
            }
            // Woken: loop back, re-check, and either pop or re-park.
        }
    }
}
