//! String values with lazy expiry.

use std::time::{Duration, Instant};

use super::{KvStore, StoreError, Value};

#[derive(Debug, Clone)]
pub struct StringValue {
    pub value: String,
    /// `None` means no expiry.
    pub ttl: Option<Duration>,
    pub created_at: Instant,
}

impl StringValue {
    pub(crate) fn new(value: String, ttl: Option<Duration>) -> Self {
        StringValue {
            value,
            ttl,
            created_at: Instant::now(),
        }
    }

    /// Expiry is evaluated on read, never swept in the background.
    pub(crate) fn is_live(&self) -> bool {
        match self.ttl {
            None => true,
            Some(ttl) => self.created_at.elapsed() < ttl,
        }
    }
}

impl KvStore {
    /// `SET` without expiry. Replaces any existing value, whatever its type.
    pub async fn set(&self, key: &str, value: String) {
        let mut inner = self.inner.lock().await;
        inner
            .map
            .insert(key.to_owned(), Value::Str(StringValue::new(value, None)));
    }

    /// `SET` with a millisecond time-to-live.
    pub async fn set_expire(&self, key: &str, value: String, ttl: Duration) {
        let mut inner = self.inner.lock().await;
        inner.map.insert(
            key.to_owned(),
            Value::Str(StringValue::new(value, Some(ttl))),
        );
    }

    /// `GET` — the stored bytes iff the key holds a live string.
    pub async fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        match inner.map.get(key) {
            Some(Value::Str(s)) if s.is_live() => Some(s.value.clone()),
            _ => None,
        }
    }

    /// `INCR` — initialize an absent (or expired) key to 1; otherwise the
    /// stored string must parse as a signed 64-bit integer.
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let next = match inner.map.get(key) {
            None => 1,
            Some(Value::Str(s)) if !s.is_live() => 1,
            Some(Value::Str(s)) => match s.value.parse::<i64>() {
                Ok(n) => n.checked_add(1).ok_or(StoreError::NotAnInteger)?,
                Err(_) => return Err(StoreError::NotAnInteger),
            },
            Some(_) => return Err(StoreError::NotAnInteger),
        };
        inner.map.insert(
            key.to_owned(),
            Value::Str(StringValue::new(next.to_string(), None)),
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::super::KvStore;
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = KvStore::new();
        store.set("foo", "bar".to_owned()).await;
        assert_eq!(store.get("foo").await, Some("bar".to_owned()));
        assert_eq!(store.get("nope").await, None);
    }

    #[tokio::test]
    async fn set_replaces_any_previous_value() {
        let store = KvStore::new();
        store.rpush("k", vec!["a".to_owned()]).await.unwrap();
        store.set("k", "now a string".to_owned()).await;
        assert_eq!(store.get("k").await, Some("now a string".to_owned()));
        assert_eq!(store.type_name("k").await, "string");
    }

    #[tokio::test]
    async fn expired_values_read_as_absent() {
        let store = KvStore::new();
        store
            .set_expire("k", "v".to_owned(), Duration::from_millis(30))
            .await;
        assert_eq!(store.get("k").await, Some("v".to_owned()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn incr_counts_from_one() {
        let store = KvStore::new();
        assert_eq!(store.incr("n").await, Ok(1));
        assert_eq!(store.incr("n").await, Ok(2));
        assert_eq!(store.get("n").await, Some("2".to_owned()));
    }

    #[tokio::test]
    async fn incr_continues_from_a_set_value() {
        let store = KvStore::new();
        store.set("n", "41".to_owned()).await;
        assert_eq!(store.incr("n").await, Ok(42));
    }

    #[tokio::test]
    async fn incr_rejects_non_integers() {
        let store = KvStore::new();
        store.set("n", "abc".to_owned()).await;
        assert_eq!(store.incr("n").await, Err(StoreError::NotAnInteger));
        // The stored value is untouched by the failed increment.
        assert_eq!(store.get("n").await, Some("abc".to_owned()));
    }

    #[tokio::test]
    async fn incr_restarts_after_expiry() {
        let store = KvStore::new();
        store
            .set_expire("n", "99".to_owned(), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.incr("n").await, Ok(1));
    }
}
