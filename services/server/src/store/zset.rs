//! Sorted sets: a member→score map plus a parallel sequence kept sorted by
//! `(score asc, member asc)`. The two structures agree at all times; rank
//! and range queries binary-search the sorted sequence.

use std::collections::HashMap;

use super::{KvStore, StoreError, Value, clamp_range};

#[derive(Debug, Clone, Default)]
pub struct SortedSetValue {
    member_scores: HashMap<String, f64>,
    ordered: Vec<(f64, String)>,
}

impl SortedSetValue {
    /// Index of the first element `>= (score, member)`.
    fn lower_bound(&self, score: f64, member: &str) -> usize {
        self.ordered
            .partition_point(|(s, m)| *s < score || (*s == score && m.as_str() < member))
    }

    /// Insert or re-score a member, keeping `ordered` sorted.
    /// Returns true iff the member is new.
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let is_new = match self.member_scores.remove(member) {
            Some(old_score) => {
                let pos = self.lower_bound(old_score, member);
                self.ordered.remove(pos);
                false
            }
            None => true,
        };
        let pos = self.lower_bound(score, member);
        self.ordered.insert(pos, (score, member.to_owned()));
        self.member_scores.insert(member.to_owned(), score);
        is_new
    }

    fn rank(&self, member: &str) -> Option<usize> {
        let score = *self.member_scores.get(member)?;
        Some(self.lower_bound(score, member))
    }

    pub(crate) fn score(&self, member: &str) -> Option<f64> {
        self.member_scores.get(member).copied()
    }

    pub(crate) fn iter_ordered(&self) -> impl Iterator<Item = (f64, &str)> {
        self.ordered.iter().map(|(s, m)| (*s, m.as_str()))
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

impl KvStore {
    /// `ZADD` — returns true iff the member is newly added.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .map
            .entry(key.to_owned())
            .or_insert_with(|| Value::SortedSet(SortedSetValue::default()));
        let Value::SortedSet(zset) = entry else {
            return Err(StoreError::WrongType);
        };
        Ok(zset.insert(member, score))
    }

    /// `ZRANK` — position of the member in score order, or `None`.
    pub async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>, StoreError> {
        let inner = self.inner.lock().await;
        match inner.map.get(key) {
            None => Ok(None),
            Some(Value::SortedSet(zset)) => Ok(zset.rank(member)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// `ZRANGE` — members only, list-style negative indexing and clamping.
    pub async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let zset = match inner.map.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::SortedSet(zset)) => zset,
            Some(_) => return Err(StoreError::WrongType),
        };
        let len = zset.len() as i64;
        let (start, stop) = clamp_range(start, stop, len);
        if start >= len || start > stop || stop < 0 {
            return Ok(Vec::new());
        }
        Ok(zset
            .iter_ordered()
            .skip(usize::try_from(start).expect("clamped to >= 0"))
            .take(usize::try_from(stop - start + 1).expect("start <= stop"))
            .map(|(_, member)| member.to_owned())
            .collect())
    }

    pub async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        match inner.map.get(key) {
            None => Ok(0),
            Some(Value::SortedSet(zset)) => Ok(zset.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let inner = self.inner.lock().await;
        match inner.map.get(key) {
            None => Ok(None),
            Some(Value::SortedSet(zset)) => Ok(zset.score(member)),
            Some(_) => Err(StoreError::WrongType),
        }
    }
}
