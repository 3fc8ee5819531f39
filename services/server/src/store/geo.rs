//! Geospatial operations layered over sorted sets: the member's score is its
//! 52-bit geohash, cast to f64 (exact — the hash fits the mantissa).

use crate::geo;

use super::{KvStore, StoreError, Value};

impl KvStore {
    /// `GEOADD` — validate, encode, and store as a sorted-set member.
    /// Returns true iff the member is newly added.
    pub async fn geoadd(
        &self,
        key: &str,
        member: &str,
        longitude: f64,
        latitude: f64,
    ) -> Result<bool, StoreError> {
        let hash = geo::encode(longitude, latitude).ok_or(StoreError::InvalidCoordinates)?;
        self.zadd(key, member, hash as f64).await
    }

    /// `GEOPOS` — decode the stored score back to (longitude, latitude).
    pub async fn geopos(&self, key: &str, member: &str) -> Result<Option<(f64, f64)>, StoreError> {
        let score = self.zscore(key, member).await?;
        Ok(score.map(|s| geo::decode(s as u64)))
    }

    /// `GEODIST` — metres between two members; `None` if either is absent.
    pub async fn geodist(
        &self,
        key: &str,
        member1: &str,
        member2: &str,
    ) -> Result<Option<f64>, StoreError> {
        let (Some(s1), Some(s2)) = (
            self.zscore(key, member1).await?,
            self.zscore(key, member2).await?,
        ) else {
            return Ok(None);
        };
        let p1 = geo::decode(s1 as u64);
        let p2 = geo::decode(s2 as u64);
        Ok(Some(geo::distance_m(p1, p2)))
    }

    /// `GEOSEARCH FROMLONLAT ... BYRADIUS` — linear scan of the members,
    /// keeping those within `radius_m` metres of the centre.
    pub async fn geosearch_from_lonlat_by_radius(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_m: f64,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let zset = match inner.map.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::SortedSet(zset)) => zset,
            Some(_) => return Err(StoreError::WrongType),
        };
        let centre = (longitude, latitude);
        Ok(zset
            .iter_ordered()
            .filter(|(score, _)| geo::distance_m(geo::decode(*score as u64), centre) <= radius_m)
            .map(|(_, member)| member.to_owned())
            .collect())
    }
}
