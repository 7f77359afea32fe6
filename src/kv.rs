//! Thin typed wrapper over the embedded ordered KV store.
//!
//! Every write is a single `sled` insert, which is atomic per key by construction —
//! this is what backs the "KV atomicity" property: a reader never observes a partial
//! write. The store is safe to delete between runs; trackers rebuild it from the chain.

use ethers::types::U256;
use eyre::{eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

#[derive(Clone)]
pub struct IndexStore {
    db: sled::Db,
}

/// A single indexed data point: a value plus a confidence score, as written by the
/// `indexers` tracker and read by the dispute checker's point-in-time lookups.
#[derive(Debug, Clone, Copy, Serialize, serde::Deserialize)]
pub struct IndexSample {
    pub value: f64,
    pub confidence: f64,
    pub observed_at: u64,
}

impl IndexStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| eyre!("failed to open index store at {}: {e}", path.as_ref().display()))?;
        Ok(Self { db })
    }

    pub fn put_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| eyre!("kv write failed for key '{key}': {e}"))?;
        Ok(())
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key.as_bytes())
            .map_err(|e| eyre!("kv read failed for key '{key}': {e}"))?
            .map(|v| v.to_vec()))
    }

    pub fn put_u256(&self, key: &str, value: U256) -> Result<()> {
        self.put_bytes(key, format!("{:#x}", value).as_bytes())
    }

    pub fn get_u256(&self, key: &str) -> Result<Option<U256>> {
        match self.get_bytes(key)? {
            None => Ok(None),
            Some(raw) => {
                let s = std::str::from_utf8(&raw)
                    .map_err(|e| eyre!("non-utf8 value for key '{key}': {e}"))?;
                let s = s.strip_prefix("0x").unwrap_or(s);
                Ok(Some(
                    U256::from_str_radix(s, 16)
                        .map_err(|e| eyre!("invalid hex-bigint for key '{key}': {e}"))?,
                ))
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).map_err(|e| eyre!("serialize failed for '{key}': {e}"))?;
        self.put_bytes(key, &raw)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_bytes(key)? {
            None => Ok(None),
            Some(raw) => Ok(Some(
                serde_json::from_slice(&raw).map_err(|e| eyre!("deserialize failed for '{key}': {e}"))?,
            )),
        }
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.put_bytes(key, &[value as u8])
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get_bytes(key)?.map(|v| v.first().copied().unwrap_or(0) != 0))
    }

    /// The literal current value for a data feed, as the `IndexEntry` data model
    /// describes it: a hex-encoded big integer at `index/<feed_id>`, read directly by
    /// the Submitter with no scaling applied. Distinct from the time-stamped,
    /// confidence-weighted series kept for the dispute checker (`index_history/...`),
    /// which the Submitter never reads.
    pub fn get_index_value(&self, feed_id: &str) -> Result<Option<U256>> {
        self.get_u256(&format!("index/{feed_id}"))
    }

    pub fn put_index_value(&self, feed_id: &str, value: U256) -> Result<()> {
        self.put_u256(&format!("index/{feed_id}"), value)
    }

    /// Appends one time-stamped sample to a feed's history, keyed
    /// `index_history/<feed_id>/<observed_at>`, and refreshes the "latest" pointer at
    /// `index_history_latest/<feed_id>`. This series is kept only for the dispute
    /// checker's point-in-time/confidence lookups; it is a separate key namespace from
    /// the plain `index/<feed_id>` value the Submitter reads.
    pub fn push_index_sample(&self, feed_id: &str, sample: IndexSample) -> Result<()> {
        let series_key = format!("index_history/{feed_id}/{}", sample.observed_at);
        self.put_json(&series_key, &sample)?;
        self.put_json(&format!("index_history_latest/{feed_id}"), &sample)
    }

    pub fn latest_index_sample(&self, feed_id: &str) -> Result<Option<IndexSample>> {
        self.get_json(&format!("index_history_latest/{feed_id}"))
    }

    /// Point-in-time lookup: the sample for `feed_id` with `observed_at` closest to `at`,
    /// scanning the history keys in the store. Used by the dispute checker, which
    /// needs "what did we think this feed was worth around time t" rather than "now".
    pub fn index_sample_near(&self, feed_id: &str, at: u64) -> Result<Option<IndexSample>> {
        let prefix = format!("index_history/{feed_id}/");
        let mut best: Option<IndexSample> = None;
        let mut best_dist = u64::MAX;
        for kv in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = kv.map_err(|e| eyre!("kv scan failed for feed '{feed_id}': {e}"))?;
            let sample: IndexSample = serde_json::from_slice(&raw)
                .map_err(|e| eyre!("deserialize failed scanning feed '{feed_id}': {e}"))?;
            let dist = sample.observed_at.abs_diff(at);
            if dist < best_dist {
                best_dist = dist;
                best = Some(sample);
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store() -> IndexStore {
        let dir = tempdir();
        IndexStore::open(dir).expect("open sled store")
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("oracle_miner_kv_test_{}_{}", std::process::id(), rand::random::<u64>()));
        p
    }

    #[test]
    fn u256_round_trips_through_hex_encoding() {
        let store = tmp_store();
        store.put_u256("gas", U256::from(1234567u64)).unwrap();
        assert_eq!(store.get_u256("gas").unwrap(), Some(U256::from(1234567u64)));
    }

    #[test]
    fn missing_key_reads_as_none() {
        let store = tmp_store();
        assert_eq!(store.get_u256("does_not_exist").unwrap(), None);
    }

    #[test]
    fn index_sample_near_picks_closest_observation() {
        let store = tmp_store();
        store
            .push_index_sample("1", IndexSample { value: 10.0, confidence: 1.0, observed_at: 100 })
            .unwrap();
        store
            .push_index_sample("1", IndexSample { value: 20.0, confidence: 1.0, observed_at: 200 })
            .unwrap();

        let nearest = store.index_sample_near("1", 180).unwrap().unwrap();
        assert_eq!(nearest.observed_at, 200);
    }
}
