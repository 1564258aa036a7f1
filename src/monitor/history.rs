//! Per-token snapshot history with change detection
//!
//! Each address keeps the newest `depth` snapshots (newest first) and the
//! content hash of the newest one. An update whose hash matches is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::domain::{parse_instant, TokenSnapshot};
use crate::error::Result;
use crate::persistence::store::{collections, fields, DocumentStore, Fields};

/// Ring of recent snapshots for one address
#[derive(Debug, Clone, Default)]
pub struct TokenHistory {
    pub chain_id: String,
    pub symbol: String,
    pub ring: VecDeque<TokenSnapshot>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "priceChange_m5", default)]
    price_change_m5: Option<f64>,
    #[serde(rename = "volume_m5", default)]
    volume_m5: Option<f64>,
    #[serde(rename = "marketCap", default)]
    market_cap: Option<f64>,
}

/// RFC 3339, or zone-less `YYYY-MM-DD HH:MM:SS` taken as UTC
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_instant(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp {:?}", raw)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryDoc {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    symbol: String,
}

pub struct HistoryStore {
    depth: usize,
    entries: HashMap<String, TokenHistory>,
    /// Snapshots seen in recent cycles, purged eagerly
    active: HashMap<String, VecDeque<TokenSnapshot>>,
}

impl HistoryStore {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }

    /// Snapshots for an address, newest first
    pub fn ring(&self, address: &str) -> Vec<TokenSnapshot> {
        self.entries
            .get(address)
            .map(|h| h.ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hash(&self, address: &str) -> Option<&str> {
        self.entries.get(address).and_then(|h| h.hash.as_deref())
    }

    pub fn active_window(&self, address: &str) -> Vec<TokenSnapshot> {
        self.active
            .get(address)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Record a snapshot. Returns false, leaving history untouched, when its
    /// content hash equals the last recorded one.
    pub fn update(&mut self, snapshot: TokenSnapshot) -> bool {
        let hash = snapshot.content_hash();
        let entry = self.entries.entry(snapshot.address.clone()).or_default();

        if entry.hash.as_deref() == Some(hash.as_str()) {
            return false;
        }

        entry.chain_id = snapshot.chain_id.clone();
        entry.symbol = snapshot.symbol.clone();
        entry.hash = Some(hash);
        entry.ring.push_front(snapshot.clone());
        entry.ring.truncate(self.depth);

        let window = self.active.entry(snapshot.address.clone()).or_default();
        window.push_front(snapshot);
        window.truncate(self.depth);
        true
    }

    /// Drop history for addresses nobody tracks and window entries for
    /// addresses outside the active set. Returns the number of histories dropped.
    pub fn cleanup(&mut self, tracked: &BTreeSet<String>, active: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|addr, _| tracked.contains(addr));
        self.active
            .retain(|addr, _| tracked.contains(addr) && active.contains(addr));

        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("Dropped history for {} untracked tokens", dropped);
        }
        dropped
    }

    /// Rebuild rings from persisted documents, recomputing missing hashes.
    ///
    /// The active window starts out as a copy of each loaded ring.
    pub fn load(&mut self, docs: Vec<(String, Value)>) -> usize {
        let mut loaded = 0;
        for (address, doc) in docs {
            let doc: HistoryDoc = match serde_json::from_value(doc) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Skipping malformed history for {}: {}", address, e);
                    continue;
                }
            };

            let ring: VecDeque<TokenSnapshot> = doc
                .sessions
                .into_iter()
                .take(self.depth)
                .map(|s| TokenSnapshot {
                    timestamp: s.timestamp,
                    address: address.clone(),
                    symbol: doc.symbol.clone(),
                    chain_id: doc.chain_id.clone(),
                    price_change_m5: s.price_change_m5,
                    volume_m5: s.volume_m5,
                    market_cap: s.market_cap,
                })
                .collect();

            let hash = doc
                .hash
                .filter(|h| !h.is_empty())
                .or_else(|| ring.front().map(TokenSnapshot::content_hash));

            self.active.insert(address.clone(), ring.clone());
            self.entries.insert(
                address,
                TokenHistory {
                    chain_id: doc.chain_id,
                    symbol: doc.symbol,
                    ring,
                    hash,
                },
            );
            loaded += 1;
        }

        info!("Loaded history for {} tokens", loaded);
        loaded
    }

    pub async fn load_from(&mut self, store: &dyn DocumentStore) -> Result<usize> {
        let docs = store.find_all(collections::TOKEN_HISTORY).await?;
        Ok(self.load(docs))
    }

    fn to_fields(address: &str, history: &TokenHistory) -> Result<Fields> {
        let sessions: Vec<Session> = history
            .ring
            .iter()
            .map(|s| Session {
                timestamp: s.timestamp,
                price_change_m5: s.price_change_m5,
                volume_m5: s.volume_m5,
                market_cap: s.market_cap,
            })
            .collect();

        Ok(fields([
            ("sessions", serde_json::to_value(sessions)?),
            ("hash", serde_json::to_value(&history.hash)?),
            ("address", Value::from(address)),
            ("chain_id", Value::from(history.chain_id.as_str())),
            ("symbol", Value::from(history.symbol.as_str())),
        ]))
    }

    /// Persist every tracked history in one bulk write.
    ///
    /// Untracked histories are dropped from memory and from the store first.
    pub async fn flush(
        &mut self,
        store: &dyn DocumentStore,
        tracked: &BTreeSet<String>,
    ) -> Result<usize> {
        let untracked: Vec<String> = self
            .entries
            .keys()
            .filter(|addr| !tracked.contains(*addr))
            .cloned()
            .collect();
        if !untracked.is_empty() {
            for addr in &untracked {
                self.entries.remove(addr);
                self.active.remove(addr);
            }
            store
                .delete_many(collections::TOKEN_HISTORY, &untracked)
                .await?;
        }

        let updates = self
            .entries
            .iter()
            .map(|(addr, history)| Self::to_fields(addr, history).map(|f| (addr.clone(), f)))
            .collect::<Result<Vec<_>>>()?;

        store
            .bulk_update(collections::TOKEN_HISTORY, &updates)
            .await?;
        info!("Flushed history for {} tokens", updates.len());
        Ok(updates.len())
    }

    /// Forget addresses and delete their stored history
    pub async fn remove(&mut self, store: &dyn DocumentStore, addresses: &[String]) -> Result<()> {
        for addr in addresses {
            self.entries.remove(addr);
            self.active.remove(addr);
        }
        store
            .delete_many(collections::TOKEN_HISTORY, addresses)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn snap(address: &str, pct: f64) -> TokenSnapshot {
        TokenSnapshot {
            timestamp: Utc::now(),
            address: address.to_string(),
            symbol: "PEPE".to_string(),
            chain_id: "ethereum".to_string(),
            price_change_m5: Some(pct),
            volume_m5: Some(10_000.0),
            market_cap: Some(5_000_000.0),
        }
    }

    fn tracked(addrs: &[&str]) -> BTreeSet<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut history = HistoryStore::new(3);
        let s = snap("a", 6.0);
        assert!(history.update(s.clone()));

        let mut later = s.clone();
        later.timestamp = s.timestamp + Duration::minutes(1);
        assert!(!history.update(later));
        assert_eq!(history.ring("a").len(), 1);
    }

    #[test]
    fn test_ring_bounded_newest_first() {
        let mut history = HistoryStore::new(3);
        for pct in [1.0, 2.0, 3.0, 4.0, 5.0] {
            assert!(history.update(snap("a", pct)));
        }

        let ring: Vec<f64> = history
            .ring("a")
            .iter()
            .filter_map(|s| s.price_change_m5)
            .collect();
        assert_eq!(ring, vec![5.0, 4.0, 3.0]);
        assert_eq!(history.active_window("a").len(), 3);
        assert_eq!(history.hash("a"), Some(snap("a", 5.0).content_hash().as_str()));
    }

    #[test]
    fn test_cleanup_respects_tracked_and_active_sets() {
        let mut history = HistoryStore::new(3);
        history.update(snap("a", 1.0));
        history.update(snap("b", 1.0));
        history.update(snap("c", 1.0));

        let active: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(history.cleanup(&tracked(&["a", "b"]), &active), 1);

        assert!(history.contains("b"));
        assert!(!history.contains("c"));
        assert_eq!(history.active_len(), 1);
    }

    #[tokio::test]
    async fn test_flush_and_load_roundtrip() {
        let store = MemoryStore::new();
        let mut history = HistoryStore::new(3);
        history.update(snap("a", 1.0));
        history.update(snap("a", 2.0));
        history.update(snap("gone", 9.0));

        let written = history.flush(&store, &tracked(&["a"])).await.unwrap();
        assert_eq!(written, 1);
        assert!(!history.contains("gone"));
        assert_eq!(store.len("token_history"), 1);

        let mut reloaded = HistoryStore::new(3);
        assert_eq!(reloaded.load_from(&store).await.unwrap(), 1);
        assert_eq!(reloaded.ring("a").len(), 2);
        assert_eq!(reloaded.hash("a"), history.hash("a"));

        // Same data after restart is not a change
        assert!(!reloaded.update(snap("a", 2.0)));
    }

    #[test]
    fn test_load_recomputes_missing_hash() {
        let doc = serde_json::json!({
            "sessions": [
                {"timestamp": "2025-01-01T00:05:00Z", "priceChange_m5": 3.5, "volume_m5": 100.0, "marketCap": 1000.0},
                {"timestamp": "2025-01-01T00:00:00Z", "priceChange_m5": 1.0, "volume_m5": 90.0, "marketCap": 990.0}
            ],
            "chain_id": "solana",
            "symbol": "BONK"
        });

        let mut history = HistoryStore::new(3);
        assert_eq!(history.load(vec![("mint".to_string(), doc)]), 1);

        let newest = &history.ring("mint")[0];
        assert_eq!(history.hash("mint"), Some(newest.content_hash().as_str()));
        assert_eq!(newest.symbol, "BONK");
    }

    #[test]
    fn test_load_accepts_zoneless_session_timestamps() {
        let doc = serde_json::json!({
            "sessions": [
                {"timestamp": "2025-01-01 00:05:00", "priceChange_m5": 6.0, "volume_m5": 100.0, "marketCap": 1000.0},
                {"timestamp": "2025-01-01T00:00:00+00:00", "priceChange_m5": 2.0}
            ],
            "chain_id": "solana",
            "symbol": "WIF"
        });

        let mut history = HistoryStore::new(3);
        assert_eq!(history.load(vec![("mint".to_string(), doc)]), 1);

        let ring = history.ring("mint");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring[0].timestamp, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
        assert_eq!(ring[1].timestamp, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(history.active_window("mint").len(), 2);

        let bad = serde_json::json!({"sessions": [{"timestamp": "yesterday"}]});
        assert_eq!(history.load(vec![("other".to_string(), bad)]), 0);
    }

    #[tokio::test]
    async fn test_remove_deletes_documents() {
        let store = MemoryStore::new();
        let mut history = HistoryStore::new(3);
        history.update(snap("a", 1.0));
        history.flush(&store, &tracked(&["a"])).await.unwrap();

        history.remove(&store, &["a".to_string()]).await.unwrap();
        assert!(history.is_empty());
        assert_eq!(store.len("token_history"), 0);
    }
}
