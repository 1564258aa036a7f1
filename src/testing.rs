//! In-process fakes for driving the service without network access

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::adapters::MarketDataSource;
use crate::domain::{ChainInfo, MarketQuote};
use crate::error::{Result, SpikeError};

/// Market source that serves a scripted quote board.
///
/// `set_quotes` replaces the board; each `fetch_chunk` returns the board
/// entries for the requested addresses, in request order.
#[derive(Default)]
pub struct ScriptedMarketSource {
    board: Mutex<HashMap<String, MarketQuote>>,
    lookups: Mutex<HashMap<String, ChainInfo>>,
    failing_chains: Mutex<HashSet<String>>,
    requested: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedMarketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quotes(&self, quotes: Vec<MarketQuote>) {
        if let Ok(mut board) = self.board.lock() {
            *board = quotes.into_iter().map(|q| (q.address.clone(), q)).collect();
        }
    }

    /// Register the answer for `lookup_chain_info`
    pub fn set_lookup(&self, address: &str, info: ChainInfo) {
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.insert(address.to_string(), info);
        }
    }

    /// Every chunk for `chain` fails as if retries were exhausted
    pub fn fail_chain(&self, chain: &str) {
        if let Ok(mut failing) = self.failing_chains.lock() {
            failing.insert(chain.to_string());
        }
    }

    /// Chunks requested so far as `(chain, addresses)`
    pub fn requested(&self) -> Vec<(String, Vec<String>)> {
        self.requested
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn clear_requested(&self) {
        if let Ok(mut requested) = self.requested.lock() {
            requested.clear();
        }
    }
}

#[async_trait]
impl MarketDataSource for ScriptedMarketSource {
    async fn fetch_chunk(&self, chain: &str, addresses: &[String]) -> Result<Vec<MarketQuote>> {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push((chain.to_string(), addresses.to_vec()));
        }

        let failing = self
            .failing_chains
            .lock()
            .map(|f| f.contains(chain))
            .unwrap_or(false);
        if failing {
            return Err(SpikeError::MarketFetch(format!(
                "{} chunk failed after retries",
                chain
            )));
        }

        let board = self
            .board
            .lock()
            .map_err(|_| SpikeError::Internal("quote board poisoned".into()))?;
        Ok(addresses
            .iter()
            .filter_map(|a| board.get(a))
            .map(|q| MarketQuote {
                chain_id: chain.to_string(),
                ..q.clone()
            })
            .collect())
    }

    async fn lookup_chain_info(&self, address: &str) -> Result<Option<ChainInfo>> {
        Ok(self
            .lookups
            .lock()
            .map_err(|_| SpikeError::Internal("lookup table poisoned".into()))?
            .get(address)
            .cloned())
    }
}
