use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::user::User;

/// One market observation of a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub timestamp: DateTime<Utc>,
    pub address: String,
    pub symbol: String,
    pub chain_id: String,
    #[serde(rename = "priceChange_m5", default)]
    pub price_change_m5: Option<f64>,
    #[serde(rename = "volume_m5", default)]
    pub volume_m5: Option<f64>,
    #[serde(rename = "marketCap", default)]
    pub market_cap: Option<f64>,
}

impl TokenSnapshot {
    /// Content hash over every field except the timestamp.
    ///
    /// Fields are serialized as sorted-key JSON, so two snapshots with the
    /// same market data hash equal regardless of when they were taken.
    pub fn content_hash(&self) -> String {
        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
        fields.insert("address", Value::from(self.address.as_str()));
        fields.insert("symbol", Value::from(self.symbol.as_str()));
        fields.insert("priceChange_m5", number_or_null(self.price_change_m5));
        fields.insert("volume_m5", number_or_null(self.volume_m5));
        fields.insert("marketCap", number_or_null(self.market_cap));

        let canonical = serde_json::to_string(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

fn number_or_null(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Raw market data for one token as returned by the market API
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MarketQuote {
    pub chain_id: String,
    pub address: String,
    pub symbol: Option<String>,
    pub price_change_m5: Option<f64>,
    pub volume_m5: Option<f64>,
    pub market_cap: Option<f64>,
}

/// Result of resolving an address to its chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    pub chain_id: String,
    pub symbol: String,
    pub name: String,
}

/// Entry in the global tracked-token index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedToken {
    pub address: String,
    pub symbol: String,
}

/// Union of every user's watch list, keyed by chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTokenIndex {
    #[serde(default)]
    pub token_list: BTreeMap<String, Vec<TrackedToken>>,
}

impl TrackedTokenIndex {
    /// Rebuild from the user set; symbols come from `symbol_of`, falling
    /// back to the first six characters of the address.
    pub fn from_users<'a, I, F>(users: I, symbol_of: F) -> Self
    where
        I: IntoIterator<Item = &'a User>,
        F: Fn(&str) -> Option<String>,
    {
        let mut index = Self::default();
        for user in users {
            for (chain, address) in user.tracking.iter() {
                let symbol = symbol_of(address).unwrap_or_else(|| short_symbol(address));
                index.insert(chain, address, &symbol);
            }
        }
        index
    }

    pub fn insert(&mut self, chain: &str, address: &str, symbol: &str) -> bool {
        let list = self.token_list.entry(chain.to_string()).or_default();
        if list.iter().any(|t| t.address == address) {
            return false;
        }
        list.push(TrackedToken {
            address: address.to_string(),
            symbol: symbol.to_string(),
        });
        true
    }

    pub fn remove_address(&mut self, address: &str) -> bool {
        let mut removed = false;
        for list in self.token_list.values_mut() {
            let before = list.len();
            list.retain(|t| t.address != address);
            removed |= list.len() != before;
        }
        self.token_list.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.token_list
            .values()
            .any(|list| list.iter().any(|t| t.address == address))
    }

    /// Every tracked address regardless of chain
    pub fn addresses(&self) -> BTreeSet<String> {
        self.token_list
            .values()
            .flat_map(|list| list.iter().map(|t| t.address.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.token_list.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fallback display symbol
pub fn short_symbol(address: &str) -> String {
    address.chars().take(6).collect()
}
