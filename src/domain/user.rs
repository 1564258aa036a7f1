use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SpikeError};

/// Chat-platform user identifier
pub type UserId = i64;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "apprentice")]
    Apprentice,
    #[serde(rename = "disciple")]
    Disciple,
    #[serde(rename = "chieftain")]
    Chieftain,
    #[serde(rename = "overlord")]
    Overlord,
    #[serde(rename = "super admin")]
    SuperAdmin,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Apprentice,
        Tier::Disciple,
        Tier::Chieftain,
        Tier::Overlord,
        Tier::SuperAdmin,
    ];

    /// Stored form
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Apprentice => "apprentice",
            Tier::Disciple => "disciple",
            Tier::Chieftain => "chieftain",
            Tier::Overlord => "overlord",
            Tier::SuperAdmin => "super admin",
        }
    }

    /// Name shown to users
    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Apprentice => "Apprentice",
            Tier::Disciple => "Disciple",
            Tier::Chieftain => "Chieftain",
            Tier::Overlord => "Overlord",
            Tier::SuperAdmin => "Super Admin",
        }
    }

    /// Maximum number of tracked addresses
    pub fn token_limit(&self) -> usize {
        match self {
            Tier::Apprentice => 3,
            Tier::Disciple => 10,
            Tier::Chieftain => 20,
            Tier::Overlord => 40,
            Tier::SuperAdmin => 999,
        }
    }

    /// Parse a stored tier name; accepts `super_admin` as well as `super admin`
    pub fn parse(raw: &str) -> Option<Tier> {
        match raw.trim().to_ascii_lowercase().replace('_', " ").as_str() {
            "apprentice" => Some(Tier::Apprentice),
            "disciple" => Some(Tier::Disciple),
            "chieftain" => Some(Tier::Chieftain),
            "overlord" => Some(Tier::Overlord),
            "super admin" => Some(Tier::SuperAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Tier {
    type Error = SpikeError;

    fn try_from(s: &str) -> Result<Self> {
        Tier::parse(s).ok_or_else(|| SpikeError::UnknownTier(s.to_string()))
    }
}

/// Addresses tracked on one chain, in insertion order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTokens {
    pub chain_id: String,
    pub addresses: Vec<String>,
}

/// Per-user watch list.
///
/// Stored as `{chain: [address, ...]}`. JSONB sorts object keys, so the user
/// document carries the chain order separately under [`TRACKING_ORDER_FIELD`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tracking(Vec<ChainTokens>);

/// User document field holding the chain order of `tracking`
pub const TRACKING_ORDER_FIELD: &str = "tracking_order";

/// Stored forms of a watch list: the chain map, or the older list of chain groups
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTracking {
    ByChain(BTreeMap<String, Vec<String>>),
    Groups(Vec<StoredGroup>),
    Empty(()),
}

#[derive(Deserialize)]
struct StoredGroup {
    chain_id: String,
    #[serde(default)]
    addresses: Vec<String>,
}

impl Serialize for Tracking {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for group in &self.0 {
            map.serialize_entry(&group.chain_id, &group.addresses)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Tracking {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pairs: Vec<(String, String)> = match StoredTracking::deserialize(deserializer)? {
            StoredTracking::ByChain(chains) => chains
                .into_iter()
                .flat_map(|(chain, addrs)| addrs.into_iter().map(move |a| (chain.clone(), a)))
                .collect(),
            StoredTracking::Groups(groups) => groups
                .into_iter()
                .flat_map(|g| {
                    let chain = g.chain_id;
                    g.addresses.into_iter().map(move |a| (chain.clone(), a))
                })
                .collect(),
            StoredTracking::Empty(()) => Vec::new(),
        };
        Ok(Tracking::from_pairs(pairs))
    }
}

impl Tracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(chain, address)` pairs, keeping first-seen order
    pub fn from_pairs<I, C, A>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, A)>,
        C: Into<String>,
        A: Into<String>,
    {
        let mut tracking = Self::new();
        for (chain, address) in pairs {
            tracking.insert(&chain.into(), &address.into());
        }
        tracking
    }

    pub fn chains(&self) -> &[ChainTokens] {
        &self.0
    }

    pub fn chain_order(&self) -> Vec<String> {
        self.0.iter().map(|c| c.chain_id.clone()).collect()
    }

    /// Reorder chain groups to follow `order`; unlisted chains keep their
    /// relative order after the listed ones
    pub fn order_chains(&mut self, order: &[String]) {
        self.0.sort_by_key(|c| {
            order
                .iter()
                .position(|o| *o == c.chain_id)
                .unwrap_or(usize::MAX)
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|c| c.addresses.is_empty())
    }

    /// Total number of tracked addresses across chains
    pub fn len(&self) -> usize {
        self.0.iter().map(|c| c.addresses.len()).sum()
    }

    /// Iterate `(chain, address)` in chain order then address order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().flat_map(|c| {
            c.addresses
                .iter()
                .map(move |a| (c.chain_id.as_str(), a.as_str()))
        })
    }

    pub fn contains(&self, chain: &str, address: &str) -> bool {
        self.0
            .iter()
            .any(|c| c.chain_id == chain && c.addresses.iter().any(|a| a == address))
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.0.iter().any(|c| c.addresses.iter().any(|a| a == address))
    }

    /// Append an address; returns false if it was already tracked on that chain
    pub fn insert(&mut self, chain: &str, address: &str) -> bool {
        match self.0.iter_mut().find(|c| c.chain_id == chain) {
            Some(group) => {
                if group.addresses.iter().any(|a| a == address) {
                    return false;
                }
                group.addresses.push(address.to_string());
            }
            None => self.0.push(ChainTokens {
                chain_id: chain.to_string(),
                addresses: vec![address.to_string()],
            }),
        }
        true
    }

    /// Remove an address from every chain; empty chains are dropped
    pub fn remove_address(&mut self, address: &str) -> bool {
        let before = self.len();
        for group in &mut self.0 {
            group.addresses.retain(|a| a != address);
        }
        self.0.retain(|c| !c.addresses.is_empty());
        self.len() != before
    }

    /// Keep the first `limit` addresses in chain-then-insertion order.
    ///
    /// Returns true when anything was dropped.
    pub fn truncate(&mut self, limit: usize) -> bool {
        if self.len() <= limit {
            return false;
        }

        let mut remaining = limit;
        for group in &mut self.0 {
            let keep = remaining.min(group.addresses.len());
            group.addresses.truncate(keep);
            remaining -= keep;
        }
        self.0.retain(|c| !c.addresses.is_empty());
        true
    }
}

/// A registered user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub id: UserId,
    #[serde(default)]
    pub tracking: Tracking,
    /// Monitoring on/off
    #[serde(default)]
    pub status: bool,
    /// Spike threshold in percent
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Raw tier name as stored; see [`User::tier`]
    #[serde(default)]
    pub tier: Option<String>,
    /// ISO-8601 expiry as stored; see [`User::expiry_at`]
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub active_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral: Option<Value>,
}

impl User {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            tracking: Tracking::new(),
            status: false,
            threshold: None,
            tier: Some(Tier::Apprentice.as_str().to_string()),
            expiry: None,
            active_restart: false,
            referral: None,
        }
    }

    /// Decode a stored document
    pub fn from_doc(id: UserId, doc: Value) -> Result<Self> {
        let order: Vec<String> = doc
            .get(TRACKING_ORDER_FIELD)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let mut user: User = serde_json::from_value(doc)?;
        user.id = id;
        user.tracking.order_chains(&order);
        Ok(user)
    }

    /// Top-level document fields, used for write-through updates
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.insert(
                    TRACKING_ORDER_FIELD.to_string(),
                    serde_json::to_value(self.tracking.chain_order())?,
                );
                Ok(map)
            }
            other => Err(SpikeError::Internal(format!(
                "user {} encoded as non-object: {}",
                self.id, other
            ))),
        }
    }

    /// Parsed tier; `None` when the stored name is missing or unknown
    pub fn tier(&self) -> Option<Tier> {
        self.tier.as_deref().and_then(Tier::parse)
    }

    pub fn set_tier(&mut self, tier: Tier) {
        self.tier = Some(tier.as_str().to_string());
    }

    /// Parsed expiry instant
    pub fn expiry_at(&self) -> Result<Option<DateTime<Utc>>> {
        match self.expiry.as_deref() {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => parse_instant(raw)
                .map(Some)
                .ok_or_else(|| SpikeError::ExpiryParse {
                    user_id: self.id,
                    value: raw.to_string(),
                }),
        }
    }

    pub fn set_expiry(&mut self, expiry: Option<DateTime<Utc>>) {
        self.expiry = expiry.map(|e| e.to_rfc3339());
    }

    /// Monitoring on and at least one tracked address
    pub fn is_active(&self) -> bool {
        self.status && !self.tracking.is_empty()
    }
}

/// Zone-less layouts accepted by [`parse_instant`], read as UTC
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Accepts RFC 3339 as well as naive `YYYY-MM-DD[T ]HH:MM:SS[.f]` timestamps taken as UTC
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|format| {
        chrono::NaiveDateTime::parse_from_str(raw, format)
            .ok()
            .map(|naive| naive.and_utc())
    })
}
