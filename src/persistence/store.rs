//! Document store abstraction
//!
//! Every durable collection is a set of JSON documents keyed by string id.
//! Updates are field maps whose keys may be dotted paths (`referral.wallet_address`);
//! they deep-merge into the existing document and create it if missing.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// Collection names
pub mod collections {
    pub const USERS: &str = "users";
    pub const TOKENS: &str = "tokens";
    pub const TOKEN_HISTORY: &str = "token_history";
    pub const SETTINGS: &str = "settings";
    pub const USER_NOTIFY: &str = "user_notify";
}

/// Singleton document ids
pub mod doc_ids {
    pub const TRACKED_TOKEN: &str = "tracked_token";
    pub const ADMIN_LIST: &str = "admin_list";
    pub const RPC_LIST: &str = "rpc_list";
    pub const WITHDRAWAL_WALLETS: &str = "withdrawal_wallets";
    pub const DEPOSIT_WALLETS: &str = "deposit_wallets";
    pub const WALLET_SECRETS: &str = "wallet_secrets";
}

/// Field map for `update_fields` / `bulk_update`
pub type Fields = Map<String, Value>;

/// Durable document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Check connectivity
    async fn ping(&self) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// All documents of a collection, ordered by id
    async fn find_all(&self, collection: &str) -> Result<Vec<(String, Value)>>;

    /// Documents whose value at dotted `path` equals `value`
    async fn find_by_field(
        &self,
        collection: &str,
        path: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>>;

    /// Deep-merge `fields` into one document, creating it if needed
    async fn update_fields(&self, collection: &str, id: &str, fields: &Fields) -> Result<()>;

    /// Upsert many documents in one operation
    async fn bulk_update(&self, collection: &str, updates: &[(String, Fields)]) -> Result<()>;

    async fn replace(&self, collection: &str, id: &str, doc: &Value) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Returns the number of documents removed
    async fn delete_many(&self, collection: &str, ids: &[String]) -> Result<u64>;

    async fn create_index(&self, collection: &str, path: &str) -> Result<()>;
}

/// Apply a dotted-path field map to a document in place
pub fn apply_fields(doc: &mut Value, fields: &Fields) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    for (path, value) in fields {
        set_path(doc, path, value.clone());
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Read the value at a dotted path
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Build a field map from `(key, value)` pairs
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
