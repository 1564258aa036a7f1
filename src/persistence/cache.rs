//! Process-wide in-memory copies of the persisted collections
//!
//! Reads are served from memory. Mutations update memory first and then
//! write through to the document store. A failed write leaves the new value
//! in memory and the document id on a pending list that the next flush retries.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::store::{collections, doc_ids, DocumentStore, Fields};
use crate::domain::{TrackedTokenIndex, User, UserId};
use crate::error::{Result, SpikeError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AdminListDoc {
    #[serde(default)]
    user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RpcListDoc {
    #[serde(default)]
    endpoints: Vec<String>,
}

/// RPC endpoints with a rotating cursor
#[derive(Debug, Default)]
struct RpcRing {
    endpoints: Vec<String>,
    cursor: usize,
}

pub struct Cache {
    store: Arc<dyn DocumentStore>,
    super_admin_id: UserId,
    users: RwLock<BTreeMap<UserId, User>>,
    tracked: RwLock<TrackedTokenIndex>,
    symbols: DashMap<String, String>,
    admins: RwLock<BTreeSet<UserId>>,
    rpcs: Mutex<RpcRing>,
    /// Users whose last write-through failed
    pending: Mutex<BTreeSet<UserId>>,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Cache {
    pub fn new(store: Arc<dyn DocumentStore>, super_admin_id: UserId) -> Self {
        Self {
            store,
            super_admin_id,
            users: RwLock::new(BTreeMap::new()),
            tracked: RwLock::new(TrackedTokenIndex::default()),
            symbols: DashMap::new(),
            admins: RwLock::new(BTreeSet::from([super_admin_id])),
            rpcs: Mutex::new(RpcRing::default()),
            pending: Mutex::new(BTreeSet::new()),
            user_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn super_admin_id(&self) -> UserId {
        self.super_admin_id
    }

    // ==================== Loading ====================

    /// Load every user document
    #[instrument(skip(self))]
    pub async fn load_users(&self) -> Result<usize> {
        let docs = self.store.find_all(collections::USERS).await?;
        let mut users = BTreeMap::new();

        for (id, doc) in docs {
            let Ok(user_id) = id.parse::<UserId>() else {
                warn!("Skipping user document with non-numeric id {}", id);
                continue;
            };
            match User::from_doc(user_id, doc) {
                Ok(user) => {
                    users.insert(user_id, user);
                }
                Err(e) => warn!("Skipping malformed user {}: {}", user_id, e),
            }
        }

        let count = users.len();
        *self.users.write().await = users;
        info!("Loaded {} users", count);
        Ok(count)
    }

    /// Load the tracked-token index and the symbol map derived from it
    pub async fn load_tracked_index(&self) -> Result<()> {
        let index = match self
            .store
            .get(collections::TOKENS, doc_ids::TRACKED_TOKEN)
            .await?
        {
            Some(doc) => serde_json::from_value::<TrackedTokenIndex>(doc)?,
            None => TrackedTokenIndex::default(),
        };

        for list in index.token_list.values() {
            for token in list {
                self.symbols
                    .insert(token.address.clone(), token.symbol.clone());
            }
        }
        debug!("Loaded tracked index with {} tokens", index.len());
        *self.tracked.write().await = index;
        Ok(())
    }

    /// Load the admin list; the super admin is always a member
    pub async fn load_admins(&self) -> Result<()> {
        let doc: AdminListDoc = match self
            .store
            .get(collections::SETTINGS, doc_ids::ADMIN_LIST)
            .await?
        {
            Some(doc) => serde_json::from_value(doc)?,
            None => AdminListDoc::default(),
        };

        let mut admins: BTreeSet<UserId> = doc.user_ids.iter().copied().collect();
        let missing_super = admins.insert(self.super_admin_id);
        *self.admins.write().await = admins;

        if missing_super {
            self.persist_admins().await;
        }
        Ok(())
    }

    pub async fn load_rpcs(&self) -> Result<usize> {
        let doc: RpcListDoc = match self
            .store
            .get(collections::SETTINGS, doc_ids::RPC_LIST)
            .await?
        {
            Some(doc) => serde_json::from_value(doc)?,
            None => RpcListDoc::default(),
        };

        let mut ring = self.rpcs.lock().await;
        ring.endpoints = doc.endpoints;
        ring.cursor = 0;
        Ok(ring.endpoints.len())
    }

    // ==================== Users ====================

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.users.read().await.get(&id).cloned()
    }

    pub async fn users(&self) -> Vec<User> {
        self.users.read().await.values().cloned().collect()
    }

    /// Users with monitoring on and a non-empty watch list
    pub async fn active_users(&self) -> Vec<User> {
        self.users
            .read()
            .await
            .values()
            .filter(|u| u.is_active())
            .cloned()
            .collect()
    }

    pub async fn any_status_on(&self) -> bool {
        self.users.read().await.values().any(|u| u.status)
    }

    /// Mutate one user (created on first touch) and write it through.
    ///
    /// Writes for the same user are serialized. A failed store write is
    /// logged and queued for the next flush; the in-memory value stands.
    pub async fn mutate_user<F>(&self, id: UserId, f: F) -> Result<User>
    where
        F: FnOnce(&mut User),
    {
        let lock = self
            .user_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let user = {
            let mut users = self.users.write().await;
            let user = users.entry(id).or_insert_with(|| User::new(id));
            f(user);
            user.clone()
        };

        let fields = user.to_fields()?;
        if let Err(e) = self
            .store
            .update_fields(collections::USERS, &id.to_string(), &fields)
            .await
        {
            warn!("Write-through for user {} failed, keeping in memory: {}", id, e);
            self.pending.lock().await.insert(id);
        }
        Ok(user)
    }

    /// Mutate many users and persist every changed one in a single bulk write.
    ///
    /// `f` returns whether it changed the user. Returns the changed users.
    pub async fn mutate_users<F>(&self, ids: &[UserId], mut f: F) -> Result<Vec<User>>
    where
        F: FnMut(&mut User) -> bool,
    {
        let mut changed: Vec<User> = Vec::new();
        {
            let mut users = self.users.write().await;
            for id in ids {
                if let Some(user) = users.get_mut(id) {
                    if f(user) {
                        changed.push(user.clone());
                    }
                }
            }
        }

        if changed.is_empty() {
            return Ok(changed);
        }

        let updates = changed
            .iter()
            .map(|u| u.to_fields().map(|f| (u.id.to_string(), f)))
            .collect::<Result<Vec<(String, Fields)>>>()?;

        if let Err(e) = self.store.bulk_update(collections::USERS, &updates).await {
            warn!(
                "Bulk write of {} users failed, keeping in memory: {}",
                updates.len(),
                e
            );
            self.pending
                .lock()
                .await
                .extend(changed.iter().map(|u| u.id));
        }
        Ok(changed)
    }

    /// Re-write users whose earlier write-through failed
    pub async fn retry_pending(&self) -> Result<usize> {
        let ids: Vec<UserId> = std::mem::take(&mut *self.pending.lock().await)
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let updates = {
            let users = self.users.read().await;
            ids.iter()
                .filter_map(|id| users.get(id))
                .map(|u| u.to_fields().map(|f| (u.id.to_string(), f)))
                .collect::<Result<Vec<(String, Fields)>>>()?
        };

        match self.store.bulk_update(collections::USERS, &updates).await {
            Ok(()) => {
                info!("Re-wrote {} pending users", updates.len());
                Ok(updates.len())
            }
            Err(e) => {
                self.pending.lock().await.extend(ids);
                Err(e)
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Whether the user's last write-through failed and awaits a retry
    pub async fn is_pending(&self, id: UserId) -> bool {
        self.pending.lock().await.contains(&id)
    }

    // ==================== Tracked tokens ====================

    pub async fn tracked_index(&self) -> TrackedTokenIndex {
        self.tracked.read().await.clone()
    }

    /// Rebuild the index as the union of all users' watch lists
    pub async fn rebuild_tracked_index(&self) -> Result<usize> {
        let index = {
            let users = self.users.read().await;
            TrackedTokenIndex::from_users(users.values(), |addr| self.symbol_for(addr))
        };
        let count = index.len();
        *self.tracked.write().await = index;
        self.persist_tracked_index().await;
        info!("Rebuilt tracked token index: {} tokens", count);
        Ok(count)
    }

    pub async fn track_token(&self, chain: &str, address: &str, symbol: &str) {
        self.set_symbol(address, symbol);
        let inserted = self.tracked.write().await.insert(chain, address, symbol);
        if inserted {
            self.persist_tracked_index().await;
        }
    }

    pub async fn untrack_addresses(&self, addresses: &[String]) {
        let removed = {
            let mut index = self.tracked.write().await;
            addresses
                .iter()
                .fold(false, |acc, a| index.remove_address(a) | acc)
        };
        for address in addresses {
            self.symbols.remove(address);
        }
        if removed {
            self.persist_tracked_index().await;
        }
    }

    async fn persist_tracked_index(&self) {
        let doc = {
            let index = self.tracked.read().await;
            serde_json::to_value(&*index)
        };
        let result = match doc {
            Ok(doc) => {
                self.store
                    .replace(collections::TOKENS, doc_ids::TRACKED_TOKEN, &doc)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist tracked token index: {}", e);
        }
    }

    // ==================== Symbols ====================

    pub fn symbol_for(&self, address: &str) -> Option<String> {
        self.symbols.get(address).map(|s| s.value().clone())
    }

    pub fn set_symbol(&self, address: &str, symbol: &str) {
        self.symbols.insert(address.to_string(), symbol.to_string());
    }

    // ==================== Admins ====================

    pub async fn admins(&self) -> Vec<UserId> {
        self.admins.read().await.iter().copied().collect()
    }

    pub async fn is_admin(&self, id: UserId) -> bool {
        self.admins.read().await.contains(&id)
    }

    pub async fn add_admins(&self, ids: &[UserId]) {
        self.admins.write().await.extend(ids.iter().copied());
        self.persist_admins().await;
    }

    /// The super admin cannot be removed
    pub async fn remove_admins(&self, ids: &[UserId]) {
        {
            let mut admins = self.admins.write().await;
            for id in ids.iter().filter(|id| **id != self.super_admin_id) {
                admins.remove(id);
            }
        }
        self.persist_admins().await;
    }

    async fn persist_admins(&self) {
        let user_ids = self.admins().await;
        let doc = json!({ "user_ids": user_ids });
        if let Err(e) = self
            .store
            .replace(collections::SETTINGS, doc_ids::ADMIN_LIST, &doc)
            .await
        {
            warn!("Failed to persist admin list: {}", e);
        }
    }

    // ==================== RPC endpoints ====================

    /// Next endpoint in round-robin order
    pub async fn next_rpc(&self) -> Result<String> {
        let mut ring = self.rpcs.lock().await;
        if ring.endpoints.is_empty() {
            return Err(SpikeError::Validation("no RPC endpoints configured".into()));
        }
        let idx = ring.cursor % ring.endpoints.len();
        ring.cursor = (idx + 1) % ring.endpoints.len();
        Ok(ring.endpoints[idx].clone())
    }

    pub async fn rpcs(&self) -> Vec<String> {
        self.rpcs.lock().await.endpoints.clone()
    }

    /// Append endpoints not already present
    pub async fn add_rpcs(&self, urls: &[String]) -> Result<()> {
        let endpoints = {
            let mut ring = self.rpcs.lock().await;
            for url in urls {
                if !ring.endpoints.contains(url) {
                    ring.endpoints.push(url.clone());
                }
            }
            ring.endpoints.clone()
        };
        self.persist_rpcs(endpoints).await
    }

    pub async fn remove_rpcs(&self, urls: &[String]) -> Result<()> {
        let endpoints = {
            let mut ring = self.rpcs.lock().await;
            ring.endpoints.retain(|e| !urls.contains(e));
            ring.cursor = 0;
            ring.endpoints.clone()
        };
        self.persist_rpcs(endpoints).await
    }

    async fn persist_rpcs(&self, endpoints: Vec<String>) -> Result<()> {
        let doc: Value = serde_json::to_value(RpcListDoc { endpoints })?;
        self.store
            .replace(collections::SETTINGS, doc_ids::RPC_LIST, &doc)
            .await
    }
}
