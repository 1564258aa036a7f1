//! User-facing watch-list operations
//!
//! These are what chat command handlers call. Every change is written
//! through the cache and keeps the tracked-token index consistent.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapters::MarketDataSource;
use crate::domain::{Tier, User, UserId};
use crate::error::{Result, SpikeError};
use crate::monitor::{MonitorEngine, MonitorRunner, NotifyStore};
use crate::persistence::Cache;
use crate::tiers::TierEngine;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddTokensReport {
    pub added: Vec<String>,
    pub already_tracking: Vec<String>,
    /// Addresses the market could not resolve to a chain
    pub failed: Vec<String>,
    /// Addresses not added because the tier limit was reached
    pub over_limit: Vec<String>,
    pub monitoring_started: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveTokensReport {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
    pub monitoring_stopped: bool,
}

pub struct TrackingService {
    cache: Arc<Cache>,
    market: Arc<dyn MarketDataSource>,
    tiers: Arc<TierEngine>,
    engine: Arc<MonitorEngine>,
    runner: Arc<MonitorRunner>,
    notify: Arc<NotifyStore>,
}

/// Trimmed, non-empty, first occurrence only
fn normalize(addresses: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    addresses
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty() && seen.insert(a.to_string()))
        .map(str::to_string)
        .collect()
}

impl TrackingService {
    pub fn new(
        cache: Arc<Cache>,
        market: Arc<dyn MarketDataSource>,
        tiers: Arc<TierEngine>,
        engine: Arc<MonitorEngine>,
        runner: Arc<MonitorRunner>,
        notify: Arc<NotifyStore>,
    ) -> Self {
        Self {
            cache,
            market,
            tiers,
            engine,
            runner,
            notify,
        }
    }

    async fn user_or_new(&self, user_id: UserId) -> User {
        self.cache
            .user(user_id)
            .await
            .unwrap_or_else(|| User::new(user_id))
    }

    /// Resolve and add addresses, respecting the tier limit.
    ///
    /// Turns monitoring on if something was added and it was off.
    pub async fn add_tokens(&self, user_id: UserId, addresses: &[String]) -> Result<AddTokensReport> {
        self.tiers.enforce(user_id).await?;

        let user = self.user_or_new(user_id).await;
        let limit = self.tiers.limit_of(&user);
        let mut count = user.tracking.len();
        let mut report = AddTokensReport::default();
        let mut pairs: Vec<(String, String)> = Vec::new();

        for address in normalize(addresses) {
            if user.tracking.contains_address(&address) {
                report.already_tracking.push(address);
                continue;
            }
            if count >= limit {
                report.over_limit.push(address);
                continue;
            }

            match self.market.lookup_chain_info(&address).await {
                Ok(Some(info)) => {
                    self.cache
                        .track_token(&info.chain_id, &address, &info.symbol)
                        .await;
                    pairs.push((info.chain_id, address.clone()));
                    report.added.push(address);
                    count += 1;
                }
                Ok(None) => {
                    debug!("No market pair for {}", address);
                    report.failed.push(address);
                }
                Err(e) => {
                    warn!("Chain lookup failed for {}: {}", address, e);
                    report.failed.push(address);
                }
            }
        }

        if pairs.is_empty() {
            return Ok(report);
        }

        let updated = self
            .cache
            .mutate_user(user_id, |u| {
                for (chain, address) in &pairs {
                    u.tracking.insert(chain, address);
                }
                if !u.status {
                    u.status = true;
                    report.monitoring_started = true;
                }
            })
            .await?;

        if updated.status {
            self.activate(user_id).await;
        }
        info!(
            "User {} added {} tokens ({} failed, {} over limit)",
            user_id,
            report.added.len(),
            report.failed.len(),
            report.over_limit.len()
        );
        Ok(report)
    }

    /// Remove addresses. A user left with nothing to watch is switched off.
    pub async fn remove_tokens(
        &self,
        user_id: UserId,
        addresses: &[String],
    ) -> Result<RemoveTokensReport> {
        let mut report = RemoveTokensReport::default();
        let targets = normalize(addresses);

        let user = self
            .cache
            .mutate_user(user_id, |u| {
                for address in &targets {
                    if u.tracking.remove_address(address) {
                        report.removed.push(address.clone());
                    } else {
                        report.not_found.push(address.clone());
                    }
                }
                if u.tracking.is_empty() && u.status {
                    u.status = false;
                    report.monitoring_stopped = true;
                }
            })
            .await?;
        debug!("User {} now tracks {} tokens", user_id, user.tracking.len());

        if !report.removed.is_empty() {
            let users = self.cache.users().await;
            let orphaned: Vec<String> = report
                .removed
                .iter()
                .filter(|a| !users.iter().any(|u| u.tracking.contains_address(a)))
                .cloned()
                .collect();

            if !orphaned.is_empty() {
                self.cache.untrack_addresses(&orphaned).await;
                if let Err(e) = self.engine.forget(&orphaned).await {
                    warn!("Failed to delete history for untracked tokens: {}", e);
                }
            }
        }
        Ok(report)
    }

    pub async fn start_monitoring(&self, user_id: UserId) -> Result<()> {
        let user = self.user_or_new(user_id).await;
        if user.tracking.is_empty() {
            return Err(SpikeError::Validation(format!(
                "user {} has no tokens to monitor",
                user_id
            )));
        }
        self.cache.mutate_user(user_id, |u| u.status = true).await?;
        self.activate(user_id).await;
        Ok(())
    }

    pub async fn stop_monitoring(&self, user_id: UserId) -> Result<()> {
        self.cache.mutate_user(user_id, |u| u.status = false).await?;
        Ok(())
    }

    /// Start the monitor loop if needed and seed the user's reminder record
    async fn activate(&self, user_id: UserId) {
        self.runner.start().await;
        self.notify.ensure(&[user_id], Utc::now()).await;
    }

    pub async fn set_threshold(&self, user_id: UserId, pct: f64) -> Result<()> {
        if !pct.is_finite() || pct < 0.0 {
            return Err(SpikeError::Validation(format!(
                "threshold must be a non-negative number, got {}",
                pct
            )));
        }
        self.cache
            .mutate_user(user_id, |u| u.threshold = Some(pct))
            .await?;
        Ok(())
    }

    /// Change tier and enforce the new limit. Returns whether the list was trimmed.
    pub async fn set_tier(&self, user_id: UserId, tier: Tier) -> Result<bool> {
        self.cache.mutate_user(user_id, |u| u.set_tier(tier)).await?;
        self.tiers.enforce(user_id).await
    }

    pub async fn set_expiry(&self, user_id: UserId, expiry: Option<DateTime<Utc>>) -> Result<()> {
        self.cache
            .mutate_user(user_id, |u| u.set_expiry(expiry))
            .await?;
        Ok(())
    }

    pub async fn admins(&self) -> Vec<UserId> {
        self.cache.admins().await
    }

    pub async fn add_admins(&self, ids: &[UserId]) {
        self.cache.add_admins(ids).await
    }

    pub async fn remove_admins(&self, ids: &[UserId]) {
        self.cache.remove_admins(ids).await
    }

    pub async fn add_rpcs(&self, urls: &[String]) -> Result<()> {
        self.cache.add_rpcs(urls).await
    }

    pub async fn remove_rpcs(&self, urls: &[String]) -> Result<()> {
        self.cache.remove_rpcs(urls).await
    }

    pub async fn next_rpc(&self) -> Result<String> {
        self.cache.next_rpc().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingTransport;
    use crate::domain::{ChainInfo, Tracking};
    use crate::monitor::EngineConfig;
    use crate::notify::{Dispatcher, DispatcherConfig};
    use crate::persistence::{DocumentStore, MemoryStore};
    use crate::services::Metrics;
    use crate::testing::ScriptedMarketSource;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<Cache>,
        market: Arc<ScriptedMarketSource>,
        runner: Arc<MonitorRunner>,
        notify: Arc<NotifyStore>,
        service: TrackingService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), 999));
        let market = Arc::new(ScriptedMarketSource::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(RecordingTransport::new()),
            DispatcherConfig::default(),
            metrics.clone(),
        ));
        let notify = Arc::new(NotifyStore::new());
        let engine = Arc::new(MonitorEngine::new(
            cache.clone(),
            market.clone(),
            dispatcher.clone(),
            notify.clone(),
            EngineConfig::default(),
            metrics.clone(),
        ));
        let runner = Arc::new(MonitorRunner::new(
            engine.clone(),
            Duration::from_secs(3600),
            metrics,
        ));
        let tiers = Arc::new(TierEngine::new(cache.clone(), dispatcher));
        let service = TrackingService::new(
            cache.clone(),
            market.clone(),
            tiers,
            engine,
            runner.clone(),
            notify.clone(),
        );
        Fixture {
            store,
            cache,
            market,
            runner,
            notify,
            service,
        }
    }

    fn info(chain: &str, symbol: &str) -> ChainInfo {
        ChainInfo {
            chain_id: chain.into(),
            symbol: symbol.into(),
            name: symbol.to_lowercase(),
        }
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_tokens_resolves_and_activates() {
        let f = fixture();
        f.market.set_lookup("mint1", info("solana", "WIF"));
        f.market.set_lookup("0xabc", info("base", "BRETT"));

        let report = f
            .service
            .add_tokens(1, &addrs(&["mint1", " 0xabc ", "mint1", "unknown"]))
            .await
            .unwrap();

        assert_eq!(report.added, addrs(&["mint1", "0xabc"]));
        assert_eq!(report.failed, addrs(&["unknown"]));
        assert!(report.monitoring_started);

        let user = f.cache.user(1).await.unwrap();
        assert!(user.status);
        assert!(user.tracking.contains("base", "0xabc"));
        assert_eq!(f.cache.symbol_for("mint1").as_deref(), Some("WIF"));
        assert!(f.cache.tracked_index().await.contains_address("0xabc"));
        assert!(f.runner.is_running());
        assert!(f.notify.get(1).await.is_some());

        let again = f.service.add_tokens(1, &addrs(&["mint1"])).await.unwrap();
        assert_eq!(again.already_tracking, addrs(&["mint1"]));
        assert!(!again.monitoring_started);

        f.runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_tokens_respects_limit() {
        let f = fixture();
        for (i, a) in ["a", "b", "c", "d"].iter().enumerate() {
            f.market.set_lookup(a, info("solana", &format!("T{}", i)));
        }

        let report = f
            .service
            .add_tokens(1, &addrs(&["a", "b", "c", "d"]))
            .await
            .unwrap();
        assert_eq!(report.added.len(), 3);
        assert_eq!(report.over_limit, addrs(&["d"]));
        assert_eq!(f.cache.user(1).await.unwrap().tracking.len(), 3);

        f.runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_last_token_stops_monitoring() {
        let f = fixture();
        for id in [1, 2] {
            f.cache
                .mutate_user(id, |u| {
                    u.status = true;
                    u.tracking = Tracking::from_pairs([("solana", "shared"), ("solana", "mine")]);
                })
                .await
                .unwrap();
        }
        f.cache
            .mutate_user(2, |u| {
                u.tracking = Tracking::from_pairs([("solana", "shared")]);
            })
            .await
            .unwrap();
        f.cache.rebuild_tracked_index().await.unwrap();

        let report = f
            .service
            .remove_tokens(1, &addrs(&["shared", "mine", "ghost"]))
            .await
            .unwrap();
        assert_eq!(report.removed, addrs(&["shared", "mine"]));
        assert_eq!(report.not_found, addrs(&["ghost"]));
        assert!(report.monitoring_stopped);

        let user = f.cache.user(1).await.unwrap();
        assert!(!user.status);
        assert!(user.tracking.is_empty());

        // still watched by user 2
        let index = f.cache.tracked_index().await;
        assert!(index.contains_address("shared"));
        assert!(!index.contains_address("mine"));

        let doc = f.store.get("users", "1").await.unwrap().unwrap();
        assert_eq!(doc["status"], false);
    }

    #[tokio::test]
    async fn test_threshold_validation_and_tier_change() {
        let f = fixture();
        assert!(f.service.set_threshold(1, -1.0).await.is_err());
        assert!(f.service.set_threshold(1, f64::NAN).await.is_err());
        f.service.set_threshold(1, 7.5).await.unwrap();
        assert_eq!(f.cache.user(1).await.unwrap().threshold, Some(7.5));

        f.cache
            .mutate_user(1, |u| {
                u.set_tier(Tier::Disciple);
                u.tracking = Tracking::from_pairs((0..6).map(|i| ("solana", format!("t{}", i))));
            })
            .await
            .unwrap();
        assert!(f.service.set_tier(1, Tier::Apprentice).await.unwrap());
        assert_eq!(f.cache.user(1).await.unwrap().tracking.len(), 3);
    }

    #[tokio::test]
    async fn test_start_monitoring_needs_tokens() {
        let f = fixture();
        assert!(matches!(
            f.service.start_monitoring(5).await,
            Err(SpikeError::Validation(_))
        ));
        assert!(!f.runner.has_started());
    }
}
