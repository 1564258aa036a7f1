//! One monitor cycle: fetch, detect changes, classify, notify, persist
//!
//! The engine owns the history store and the amortized-persist counters.
//! Scheduling and single-flight live in [`super::runner`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::classifier::classify;
use super::history::HistoryStore;
use super::reminder::NotifyStore;
use crate::adapters::{chunk_by_chain, MarketDataSource};
use crate::config::{MonitorSettings, TierSettings};
use crate::domain::{short_symbol, MarketQuote, TokenSnapshot, UserId};
use crate::error::Result;
use crate::notify::{DispatchSummary, Dispatcher, SpikeAlert};
use crate::persistence::Cache;
use crate::services::Metrics;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: usize,
    /// Flush once this many changes are pending
    pub save_threshold: usize,
    /// Flush after this many cycles if anything is pending
    pub max_save_delay: usize,
    pub history_depth: usize,
    pub default_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 30,
            save_threshold: 50,
            max_save_delay: 5,
            history_depth: 3,
            default_threshold: 5.0,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(monitor: &MonitorSettings, tiers: &TierSettings) -> Self {
        Self {
            chunk_size: monitor.chunk_size.clamp(1, 30),
            save_threshold: monitor.save_threshold.max(1),
            max_save_delay: monitor.max_save_delay.max(1),
            history_depth: monitor.history_ring_depth.max(1),
            default_threshold: tiers.default_threshold_pct,
        }
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Distinct (chain, address) pairs watched by active users
    pub tokens: usize,
    pub quotes: usize,
    pub failed_chunks: usize,
    /// Snapshots that differed from history
    pub changed: usize,
    pub alerts: DispatchSummary,
    /// Users that received at least one alert
    pub recipients: usize,
    pub dropped_histories: usize,
    pub flushed: bool,
}

#[derive(Debug)]
struct CycleState {
    pending_changes: usize,
    cycles_since_save: usize,
    first_run: bool,
}

pub struct MonitorEngine {
    cache: Arc<Cache>,
    market: Arc<dyn MarketDataSource>,
    dispatcher: Arc<Dispatcher>,
    notify: Arc<NotifyStore>,
    history: Mutex<HistoryStore>,
    state: Mutex<CycleState>,
    config: EngineConfig,
    metrics: Arc<Metrics>,
}

impl MonitorEngine {
    pub fn new(
        cache: Arc<Cache>,
        market: Arc<dyn MarketDataSource>,
        dispatcher: Arc<Dispatcher>,
        notify: Arc<NotifyStore>,
        config: EngineConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            market,
            dispatcher,
            notify,
            history: Mutex::new(HistoryStore::new(config.history_depth)),
            state: Mutex::new(CycleState {
                pending_changes: 0,
                cycles_since_save: 0,
                first_run: true,
            }),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load persisted history; missing hashes are recomputed
    pub async fn load_history(&self) -> Result<usize> {
        let store = self.cache.store();
        self.history.lock().await.load_from(store.as_ref()).await
    }

    /// Snapshots for an address, newest first
    pub async fn history_ring(&self, address: &str) -> Vec<TokenSnapshot> {
        self.history.lock().await.ring(address)
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Forget addresses nobody tracks any more
    pub async fn forget(&self, addresses: &[String]) -> Result<()> {
        if addresses.is_empty() {
            return Ok(());
        }
        let store = self.cache.store();
        self.history
            .lock()
            .await
            .remove(store.as_ref(), addresses)
            .await
    }

    pub async fn pending_changes(&self) -> usize {
        self.state.lock().await.pending_changes
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    #[instrument(skip(self), fields(cycle_at = %now))]
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let active_users = self.cache.active_users().await;
        let tokens: BTreeSet<(String, String)> = active_users
            .iter()
            .flat_map(|u| u.tracking.iter())
            .map(|(chain, addr)| (chain.to_string(), addr.to_string()))
            .collect();
        let active_addresses: HashSet<String> =
            tokens.iter().map(|(_, addr)| addr.clone()).collect();
        report.tokens = tokens.len();

        let chunks = chunk_by_chain(
            tokens.iter().map(|(c, a)| (c.as_str(), a.as_str())),
            self.config.chunk_size,
        );

        let first_run = self.state.lock().await.first_run;
        let mut changed: Vec<TokenSnapshot> = Vec::new();
        {
            let mut history = self.history.lock().await;
            for (chain, addresses) in &chunks {
                let quotes = match self.market.fetch_chunk(chain, addresses).await {
                    Ok(quotes) => quotes,
                    Err(e) => {
                        warn!("Skipping {} chunk of {} tokens: {}", chain, addresses.len(), e);
                        Metrics::inc(&self.metrics.fetch_failures);
                        report.failed_chunks += 1;
                        continue;
                    }
                };
                report.quotes += quotes.len();
                Metrics::add(&self.metrics.quotes_fetched, quotes.len() as u64);

                for quote in quotes {
                    let snapshot = self.snapshot_from(chain, quote, now);
                    if history.update(snapshot.clone()) {
                        changed.push(snapshot);
                    }
                }
            }
        }
        report.changed = changed.len();
        Metrics::add(&self.metrics.snapshots_changed, changed.len() as u64);

        let alerts = self.classify_changes(&changed, &active_users).await;
        report.recipients = alerts.len();
        if !alerts.is_empty() {
            let recipients: Vec<UserId> = alerts.keys().copied().collect();
            report.alerts = self.dispatcher.dispatch(alerts).await;
            self.notify.mark_spike(&recipients, now).await;
        }

        let tracked = self.cache.tracked_index().await.addresses();
        report.dropped_histories = self
            .history
            .lock()
            .await
            .cleanup(&tracked, &active_addresses);

        report.flushed = self.amortized_persist(report.changed, first_run, &tracked).await;
        self.metrics.record_cycle(now);

        info!(
            "Cycle done: {} tokens, {} quotes, {} changed, {} alerts to {} users",
            report.tokens, report.quotes, report.changed, report.alerts.delivered, report.recipients
        );
        Ok(report)
    }

    /// Symbol precedence: known symbol, then the market's, then a shortened address
    fn snapshot_from(&self, chain: &str, quote: MarketQuote, now: DateTime<Utc>) -> TokenSnapshot {
        let symbol = match self.cache.symbol_for(&quote.address) {
            Some(symbol) => symbol,
            None => {
                let symbol = quote
                    .symbol
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| short_symbol(&quote.address));
                self.cache.set_symbol(&quote.address, &symbol);
                symbol
            }
        };

        TokenSnapshot {
            timestamp: now,
            address: quote.address,
            symbol,
            chain_id: chain.to_string(),
            price_change_m5: quote.price_change_m5,
            volume_m5: quote.volume_m5,
            market_cap: quote.market_cap,
        }
    }

    async fn classify_changes(
        &self,
        changed: &[TokenSnapshot],
        active_users: &[crate::domain::User],
    ) -> BTreeMap<UserId, Vec<SpikeAlert>> {
        let mut alerts: BTreeMap<UserId, Vec<SpikeAlert>> = BTreeMap::new();
        if changed.is_empty() {
            return alerts;
        }

        let history = self.history.lock().await;
        for snapshot in changed {
            let window = history.active_window(&snapshot.address);
            for user in active_users
                .iter()
                .filter(|u| u.tracking.contains(&snapshot.chain_id, &snapshot.address))
            {
                let threshold = user.threshold.unwrap_or(self.config.default_threshold);
                let spike = classify(&window, threshold);
                if spike.is_spike() {
                    debug!(
                        "{} {} spike for user {} ({:?})",
                        snapshot.symbol,
                        spike.as_str(),
                        user.id,
                        spike.minutes()
                    );
                    alerts.entry(user.id).or_default().push(SpikeAlert {
                        snapshot: snapshot.clone(),
                        spike,
                    });
                }
            }
        }
        alerts
    }

    /// Count changes and flush when the threshold or the delay is reached.
    /// Changes seen on the first cycle after boot do not count.
    async fn amortized_persist(
        &self,
        changes: usize,
        first_run: bool,
        tracked: &BTreeSet<String>,
    ) -> bool {
        let due = {
            let mut state = self.state.lock().await;
            if !first_run {
                state.pending_changes += changes;
            }
            state.first_run = false;
            state.cycles_since_save += 1;

            state.pending_changes >= self.config.save_threshold
                || (state.cycles_since_save >= self.config.max_save_delay
                    && state.pending_changes > 0)
        };
        if !due {
            return false;
        }

        match self.flush_with(tracked).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.pending_changes = 0;
                state.cycles_since_save = 0;
                true
            }
            Err(e) => {
                warn!("History flush failed, keeping changes pending: {}", e);
                Metrics::inc(&self.metrics.cycle_errors);
                false
            }
        }
    }

    /// Persist history, pending user writes and reminder records
    pub async fn flush(&self) -> Result<()> {
        let tracked = self.cache.tracked_index().await.addresses();
        self.flush_with(&tracked).await?;
        let mut state = self.state.lock().await;
        state.pending_changes = 0;
        state.cycles_since_save = 0;
        Ok(())
    }

    async fn flush_with(&self, tracked: &BTreeSet<String>) -> Result<()> {
        let store = self.cache.store();
        let written = self
            .history
            .lock()
            .await
            .flush(store.as_ref(), tracked)
            .await?;
        Metrics::inc(&self.metrics.history_flushes);

        let retried = self.cache.retry_pending().await?;
        self.notify.flush(store.as_ref()).await?;
        debug!("Flushed {} histories, re-wrote {} users", written, retried);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingTransport;
    use crate::domain::Tracking;
    use crate::notify::DispatcherConfig;
    use crate::persistence::MemoryStore;
    use crate::testing::ScriptedMarketSource;

    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<Cache>,
        market: Arc<ScriptedMarketSource>,
        transport: Arc<RecordingTransport>,
        engine: MonitorEngine,
    }

    async fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), 999));
        let market = Arc::new(ScriptedMarketSource::new());
        let transport = Arc::new(RecordingTransport::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            DispatcherConfig::default(),
            metrics.clone(),
        ));
        let engine = MonitorEngine::new(
            cache.clone(),
            market.clone(),
            dispatcher,
            Arc::new(NotifyStore::new()),
            config,
            metrics,
        );
        Harness {
            store,
            cache,
            market,
            transport,
            engine,
        }
    }

    async fn watch(cache: &Cache, user: UserId, pairs: &[(&str, &str)], status: bool) {
        let tracking = Tracking::from_pairs(pairs.iter().copied());
        cache
            .mutate_user(user, |u| {
                u.status = status;
                u.tracking = tracking;
                u.threshold = Some(5.0);
            })
            .await
            .unwrap();
        cache.rebuild_tracked_index().await.unwrap();
    }

    fn quote(address: &str, pct: f64) -> MarketQuote {
        MarketQuote {
            chain_id: "solana".into(),
            address: address.into(),
            symbol: Some(address.to_uppercase()),
            price_change_m5: Some(pct),
            volume_m5: Some(10.0),
            market_cap: Some(1000.0),
        }
    }

    #[tokio::test]
    async fn test_only_active_users_tokens_are_fetched() {
        let h = harness(EngineConfig::default()).await;
        watch(&h.cache, 1, &[("solana", "a"), ("base", "b")], true).await;
        watch(&h.cache, 2, &[("solana", "a"), ("solana", "c")], true).await;
        watch(&h.cache, 3, &[("solana", "z")], false).await;

        h.market.set_quotes(vec![quote("a", 1.0)]);
        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.tokens, 3);

        let requested = h.market.requested();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested[0].0, "base");
        assert_eq!(requested[1], ("solana".to_string(), vec!["a".to_string(), "c".to_string()]));
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_does_not_alert_twice() {
        let h = harness(EngineConfig::default()).await;
        watch(&h.cache, 1, &[("solana", "a")], true).await;

        h.market.set_quotes(vec![quote("a", 6.0)]);
        h.market.set_quotes(vec![quote("a", 6.0)]);

        let first = h.engine.run_cycle().await.unwrap();
        assert_eq!(first.changed, 1);
        assert_eq!(first.alerts.delivered, 1);

        let second = h.engine.run_cycle().await.unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(h.transport.sent_to(1).len(), 1);
        assert_eq!(h.engine.history_ring("a").await.len(), 1);
    }

    #[tokio::test]
    async fn test_paused_token_starts_fresh_after_resume() {
        let h = harness(EngineConfig::default()).await;
        watch(&h.cache, 1, &[("solana", "a")], true).await;

        h.market.set_quotes(vec![quote("a", 7.0)]);
        h.engine.run_cycle().await.unwrap();

        watch(&h.cache, 1, &[("solana", "a")], false).await;
        h.engine.run_cycle().await.unwrap();
        assert_eq!(h.engine.history_ring("a").await.len(), 1);

        watch(&h.cache, 1, &[("solana", "a")], true).await;
        h.market.set_quotes(vec![quote("a", 8.0)]);
        h.engine.run_cycle().await.unwrap();

        let sent = h.transport.sent_to(1);
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("First spike detected in the last 5 minutes"));
        assert_eq!(h.engine.history_ring("a").await.len(), 2);
    }

    #[tokio::test]
    async fn test_threshold_is_per_user() {
        let h = harness(EngineConfig::default()).await;
        watch(&h.cache, 1, &[("solana", "a")], true).await;
        watch(&h.cache, 2, &[("solana", "a")], true).await;
        h.cache.mutate_user(2, |u| u.threshold = Some(10.0)).await.unwrap();

        h.market.set_quotes(vec![quote("a", 7.5)]);
        h.engine.run_cycle().await.unwrap();

        assert_eq!(h.transport.sent_to(1).len(), 1);
        assert!(h.transport.sent_to(2).is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_changes_do_not_count() {
        let config = EngineConfig {
            save_threshold: 2,
            max_save_delay: 100,
            ..EngineConfig::default()
        };
        let h = harness(config).await;
        watch(&h.cache, 1, &[("solana", "a"), ("solana", "b")], true).await;

        h.market.set_quotes(vec![quote("a", 1.0), quote("b", 1.0)]);
        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.changed, 2);
        assert!(!report.flushed);
        assert_eq!(h.engine.pending_changes().await, 0);

        h.market.set_quotes(vec![quote("a", 2.0), quote("b", 2.0)]);
        let report = h.engine.run_cycle().await.unwrap();
        assert!(report.flushed);
        assert_eq!(h.store.len("token_history"), 2);
        assert_eq!(h.engine.pending_changes().await, 0);
    }

    #[tokio::test]
    async fn test_flush_after_max_delay() {
        let config = EngineConfig {
            save_threshold: 50,
            max_save_delay: 3,
            ..EngineConfig::default()
        };
        let h = harness(config).await;
        watch(&h.cache, 1, &[("solana", "a")], true).await;

        let mut flushed = Vec::new();
        for pct in [1.0, 2.0, 3.0] {
            h.market.set_quotes(vec![quote("a", pct)]);
            flushed.push(h.engine.run_cycle().await.unwrap().flushed);
        }
        assert_eq!(flushed, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pending() {
        let config = EngineConfig {
            save_threshold: 1,
            ..EngineConfig::default()
        };
        let h = harness(config).await;
        watch(&h.cache, 1, &[("solana", "a")], true).await;

        h.market.set_quotes(vec![quote("a", 1.0)]);
        h.engine.run_cycle().await.unwrap();

        h.store.set_fail_writes(true);
        h.market.set_quotes(vec![quote("a", 2.0)]);
        let report = h.engine.run_cycle().await.unwrap();
        assert!(!report.flushed);
        assert_eq!(h.engine.pending_changes().await, 1);

        h.store.set_fail_writes(false);
        h.engine.flush().await.unwrap();
        assert_eq!(h.engine.pending_changes().await, 0);
        assert_eq!(h.store.len("token_history"), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_skipped() {
        let h = harness(EngineConfig::default()).await;
        watch(&h.cache, 1, &[("base", "b"), ("solana", "a")], true).await;

        h.market.fail_chain("base");
        h.market.set_quotes(vec![quote("a", 6.0)]);
        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.changed, 1);
    }
}
