//! Fixed-interval scheduling of monitor cycles
//!
//! At most one cycle runs at a time. A tick that arrives while a cycle is
//! still running is dropped. Stopping waits for the running cycle and then
//! flushes whatever history is still pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::{CycleReport, MonitorEngine};
use crate::error::{Result, SpikeError};
use crate::services::Metrics;

/// Held for the duration of a cycle; releases the flag on drop
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct MonitorRunner {
    engine: Arc<MonitorEngine>,
    interval: Duration,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    in_flight: Arc<AtomicBool>,
    started_once: AtomicBool,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorRunner {
    pub fn new(engine: Arc<MonitorEngine>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            engine,
            interval,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicBool::new(false)),
            started_once: AtomicBool::new(false),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> Arc<MonitorEngine> {
        Arc::clone(&self.engine)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared flag for health reporting
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn has_started(&self) -> bool {
        self.started_once.load(Ordering::SeqCst)
    }

    pub fn is_cycle_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one cycle now unless another is in flight.
    ///
    /// Returns `None` when the cycle was skipped.
    pub async fn try_run_cycle(&self) -> Option<Result<CycleReport>> {
        run_guarded(&self.engine, &self.in_flight, &self.metrics).await
    }

    /// Start the tick loop; a second call is a no-op
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Monitor loop already running");
            return;
        }
        self.started_once.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(false);

        info!("Starting monitor loop (interval: {:?})", self.interval);

        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut current: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let engine = Arc::clone(&engine);
                        let in_flight = Arc::clone(&in_flight);
                        let metrics = Arc::clone(&metrics);
                        let cycle = tokio::spawn(async move {
                            if let Some(Err(e)) = run_guarded(&engine, &in_flight, &metrics).await {
                                error!("Monitor cycle failed: {}", e);
                                Metrics::inc(&metrics.cycle_errors);
                            }
                        });
                        if let Some(previous) = current.replace(cycle) {
                            if !previous.is_finished() {
                                // still owns the guard; the new task will have skipped
                                current = Some(previous);
                            }
                        }
                    }
                }
            }

            if let Some(cycle) = current.take() {
                if let Err(e) = cycle.await {
                    error!("Monitor cycle task failed: {}", e);
                }
            }

            if engine.pending_changes().await > 0 {
                match engine.flush().await {
                    Ok(()) => info!("Final history flush complete"),
                    Err(e) => error!("Final history flush failed: {}", e),
                }
            }
            info!("Monitor loop stopped");
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Stop the loop and wait for it to finish its final flush.
    ///
    /// Fails with `RestartInconsistency` if the loop was never started.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SpikeError::RestartInconsistency(
                "monitor loop is not running".into(),
            ));
        }

        self.stop_tx.send_replace(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Monitor loop task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn run_guarded(
    engine: &MonitorEngine,
    in_flight: &Arc<AtomicBool>,
    metrics: &Metrics,
) -> Option<Result<CycleReport>> {
    let Some(_guard) = InFlight::acquire(in_flight) else {
        info!("Previous cycle still running, dropping tick");
        Metrics::inc(&metrics.cycles_skipped);
        return None;
    };
    Some(engine.run_cycle().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MarketDataSource, RecordingTransport};
    use crate::domain::{ChainInfo, MarketQuote, Tracking};
    use crate::monitor::engine::EngineConfig;
    use crate::monitor::reminder::NotifyStore;
    use crate::notify::{Dispatcher, DispatcherConfig};
    use crate::persistence::{Cache, MemoryStore};
    use crate::testing::ScriptedMarketSource;
    use std::sync::atomic::AtomicUsize;

    /// Market whose every fetch takes `delay`, recording how many overlap
    struct SlowMarket {
        delay: Duration,
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowMarket {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                inside: AtomicUsize::new(0),
                max_inside: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl MarketDataSource for SlowMarket {
        async fn fetch_chunk(&self, _chain: &str, _addresses: &[String]) -> Result<Vec<MarketQuote>> {
            let inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(inside, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn lookup_chain_info(&self, _address: &str) -> Result<Option<ChainInfo>> {
            Ok(None)
        }
    }

    async fn runner(interval: Duration) -> (MonitorRunner, Arc<ScriptedMarketSource>, Arc<MemoryStore>, Arc<Metrics>) {
        let market = Arc::new(ScriptedMarketSource::new());
        market.set_quotes(vec![MarketQuote {
            chain_id: "solana".into(),
            address: "a".into(),
            symbol: Some("A".into()),
            price_change_m5: Some(1.0),
            volume_m5: None,
            market_cap: None,
        }]);
        let (runner, store, metrics) = runner_with(market.clone(), interval).await;
        (runner, market, store, metrics)
    }

    async fn runner_with(
        market: Arc<dyn MarketDataSource>,
        interval: Duration,
    ) -> (MonitorRunner, Arc<MemoryStore>, Arc<Metrics>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), 999));
        cache
            .mutate_user(1, |u| {
                u.status = true;
                u.tracking = Tracking::from_pairs([("solana", "a")]);
            })
            .await
            .unwrap();
        cache.rebuild_tracked_index().await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(RecordingTransport::new()),
            DispatcherConfig::default(),
            metrics.clone(),
        ));
        let engine = Arc::new(MonitorEngine::new(
            cache,
            market,
            dispatcher,
            Arc::new(NotifyStore::new()),
            EngineConfig {
                save_threshold: 50,
                max_save_delay: 100,
                ..EngineConfig::default()
            },
            metrics.clone(),
        ));
        (MonitorRunner::new(engine, interval, metrics.clone()), store, metrics)
    }

    #[tokio::test]
    async fn test_tick_dropped_while_cycle_in_flight() {
        let (runner, _market, _store, metrics) = runner(Duration::from_secs(60)).await;

        let guard = InFlight::acquire(&runner.in_flight).unwrap();
        assert!(runner.is_cycle_in_flight());
        assert!(runner.try_run_cycle().await.is_none());
        assert_eq!(Metrics::get(&metrics.cycles_skipped), 1);

        drop(guard);
        assert!(!runner.is_cycle_in_flight());
        assert!(runner.try_run_cycle().await.unwrap().is_ok());
        assert_eq!(Metrics::get(&metrics.cycles), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_inconsistent() {
        let (runner, _market, _store, _metrics) = runner(Duration::from_secs(60)).await;
        assert!(!runner.has_started());
        assert!(matches!(
            runner.stop().await,
            Err(SpikeError::RestartInconsistency(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_on_interval_and_flushes_on_stop() {
        let (runner, market, store, metrics) = runner(Duration::from_secs(60)).await;

        runner.start().await;
        runner.start().await;
        assert!(runner.is_running());

        // first tick fires immediately, then one per interval
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(market.requested().len(), 3);
        assert_eq!(Metrics::get(&metrics.cycles), 3);

        // second cycle's change is pending until the final flush
        market.set_quotes(vec![MarketQuote {
            chain_id: "solana".into(),
            address: "a".into(),
            symbol: Some("A".into()),
            price_change_m5: Some(2.0),
            volume_m5: None,
            market_cap: None,
        }]);
        tokio::time::sleep(Duration::from_secs(60)).await;

        runner.stop().await.unwrap();
        assert!(!runner.is_running());
        assert!(runner.has_started());
        assert_eq!(store.len("token_history"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_never_overlap() {
        let market = Arc::new(SlowMarket::new(Duration::from_secs(150)));
        let (runner, _store, metrics) = runner_with(market.clone(), Duration::from_secs(60)).await;

        runner.start().await;
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(market.max_inside.load(Ordering::SeqCst), 1);
        assert!(market.calls.load(Ordering::SeqCst) >= 2);
        assert!(Metrics::get(&metrics.cycles_skipped) > 0);

        runner.stop().await.unwrap();
        assert_eq!(market.inside.load(Ordering::SeqCst), 0);
        assert_eq!(market.max_inside.load(Ordering::SeqCst), 1);
    }
}
