//! Service assembly, boot sequence and shutdown
//!
//! Boot order matters: limits are enforced before restart recovery turns
//! users back on, and the tracked-token index is rebuilt only after both.

use chrono::Utc;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::recovery::RestartRecovery;
use super::shutdown::{GracefulShutdown, ShutdownConfig};
use crate::adapters::{ChatTransport, MarketDataSource};
use crate::config::AppConfig;
use crate::domain::UserId;
use crate::error::{Result, SpikeError};
use crate::monitor::{EngineConfig, MonitorEngine, MonitorRunner, NotifyStore, ReminderService};
use crate::notify::{Dispatcher, DispatcherConfig};
use crate::persistence::{collections, Cache, DocumentStore};
use crate::services::Metrics;
use crate::tiers::{ExpiryConfig, ExpiryScheduler, TierEngine};
use crate::tracking::TrackingService;

/// Fields indexed at boot, per collection
const INDEXES: &[(&str, &str)] = &[
    (collections::USERS, "tier"),
    (collections::USERS, "expiry"),
    (collections::USERS, "active_restart"),
    (collections::USERS, "referral.wallet_address"),
    (collections::TOKENS, "token_list.*.address"),
];

/// What the boot sequence found and changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub users: usize,
    pub histories: usize,
    pub rpcs: usize,
    pub notify_seeded: usize,
    pub limits_enforced: usize,
    pub restored: Vec<UserId>,
    pub tracked_tokens: usize,
    pub thresholds_seeded: usize,
}

pub struct App {
    pub config: AppConfig,
    pub store: Arc<dyn DocumentStore>,
    pub cache: Arc<Cache>,
    pub metrics: Arc<Metrics>,
    pub dispatcher: Arc<Dispatcher>,
    pub notify: Arc<NotifyStore>,
    pub engine: Arc<MonitorEngine>,
    pub runner: Arc<MonitorRunner>,
    pub tiers: Arc<TierEngine>,
    pub expiry: Arc<ExpiryScheduler>,
    pub reminder: Arc<ReminderService>,
    pub recovery: RestartRecovery,
    pub tracking: TrackingService,
    pub shutdown: Arc<GracefulShutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Wire every component together. Nothing is loaded or started.
    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        market: Arc<dyn MarketDataSource>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(Cache::new(Arc::clone(&store), config.tiers.super_admin_id));
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            DispatcherConfig::from_settings(&config.monitor, &config.chat),
            Arc::clone(&metrics),
        ));
        let notify = Arc::new(NotifyStore::new());

        let engine = Arc::new(MonitorEngine::new(
            Arc::clone(&cache),
            Arc::clone(&market),
            Arc::clone(&dispatcher),
            Arc::clone(&notify),
            EngineConfig::from_settings(&config.monitor, &config.tiers),
            Arc::clone(&metrics),
        ));
        let runner = Arc::new(MonitorRunner::new(
            Arc::clone(&engine),
            Duration::from_secs(config.monitor.poll_interval_secs.max(1)),
            Arc::clone(&metrics),
        ));

        let tiers = Arc::new(TierEngine::new(Arc::clone(&cache), Arc::clone(&dispatcher)));
        let expiry = Arc::new(ExpiryScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&tiers),
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
            ExpiryConfig::from(&config.tiers),
        ));
        let reminder = Arc::new(ReminderService::new(
            Arc::clone(&cache),
            Arc::clone(&notify),
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
            Duration::from_secs(config.monitor.reminder_interval_secs.max(1)),
        ));
        let recovery = RestartRecovery::new(Arc::clone(&cache));
        let tracking = TrackingService::new(
            Arc::clone(&cache),
            market,
            Arc::clone(&tiers),
            Arc::clone(&engine),
            Arc::clone(&runner),
            Arc::clone(&notify),
        );

        Self {
            config,
            store,
            cache,
            metrics,
            dispatcher,
            notify,
            engine,
            runner,
            tiers,
            expiry,
            reminder,
            recovery,
            tracking,
            shutdown: Arc::new(GracefulShutdown::new(ShutdownConfig::default())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load state and reconcile it, in boot order. Starts nothing.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<BootReport> {
        let mut report = BootReport::default();

        self.store
            .ping()
            .await
            .map_err(|e| SpikeError::PersistenceUnavailable(e.to_string()))?;

        report.users = self.cache.load_users().await?;
        self.cache.load_tracked_index().await?;
        self.cache.load_admins().await?;

        for (collection, path) in INDEXES {
            if let Err(e) = self.store.create_index(collection, path).await {
                warn!("Could not create index on {}.{}: {}", collection, path, e);
            }
        }

        report.histories = self.engine.load_history().await?;
        report.rpcs = self.cache.load_rpcs().await?;

        self.notify.load(self.store.as_ref()).await?;
        let active: Vec<UserId> = self
            .cache
            .active_users()
            .await
            .iter()
            .map(|u| u.id)
            .collect();
        report.notify_seeded = self.notify.ensure(&active, Utc::now()).await;
        if report.notify_seeded > 0 {
            self.notify.flush(self.store.as_ref()).await?;
        }

        report.limits_enforced = self.tiers.enforce_all().await?;
        report.restored = self.recovery.restore_active_users().await?;
        report.tracked_tokens = self.cache.rebuild_tracked_index().await?;
        report.thresholds_seeded = self.seed_thresholds().await?;

        info!(
            "Boot complete: {} users, {} histories, {} tokens tracked, {} restored",
            report.users,
            report.histories,
            report.tracked_tokens,
            report.restored.len()
        );
        Ok(report)
    }

    /// Give every user without a threshold the default one, in one write
    async fn seed_thresholds(&self) -> Result<usize> {
        let default = self.config.tiers.default_threshold_pct;
        let ids: Vec<UserId> = self.cache.users().await.iter().map(|u| u.id).collect();
        let seeded = self
            .cache
            .mutate_users(&ids, |u| {
                if u.threshold.is_some() {
                    return false;
                }
                u.threshold = Some(default);
                true
            })
            .await?;
        Ok(seeded.len())
    }

    /// Start the monitor (only if someone is monitoring), the reminder loop
    /// and the expiry scheduler. Returns whether the monitor was started.
    pub async fn start_background(&self) -> bool {
        let monitor_started = if self.cache.any_status_on().await {
            self.runner.start().await;
            true
        } else {
            info!("No active users, monitor will start with the first one");
            false
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(Arc::clone(&self.reminder).spawn(self.shutdown.token()));
        tasks.push(Arc::clone(&self.expiry).spawn(self.shutdown.token()));
        monitor_started
    }

    /// Capture restart state, stop every task and flush what is left in memory
    pub async fn shutdown(&self) {
        let mark_restart = async {
            self.recovery
                .mark_active_users()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        .boxed();

        let stop_tasks = async {
            match self.runner.stop().await {
                Ok(()) => {}
                Err(SpikeError::RestartInconsistency(reason)) => {
                    warn!("Skipping monitor cancellation: {}", reason);
                }
                Err(e) => error!("Monitor stop failed: {}", e),
            }

            let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        .boxed();

        let flush_state = async {
            let notify = self.notify.flush(self.store.as_ref()).await;
            let users = self.cache.retry_pending().await;
            match (notify, users) {
                (Ok(_), Ok(_)) => Ok(()),
                (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
            }
        }
        .boxed();

        self.shutdown
            .execute(mark_restart, stop_tasks, flush_state)
            .await;
    }
}

/// Assemble, load and start the service
pub async fn boot(
    config: AppConfig,
    store: Arc<dyn DocumentStore>,
    market: Arc<dyn MarketDataSource>,
    transport: Arc<dyn ChatTransport>,
) -> Result<App> {
    let app = App::assemble(config, store, market, transport);
    app.load().await?;
    app.start_background().await;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingTransport;
    use crate::domain::{Tier, Tracking, User};
    use crate::persistence::MemoryStore;
    use crate::testing::ScriptedMarketSource;
    use serde_json::json;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.tiers.super_admin_id = 999;
        config
    }

    async fn seed(store: &MemoryStore, user: &User) {
        store
            .update_fields("users", &user.id.to_string(), &user.to_fields().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let app = App::assemble(
            config(),
            store,
            Arc::new(ScriptedMarketSource::new()),
            Arc::new(RecordingTransport::new()),
        );
        assert!(matches!(
            app.load().await,
            Err(SpikeError::PersistenceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_load_enforces_before_restoring() {
        let store = Arc::new(MemoryStore::new());

        let mut over = User::new(1);
        over.active_restart = true;
        over.tracking = Tracking::from_pairs((0..5).map(|i| ("solana", format!("t{}", i))));
        seed(&store, &over).await;

        let mut admin = User::new(999);
        admin.set_tier(Tier::Disciple);
        admin.threshold = Some(2.0);
        seed(&store, &admin).await;

        store
            .replace("users", "2", &json!({"status": true, "tracking": {"base": ["0xb"]}}))
            .await
            .unwrap();

        let app = App::assemble(
            config(),
            store.clone(),
            Arc::new(ScriptedMarketSource::new()),
            Arc::new(RecordingTransport::new()),
        );
        let report = app.load().await.unwrap();

        assert_eq!(report.users, 3);
        assert_eq!(report.restored, vec![1]);
        assert_eq!(report.notify_seeded, 1);
        assert_eq!(report.tracked_tokens, 3 + 1);
        assert_eq!(report.thresholds_seeded, 2);

        let user = app.cache.user(1).await.unwrap();
        assert!(user.status);
        assert_eq!(user.tracking.len(), 3);
        assert_eq!(user.threshold, Some(5.0));
        assert_eq!(app.cache.user(999).await.unwrap().tier(), Some(Tier::SuperAdmin));
        assert_eq!(app.cache.user(999).await.unwrap().threshold, Some(2.0));

        let indexes = store.indexes("users");
        assert!(indexes.contains(&"tier".to_string()));
        assert!(indexes.contains(&"referral.wallet_address".to_string()));
        assert!(!indexes.iter().any(|p| p.starts_with("referral.successful")));
        assert_eq!(store.indexes("tokens"), vec!["token_list.*.address".to_string()]);
        assert!(app.cache.admins().await.contains(&999));
    }

    #[tokio::test]
    async fn test_shutdown_without_monitor_still_marks_and_flushes() {
        let store = Arc::new(MemoryStore::new());
        let app = boot(
            config(),
            store.clone(),
            Arc::new(ScriptedMarketSource::new()),
            Arc::new(RecordingTransport::new()),
        )
        .await
        .unwrap();
        assert!(!app.runner.has_started());

        app.cache
            .mutate_user(4, |u| u.status = true)
            .await
            .unwrap();
        app.shutdown().await;

        let doc = store.get("users", "4").await.unwrap().unwrap();
        assert_eq!(doc["active_restart"], true);
        assert_eq!(doc["status"], false);
        assert!(app.shutdown.is_shutdown_requested());
    }
}
