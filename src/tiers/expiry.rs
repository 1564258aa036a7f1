//! Tier expiry scheduler
//!
//! With `d` the whole days until expiry (rounded down):
//! `1..=3` sends a reminder, `0` sends the expires-today notice, and
//! `d <= -3` downgrades to apprentice once the grace period is over.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::limits::TierEngine;
use crate::config::TierSettings;
use crate::coordination::shutdown::ShutdownToken;
use crate::domain::{Tier, User, UserId};
use crate::error::{Result, SpikeError};
use crate::notify::messages::{expiry_reminder_message, expiry_today_message};
use crate::notify::Dispatcher;
use crate::persistence::Cache;
use crate::services::Metrics;

const SECONDS_PER_DAY: i64 = 86_400;
/// Days after expiry before the downgrade
pub const GRACE_DAYS: i64 = 3;
/// Reminders start this many days ahead
pub const REMINDER_DAYS: i64 = 3;

#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub interval: Duration,
    /// Wait before retrying after a failed pass
    pub error_sleep: Duration,
    pub batch_size: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * SECONDS_PER_DAY as u64),
            error_sleep: Duration::from_secs(3600),
            batch_size: 50,
        }
    }
}

impl From<&TierSettings> for ExpiryConfig {
    fn from(settings: &TierSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.expiry_check_interval_secs),
            error_sleep: Duration::from_secs(settings.expiry_error_sleep_secs),
            batch_size: settings.expiry_batch_size.max(1),
        }
    }
}

/// What the pass decided for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    Remind { days: i64 },
    ExpiresToday,
    Downgrade,
    Nothing,
}

/// Whole days from `now` until `expiry`, rounded toward negative infinity
pub fn days_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expiry - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}

pub fn action_for(days: i64) -> ExpiryAction {
    match days {
        1..=REMINDER_DAYS => ExpiryAction::Remind { days },
        0 => ExpiryAction::ExpiresToday,
        d if d + GRACE_DAYS <= 0 => ExpiryAction::Downgrade,
        _ => ExpiryAction::Nothing,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub reminded: usize,
    pub notified: usize,
    pub downgraded: usize,
    /// Users whose expiry could not be parsed
    pub skipped: usize,
    /// Downgrades that did not complete; retried on the next pass
    pub failed: usize,
}

pub struct ExpiryScheduler {
    cache: Arc<Cache>,
    tiers: Arc<TierEngine>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    config: ExpiryConfig,
}

impl ExpiryScheduler {
    pub fn new(
        cache: Arc<Cache>,
        tiers: Arc<TierEngine>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        config: ExpiryConfig,
    ) -> Self {
        Self {
            cache,
            tiers,
            dispatcher,
            metrics,
            config,
        }
    }

    fn categorize(
        &self,
        users: &[User],
        now: DateTime<Utc>,
        summary: &mut ExpirySummary,
    ) -> (Vec<(UserId, String)>, Vec<(UserId, String)>, Vec<UserId>) {
        let mut reminders = Vec::new();
        let mut today = Vec::new();
        let mut downgrades = Vec::new();

        for user in users {
            let tier = match user.tier() {
                Some(Tier::Apprentice) | None => continue,
                Some(tier) => tier,
            };
            let expiry = match user.expiry_at() {
                Ok(Some(expiry)) => expiry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping expiry check: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            match action_for(days_until(expiry, now)) {
                ExpiryAction::Remind { days } => {
                    reminders.push((user.id, expiry_reminder_message(tier, days)))
                }
                ExpiryAction::ExpiresToday => today.push((user.id, expiry_today_message(tier))),
                ExpiryAction::Downgrade => downgrades.push(user.id),
                ExpiryAction::Nothing => {}
            }
        }
        (reminders, today, downgrades)
    }

    /// One pass over all users
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<ExpirySummary> {
        let mut summary = ExpirySummary::default();
        let users = self.cache.users().await;
        let (reminders, today, downgrades) = self.categorize(&users, now, &mut summary);
        debug!(
            "Expiry pass: {} reminders, {} expiring today, {} to downgrade",
            reminders.len(),
            today.len(),
            downgrades.len()
        );

        let batch = self.config.batch_size.max(1);
        for chunk in reminders.chunks(batch) {
            self.dispatcher.send_many(chunk.to_vec()).await;
        }
        summary.reminded = reminders.len();

        for chunk in today.chunks(batch) {
            self.dispatcher.send_many(chunk.to_vec()).await;
        }
        summary.notified = today.len();

        for chunk in downgrades.chunks(batch) {
            let results = join_all(chunk.iter().map(|id| self.downgrade(*id))).await;
            for (id, result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => summary.downgraded += 1,
                    Err(e) => {
                        warn!("Downgrade of user {} failed, continuing: {}", id, e);
                        summary.failed += 1;
                    }
                }
            }
        }

        Metrics::inc(&self.metrics.expiry_passes);
        info!(
            "Expiry pass done: {} reminded, {} notified, {} downgraded, {} failed, {} skipped",
            summary.reminded,
            summary.notified,
            summary.downgraded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    async fn downgrade(&self, user_id: UserId) -> Result<()> {
        self.cache
            .mutate_user(user_id, |u| {
                u.set_tier(Tier::Apprentice);
                u.set_expiry(None);
            })
            .await?;
        self.tiers.enforce(user_id).await?;
        if self.cache.is_pending(user_id).await {
            return Err(SpikeError::PersistenceWrite(format!(
                "downgrade of user {} kept in memory only",
                user_id
            )));
        }
        info!("User {} downgraded to apprentice after grace period", user_id);
        Ok(())
    }

    /// Run passes until shutdown, sleeping longer after a success than after a failure
    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = match self.run_pass(Utc::now()).await {
                    Ok(_) => self.config.interval,
                    Err(e) => {
                        error!("Expiry pass failed, retrying in {:?}: {}", self.config.error_sleep, e);
                        self.config.error_sleep
                    }
                };

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Expiry scheduler stopping");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordingTransport;
    use crate::domain::Tracking;
    use crate::notify::DispatcherConfig;
    use crate::persistence::{DocumentStore, MemoryStore};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_day_buckets() {
        let now = Utc::now();
        let at = |hours: i64| days_until(now + ChronoDuration::hours(hours), now);

        assert_eq!(at(36), 1);
        assert_eq!(at(12), 0);
        assert_eq!(at(-12), -1);
        assert_eq!(at(-72), -3);

        assert_eq!(action_for(3), ExpiryAction::Remind { days: 3 });
        assert_eq!(action_for(4), ExpiryAction::Nothing);
        assert_eq!(action_for(0), ExpiryAction::ExpiresToday);
        assert_eq!(action_for(-1), ExpiryAction::Nothing);
        assert_eq!(action_for(-2), ExpiryAction::Nothing);
        assert_eq!(action_for(-3), ExpiryAction::Downgrade);
        assert_eq!(action_for(-10), ExpiryAction::Downgrade);
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<Cache>,
        transport: Arc<RecordingTransport>,
        scheduler: ExpiryScheduler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone(), 999));
        let transport = Arc::new(RecordingTransport::new());
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            DispatcherConfig::default(),
            metrics.clone(),
        ));
        let tiers = Arc::new(TierEngine::new(cache.clone(), dispatcher.clone()));
        let scheduler = ExpiryScheduler::new(
            cache.clone(),
            tiers,
            dispatcher,
            metrics,
            ExpiryConfig {
                batch_size: 2,
                ..ExpiryConfig::default()
            },
        );
        Fixture {
            store,
            cache,
            transport,
            scheduler,
        }
    }

    async fn subscriber(cache: &Cache, id: UserId, tier: Tier, expiry: DateTime<Utc>) {
        cache
            .mutate_user(id, |u| {
                u.set_tier(tier);
                u.set_expiry(Some(expiry));
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pass_categorizes_users() {
        let f = fixture();
        let now = Utc::now();
        let day = ChronoDuration::days(1);

        subscriber(&f.cache, 1, Tier::Disciple, now + day * 2 + ChronoDuration::hours(1)).await;
        subscriber(&f.cache, 2, Tier::Chieftain, now + ChronoDuration::hours(5)).await;
        subscriber(&f.cache, 3, Tier::Overlord, now - day * 4).await;
        subscriber(&f.cache, 4, Tier::Chieftain, now - day).await;
        subscriber(&f.cache, 5, Tier::Apprentice, now + day).await;
        f.cache
            .mutate_user(6, |u| {
                u.set_tier(Tier::Disciple);
                u.expiry = Some("next tuesday".into());
            })
            .await
            .unwrap();

        let summary = f.scheduler.run_pass(now).await.unwrap();
        assert_eq!(
            summary,
            ExpirySummary {
                reminded: 1,
                notified: 1,
                downgraded: 1,
                skipped: 1,
                failed: 0
            }
        );

        assert!(f.transport.sent_to(1)[0].contains("expire in 2 days"));
        assert!(f.transport.sent_to(2)[0].contains("expire today"));
        assert!(f.transport.sent_to(4).is_empty());
        assert!(f.transport.sent_to(5).is_empty());

        let downgraded = f.cache.user(3).await.unwrap();
        assert_eq!(downgraded.tier(), Some(Tier::Apprentice));
        assert!(downgraded.expiry.is_none());
    }

    #[tokio::test]
    async fn test_downgrade_trims_watch_list() {
        let f = fixture();
        let now = Utc::now();
        subscriber(&f.cache, 7, Tier::Chieftain, now - ChronoDuration::days(4)).await;
        f.cache
            .mutate_user(7, |u| {
                u.status = true;
                u.tracking = Tracking::from_pairs((0..6).map(|i| ("solana", format!("t{}", i))));
            })
            .await
            .unwrap();

        let summary = f.scheduler.run_pass(now).await.unwrap();
        assert_eq!(summary.downgraded, 1);
        assert_eq!(summary.reminded + summary.notified, 0);

        let user = f.cache.user(7).await.unwrap();
        assert_eq!(user.tracking.len(), 3);
        let sent = f.transport.sent_to(7);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("🚫"));
    }

    #[tokio::test]
    async fn test_failed_downgrade_does_not_stop_the_pass() {
        let f = fixture();
        let now = Utc::now();
        for id in [3, 8, 9] {
            subscriber(&f.cache, id, Tier::Chieftain, now - ChronoDuration::days(5)).await;
        }
        f.store.fail_writes_for("users", "3");

        let summary = f.scheduler.run_pass(now).await.unwrap();
        assert_eq!(summary.downgraded, 2);
        assert_eq!(summary.failed, 1);

        for id in [8, 9] {
            let user = f.cache.user(id).await.unwrap();
            assert_eq!(user.tier(), Some(Tier::Apprentice));
            let doc = f.store.get("users", &id.to_string()).await.unwrap().unwrap();
            assert_eq!(doc["tier"], "apprentice");
        }
        assert!(f.cache.is_pending(3).await);
    }
}
