//! "Still monitoring" reminders for users who have not seen a spike yet
//!
//! Each user has a [`NotifyRecord`]. A spike resets it; otherwise the pass
//! sends a reminder once `next_interval` hours have passed since the last
//! alert and advances the interval 24 -> 36 -> 48 -> 24.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordination::shutdown::ShutdownToken;
use crate::domain::UserId;
use crate::error::Result;
use crate::notify::messages::monitoring_reminder_message;
use crate::notify::Dispatcher;
use crate::persistence::store::{collections, DocumentStore, Fields};
use crate::persistence::Cache;
use crate::services::Metrics;

/// Hours before the first reminder
pub const INITIAL_INTERVAL_HOURS: u32 = 24;

/// Interval that follows `current`; unknown values restart the cycle
pub fn next_interval(current: u32) -> u32 {
    match current {
        24 => 36,
        36 => 48,
        48 => 24,
        _ => INITIAL_INTERVAL_HOURS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotifyRecord {
    pub last_alert_time: DateTime<Utc>,
    pub next_interval: u32,
    pub has_received_spike: bool,
}

impl NotifyRecord {
    pub fn seeded(now: DateTime<Utc>) -> Self {
        Self {
            last_alert_time: now,
            next_interval: INITIAL_INTERVAL_HOURS,
            has_received_spike: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let elapsed_hours = (now - self.last_alert_time).num_seconds() as f64 / 3600.0;
        elapsed_hours >= f64::from(self.next_interval)
    }
}

/// In-memory reminder records with dirty tracking for batched persistence
#[derive(Default)]
pub struct NotifyStore {
    records: RwLock<HashMap<UserId, NotifyRecord>>,
    dirty: Mutex<BTreeSet<UserId>>,
}

impl NotifyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, store: &dyn DocumentStore) -> Result<usize> {
        let docs = store.find_all(collections::USER_NOTIFY).await?;
        let mut records = self.records.write().await;
        for (id, doc) in docs {
            let Ok(user_id) = id.parse::<UserId>() else {
                warn!("Skipping notify record with non-numeric id {}", id);
                continue;
            };
            match serde_json::from_value::<NotifyRecord>(doc) {
                Ok(record) => {
                    records.insert(user_id, record);
                }
                Err(e) => warn!("Skipping malformed notify record {}: {}", user_id, e),
            }
        }
        debug!("Loaded {} notify records", records.len());
        Ok(records.len())
    }

    pub async fn get(&self, user: UserId) -> Option<NotifyRecord> {
        self.records.read().await.get(&user).copied()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn set(&self, user: UserId, record: NotifyRecord) {
        self.records.write().await.insert(user, record);
        self.dirty.lock().await.insert(user);
    }

    /// Seed records for users that have none. Returns how many were created.
    pub async fn ensure(&self, users: &[UserId], now: DateTime<Utc>) -> usize {
        let mut created = Vec::new();
        {
            let mut records = self.records.write().await;
            for user in users {
                if !records.contains_key(user) {
                    records.insert(*user, NotifyRecord::seeded(now));
                    created.push(*user);
                }
            }
        }
        let count = created.len();
        self.dirty.lock().await.extend(created);
        count
    }

    /// A spike resets the reminder schedule
    pub async fn mark_spike(&self, users: &[UserId], now: DateTime<Utc>) {
        {
            let mut records = self.records.write().await;
            for user in users {
                records.insert(
                    *user,
                    NotifyRecord {
                        last_alert_time: now,
                        next_interval: INITIAL_INTERVAL_HOURS,
                        has_received_spike: true,
                    },
                );
            }
        }
        self.dirty.lock().await.extend(users.iter().copied());
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.lock().await.len()
    }

    /// Write dirty records in one bulk operation
    pub async fn flush(&self, store: &dyn DocumentStore) -> Result<usize> {
        let ids: Vec<UserId> = std::mem::take(&mut *self.dirty.lock().await)
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let updates = {
            let records = self.records.read().await;
            ids.iter()
                .filter_map(|id| records.get(id).map(|r| (*id, *r)))
                .map(|(id, record)| -> Result<(String, Fields)> {
                    let fields: Fields = match serde_json::to_value(record)? {
                        serde_json::Value::Object(map) => map,
                        _ => Fields::new(),
                    };
                    Ok((id.to_string(), fields))
                })
                .collect::<Result<Vec<(String, Fields)>>>()?
        };

        if let Err(e) = store.bulk_update(collections::USER_NOTIFY, &updates).await {
            self.dirty.lock().await.extend(ids);
            return Err(e);
        }
        debug!("Flushed {} notify records", updates.len());
        Ok(updates.len())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderSummary {
    pub reminded: usize,
    pub seeded: usize,
    /// Users already alerted by a spike
    pub skipped: usize,
}

pub struct ReminderService {
    cache: Arc<Cache>,
    notify: Arc<NotifyStore>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl ReminderService {
    pub fn new(
        cache: Arc<Cache>,
        notify: Arc<NotifyStore>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            notify,
            dispatcher,
            metrics,
            interval,
        }
    }

    /// One reminder pass over the active users
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<ReminderSummary> {
        let mut summary = ReminderSummary::default();
        let mut due = Vec::new();

        for user in self.cache.active_users().await {
            match self.notify.get(user.id).await {
                None => {
                    self.notify.set(user.id, NotifyRecord::seeded(now)).await;
                    summary.seeded += 1;
                }
                Some(record) if record.has_received_spike => summary.skipped += 1,
                Some(record) if record.is_due(now) => due.push((user.id, record)),
                Some(_) => {}
            }
        }

        if !due.is_empty() {
            let text = monitoring_reminder_message();
            let messages = due.iter().map(|(id, _)| (*id, text.clone())).collect();
            let sent = self.dispatcher.send_many(messages).await;
            Metrics::add(&self.metrics.reminders_sent, sent.delivered as u64);

            for (user, record) in &due {
                self.notify
                    .set(
                        *user,
                        NotifyRecord {
                            last_alert_time: now,
                            next_interval: next_interval(record.next_interval),
                            has_received_spike: false,
                        },
                    )
                    .await;
            }
            summary.reminded = due.len();
        }

        if self.notify.dirty_count().await > 0 {
            self.notify.flush(self.cache.store().as_ref()).await?;
        }

        info!(
            "Reminder pass: {} reminded, {} seeded, {} already alerted",
            summary.reminded, summary.seeded, summary.skipped
        );
        Ok(summary)
    }

    /// Run passes on a fixed interval until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Reminder loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_pass(Utc::now()).await {
                            error!("Reminder pass failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
