//! Notification fan-out
//!
//! Alerts are grouped by recipient. Each recipient's alerts go out in order
//! under a single semaphore permit, so at most `max_concurrent` recipients are
//! being served at once. A copy of every alert is batched to the spike-log chat.
//! Failed deliveries are logged and reported to the error-log chat; nothing is retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::messages::{admin_log_message, delivery_failure_message, spike_message};
use crate::adapters::{ChatTransport, MessageFormat};
use crate::config::{ChatSettings, MonitorSettings};
use crate::domain::{TokenSnapshot, UserId};
use crate::monitor::classifier::Spike;
use crate::services::Metrics;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    /// Admin-log entries per batch task
    pub admin_batch_size: usize,
    pub spike_log_chat: Option<i64>,
    pub error_log_chat: Option<i64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            admin_batch_size: 20,
            spike_log_chat: None,
            error_log_chat: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_settings(monitor: &MonitorSettings, chat: &ChatSettings) -> Self {
        Self {
            max_concurrent: monitor.max_concurrent_notifications.max(1),
            admin_batch_size: monitor.notification_batch_size.max(1),
            spike_log_chat: chat.spike_log_chat_id,
            error_log_chat: chat.error_log_chat_id,
        }
    }
}

/// A classified spike bound for one recipient
#[derive(Debug, Clone)]
pub struct SpikeAlert {
    pub snapshot: TokenSnapshot,
    pub spike: Spike,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
    pub admin_logged: usize,
}

impl DispatchSummary {
    fn merge(&mut self, other: DispatchSummary) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.admin_logged += other.admin_logged;
    }
}

/// Delivery with failure reporting; cheap to clone into tasks
#[derive(Clone)]
struct Courier {
    transport: Arc<dyn ChatTransport>,
    error_log_chat: Option<i64>,
    metrics: Arc<Metrics>,
}

impl Courier {
    async fn deliver(&self, chat_id: i64, text: &str) -> bool {
        match self
            .transport
            .send_message(chat_id, text, MessageFormat::Markdown, true)
            .await
        {
            Ok(()) => {
                Metrics::inc(&self.metrics.notifications_sent);
                true
            }
            Err(e) => {
                error!("Failed to send message to {}: {}", chat_id, e);
                Metrics::inc(&self.metrics.notifications_failed);
                self.report_failure(chat_id, &e.to_string()).await;
                false
            }
        }
    }

    async fn report_failure(&self, chat_id: i64, reason: &str) {
        let Some(error_chat) = self.error_log_chat.filter(|c| *c != chat_id) else {
            return;
        };
        let text = delivery_failure_message(chat_id, reason);
        if let Err(e) = self
            .transport
            .send_message(error_chat, &text, MessageFormat::Plain, true)
            .await
        {
            warn!("Could not report delivery failure to error log: {}", e);
        }
    }

    async fn display_name(&self, user: UserId) -> String {
        match self.transport.get_chat(user).await {
            Ok(info) => info.display_name(user),
            Err(e) => {
                debug!("get_chat failed for {}: {}", user, e);
                format!("User {}", user)
            }
        }
    }
}

pub struct Dispatcher {
    courier: Courier,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        config: DispatcherConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            courier: Courier {
                transport,
                error_log_chat: config.error_log_chat,
                metrics,
            },
            config,
            semaphore,
        }
    }

    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        Arc::clone(&self.courier.transport)
    }

    /// Deliver one message outside any batch
    pub async fn send(&self, chat_id: i64, text: &str) -> bool {
        self.courier.deliver(chat_id, text).await
    }

    /// Deliver independent messages concurrently, bounded by the semaphore
    pub async fn send_many(&self, messages: Vec<(i64, String)>) -> DispatchSummary {
        let mut tasks = JoinSet::new();
        for (chat_id, text) in messages {
            let courier = self.courier.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                courier.deliver(chat_id, &text).await
            });
        }

        let mut summary = DispatchSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => summary.delivered += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!("Notification task failed: {}", e);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Send spike alerts to their recipients and copy them to the spike log
    pub async fn dispatch(&self, alerts: BTreeMap<UserId, Vec<SpikeAlert>>) -> DispatchSummary {
        let want_log = self.config.spike_log_chat.is_some();
        let mut tasks = JoinSet::new();

        for (user, user_alerts) in alerts {
            let courier = self.courier.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let name = if want_log {
                    courier.display_name(user).await
                } else {
                    String::new()
                };

                let mut summary = DispatchSummary::default();
                let mut log_entries = Vec::new();
                for alert in user_alerts {
                    let Some(text) = spike_message(&alert.snapshot, alert.spike) else {
                        continue;
                    };
                    if courier.deliver(user, &text).await {
                        summary.delivered += 1;
                    } else {
                        summary.failed += 1;
                    }
                    if want_log {
                        log_entries.push(admin_log_message(&name, &text));
                    }
                }
                (summary, log_entries)
            });
        }

        let mut summary = DispatchSummary::default();
        let mut log_entries = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((user_summary, entries)) => {
                    summary.merge(user_summary);
                    log_entries.extend(entries);
                }
                Err(e) => error!("Notification task failed: {}", e),
            }
        }

        if let Some(log_chat) = self.config.spike_log_chat {
            summary.admin_logged = self.send_admin_log(log_chat, log_entries).await;
        }

        debug!(
            "Dispatched {} alerts ({} failed, {} logged)",
            summary.delivered, summary.failed, summary.admin_logged
        );
        summary
    }

    /// Spike-log copies in batches, each batch sent in order by one task
    async fn send_admin_log(&self, log_chat: i64, entries: Vec<String>) -> usize {
        let mut tasks = JoinSet::new();
        for batch in entries.chunks(self.config.admin_batch_size.max(1)) {
            let batch = batch.to_vec();
            let courier = self.courier.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let mut sent = 0;
                for entry in batch {
                    if courier.deliver(log_chat, &entry).await {
                        sent += 1;
                    }
                }
                sent
            });
        }

        let mut logged = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(sent) => logged += sent,
                Err(e) => error!("Admin log task failed: {}", e),
            }
        }
        logged
    }
}
