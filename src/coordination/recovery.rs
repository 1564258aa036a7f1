//! Restart recovery
//!
//! Before exit, every monitoring user is flagged `active_restart` and switched
//! off. On the next boot the flag is turned back into `status = true`.

use std::sync::Arc;
use tracing::info;

use crate::domain::UserId;
use crate::error::Result;
use crate::persistence::Cache;

pub struct RestartRecovery {
    cache: Arc<Cache>,
}

impl RestartRecovery {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Capture users with monitoring on. One bulk write.
    pub async fn mark_active_users(&self) -> Result<Vec<UserId>> {
        let active: Vec<UserId> = self
            .cache
            .users()
            .await
            .into_iter()
            .filter(|u| u.status)
            .map(|u| u.id)
            .collect();

        let marked = self
            .cache
            .mutate_users(&active, |u| {
                u.active_restart = true;
                u.status = false;
                true
            })
            .await?;

        let ids: Vec<UserId> = marked.iter().map(|u| u.id).collect();
        info!("Marked {} users for restart recovery", ids.len());
        Ok(ids)
    }

    /// Switch monitoring back on for users captured before the last exit
    pub async fn restore_active_users(&self) -> Result<Vec<UserId>> {
        let flagged: Vec<UserId> = self
            .cache
            .users()
            .await
            .into_iter()
            .filter(|u| u.active_restart)
            .map(|u| u.id)
            .collect();

        let restored = self
            .cache
            .mutate_users(&flagged, |u| {
                u.status = true;
                u.active_restart = false;
                true
            })
            .await?;

        let ids: Vec<UserId> = restored.iter().map(|u| u.id).collect();
        info!("Restored monitoring for {} users", ids.len());
        Ok(ids)
    }
}
