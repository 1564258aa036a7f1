//! Per-tier watch-list limits

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{Tier, User, UserId};
use crate::error::Result;
use crate::notify::messages::trim_notice_message;
use crate::notify::Dispatcher;
use crate::persistence::Cache;

pub struct TierEngine {
    cache: Arc<Cache>,
    dispatcher: Arc<Dispatcher>,
}

impl TierEngine {
    pub fn new(cache: Arc<Cache>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { cache, dispatcher }
    }

    fn is_super_admin(&self, user: &User) -> bool {
        user.id == self.cache.super_admin_id()
    }

    /// Address limit for a user; an unknown tier gets the apprentice limit
    pub fn limit_of(&self, user: &User) -> usize {
        if self.is_super_admin(user) {
            return Tier::SuperAdmin.token_limit();
        }
        match user.tier() {
            Some(tier) => tier.token_limit(),
            None => {
                warn!(
                    "User {} has unknown tier {:?}, applying apprentice limit",
                    user.id, user.tier
                );
                Tier::Apprentice.token_limit()
            }
        }
    }

    /// Bring one user into line: the super admin's tier is pinned and the
    /// watch list is cut to the limit. Returns whether anything was trimmed.
    pub fn apply(&self, user: &mut User) -> bool {
        if self.is_super_admin(user) && user.tier() != Some(Tier::SuperAdmin) {
            user.set_tier(Tier::SuperAdmin);
        }
        let limit = self.limit_of(user);
        user.tracking.truncate(limit)
    }

    /// Enforce the limit for one user and tell them if their list was trimmed
    pub async fn enforce(&self, user_id: UserId) -> Result<bool> {
        let Some(mut user) = self.cache.user(user_id).await else {
            debug!("enforce: user {} not found", user_id);
            return Ok(false);
        };

        let before = user.clone();
        let trimmed = self.apply(&mut user);
        if user == before {
            return Ok(false);
        }

        let updated = self
            .cache
            .mutate_user(user_id, |u| {
                u.tier = user.tier.clone();
                u.tracking = user.tracking.clone();
            })
            .await?;

        if trimmed {
            let tier = updated.tier().unwrap_or(Tier::Apprentice);
            let limit = self.limit_of(&updated);
            info!("Trimmed user {} to {} tokens ({})", user_id, limit, tier);
            self.cache.rebuild_tracked_index().await?;
            self.dispatcher
                .send(user_id, &trim_notice_message(tier, limit))
                .await;
        }
        Ok(trimmed)
    }

    /// Enforce every user's limit in one bulk write, without messaging anyone.
    ///
    /// Returns the number of users changed.
    pub async fn enforce_all(&self) -> Result<usize> {
        let super_admin = self.cache.super_admin_id();
        let ids: Vec<UserId> = self.cache.users().await.iter().map(|u| u.id).collect();

        let changed = self
            .cache
            .mutate_users(&ids, |user| {
                let mut changed = false;
                if user.id == super_admin && user.tier() != Some(Tier::SuperAdmin) {
                    user.set_tier(Tier::SuperAdmin);
                    changed = true;
                }
                let limit = self.limit_of(user);
                user.tracking.truncate(limit) || changed
            })
            .await?;

        info!("Tier limits enforced: {} of {} users changed", changed.len(), ids.len());
        Ok(changed.len())
    }
}
