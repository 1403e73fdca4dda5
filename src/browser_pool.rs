//! Browser pool — per-user slot accounting with atomic reserve/upgrade/fail/
//! destroy, plus stale-slot garbage collection.
//!
//! Mutations are serialized per user so admission decisions are atomic: the
//! whole map lives behind one lock, mirroring the teacher's
//! `BrowserSessionManager` (single `RwLock<HashMap<...>>`, weak-referenced
//! background GC task) generalized from a per-conversation keying scheme to
//! per-user accounting with a slot cap.

use crate::browser_driver::BrowserDriver;
use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotPurpose {
    Recording,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Reserved,
    Initializing,
    Ready,
    Failed,
    Destroying,
}

#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub browser_id: String,
    pub user_id: String,
    pub purpose: SlotPurpose,
    pub state: SlotState,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

struct Slot {
    user_id: String,
    purpose: SlotPurpose,
    state: SlotState,
    created_at: DateTime<Utc>,
    last_touched_at: DateTime<Utc>,
    ready_tx: watch::Sender<bool>,
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("slot not found: {0}")]
    SlotNotFound(String),
    #[error("driver error: {0}")]
    Driver(#[from] crate::browser_driver::DriverError),
    #[error("timed out waiting for slot to become ready")]
    ReadyTimeout,
}

#[async_trait]
pub trait BrowserPool: Send + Sync {
    /// Reserve a slot if the user is under cap (and, for `purpose=recording`,
    /// has no existing recording slot). Returns `None` when denied.
    async fn reserve_slot(&self, user_id: &str, purpose: SlotPurpose) -> Option<String>;

    /// Drive the reserved slot's real launch and mark it `ready`, or `failed`
    /// on error. Matches spec's `UpgradeSlot` after performing the launch.
    async fn upgrade_slot(&self, browser_id: &str) -> Result<(), PoolError>;

    async fn fail_slot(&self, browser_id: &str);

    async fn destroy_slot(&self, browser_id: &str);

    async fn get_slot(&self, browser_id: &str) -> Option<SlotSnapshot>;

    async fn has_available_slots(&self, user_id: &str, purpose: Option<SlotPurpose>) -> bool;

    async fn get_active_for_user_by_purpose(
        &self,
        user_id: &str,
        purpose: SlotPurpose,
    ) -> Option<String>;

    /// Wait for a slot to reach `ready`, bounded by `timeout`. If the slot
    /// disappears in the meantime that is treated as fatal per spec.
    async fn wait_ready(&self, browser_id: &str, timeout: Duration) -> Result<(), PoolError>;

    async fn cleanup_stale(&self, threshold: Duration);

    async fn shutdown_all(&self);
}

pub struct ProductionBrowserPool {
    slots: RwLock<HashMap<String, Slot>>,
    driver: Arc<dyn BrowserDriver>,
    db: Database,
    default_max_slots_per_user: u32,
}

impl ProductionBrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, db: Database, default_max_slots_per_user: u32) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(HashMap::new()),
            driver,
            db,
            default_max_slots_per_user,
        })
    }

    fn is_active(state: SlotState) -> bool {
        matches!(
            state,
            SlotState::Reserved | SlotState::Initializing | SlotState::Ready
        )
    }

    /// A user's persisted `slot_limit` overrides the process-wide default
    /// (spec §3's per-user `N`); users with no row yet fall back to it.
    fn slot_limit_for(&self, user_id: &str) -> u32 {
        self.db
            .get_user(user_id)
            .map(|u| u.slot_limit)
            .unwrap_or(self.default_max_slots_per_user)
    }
}

#[async_trait]
impl BrowserPool for ProductionBrowserPool {
    async fn reserve_slot(&self, user_id: &str, purpose: SlotPurpose) -> Option<String> {
        let limit = self.slot_limit_for(user_id);
        let mut slots = self.slots.write().await;

        let active_count = slots
            .values()
            .filter(|s| s.user_id == user_id && Self::is_active(s.state))
            .count() as u32;
        if active_count >= limit {
            return None;
        }
        if purpose == SlotPurpose::Recording
            && slots.values().any(|s| {
                s.user_id == user_id && s.purpose == SlotPurpose::Recording && Self::is_active(s.state)
            })
        {
            return None;
        }

        let browser_id = crate::clock::Ids::browser_id();
        let now = Utc::now();
        let (ready_tx, _ready_rx) = watch::channel(false);
        slots.insert(
            browser_id.clone(),
            Slot {
                user_id: user_id.to_string(),
                purpose,
                state: SlotState::Reserved,
                created_at: now,
                last_touched_at: now,
                ready_tx,
            },
        );
        tracing::info!(browser_id = %browser_id, user_id, "reserved browser slot");
        Some(browser_id)
    }

    async fn upgrade_slot(&self, browser_id: &str) -> Result<(), PoolError> {
        {
            let mut slots = self.slots.write().await;
            let slot = slots
                .get_mut(browser_id)
                .ok_or_else(|| PoolError::SlotNotFound(browser_id.to_string()))?;
            slot.state = SlotState::Initializing;
        }

        let launch_result = self.driver.launch(browser_id).await;

        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(browser_id) else {
            // Slot was removed (e.g. aborted) while we were launching.
            return Err(PoolError::SlotNotFound(browser_id.to_string()));
        };
        match launch_result {
            Ok(()) => {
                slot.state = SlotState::Ready;
                slot.last_touched_at = Utc::now();
                let _ = slot.ready_tx.send(true);
                tracing::info!(browser_id, "browser slot ready");
                Ok(())
            }
            Err(e) => {
                slot.state = SlotState::Failed;
                tracing::warn!(browser_id, error = %e, "browser slot failed to initialize");
                Err(PoolError::Driver(e))
            }
        }
    }

    async fn fail_slot(&self, browser_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(browser_id) {
            slot.state = SlotState::Failed;
        }
    }

    async fn destroy_slot(&self, browser_id: &str) {
        {
            let mut slots = self.slots.write().await;
            match slots.get_mut(browser_id) {
                Some(slot) => slot.state = SlotState::Destroying,
                None => return,
            }
        };
        if let Err(e) = self.driver.close(browser_id).await {
            tracing::warn!(browser_id, error = %e, "error tearing down browser slot");
        }
        self.slots.write().await.remove(browser_id);
        tracing::info!(browser_id, "browser slot destroyed");
    }

    async fn get_slot(&self, browser_id: &str) -> Option<SlotSnapshot> {
        let slots = self.slots.read().await;
        slots.get(browser_id).map(|s| SlotSnapshot {
            browser_id: browser_id.to_string(),
            user_id: s.user_id.clone(),
            purpose: s.purpose,
            state: s.state,
            created_at: s.created_at,
            last_touched_at: s.last_touched_at,
        })
    }

    async fn has_available_slots(&self, user_id: &str, purpose: Option<SlotPurpose>) -> bool {
        let limit = self.slot_limit_for(user_id);
        let slots = self.slots.read().await;
        let active_count = slots
            .values()
            .filter(|s| s.user_id == user_id && Self::is_active(s.state))
            .count() as u32;
        if active_count >= limit {
            return false;
        }
        if purpose == Some(SlotPurpose::Recording) {
            return !slots.values().any(|s| {
                s.user_id == user_id && s.purpose == SlotPurpose::Recording && Self::is_active(s.state)
            });
        }
        true
    }

    async fn get_active_for_user_by_purpose(
        &self,
        user_id: &str,
        purpose: SlotPurpose,
    ) -> Option<String> {
        let slots = self.slots.read().await;
        slots.iter().find_map(|(id, s)| {
            (s.user_id == user_id && s.purpose == purpose && Self::is_active(s.state))
                .then(|| id.clone())
        })
    }

    async fn wait_ready(&self, browser_id: &str, timeout: Duration) -> Result<(), PoolError> {
        let mut ready_rx = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(browser_id)
                .ok_or_else(|| PoolError::SlotNotFound(browser_id.to_string()))?;
            if slot.state == SlotState::Ready {
                return Ok(());
            }
            slot.ready_tx.subscribe()
        };

        tokio::time::timeout(timeout, async {
            loop {
                if *ready_rx.borrow() {
                    return Ok(());
                }
                if ready_rx.changed().await.is_err() {
                    return Err(PoolError::SlotNotFound(browser_id.to_string()));
                }
            }
        })
        .await
        .map_err(|_| PoolError::ReadyTimeout)?
    }

    async fn cleanup_stale(&self, threshold: Duration) {
        let now = Utc::now();
        let mut to_remove = Vec::new();
        {
            let slots = self.slots.read().await;
            for (id, slot) in slots.iter() {
                let stale = matches!(
                    slot.state,
                    SlotState::Reserved | SlotState::Initializing | SlotState::Failed
                ) && now.signed_duration_since(slot.last_touched_at)
                    > chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero());
                if stale {
                    to_remove.push(id.clone());
                }
            }
        }
        for id in to_remove {
            tracing::info!(browser_id = %id, "evicting stale browser slot");
            self.destroy_slot(&id).await;
        }
    }

    async fn shutdown_all(&self) {
        let ids: Vec<String> = self.slots.read().await.keys().cloned().collect();
        for id in ids {
            self.destroy_slot(&id).await;
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A pool fake driven purely by bookkeeping, for worker and queue
    /// tests that care about admission/lifecycle but not real CDP sessions.
    pub struct FakeBrowserPool {
        slots: Mutex<HashMap<String, SlotSnapshot>>,
        max_slots_per_user: u32,
        auto_ready: bool,
    }

    impl FakeBrowserPool {
        pub fn new(max_slots_per_user: u32) -> Arc<Self> {
            Arc::new(Self {
                slots: Mutex::new(HashMap::new()),
                max_slots_per_user,
                auto_ready: true,
            })
        }

        fn is_active(state: SlotState) -> bool {
            matches!(
                state,
                SlotState::Reserved | SlotState::Initializing | SlotState::Ready
            )
        }
    }

    #[async_trait]
    impl BrowserPool for FakeBrowserPool {
        async fn reserve_slot(&self, user_id: &str, purpose: SlotPurpose) -> Option<String> {
            let mut slots = self.slots.lock().unwrap();
            let active = slots
                .values()
                .filter(|s| s.user_id == user_id && Self::is_active(s.state))
                .count() as u32;
            if active >= self.max_slots_per_user {
                return None;
            }
            if purpose == SlotPurpose::Recording
                && slots.values().any(|s| {
                    s.user_id == user_id && s.purpose == SlotPurpose::Recording && Self::is_active(s.state)
                })
            {
                return None;
            }
            let browser_id = crate::clock::Ids::browser_id();
            let now = Utc::now();
            slots.insert(
                browser_id.clone(),
                SlotSnapshot {
                    browser_id: browser_id.clone(),
                    user_id: user_id.to_string(),
                    purpose,
                    state: if self.auto_ready {
                        SlotState::Ready
                    } else {
                        SlotState::Reserved
                    },
                    created_at: now,
                    last_touched_at: now,
                },
            );
            Some(browser_id)
        }

        async fn upgrade_slot(&self, browser_id: &str) -> Result<(), PoolError> {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots
                .get_mut(browser_id)
                .ok_or_else(|| PoolError::SlotNotFound(browser_id.to_string()))?;
            slot.state = SlotState::Ready;
            Ok(())
        }

        async fn fail_slot(&self, browser_id: &str) {
            if let Some(slot) = self.slots.lock().unwrap().get_mut(browser_id) {
                slot.state = SlotState::Failed;
            }
        }

        async fn destroy_slot(&self, browser_id: &str) {
            self.slots.lock().unwrap().remove(browser_id);
        }

        async fn get_slot(&self, browser_id: &str) -> Option<SlotSnapshot> {
            self.slots.lock().unwrap().get(browser_id).cloned()
        }

        async fn has_available_slots(&self, user_id: &str, purpose: Option<SlotPurpose>) -> bool {
            let slots = self.slots.lock().unwrap();
            let active = slots
                .values()
                .filter(|s| s.user_id == user_id && Self::is_active(s.state))
                .count() as u32;
            if active >= self.max_slots_per_user {
                return false;
            }
            if purpose == Some(SlotPurpose::Recording) {
                return !slots.values().any(|s| {
                    s.user_id == user_id && s.purpose == SlotPurpose::Recording && Self::is_active(s.state)
                });
            }
            true
        }

        async fn get_active_for_user_by_purpose(
            &self,
            user_id: &str,
            purpose: SlotPurpose,
        ) -> Option<String> {
            self.slots
                .lock()
                .unwrap()
                .values()
                .find(|s| s.user_id == user_id && s.purpose == purpose && Self::is_active(s.state))
                .map(|s| s.browser_id.clone())
        }

        async fn wait_ready(&self, browser_id: &str, _timeout: Duration) -> Result<(), PoolError> {
            let state = self
                .slots
                .lock()
                .unwrap()
                .get(browser_id)
                .map(|s| s.state)
                .ok_or_else(|| PoolError::SlotNotFound(browser_id.to_string()))?;
            if state == SlotState::Ready {
                Ok(())
            } else {
                Err(PoolError::ReadyTimeout)
            }
        }

        async fn cleanup_stale(&self, _threshold: Duration) {}

        async fn shutdown_all(&self) {
            self.slots.lock().unwrap().clear();
        }
    }

    impl FakeBrowserPool {
        pub fn slot_count(&self) -> usize {
            self.slots.lock().unwrap().len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBrowserPool;
    use super::*;

    #[tokio::test]
    async fn admits_up_to_cap_then_denies() {
        let pool = FakeBrowserPool::new(2);
        let a = pool.reserve_slot("u1", SlotPurpose::Run).await;
        let b = pool.reserve_slot("u1", SlotPurpose::Run).await;
        let c = pool.reserve_slot("u1", SlotPurpose::Run).await;
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn only_one_recording_slot_per_user() {
        let pool = FakeBrowserPool::new(2);
        let first = pool.reserve_slot("u1", SlotPurpose::Recording).await;
        let second = pool.reserve_slot("u1", SlotPurpose::Recording).await;
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn destroying_a_slot_frees_capacity() {
        let pool = FakeBrowserPool::new(1);
        let a = pool.reserve_slot("u1", SlotPurpose::Run).await.unwrap();
        assert!(pool.reserve_slot("u1", SlotPurpose::Run).await.is_none());
        pool.destroy_slot(&a).await;
        assert!(pool.reserve_slot("u1", SlotPurpose::Run).await.is_some());
    }

    #[tokio::test]
    async fn production_pool_honors_per_user_slot_limit_override() {
        use crate::browser_driver::testing::FakeDriver;

        let db = Database::open_in_memory().unwrap();
        db.upsert_user("u1", 1).unwrap();
        let pool = ProductionBrowserPool::new(Arc::new(FakeDriver::default()), db, 2);

        // The user's persisted slot_limit (1) overrides the process-wide
        // default (2) passed to `new`.
        let a = pool.reserve_slot("u1", SlotPurpose::Run).await;
        let b = pool.reserve_slot("u1", SlotPurpose::Run).await;
        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn production_pool_falls_back_to_default_for_unknown_user() {
        use crate::browser_driver::testing::FakeDriver;

        let db = Database::open_in_memory().unwrap();
        let pool = ProductionBrowserPool::new(Arc::new(FakeDriver::default()), db, 2);

        let a = pool.reserve_slot("unknown-user", SlotPurpose::Run).await;
        let b = pool.reserve_slot("unknown-user", SlotPurpose::Run).await;
        let c = pool.reserve_slot("unknown-user", SlotPurpose::Run).await;
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn different_users_have_independent_caps() {
        let pool = FakeBrowserPool::new(1);
        assert!(pool.reserve_slot("u1", SlotPurpose::Run).await.is_some());
        assert!(pool.reserve_slot("u2", SlotPurpose::Run).await.is_some());
    }
}
