use crate::api::{BackendApi, ProStatusReply, UsageCounters};
use crate::error::ApiResult;
use crate::identity::short_id;
use crate::models::{EntitlementState, ProStatus};
use crate::state::AppEvent;
use crate::storage::{keys, StorageManager};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Single source of truth for whether the user may attempt a generation.
#[derive(Clone)]
pub struct EntitlementTracker {
    state: Arc<Mutex<EntitlementState>>,
    storage: Arc<StorageManager>,
    api: Arc<dyn BackendApi>,
    events: broadcast::Sender<AppEvent>,
}

impl EntitlementTracker {
    /// Restores the cached counters and token. A stored token starts out as
    /// `checking`; call [`EntitlementTracker::refresh_current`] to resolve it.
    pub async fn load(
        storage: Arc<StorageManager>,
        api: Arc<dyn BackendApi>,
        events: broadcast::Sender<AppEvent>,
        initial_free: u64,
    ) -> Self {
        let free_remaining = match storage.get_trimmed(keys::FREE_LEFT) {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(|n| n.max(0.0) as u64)
                .unwrap_or(0),
            None => initial_free,
        };
        let pro_token = storage.get_trimmed(keys::PRO_TOKEN);
        let pro_status = if pro_token.is_some() {
            ProStatus::Checking
        } else {
            ProStatus::Off
        };

        let state = EntitlementState {
            free_remaining,
            pro_token,
            pro_status,
            pro_remaining: None,
        };
        log::info!(
            "Entitlement restored: {} free, {}",
            state.free_remaining,
            state.pro_line()
        );

        Self {
            state: Arc::new(Mutex::new(state)),
            storage,
            api,
            events,
        }
    }

    pub async fn snapshot(&self) -> EntitlementState {
        self.state.lock().await.clone()
    }

    pub async fn can_send(&self) -> bool {
        self.state.lock().await.can_send()
    }

    pub async fn pro_token(&self) -> Option<String> {
        self.state.lock().await.pro_token.clone()
    }

    /// Stores a user-supplied token (or unlinks on blank input) and resolves
    /// its status against the backend.
    pub async fn activate_token(&self, draft: &str) -> ProStatus {
        let token = draft.trim();
        if token.is_empty() {
            {
                let mut state = self.state.lock().await;
                state.pro_token = None;
                state.pro_status = ProStatus::Off;
                state.pro_remaining = None;
            }
            log::info!("Pro token unlinked");
            self.storage.persist(keys::PRO_TOKEN, "").await;
            self.publish().await;
            return ProStatus::Off;
        }

        self.install_token(token).await
    }

    /// Replaces any prior token, moves to `checking` and refreshes.
    pub async fn install_token(&self, token: &str) -> ProStatus {
        {
            let mut state = self.state.lock().await;
            state.pro_token = Some(token.to_string());
            state.pro_status = ProStatus::Checking;
            state.pro_remaining = None;
        }
        log::info!("Pro token {} installed, checking status", short_id(token));
        self.storage.persist(keys::PRO_TOKEN, token).await;
        self.publish().await;

        self.refresh_status(token).await
    }

    /// Refreshes whatever token is currently stored.
    pub async fn refresh_current(&self) -> ProStatus {
        match self.pro_token().await {
            Some(token) => self.refresh_status(&token).await,
            None => {
                let mut state = self.state.lock().await;
                state.pro_status = ProStatus::Off;
                state.pro_remaining = None;
                ProStatus::Off
            }
        }
    }

    /// Queries the backend for `token` and applies the result, unless the
    /// stored token changed while the query was in flight.
    pub async fn refresh_status(&self, token: &str) -> ProStatus {
        let reply = self.api.pro_status(token).await;
        let (status, remaining) = status_from_reply(&reply);
        if let Err(e) = &reply {
            log::warn!("Pro status query failed: {}", e);
        }

        {
            let mut state = self.state.lock().await;
            if state.pro_token.as_deref() != Some(token) {
                log::debug!(
                    "Discarding status for replaced token {}",
                    short_id(token)
                );
                return state.pro_status;
            }
            state.pro_status = status;
            state.pro_remaining = remaining;
        }
        log::info!("Pro token {} is {:?} ({:?} left)", short_id(token), status, remaining);
        self.publish().await;
        status
    }

    /// Overwrites local counters with the values the backend reported.
    pub async fn apply_counters(&self, counters: UsageCounters) {
        if counters.free_left.is_none() && counters.pro_left.is_none() {
            return;
        }
        let free_to_persist = {
            let mut state = self.state.lock().await;
            if let Some(free) = counters.free_left {
                state.free_remaining = free;
            }
            if let (Some(left), true) = (counters.pro_left, state.pro_token.is_some()) {
                state.pro_remaining = Some(left);
                state.pro_status = if left > 0 {
                    ProStatus::Active
                } else {
                    ProStatus::Exhausted
                };
            }
            counters.free_left.map(|_| state.free_remaining)
        };
        if let Some(free) = free_to_persist {
            self.storage.persist(keys::FREE_LEFT, &free.to_string()).await;
        }
        self.publish().await;
    }

    /// Local estimate between requests: a free send costs one unit. The next
    /// response's counters replace it.
    pub async fn note_send(&self) {
        let free = {
            let mut state = self.state.lock().await;
            if state.pro_token.is_some() || state.free_remaining == 0 {
                return;
            }
            state.free_remaining -= 1;
            state.free_remaining
        };
        self.storage.persist(keys::FREE_LEFT, &free.to_string()).await;
        self.publish().await;
    }

    async fn publish(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.events.send(AppEvent::EntitlementChanged(snapshot));
    }
}

/// Maps a status query result onto the token status and remaining credits.
pub fn status_from_reply(reply: &ApiResult<ProStatusReply>) -> (ProStatus, Option<u64>) {
    match reply {
        // unlimited or legacy tokens are reported as not found
        Ok(ProStatusReply::NotFound) => (ProStatus::Active, None),
        Ok(ProStatusReply::Unauthorized) | Ok(ProStatusReply::Failed(_)) => (ProStatus::Invalid, None),
        Ok(ProStatusReply::Ok { credits_left: Some(left) }) => {
            if *left > 0 {
                (ProStatus::Active, Some(*left))
            } else {
                (ProStatus::Exhausted, Some(0))
            }
        }
        Ok(ProStatusReply::Ok { credits_left: None }) => (ProStatus::Active, None),
        Err(_) => (ProStatus::Invalid, None),
    }
}
