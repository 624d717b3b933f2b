use crate::api::BackendApi;
use crate::config::AppConfig;
use crate::entitlement::EntitlementTracker;
use crate::identity::{self, ClientIdentity};
use crate::models::{BillingState, EntitlementState, SessionStatus};
use crate::storage::{keys, StorageManager};
use crate::transcript::TranscriptManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// State changes published to whatever renders the client.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    ChunkAppended {
        generation_id: u64,
        message_id: Uuid,
        delta: String,
    },
    SessionStatusChanged(SessionStatus),
    EntitlementChanged(EntitlementState),
    BillingChanged {
        state: BillingState,
        message: String,
        checkout_link: Option<String>,
    },
    TranscriptChanged,
    Notice(String),
}

// Process-wide application state, handed explicitly to the session
// controller and the billing workflow
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<StorageManager>,
    pub api: Arc<dyn BackendApi>,
    pub identity: ClientIdentity,
    pub entitlement: EntitlementTracker,
    pub transcripts: Arc<Mutex<TranscriptManager>>,
    events: broadcast::Sender<AppEvent>,
    visible: Arc<AtomicBool>,
}

impl AppState {
    /// Loads persisted identity, entitlement and transcripts into a new state.
    pub async fn new(config: AppConfig, storage: StorageManager, api: Arc<dyn BackendApi>) -> Self {
        let storage = Arc::new(storage);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let identity = identity::resolve(&storage).await;
        let entitlement = EntitlementTracker::load(
            Arc::clone(&storage),
            Arc::clone(&api),
            events.clone(),
            config.initial_free_quota,
        )
        .await;
        let transcripts = TranscriptManager::load(Arc::clone(&storage));

        log::info!(
            "Application state ready for client {}",
            identity::short_id(&identity.client_id)
        );

        Self {
            config: Arc::new(config),
            storage,
            api,
            identity,
            entitlement,
            transcripts: Arc::new(Mutex::new(transcripts)),
            events,
            visible: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Whether the client is currently in front of the user.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
        log::debug!("Visibility changed: {}", visible);
    }

    /// Model to request: the stored selection, else the configured preference.
    pub fn selected_model(&self) -> Option<String> {
        self.storage
            .get_trimmed(keys::MODEL)
            .or_else(|| self.config.preferred_model.clone())
    }

    pub async fn select_model(&self, model: &str) {
        self.storage.persist(keys::MODEL, model.trim()).await;
    }
}
