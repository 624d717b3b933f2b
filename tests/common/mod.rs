#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use voidchat_lib::api::{
    BackendApi, ChatRequest, ChatResponse, ClaimReply, ClaimRequest, CreatedInvoice, Credentials,
    InvoiceRequest, ProStatusReply, UsageCounters,
};
use voidchat_lib::config::AppConfig;
use voidchat_lib::error::{ApiError, ApiResult};
use voidchat_lib::models::ModelList;
use voidchat_lib::state::{AppEvent, AppState};
use voidchat_lib::storage::StorageManager;

pub type ChunkSender = mpsc::UnboundedSender<ApiResult<Bytes>>;

struct ScriptedReply {
    status: u16,
    counters: UsageCounters,
    retry_after: Option<String>,
    body: mpsc::UnboundedReceiver<ApiResult<Bytes>>,
}

/// Backend whose generation responses are queued by the test. Each body is
/// a channel, so the test decides when chunks arrive and when the stream ends.
/// Claims answer from a queue (pending once it is empty) and can be held
/// open by a gate.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<(Credentials, ChatRequest)>>,
    claim_replies: Mutex<VecDeque<ClaimReply>>,
    claims: Mutex<Vec<ClaimRequest>>,
    claim_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub claim_started: Notify,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a 200 response and returns the sender feeding its body.
    pub fn push_stream(&self) -> ChunkSender {
        self.push_stream_with(200, UsageCounters::default(), None)
    }

    pub fn push_stream_with(
        &self,
        status: u16,
        counters: UsageCounters,
        retry_after: Option<&str>,
    ) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded();
        self.replies.lock().unwrap().push_back(ScriptedReply {
            status,
            counters,
            retry_after: retry_after.map(str::to_string),
            body: rx,
        });
        tx
    }

    /// Queues a response whose whole body is known up front.
    pub fn push_reply(&self, status: u16, counters: UsageCounters, retry_after: Option<&str>, chunks: &[&str]) {
        let tx = self.push_stream_with(status, counters, retry_after);
        for chunk in chunks {
            send_chunk(&tx, chunk);
        }
    }

    pub fn requests(&self) -> Vec<(Credentials, ChatRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn push_claim(&self, reply: ClaimReply) {
        self.claim_replies.lock().unwrap().push_back(reply);
    }

    /// Holds the next claim open until the returned sender fires.
    pub fn gate_next_claim(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.claim_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn claims(&self) -> Vec<ClaimRequest> {
        self.claims.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendApi for ScriptedBackend {
    async fn open_chat_stream(
        &self,
        credentials: &Credentials,
        request: &ChatRequest,
    ) -> ApiResult<ChatResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((credentials.clone(), request.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ApiError::MissingField("scripted reply"))?;
        Ok(ChatResponse {
            status: reply.status,
            counters: reply.counters,
            retry_after: reply.retry_after,
            body: Box::pin(reply.body),
        })
    }

    async fn pro_status(&self, _token: &str) -> ApiResult<ProStatusReply> {
        Ok(ProStatusReply::NotFound)
    }

    async fn create_invoice(&self, _request: &InvoiceRequest) -> ApiResult<CreatedInvoice> {
        Ok(CreatedInvoice {
            invoice_id: "inv_1".into(),
            checkout_link: Some("https://pay.example/inv_1".into()),
        })
    }

    async fn claim(&self, request: &ClaimRequest) -> ApiResult<ClaimReply> {
        self.claims.lock().unwrap().push(request.clone());
        self.claim_started.notify_one();
        let gate = self.claim_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let reply = self.claim_replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or(ClaimReply::Pending))
    }

    async fn list_models(&self) -> ApiResult<ModelList> {
        Ok(ModelList {
            models: vec!["void-small".into()],
            default: Some("void-small".into()),
        })
    }
}

pub fn send_chunk(tx: &ChunkSender, text: &str) {
    // the receiver is gone once a session has been cancelled
    let _ = tx.unbounded_send(Ok(Bytes::from(text.to_string())));
}

/// Short timer settings for tests that let the invoice poller run.
pub fn polling_config(interval_ms: u64, timeout_ms: u64) -> AppConfig {
    AppConfig {
        poll_interval: Duration::from_millis(interval_ms),
        poll_timeout: Duration::from_millis(timeout_ms),
        ..AppConfig::default()
    }
}

pub fn test_config(free_quota: u64) -> AppConfig {
    AppConfig {
        initial_free_quota: free_quota,
        poll_interval: Duration::from_secs(60),
        ..AppConfig::default()
    }
}

/// Application state over a fresh in-memory store. `seed` entries are
/// written before the state loads them.
pub async fn app_with(
    api: Arc<dyn BackendApi>,
    config: AppConfig,
    seed: &[(&str, &str)],
) -> AppState {
    let storage = StorageManager::in_memory().await.unwrap();
    for (key, value) in seed {
        storage.set(key, value).await.unwrap();
    }
    AppState::new(config, storage, api).await
}

/// Waits for the first event matching `pred`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
