//! Generation session controller.
//!
//! At most one streaming generation is live. Each send allocates a new
//! generation id; every chunk append re-checks that id (and the session's
//! cancel token) while holding the transcript lock, so a superseded or
//! stopped session can never write into a message after it lost ownership.

use crate::api::{ChatRequest, Credentials, WireMessage};
use crate::config::SYSTEM_DIRECTIVE;
use crate::decoder::Utf8StreamDecoder;
use crate::models::{Message, Role, SessionStatus};
use crate::state::{AppEvent, AppState};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const CANNOT_REACH_BACKEND: &str = "Error: cannot reach the backend.";
pub const FREE_LIMIT_NOTICE: &str = "Free limit reached. Open Credits to continue.";
const PRO_EXHAUSTED: &str = "Pro credits exhausted. Open Credits.";
const FREE_EXHAUSTED: &str = "Free limit reached. Open Credits.";

/// Why a send or regenerate was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    EmptyPrompt,
    Busy,
    NoEntitlement,
    NothingToRegenerate,
}

/// Identifies a started generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationTicket {
    pub generation_id: u64,
    pub message_id: Uuid,
}

struct ActiveSession {
    generation_id: u64,
    target_message_id: Uuid,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct SessionSlot {
    status: SessionStatus,
    active: Option<ActiveSession>,
    starting: bool,
}

#[derive(Clone)]
pub struct GenerationController {
    app: AppState,
    slot: Arc<Mutex<SessionSlot>>,
    latest: Arc<AtomicU64>,
    clearing: Arc<AtomicBool>,
}

impl GenerationController {
    pub fn new(app: AppState) -> Self {
        Self {
            app,
            slot: Arc::new(Mutex::new(SessionSlot {
                status: SessionStatus::Idle,
                active: None,
                starting: false,
            })),
            latest: Arc::new(AtomicU64::new(0)),
            clearing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.slot.lock().await.status
    }

    /// Id of the most recently issued generation (0 before the first send).
    pub fn latest_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Starts a generation for `prompt` in the active conversation. A live
    /// session is superseded: its handle is cancelled and its remaining
    /// chunks are dropped, without a status transition of its own.
    pub async fn send(&self, prompt: &str) -> Result<GenerationTicket, SendRejected> {
        let text = prompt.trim();
        if text.is_empty() {
            return Err(SendRejected::EmptyPrompt);
        }
        if self.clearing.load(Ordering::SeqCst) {
            log::debug!("Send rejected: chat is being cleared");
            return Err(SendRejected::Busy);
        }
        {
            let mut slot = self.slot.lock().await;
            if slot.starting {
                log::debug!("Send rejected: another send is starting");
                return Err(SendRejected::Busy);
            }
            slot.starting = true;
        }

        let result = self.start(text).await;
        self.slot.lock().await.starting = false;
        result
    }

    async fn start(&self, text: &str) -> Result<GenerationTicket, SendRejected> {
        if !self.app.entitlement.can_send().await {
            log::info!("Send blocked locally: no free quota and no pro token");
            let mut transcripts = self.app.transcripts.lock().await;
            transcripts.push(Message::assistant(FREE_LIMIT_NOTICE));
            drop(transcripts);
            self.app.emit(AppEvent::TranscriptChanged);
            return Err(SendRejected::NoEntitlement);
        }

        let (request, message_id) = {
            let mut transcripts = self.app.transcripts.lock().await;
            let request = build_request(
                transcripts.messages(),
                text,
                self.app.config.history_turns,
                self.app.selected_model(),
            );
            transcripts.push(Message::user(text));
            let message_id = transcripts.push(Message::assistant(""));
            (request, message_id)
        };
        self.app.emit(AppEvent::TranscriptChanged);

        let generation_id = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut slot = self.slot.lock().await;
            if let Some(old) = slot.active.take() {
                log::debug!(
                    "Generation {} superseded by {}",
                    old.generation_id,
                    generation_id
                );
                old.cancel.cancel();
            }
            slot.active = Some(ActiveSession {
                generation_id,
                target_message_id: message_id,
                cancel: cancel.clone(),
                task: None,
            });
            slot.status = SessionStatus::Thinking;
        }
        self.app.emit(AppEvent::SessionStatusChanged(SessionStatus::Thinking));
        self.app.entitlement.note_send().await;

        let credentials = Credentials {
            client_id: self.app.identity.client_id.clone(),
            pro_token: self.app.entitlement.pro_token().await,
            fingerprint: Some(self.app.identity.fingerprint.clone()),
        };

        log::info!("Generation {} started for message {}", generation_id, message_id);
        let this = self.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.run(generation_id, message_id, credentials, request, task_cancel)
                .await;
        });

        let mut slot = self.slot.lock().await;
        match slot.active.as_mut() {
            Some(active) if active.generation_id == generation_id => active.task = Some(handle),
            // already finished or replaced
            _ => {}
        }

        Ok(GenerationTicket {
            generation_id,
            message_id,
        })
    }

    /// Cancels the live session, marks its reply as interrupted when that
    /// reply is still the trailing message, and moves to `stopped`. Without a
    /// live session this does nothing. Returns whether a session was stopped.
    pub async fn stop(&self) -> bool {
        let stopped = {
            let mut slot = self.slot.lock().await;
            match slot.active.take() {
                Some(active) => {
                    active.cancel.cancel();
                    slot.status = SessionStatus::Stopped;
                    Some(active)
                }
                None => None,
            }
        };
        let Some(active) = stopped else {
            log::debug!("Stop requested with no active session");
            return false;
        };
        log::warn!("Generation {} stopped by user", active.generation_id);
        self.app.emit(AppEvent::SessionStatusChanged(SessionStatus::Stopped));

        {
            let mut transcripts = self.app.transcripts.lock().await;
            let owns_trailing = transcripts
                .trailing()
                .is_some_and(|m| m.role == Role::Assistant && m.id == active.target_message_id);
            if owns_trailing {
                transcripts.mark_interrupted(active.target_message_id);
            }
            transcripts.flush().await;
        }
        self.app.emit(AppEvent::TranscriptChanged);
        true
    }

    /// Drops the trailing assistant reply (and the prompt that produced it)
    /// and sends that prompt again.
    pub async fn regenerate(&self) -> Result<GenerationTicket, SendRejected> {
        if self.clearing.load(Ordering::SeqCst) || self.slot.lock().await.starting {
            return Err(SendRejected::Busy);
        }
        if !self.app.entitlement.can_send().await {
            return Err(SendRejected::NoEntitlement);
        }

        let prompt = {
            let mut transcripts = self.app.transcripts.lock().await;
            let msgs = transcripts.messages();
            let n = msgs.len();
            let prompt = match (n >= 2).then(|| (&msgs[n - 2], &msgs[n - 1])) {
                Some((user, reply)) if user.role == Role::User && reply.role == Role::Assistant => {
                    user.text.clone()
                }
                _ => return Err(SendRejected::NothingToRegenerate),
            };
            transcripts.pop();
            transcripts.pop();
            prompt
        };
        log::info!("Regenerating reply");
        self.send(&prompt).await
    }

    /// Stops any session and switches to a fresh draft conversation.
    pub async fn new_chat(&self) {
        if self.clearing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop().await;
        // invalidate whatever generation id is still in flight
        self.latest.fetch_add(1, Ordering::SeqCst);
        self.app.transcripts.lock().await.new_draft().await;
        self.app.emit(AppEvent::TranscriptChanged);
        self.clearing.store(false, Ordering::SeqCst);
    }

    /// Stops any session and opens conversation `id`.
    pub async fn load_chat(&self, id: Uuid) -> anyhow::Result<()> {
        self.stop().await;
        self.app.transcripts.lock().await.load_conversation(id).await?;
        self.app.emit(AppEvent::TranscriptChanged);
        Ok(())
    }

    /// Deletes conversation `id`, stopping the session first if it is the
    /// active conversation.
    pub async fn delete_chat(&self, id: Uuid) -> anyhow::Result<()> {
        let is_active = self.app.transcripts.lock().await.active_id() == Some(id);
        if is_active {
            self.stop().await;
        }
        self.app.transcripts.lock().await.delete(id).await?;
        self.app.emit(AppEvent::TranscriptChanged);
        Ok(())
    }

    /// Waits until the current session's task has exited.
    pub async fn wait(&self) {
        let handle = {
            let mut slot = self.slot.lock().await;
            slot.active.as_mut().and_then(|a| a.task.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Generation task failed: {:?}", e);
            }
        }
    }

    // --- Session task ---

    async fn run(
        &self,
        generation_id: u64,
        message_id: Uuid,
        credentials: Credentials,
        request: ChatRequest,
        cancel: CancellationToken,
    ) {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Generation {} cancelled before the response", generation_id);
                return;
            }
            result = self.app.api.open_chat_stream(&credentials, &request) => result,
        };

        let response = match opened {
            Ok(response) => response,
            Err(e) => {
                log::error!("Generation {} failed to reach backend: {}", generation_id, e);
                self.finish_with_notice(generation_id, message_id, &cancel, CANNOT_REACH_BACKEND)
                    .await;
                return;
            }
        };

        // counters are authoritative even on error statuses
        self.app.entitlement.apply_counters(response.counters).await;

        match response.status {
            402 => {
                let notice = if credentials.pro_token.is_some() {
                    PRO_EXHAUSTED
                } else {
                    FREE_EXHAUSTED
                };
                log::warn!("Generation {} refused: quota exhausted", generation_id);
                self.finish_with_notice(generation_id, message_id, &cancel, notice).await;
                return;
            }
            429 => {
                let wait = response.retry_after.as_deref().unwrap_or("a few");
                let notice = format!("Too many requests. Try again in {} seconds.", wait);
                log::warn!("Generation {} rate limited", generation_id);
                self.finish_with_notice(generation_id, message_id, &cancel, &notice).await;
                return;
            }
            status if !(200..300).contains(&status) => {
                let notice = format!("Error: backend responded with HTTP {}.", status);
                log::error!("Generation {} failed with HTTP {}", generation_id, status);
                self.finish_with_notice(generation_id, message_id, &cancel, &notice).await;
                return;
            }
            _ => {}
        }

        let mut body = response.body;
        let mut decoder = Utf8StreamDecoder::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("Generation {} observed cancellation", generation_id);
                    return;
                }
                next = body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    let text = decoder.push(&bytes);
                    if !text.is_empty()
                        && !self.append_chunk(generation_id, message_id, &cancel, &text).await
                    {
                        log::debug!("Generation {} is stale, dropping the rest", generation_id);
                        return;
                    }
                }
                Some(Err(e)) => {
                    log::error!("Generation {} stream broke: {}", generation_id, e);
                    self.finish_with_notice(generation_id, message_id, &cancel, CANNOT_REACH_BACKEND)
                        .await;
                    return;
                }
                None => break,
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() && !self.append_chunk(generation_id, message_id, &cancel, &tail).await {
            return;
        }
        log::info!("Generation {} completed", generation_id);
        self.complete(generation_id).await;
    }

    fn is_current(&self, generation_id: u64, cancel: &CancellationToken) -> bool {
        !cancel.is_cancelled() && self.latest.load(Ordering::SeqCst) == generation_id
    }

    /// Appends `text` if this generation still owns the message.
    async fn append_chunk(
        &self,
        generation_id: u64,
        message_id: Uuid,
        cancel: &CancellationToken,
        text: &str,
    ) -> bool {
        let mut transcripts = self.app.transcripts.lock().await;
        if !self.is_current(generation_id, cancel) {
            return false;
        }
        if !transcripts.append_text(message_id, text) {
            log::warn!("Message {} left the active transcript", message_id);
            return false;
        }
        drop(transcripts);
        self.app.emit(AppEvent::ChunkAppended {
            generation_id,
            message_id,
            delta: text.to_string(),
        });
        true
    }

    /// Writes a terminal notice into the reply and returns to `idle`.
    async fn finish_with_notice(
        &self,
        generation_id: u64,
        message_id: Uuid,
        cancel: &CancellationToken,
        notice: &str,
    ) {
        {
            let mut transcripts = self.app.transcripts.lock().await;
            if !self.is_current(generation_id, cancel) {
                return;
            }
            let separator = match transcripts.message(message_id) {
                Some(m) if !m.text.is_empty() => "\n\n",
                _ => "",
            };
            transcripts.append_text(message_id, &format!("{}{}", separator, notice));
        }
        self.app.emit(AppEvent::TranscriptChanged);
        self.complete(generation_id).await;
    }

    /// Ends `generation_id` normally if it is still the live session.
    async fn complete(&self, generation_id: u64) {
        let finished = {
            let mut slot = self.slot.lock().await;
            match &slot.active {
                Some(active) if active.generation_id == generation_id => {
                    slot.active = None;
                    slot.status = SessionStatus::Idle;
                    true
                }
                _ => false,
            }
        };
        if finished {
            self.app.emit(AppEvent::SessionStatusChanged(SessionStatus::Idle));
            self.app.transcripts.lock().await.flush().await;
        }
    }
}

/// Builds the request body: the system directive, up to `turns` prior
/// messages and the new prompt.
pub fn build_request(
    prior: &[Message],
    prompt: &str,
    turns: usize,
    model: Option<String>,
) -> ChatRequest {
    let skip = prior.len().saturating_sub(turns);
    let mut messages = Vec::with_capacity(prior.len() - skip + 2);
    messages.push(WireMessage {
        role: "system".to_string(),
        content: SYSTEM_DIRECTIVE.to_string(),
    });
    messages.extend(prior[skip..].iter().map(|m| WireMessage {
        role: m.role.as_str().to_string(),
        content: m.text.clone(),
    }));
    messages.push(WireMessage {
        role: "user".to_string(),
        content: prompt.to_string(),
    });
    ChatRequest { model, messages }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keeps_last_turns_between_directive_and_prompt() {
        let prior: Vec<Message> = (0..20)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("q{}", i))
                } else {
                    Message::assistant(format!("a{}", i))
                }
            })
            .collect();

        let request = build_request(&prior, "next", 12, Some("m1".into()));
        assert_eq!(request.model.as_deref(), Some("m1"));
        assert_eq!(request.messages.len(), 14);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[1].content, "q8");
        assert_eq!(request.messages[12].role, "assistant");
        assert_eq!(request.messages[12].content, "a19");
        assert_eq!(request.messages[13].content, "next");
    }

    #[test]
    fn short_history_is_sent_whole() {
        let prior = vec![Message::user("hi"), Message::assistant("hello")];
        let request = build_request(&prior, "again", 12, None);
        let roles: Vec<_> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
    }
}
