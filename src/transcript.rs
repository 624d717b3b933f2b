use crate::models::{ConversationMeta, ExportBundle, Message, Role, EXPORT_VERSION};
use crate::storage::{keys, StorageManager};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 40;

/// Owns the conversation index and the transcript currently on screen.
/// Transcript writes are batched: mutations mark the manager dirty and
/// [`TranscriptManager::flush`] persists them.
pub struct TranscriptManager {
    storage: Arc<StorageManager>,
    index: Vec<ConversationMeta>,
    active_id: Option<Uuid>,
    messages: Vec<Message>,
    dirty: bool,
}

impl TranscriptManager {
    /// Reads the index and reopens the last active conversation, if it still exists.
    pub fn load(storage: Arc<StorageManager>) -> Self {
        let index: Vec<ConversationMeta> = storage.get_json(keys::CHAT_INDEX).unwrap_or_default();
        let active_id = storage
            .get_trimmed(keys::ACTIVE_CHAT)
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .filter(|id| index.iter().any(|m| m.id == *id));
        let messages = active_id
            .and_then(|id| storage.get_json::<Vec<Message>>(&keys::transcript(id)))
            .unwrap_or_default();

        log::info!(
            "Loaded {} conversations (active: {:?}, {} messages)",
            index.len(),
            active_id,
            messages.len()
        );

        Self {
            storage,
            index,
            active_id,
            messages,
            dirty: false,
        }
    }

    pub fn active_id(&self) -> Option<Uuid> {
        self.active_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn trailing(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn meta(&self, id: Uuid) -> Option<&ConversationMeta> {
        self.index.iter().find(|m| m.id == id)
    }

    /// Appends a message to the active transcript. The first user message of
    /// a draft creates the conversation, titled after that message.
    pub fn push(&mut self, message: Message) -> Uuid {
        if self.active_id.is_none() && message.role == Role::User {
            let meta = ConversationMeta {
                id: Uuid::new_v4(),
                title: title_from(&message.text),
                updated_at: Utc::now(),
                pinned: false,
            };
            log::info!("Created conversation {} ('{}')", meta.id, meta.title);
            self.active_id = Some(meta.id);
            self.index.push(meta);
        }
        let id = message.id;
        self.messages.push(message);
        self.touch();
        id
    }

    /// Appends streamed text to a message. Returns false if it is not in the
    /// active transcript.
    pub fn append_text(&mut self, message_id: Uuid, delta: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.text.push_str(delta);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_interrupted(&mut self, message_id: Uuid) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if !message.interrupted => {
                message.interrupted = true;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Removes and returns the trailing message.
    pub fn pop(&mut self) -> Option<Message> {
        let popped = self.messages.pop();
        if popped.is_some() {
            self.touch();
        }
        popped
    }

    /// Conversations with pinned ones first, then most recently updated.
    pub fn list(&self) -> Vec<ConversationMeta> {
        let mut list = self.index.clone();
        sort_index(&mut list);
        list
    }

    /// Persists the active transcript, the index and the active pointer.
    pub async fn flush(&mut self) {
        if let Some(id) = self.active_id {
            if let Err(e) = self.storage.set_json(&keys::transcript(id), &self.messages).await {
                log::warn!("Failed to persist transcript {}: {:?}", id, e);
                return;
            }
        }
        if let Err(e) = self.storage.set_json(keys::CHAT_INDEX, &self.index).await {
            log::warn!("Failed to persist conversation index: {:?}", e);
            return;
        }
        let active = self.active_id.map(|id| id.to_string());
        self.storage.persist_opt(keys::ACTIVE_CHAT, active.as_deref()).await;
        self.dirty = false;
        log::debug!("Transcript flushed ({} messages)", self.messages.len());
    }

    pub async fn flush_if_dirty(&mut self) {
        if self.dirty {
            self.flush().await;
        }
    }

    /// Leaves the current conversation for an empty, id-less draft.
    pub async fn new_draft(&mut self) {
        self.flush_if_dirty().await;
        self.active_id = None;
        self.messages.clear();
        self.storage.persist(keys::ACTIVE_CHAT, "").await;
        log::info!("Switched to a new draft conversation");
    }

    /// Replaces the in-memory transcript with conversation `id`.
    pub async fn load_conversation(&mut self, id: Uuid) -> Result<()> {
        if self.meta(id).is_none() {
            return Err(anyhow!("Conversation {} not found", id));
        }
        self.flush_if_dirty().await;
        self.messages = self
            .storage
            .get_json(&keys::transcript(id))
            .unwrap_or_default();
        self.active_id = Some(id);
        self.storage.persist(keys::ACTIVE_CHAT, &id.to_string()).await;
        log::info!("Loaded conversation {} ({} messages)", id, self.messages.len());
        Ok(())
    }

    pub async fn rename(&mut self, id: Uuid, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(anyhow!("Title cannot be empty"));
        }
        let meta = self
            .index
            .iter_mut()
            .find(|m| m.id == id)
            .context("Conversation not found for renaming.")?;
        meta.title = title.to_string();
        meta.updated_at = Utc::now();
        log::info!("Renamed conversation {} to '{}'", id, title);
        self.save_index().await
    }

    pub async fn set_pinned(&mut self, id: Uuid, pinned: bool) -> Result<()> {
        let meta = self
            .index
            .iter_mut()
            .find(|m| m.id == id)
            .context("Conversation not found for pinning.")?;
        meta.pinned = pinned;
        self.save_index().await
    }

    /// Copies conversation `id` under a new id, unpinned.
    pub async fn duplicate(&mut self, id: Uuid) -> Result<Uuid> {
        self.flush_if_dirty().await;
        let source = self.meta(id).cloned().context("Conversation not found for duplication.")?;
        let messages = self.read_transcript(id);

        let copy = ConversationMeta {
            id: Uuid::new_v4(),
            title: format!("{} (copy)", source.title),
            updated_at: Utc::now(),
            pinned: false,
        };
        self.storage
            .set_json(&keys::transcript(copy.id), &messages)
            .await
            .context("Failed to store duplicated transcript")?;
        let new_id = copy.id;
        self.index.push(copy);
        self.save_index().await?;
        log::info!("Duplicated conversation {} as {}", id, new_id);
        Ok(new_id)
    }

    /// Removes a conversation. Deleting the active one falls back to a draft.
    pub async fn delete(&mut self, id: Uuid) -> Result<()> {
        let before = self.index.len();
        self.index.retain(|m| m.id != id);
        if self.index.len() == before {
            log::warn!("Attempted to delete non-existent conversation: {}", id);
            return Err(anyhow!("Conversation {} not found", id));
        }
        self.storage
            .remove(&keys::transcript(id))
            .await
            .context("Failed to delete transcript")?;
        if self.active_id == Some(id) {
            self.active_id = None;
            self.messages.clear();
            self.dirty = false;
            self.storage.persist(keys::ACTIVE_CHAT, "").await;
        }
        log::warn!("Deleted conversation {}", id);
        self.save_index().await
    }

    /// Bundles the index and every transcript into one document.
    pub async fn export(&mut self) -> ExportBundle {
        self.flush_if_dirty().await;
        let mut index = self.index.clone();
        sort_index(&mut index);
        let transcripts: BTreeMap<Uuid, Vec<Message>> = index
            .iter()
            .map(|meta| (meta.id, self.read_transcript(meta.id)))
            .collect();
        log::info!("Exported {} conversations", index.len());
        ExportBundle {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            index,
            transcripts,
        }
    }

    /// Adds conversations from `bundle` whose ids are not present yet.
    /// Returns how many were added.
    pub async fn import(&mut self, bundle: ExportBundle) -> Result<usize> {
        if bundle.version > EXPORT_VERSION {
            return Err(anyhow!("Unsupported export version {}", bundle.version));
        }
        let mut known: HashSet<Uuid> = self.index.iter().map(|m| m.id).collect();
        let mut added = 0;
        for meta in bundle.index {
            if !known.insert(meta.id) {
                log::debug!("Skipping already present conversation {}", meta.id);
                continue;
            }
            let messages = bundle.transcripts.get(&meta.id).cloned().unwrap_or_default();
            self.storage
                .set_json(&keys::transcript(meta.id), &messages)
                .await
                .context(format!("Failed to store imported transcript {}", meta.id))?;
            self.index.push(meta);
            added += 1;
        }
        if added > 0 {
            self.save_index().await?;
        }
        log::info!("Imported {} conversations", added);
        Ok(added)
    }

    fn read_transcript(&self, id: Uuid) -> Vec<Message> {
        if self.active_id == Some(id) {
            return self.messages.clone();
        }
        self.storage.get_json(&keys::transcript(id)).unwrap_or_default()
    }

    async fn save_index(&mut self) -> Result<()> {
        self.storage
            .set_json(keys::CHAT_INDEX, &self.index)
            .await
            .context("Failed to persist conversation index")
    }

    fn touch(&mut self) {
        if let Some(id) = self.active_id {
            if let Some(meta) = self.index.iter_mut().find(|m| m.id == id) {
                meta.updated_at = Utc::now();
            }
        }
        self.dirty = true;
    }
}

/// Periodically flushes pending transcript changes.
pub fn spawn_autosave(transcripts: Arc<Mutex<TranscriptManager>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            transcripts.lock().await.flush_if_dirty().await;
        }
    })
}

fn sort_index(index: &mut [ConversationMeta]) {
    index.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
}

fn title_from(text: &str) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New Chat".to_string();
    }
    if line.chars().count() > TITLE_MAX_CHARS {
        let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}…", cut.trim_end())
    } else {
        line.to_string()
    }
}
