use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// Who wrote a message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Role name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub role: Role,
    pub text: String, // Grows by appends while the message is being streamed
    #[serde(default)]
    pub interrupted: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            text: text.into(),
            interrupted: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            text: text.into(),
            interrupted: false,
        }
    }
}

// Index entry for a stored conversation (messages live under their own key)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    pub id: Uuid,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
}

// A conversation together with its transcript
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(flatten)]
    pub meta: ConversationMeta,
    pub messages: Vec<Message>,
}

/// Portable document produced by export and consumed by import.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub index: Vec<ConversationMeta>,
    pub transcripts: BTreeMap<Uuid, Vec<Message>>,
}

pub const EXPORT_VERSION: u32 = 1;

// --- Entitlement ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProStatus {
    Off,
    Checking,
    Active,
    Invalid,
    Exhausted,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementState {
    pub free_remaining: u64,
    pub pro_token: Option<String>,
    pub pro_status: ProStatus,
    pub pro_remaining: Option<u64>,
}

impl Default for EntitlementState {
    fn default() -> Self {
        Self {
            free_remaining: 0,
            pro_token: None,
            pro_status: ProStatus::Off,
            pro_remaining: None,
        }
    }
}

impl EntitlementState {
    /// Optimistic local gate. A token with unknown or zero remaining credits
    /// still passes; the backend answers 402 when it is really exhausted.
    pub fn can_send(&self) -> bool {
        self.free_remaining > 0 || self.pro_token.is_some()
    }

    /// One-line summary of the pro entitlement.
    pub fn pro_line(&self) -> String {
        if self.pro_token.is_none() {
            return "Pro: Off".to_string();
        }
        match self.pro_status {
            ProStatus::Checking => "Pro: Checking…".to_string(),
            ProStatus::Invalid => "Pro: Invalid token".to_string(),
            ProStatus::Exhausted => "Pro: Active (0 credits)".to_string(),
            ProStatus::Active => match self.pro_remaining {
                Some(left) => format!("Pro: Active ({} credits)", left),
                None => "Pro: Active".to_string(),
            },
            ProStatus::Off => "Pro: Off".to_string(),
        }
    }
}

// --- Billing ---

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plan {
    pub id: &'static str,
    pub title: &'static str,
    pub credits: u64,
    pub price_usd: u32,
}

pub const PLANS: [Plan; 3] = [
    Plan { id: "starter", title: "Starter", credits: 1_000, price_usd: 1 },
    Plan { id: "plus", title: "Plus", credits: 5_000, price_usd: 4 },
    Plan { id: "max", title: "Max", credits: 15_000, price_usd: 10 },
];

impl Plan {
    /// Looks a plan up by id, falling back to the first tier.
    pub fn find(id: &str) -> Plan {
        PLANS.iter().copied().find(|p| p.id == id).unwrap_or(PLANS[0])
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BillingState {
    Idle,
    Creating,
    Waiting,
    Claiming,
    Done,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    pub checkout_link: Option<String>,
    pub plan_id: String,
}

// --- Generation session ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Thinking,
    Stopped,
}

/// Models offered by the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}
