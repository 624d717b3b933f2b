use crate::storage::{keys, StorageManager};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable anonymous identity of this client installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub fingerprint: String,
}

/// Reuses the stored client id or mints and stores a new one.
pub async fn load_or_create_client_id(storage: &StorageManager) -> String {
    if let Some(id) = storage.get_trimmed(keys::CLIENT_ID) {
        return id;
    }
    let id = Uuid::new_v4().to_string();
    log::info!("Generated new client id {}", short_id(&id));
    storage.persist(keys::CLIENT_ID, &id).await;
    id
}

/// Resolves the full identity. The fingerprint digest is computed off the
/// async runtime; if that fails the identity carries no fingerprint.
pub async fn resolve(storage: &StorageManager) -> ClientIdentity {
    let client_id = load_or_create_client_id(storage).await;
    let seed = client_id.clone();
    let fingerprint = match tokio::task::spawn_blocking(move || fingerprint(&seed)).await {
        Ok(digest) => digest,
        Err(e) => {
            log::warn!("Fingerprint computation failed: {}", e);
            String::new()
        }
    };
    ClientIdentity {
        client_id,
        fingerprint,
    }
}

/// Hex SHA-256 over the platform description and the client id.
pub fn fingerprint(client_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(std::env::consts::OS.as_bytes());
    hasher.update(b"/");
    hasher.update(std::env::consts::ARCH.as_bytes());
    hasher.update(b"/");
    hasher.update(client_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 8 characters followed by an ellipsis, for logs and status lines.
pub fn short_id(id: &str) -> String {
    if id.is_empty() {
        return "—".to_string();
    }
    let prefix: String = id.chars().take(8).collect();
    format!("{}…", prefix)
}
