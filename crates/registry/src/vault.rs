//! CredentialVault — at-rest AES-256-GCM encryption of device secrets.
//!
//! One process-wide symmetric key, loaded from the environment at startup
//! and read-only afterwards. Plaintext exists only in memory on the way to a
//! RouterOS call; it is never persisted, logged, or returned to clients.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use tokio::sync::RwLock;
use uuid::Uuid;

use fg_domain::credential::{Credential, CredentialKind, CredentialMaterial};
use fg_domain::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CredentialVault
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CredentialVault {
    /// `None` when no key is configured; every operation then fails with
    /// `VaultLocked`.
    key: Option<[u8; KEY_LEN]>,
    rows: RwLock<Vec<Credential>>,
    persist_path: PathBuf,
}

impl CredentialVault {
    /// Load the key from the named env var (base64-wrapped raw 32 bytes).
    pub fn from_env(state_dir: &Path, key_env: &str) -> Self {
        let key = std::env::var(key_env)
            .ok()
            .and_then(|raw| Self::decode_key(&raw));
        if key.is_none() {
            tracing::warn!(var = key_env, "vault key not configured; credential operations will fail");
        }
        Self::new(state_dir, key)
    }

    pub fn new(state_dir: &Path, key: Option<[u8; KEY_LEN]>) -> Self {
        let persist_path = state_dir.join("credentials.json");
        let mut vault = Self {
            key,
            rows: RwLock::new(Vec::new()),
            persist_path,
        };
        vault.load();
        vault
    }

    fn decode_key(raw: &str) -> Option<[u8; KEY_LEN]> {
        let bytes = BASE64.decode(raw.trim()).ok()?;
        if bytes.len() != KEY_LEN {
            tracing::warn!(len = bytes.len(), "vault key has wrong length, expected 32 bytes");
            return None;
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Some(key)
    }

    fn load(&mut self) {
        if let Ok(data) = std::fs::read_to_string(&self.persist_path) {
            if let Ok(rows) = serde_json::from_str::<Vec<Credential>>(&data) {
                let count = rows.len();
                self.rows = RwLock::new(rows);
                tracing::info!(count, "loaded credential rows from disk");
            }
        }
    }

    async fn persist(&self) {
        let rows = self.rows.read().await;
        if let Ok(json) = serde_json::to_string_pretty(&*rows) {
            let path = self.persist_path.clone();
            drop(rows);
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist credentials");
                }
            })
            .await;
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    // ── Crypto ───────────────────────────────────────────────────────

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self.key.as_ref().ok_or(Error::VaultLocked)?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
    }

    /// Encrypt to base64(`nonce || ciphertext`), fresh nonce per call.
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| Error::Internal("credential encryption failed".into()))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(wrapped))
    }

    fn decrypt(&self, wrapped: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let bytes = BASE64
            .decode(wrapped)
            .map_err(|_| Error::Internal("credential ciphertext is not valid base64".into()))?;
        if bytes.len() <= NONCE_LEN {
            return Err(Error::Internal("credential ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Internal("credential decryption failed (wrong key?)".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Internal("decrypted credential is not utf-8".into()))
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Store a credential. Any existing active row for (device, kind) is
    /// flipped inactive in the same write-lock section.
    pub async fn store(
        &self,
        device_id: Uuid,
        kind: CredentialKind,
        username: String,
        plaintext: &str,
    ) -> Result<Credential> {
        let ciphertext = self.encrypt(plaintext)?;
        let now = Utc::now();

        let mut rows = self.rows.write().await;
        for row in rows.iter_mut() {
            if row.device_id == device_id && row.kind == kind && row.active {
                row.active = false;
                row.rotated_at = Some(now);
            }
        }
        let credential = Credential {
            id: Uuid::new_v4(),
            device_id,
            kind,
            username,
            ciphertext,
            active: true,
            created_at: now,
            rotated_at: None,
        };
        rows.push(credential.clone());
        drop(rows);

        self.persist().await;
        Ok(credential)
    }

    /// Decrypt the active credential for (device, kind). Callers are
    /// responsible for emitting the READ_SENSITIVE audit event.
    pub async fn retrieve(&self, device_id: Uuid, kind: CredentialKind) -> Result<CredentialMaterial> {
        if self.key.is_none() {
            return Err(Error::VaultLocked);
        }
        let rows = self.rows.read().await;
        let row = rows
            .iter()
            .find(|r| r.device_id == device_id && r.kind == kind && r.active)
            .ok_or_else(|| Error::CredentialNotFound {
                device: device_id.to_string(),
                kind: kind.to_string(),
            })?;
        let secret = self.decrypt(&row.ciphertext)?;
        Ok(CredentialMaterial {
            username: row.username.clone(),
            secret,
        })
    }

    /// Rotate requires an existing active row; the flip and the insert land
    /// in one write-lock section and one persist.
    pub async fn rotate(
        &self,
        device_id: Uuid,
        kind: CredentialKind,
        new_plaintext: &str,
    ) -> Result<Credential> {
        let has_active = self
            .rows
            .read()
            .await
            .iter()
            .any(|r| r.device_id == device_id && r.kind == kind && r.active);
        if !has_active {
            return Err(Error::CredentialNotFound {
                device: device_id.to_string(),
                kind: kind.to_string(),
            });
        }
        let username = self
            .rows
            .read()
            .await
            .iter()
            .find(|r| r.device_id == device_id && r.kind == kind && r.active)
            .map(|r| r.username.clone())
            .unwrap_or_default();
        self.store(device_id, kind, username, new_plaintext).await
    }

    /// Deactivate every credential for a device (decommission path).
    pub async fn deactivate_all(&self, device_id: Uuid) -> usize {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        let mut count = 0;
        for row in rows.iter_mut() {
            if row.device_id == device_id && row.active {
                row.active = false;
                row.rotated_at = Some(now);
                count += 1;
            }
        }
        drop(rows);

        if count > 0 {
            self.persist().await;
        }
        count
    }

    /// Invariant check: at most one active row per (device, kind).
    pub async fn active_count(&self, device_id: Uuid, kind: CredentialKind) -> usize {
        self.rows
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device_id && r.kind == kind && r.active)
            .count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_LEN] {
        [7u8; KEY_LEN]
    }

    fn vault(dir: &tempfile::TempDir) -> CredentialVault {
        CredentialVault::new(dir.path(), Some(test_key()))
    }

    #[tokio::test]
    async fn store_and_retrieve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let device = Uuid::new_v4();

        vault
            .store(device, CredentialKind::Rest, "svc".into(), "s3cret")
            .await
            .unwrap();
        let material = vault.retrieve(device, CredentialKind::Rest).await.unwrap();
        assert_eq!(material.username, "svc");
        assert_eq!(material.secret, "s3cret");
    }

    #[tokio::test]
    async fn plaintext_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let device = Uuid::new_v4();
        vault
            .store(device, CredentialKind::Rest, "svc".into(), "hunter2-plaintext")
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("credentials.json")).unwrap();
        assert!(!raw.contains("hunter2-plaintext"));
        assert!(raw.contains("svc"));
    }

    #[tokio::test]
    async fn rotation_keeps_single_active_row() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let device = Uuid::new_v4();

        vault
            .store(device, CredentialKind::Ssh, "svc".into(), "old")
            .await
            .unwrap();
        vault
            .rotate(device, CredentialKind::Ssh, "new")
            .await
            .unwrap();

        assert_eq!(vault.active_count(device, CredentialKind::Ssh).await, 1);
        let material = vault.retrieve(device, CredentialKind::Ssh).await.unwrap();
        assert_eq!(material.secret, "new");

        // Old row is retained, inactive, with rotated_at set.
        let rows = vault.rows.read().await;
        let inactive: Vec<_> = rows.iter().filter(|r| !r.active).collect();
        assert_eq!(inactive.len(), 1);
        assert!(inactive[0].rotated_at.is_some());
    }

    #[tokio::test]
    async fn rotate_without_existing_row_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let err = vault
            .rotate(Uuid::new_v4(), CredentialKind::Rest, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialNotFound { .. }));
    }

    #[tokio::test]
    async fn locked_vault_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let vault = CredentialVault::new(dir.path(), None);
        let device = Uuid::new_v4();

        let err = vault
            .store(device, CredentialKind::Rest, "svc".into(), "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VaultLocked));

        let err = vault.retrieve(device, CredentialKind::Rest).await.unwrap_err();
        assert!(matches!(err, Error::VaultLocked));
        assert!(!vault.is_unlocked());
    }

    #[tokio::test]
    async fn deactivate_all_clears_both_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let device = Uuid::new_v4();
        vault
            .store(device, CredentialKind::Rest, "svc".into(), "a")
            .await
            .unwrap();
        vault
            .store(device, CredentialKind::Ssh, "svc".into(), "b")
            .await
            .unwrap();

        assert_eq!(vault.deactivate_all(device).await, 2);
        assert!(vault.retrieve(device, CredentialKind::Rest).await.is_err());
        assert!(vault.retrieve(device, CredentialKind::Ssh).await.is_err());
    }

    #[tokio::test]
    async fn wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let device = Uuid::new_v4();
        {
            let vault = vault(&dir);
            vault
                .store(device, CredentialKind::Rest, "svc".into(), "pw")
                .await
                .unwrap();
        }
        let other = CredentialVault::new(dir.path(), Some([9u8; KEY_LEN]));
        let err = other.retrieve(device, CredentialKind::Rest).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn key_decode_rejects_wrong_length() {
        assert!(CredentialVault::decode_key(&BASE64.encode([1u8; 16])).is_none());
        assert!(CredentialVault::decode_key("not-base64!!").is_none());
        assert!(CredentialVault::decode_key(&BASE64.encode([1u8; 32])).is_some());
    }

    #[tokio::test]
    async fn nonces_are_unique_per_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let vault = vault(&dir);
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }
}
