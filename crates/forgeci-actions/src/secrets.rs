// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secrets and variables: naming rules, AES-256-GCM storage, scoping.
//!
//! Secret values are encrypted at rest with a key derived per row from the
//! process runtime secret, so a copied database row is useless without the
//! deployment's secret. Variables are plaintext.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::warn;

use crate::error::{ActionsError, Result};
use crate::persistence::Persistence;

type HmacSha256 = Hmac<Sha256>;

/// Nonce length for AES-256-GCM, prefixed to every ciphertext.
const NONCE_LEN: usize = 12;

/// Name prefixes reserved for the synthesized job environment.
const FORBIDDEN_PREFIXES: &[&str] = &["FORGEJO_", "GITHUB_", "GITEA_"];

/// Store for encrypted secrets and plaintext variables.
#[derive(Clone)]
pub struct SecretStore {
    db: Arc<dyn Persistence>,
    runtime_secret: String,
}

impl SecretStore {
    /// Create a store over the given persistence backend.
    pub fn new(db: Arc<dyn Persistence>, runtime_secret: String) -> Self {
        Self { db, runtime_secret }
    }

    /// Validate and normalize a secret/variable name.
    ///
    /// Names match `^[A-Za-z_][A-Za-z0-9_]*$` and are uppercased. Reserved
    /// prefixes and the exact name `CI` are refused.
    pub fn normalize_name(name: &str) -> Result<String> {
        let mut chars = name.chars();
        let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if name.is_empty() || !valid_first || !valid_rest {
            return Err(ActionsError::ValidationError {
                field: "name".to_string(),
                message: format!(
                    "'{}' must start with a letter or underscore and contain only \
                     letters, digits, and underscores",
                    name
                ),
            });
        }

        let upper = name.to_ascii_uppercase();
        if upper == "CI" || FORBIDDEN_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            return Err(ActionsError::ForbiddenName { name: upper });
        }

        Ok(upper)
    }

    // Per-row key: HMAC-SHA256 of the runtime secret over the column and the
    // row's identity tuple. Stable across upserts, unique across rows.
    fn derive_key(&self, owner_id: i64, repo_id: i64, name: &str) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.runtime_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("secrets:data:{}:{}:{}", owner_id, repo_id, name).as_bytes());
        mac.finalize().into_bytes().into()
    }

    fn encrypt(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ActionsError::CryptoError {
            operation: "encrypt".to_string(),
            details: e.to_string(),
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext =
            cipher
                .encrypt(nonce, plaintext)
                .map_err(|e| ActionsError::CryptoError {
                    operation: "encrypt".to_string(),
                    details: e.to_string(),
                })?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(ActionsError::CryptoError {
                operation: "decrypt".to_string(),
                details: "ciphertext shorter than nonce".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| ActionsError::CryptoError {
            operation: "decrypt".to_string(),
            details: e.to_string(),
        })?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| ActionsError::CryptoError {
                operation: "decrypt".to_string(),
                details: e.to_string(),
            })
    }

    /// Store a secret, encrypting its value. The name is validated and
    /// uppercased; storing under an existing name overwrites the value.
    pub async fn set_secret(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let name = Self::normalize_name(name)?;
        let key = self.derive_key(owner_id, repo_id, &name);
        let data = self.encrypt(&key, value.as_bytes())?;
        self.db.put_secret(owner_id, repo_id, &name, &data).await?;
        Ok(())
    }

    /// Delete a secret. Existing rows with now-forbidden names may still be
    /// deleted, so only the character rule is enforced here.
    pub async fn delete_secret(&self, owner_id: i64, repo_id: i64, name: &str) -> Result<()> {
        let upper = name.to_ascii_uppercase();
        self.db.delete_secret(owner_id, repo_id, &upper).await?;
        Ok(())
    }

    /// Decrypt every secret visible to a run (owner-level then repo-level,
    /// repo entries shadowing owner entries of the same name).
    pub async fn secrets_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<HashMap<String, String>> {
        let records = self.db.list_secrets_for_run(owner_id, repo_id).await?;
        let mut out = HashMap::with_capacity(records.len());

        for record in records {
            let key = self.derive_key(record.owner_id, record.repo_id, &record.name);
            match self.decrypt(&key, &record.data) {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(value) => {
                        out.insert(record.name, value);
                    }
                    Err(_) => {
                        warn!(secret = %record.name, "secret is not valid UTF-8, skipping");
                    }
                },
                Err(e) => {
                    // A wrong runtime secret must not fail the whole dispatch.
                    warn!(secret = %record.name, error = %e, "failed to decrypt secret, skipping");
                }
            }
        }

        Ok(out)
    }

    /// Store a variable. Newlines are normalized to `\n`.
    pub async fn set_variable(
        &self,
        owner_id: i64,
        repo_id: i64,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let name = Self::normalize_name(name)?;
        let value = value.replace("\r\n", "\n").replace('\r', "\n");
        self.db
            .put_variable(owner_id, repo_id, &name, &value)
            .await?;
        Ok(())
    }

    /// Delete a variable.
    pub async fn delete_variable(&self, owner_id: i64, repo_id: i64, name: &str) -> Result<()> {
        let upper = name.to_ascii_uppercase();
        self.db.delete_variable(owner_id, repo_id, &upper).await?;
        Ok(())
    }

    /// Variables visible to a run, repo entries shadowing owner entries.
    pub async fn variables_for_run(
        &self,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<HashMap<String, String>> {
        let records = self.db.list_variables_for_run(owner_id, repo_id).await?;
        let mut out = HashMap::with_capacity(records.len());
        for record in records {
            out.insert(record.name, record.data);
        }
        Ok(out)
    }
}
