// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner registry: registration tokens, runner identity, scope rules.
//!
//! A runner registers once with a single-use registration token and from
//! then on authenticates every call with its UUID plus a secret token the
//! server only stores salted-hashed. Runners are scoped global, to an
//! owner, or to a repository, and never cross scopes.

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{ActionsError, Result};
use crate::logstore::LogStore;
use crate::persistence::{Persistence, RunnerRecord};

/// Registration token length in bytes of entropy (hex-encoded on the wire).
const REGISTRATION_TOKEN_BYTES: usize = 20;
/// Runner secret token entropy.
const RUNNER_TOKEN_BYTES: usize = 20;
/// Salt entropy for the stored token hash.
const TOKEN_SALT_BYTES: usize = 8;
/// Runner names are truncated to this many bytes.
const MAX_NAME_BYTES: usize = 255;
/// Declared version strings are truncated to this many bytes.
const MAX_VERSION_BYTES: usize = 64;

/// Checks that a runner scope (owner/repo) still exists.
///
/// The user/repository tables live outside this subsystem; deployments
/// plug their own check in. Registration against a vanished scope fails
/// with `InvalidRegistration`.
#[async_trait]
pub trait ScopeValidator: Send + Sync {
    async fn scope_exists(&self, owner_id: i64, repo_id: i64) -> Result<bool>;
}

/// Validator that accepts every scope (single-tenant deployments).
pub struct AllScopesValid;

#[async_trait]
impl ScopeValidator for AllScopesValid {
    async fn scope_exists(&self, _owner_id: i64, _repo_id: i64) -> Result<bool> {
        Ok(true)
    }
}

/// A freshly registered runner and the secret it must present from now on.
#[derive(Debug)]
pub struct Registration {
    pub runner: RunnerRecord,
    pub secret_token: String,
}

/// Runner registry over a persistence backend.
pub struct RunnerRegistry {
    db: Arc<dyn Persistence>,
    logs: Arc<dyn LogStore>,
    scopes: Arc<dyn ScopeValidator>,
}

impl RunnerRegistry {
    pub fn new(
        db: Arc<dyn Persistence>,
        logs: Arc<dyn LogStore>,
        scopes: Arc<dyn ScopeValidator>,
    ) -> Self {
        Self { db, logs, scopes }
    }

    /// Issue a registration token for a scope, superseding earlier ones.
    pub async fn issue_registration_token(&self, owner_id: i64, repo_id: i64) -> Result<String> {
        self.db
            .deactivate_registration_tokens(owner_id, repo_id)
            .await?;
        let token = random_hex(REGISTRATION_TOKEN_BYTES);
        self.db
            .create_registration_token(&token, owner_id, repo_id)
            .await?;
        Ok(token)
    }

    /// Register a new runner against a registration token.
    ///
    /// The token is consumed: a second registration with it is refused.
    pub async fn register(
        &self,
        registration_token: &str,
        name: &str,
        version: &str,
        labels: &[String],
        ephemeral: bool,
    ) -> Result<Registration> {
        let record = self
            .db
            .get_registration_token(registration_token)
            .await?
            .ok_or_else(|| ActionsError::InvalidRegistration {
                reason: "unknown registration token".to_string(),
            })?;
        if !record.is_active {
            return Err(ActionsError::InvalidRegistration {
                reason: "registration token is no longer active".to_string(),
            });
        }
        if !self
            .scopes
            .scope_exists(record.owner_id, record.repo_id)
            .await?
        {
            return Err(ActionsError::InvalidRegistration {
                reason: "owning scope no longer exists".to_string(),
            });
        }

        // Single use: consume before handing out credentials.
        self.db
            .deactivate_registration_tokens(record.owner_id, record.repo_id)
            .await?;

        let uuid = uuid::Uuid::new_v4().to_string();
        let secret_token = random_hex(RUNNER_TOKEN_BYTES);
        let salt = random_hex(TOKEN_SALT_BYTES);
        let hash = hash_token(&salt, &secret_token);

        let runner = self
            .db
            .create_runner(
                &uuid,
                &hash,
                &salt,
                &truncate_bytes(name, MAX_NAME_BYTES),
                &truncate_bytes(version, MAX_VERSION_BYTES),
                record.owner_id,
                record.repo_id,
                &serde_json::to_string(labels)?,
                ephemeral,
            )
            .await?;

        info!(
            runner = %runner.uuid,
            owner_id = runner.owner_id,
            repo_id = runner.repo_id,
            ephemeral,
            "runner registered"
        );

        Ok(Registration {
            runner,
            secret_token,
        })
    }

    /// Authenticate a runner by UUID and secret token.
    ///
    /// An unknown UUID and a wrong token read the same, so UUIDs cannot be
    /// probed.
    pub async fn authenticate(&self, uuid: &str, token: &str) -> Result<RunnerRecord> {
        let runner = self
            .db
            .get_runner_by_uuid(uuid)
            .await?
            .ok_or(ActionsError::BadAuthorization)?;

        if hash_token(&runner.token_salt, token) != runner.token_hash {
            warn!(runner = %uuid, "runner presented a bad token");
            return Err(ActionsError::BadAuthorization);
        }

        self.db.touch_runner(runner.id).await?;
        Ok(runner)
    }

    /// Update a runner's declared labels and version.
    pub async fn declare(
        &self,
        runner: &RunnerRecord,
        labels: &[String],
        version: &str,
    ) -> Result<()> {
        self.db
            .update_runner_declare(
                runner.id,
                &serde_json::to_string(labels)?,
                &truncate_bytes(version, MAX_VERSION_BYTES),
            )
            .await
    }

    /// Fetch a runner visible from the acting scope.
    ///
    /// Out-of-scope runners are reported as not found, never as forbidden.
    pub async fn get_in_scope(
        &self,
        uuid: &str,
        owner_id: i64,
        repo_id: i64,
    ) -> Result<RunnerRecord> {
        let runner = self
            .db
            .get_runner_by_uuid(uuid)
            .await?
            .filter(|r| r.owner_id == owner_id && r.repo_id == repo_id)
            .ok_or_else(|| ActionsError::RunnerNotFound {
                uuid: uuid.to_string(),
            })?;
        Ok(runner)
    }

    /// Delete a runner visible from the acting scope.
    pub async fn delete_in_scope(&self, uuid: &str, owner_id: i64, repo_id: i64) -> Result<()> {
        let runner = self.get_in_scope(uuid, owner_id, repo_id).await?;
        self.db.delete_runner(runner.id).await
    }

    /// Cascade deletion when an owner or repository is removed: every
    /// runner in the scope goes away, in-flight tasks are cancelled, and
    /// their log files are released.
    pub async fn remove_scope(&self, owner_id: i64, repo_id: i64) -> Result<()> {
        self.db
            .deactivate_registration_tokens(owner_id, repo_id)
            .await?;

        let runner_ids = self.db.delete_runners_in_scope(owner_id, repo_id).await?;
        for runner_id in &runner_ids {
            for task in self.db.list_active_tasks_by_runner(*runner_id).await? {
                self.db.cancel_task(task.id).await?;
                if let Err(e) = self.logs.delete(&task.log_filename).await {
                    warn!(task_id = task.id, error = %e, "failed to release task log");
                }
            }
        }

        info!(
            owner_id,
            repo_id,
            runners = runner_ids.len(),
            "scope removed, runners cascade-deleted"
        );
        Ok(())
    }
}

/// Hex SHA-256 of salt + token, as stored in the runner row.
pub fn hash_token(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Truncate to a byte limit without splitting a character.
fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
