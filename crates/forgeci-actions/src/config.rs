// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;

/// Actions server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// QUIC server address for runner communication
    pub quic_addr: SocketAddr,
    /// HTTP server address for the OIDC endpoints
    pub http_addr: SocketAddr,
    /// Public base URL of the instance (issuer base for tokens)
    pub app_url: String,
    /// Secret for HMAC runtime tokens and secret-column key derivation
    pub runtime_secret: String,
    /// Signing algorithm for ID tokens (RS256/RS384/RS512/ES256/ES384/EdDSA)
    pub oidc_alg: String,
    /// Path to the ID-token signing key (PEM); generated when absent for
    /// RS* and EdDSA
    pub oidc_key_file: String,
    /// Directory for task log files
    pub log_dir: String,
    /// Seconds between sweeper passes
    pub sweep_interval_secs: u64,
    /// Running tasks with no update for this long are force-cancelled
    pub zombie_task_timeout_secs: i64,
    /// Waiting/Blocked jobs older than this are cancelled
    pub abandoned_job_timeout_secs: i64,
    /// Terminal tasks keep their log in the row store at most this long
    pub log_flush_timeout_secs: i64,
    /// Bump the per-scope tasks version on task finish (concurrency-group
    /// queuing wakes pollers through it)
    pub concurrency_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FORGECI_DATABASE_URL`: SQLite connection string
    /// - `FORGECI_RUNTIME_SECRET`: secret for runtime tokens and secret storage
    ///
    /// Optional (with defaults):
    /// - `FORGECI_QUIC_PORT`: runner QUIC server port (default: 8088)
    /// - `FORGECI_HTTP_PORT`: OIDC HTTP server port (default: 8089)
    /// - `FORGECI_APP_URL`: public base URL (default: http://localhost:3000/)
    /// - `FORGECI_OIDC_ALG`: ID-token algorithm (default: RS256)
    /// - `FORGECI_OIDC_KEY_FILE`: signing key path (default: .data/oidc-signing-key.pem)
    /// - `FORGECI_LOG_DIR`: task log directory (default: .data/actions-logs)
    /// - `FORGECI_SWEEP_INTERVAL_SECS`: sweeper period (default: 60)
    /// - `FORGECI_ZOMBIE_TASK_TIMEOUT_SECS`: stale Running task cutoff (default: 600)
    /// - `FORGECI_ABANDONED_JOB_TIMEOUT_SECS`: stale Waiting/Blocked job cutoff (default: 86400)
    /// - `FORGECI_LOG_FLUSH_TIMEOUT_SECS`: log transfer cutoff (default: 3600)
    /// - `FORGECI_CONCURRENCY_ENABLED`: "true" to bump tasks version on finish (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FORGECI_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FORGECI_DATABASE_URL"))?;

        let runtime_secret = std::env::var("FORGECI_RUNTIME_SECRET")
            .map_err(|_| ConfigError::Missing("FORGECI_RUNTIME_SECRET"))?;
        if runtime_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "FORGECI_RUNTIME_SECRET",
                "must be at least 32 bytes",
            ));
        }

        let quic_port: u16 = std::env::var("FORGECI_QUIC_PORT")
            .unwrap_or_else(|_| "8088".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FORGECI_QUIC_PORT", "must be a valid port number")
            })?;

        let http_port: u16 = std::env::var("FORGECI_HTTP_PORT")
            .unwrap_or_else(|_| "8089".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FORGECI_HTTP_PORT", "must be a valid port number")
            })?;

        let app_url = std::env::var("FORGECI_APP_URL")
            .unwrap_or_else(|_| "http://localhost:3000/".to_string());

        let oidc_alg = std::env::var("FORGECI_OIDC_ALG").unwrap_or_else(|_| "RS256".to_string());
        match oidc_alg.as_str() {
            "RS256" | "RS384" | "RS512" | "ES256" | "ES384" | "EdDSA" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "FORGECI_OIDC_ALG",
                    "must be one of RS256, RS384, RS512, ES256, ES384, EdDSA",
                ));
            }
        }

        let oidc_key_file = std::env::var("FORGECI_OIDC_KEY_FILE")
            .unwrap_or_else(|_| ".data/oidc-signing-key.pem".to_string());

        let log_dir =
            std::env::var("FORGECI_LOG_DIR").unwrap_or_else(|_| ".data/actions-logs".to_string());

        let sweep_interval_secs: u64 = std::env::var("FORGECI_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FORGECI_SWEEP_INTERVAL_SECS", "must be a positive integer")
            })?;

        let zombie_task_timeout_secs: i64 = std::env::var("FORGECI_ZOMBIE_TASK_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FORGECI_ZOMBIE_TASK_TIMEOUT_SECS",
                    "must be a positive integer",
                )
            })?;

        let abandoned_job_timeout_secs: i64 = std::env::var("FORGECI_ABANDONED_JOB_TIMEOUT_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FORGECI_ABANDONED_JOB_TIMEOUT_SECS",
                    "must be a positive integer",
                )
            })?;

        let log_flush_timeout_secs: i64 = std::env::var("FORGECI_LOG_FLUSH_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FORGECI_LOG_FLUSH_TIMEOUT_SECS",
                    "must be a positive integer",
                )
            })?;

        let concurrency_enabled = std::env::var("FORGECI_CONCURRENCY_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            quic_addr: SocketAddr::from(([0, 0, 0, 0], quic_port)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            app_url,
            runtime_secret,
            oidc_alg,
            oidc_key_file,
            log_dir,
            sweep_interval_secs,
            zombie_task_timeout_secs,
            abandoned_job_timeout_secs,
            log_flush_timeout_secs,
            concurrency_enabled,
        })
    }

    /// Issuer for runtime and ID tokens: `<AppURL>/api/actions` without a
    /// trailing slash on the base.
    pub fn issuer(&self) -> String {
        format!("{}/api/actions", self.app_url.trim_end_matches('/'))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
