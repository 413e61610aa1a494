// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime tokens: short-lived HMAC JWTs scoped to one task.
//!
//! A runtime token is minted when a task is dispatched and authenticates the
//! runner's follow-up HTTP calls (result uploads, ID-token requests). It is
//! HS256 over the process runtime secret; verification rejects any other
//! algorithm, so an asymmetric ID token can never be replayed here.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{ActionsError, Result};

/// Runtime token lifetime: 24 hours, matching the maximum task duration.
const RUNTIME_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// Claims carried by a runtime token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeClaims {
    /// Space-separated scopes: `Actions.Results:<run>:<job>` always, plus
    /// `generate_id_token:<run>:<job>` when OIDC is enabled for the job.
    pub scp: String,
    /// Task this token belongs to.
    #[serde(rename = "TaskID")]
    pub task_id: i64,
    /// Run the task executes in.
    #[serde(rename = "RunID")]
    pub run_id: i64,
    /// Job the task executes.
    #[serde(rename = "JobID")]
    pub job_id: i64,
    /// JSON-encoded cache scope list.
    pub ac: String,
    /// Not valid before (unix seconds).
    pub nbf: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// OIDC subject for the job, present when OIDC is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_sub: Option<String>,
    /// JSON map of extra OIDC claims, present when OIDC is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc_extra: Option<String>,
}

impl RuntimeClaims {
    /// Whether the token may request an ID token for its run/job.
    pub fn can_generate_id_token(&self) -> bool {
        let want = format!("generate_id_token:{}:{}", self.run_id, self.job_id);
        self.scp.split_whitespace().any(|s| s == want)
    }
}

/// Mints and verifies runtime tokens over the process runtime secret.
#[derive(Clone)]
pub struct TokenService {
    secret: String,
}

impl TokenService {
    /// Create a service over the given secret.
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Mint a runtime token for a task.
    ///
    /// `oidc` carries the subject and extra-claims JSON when OIDC is enabled
    /// for the job; None disables the `generate_id_token` scope entirely
    /// (the fork-PR case).
    pub fn create(
        &self,
        task_id: i64,
        run_id: i64,
        job_id: i64,
        oidc: Option<(String, String)>,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();

        let mut scp = format!("Actions.Results:{}:{}", run_id, job_id);
        let (oidc_sub, oidc_extra) = match oidc {
            Some((sub, extra)) => {
                scp.push_str(&format!(" generate_id_token:{}:{}", run_id, job_id));
                (Some(sub), Some(extra))
            }
            None => (None, None),
        };

        let claims = RuntimeClaims {
            scp,
            task_id,
            run_id,
            job_id,
            ac: r#"[{"Scope":"","Permission":3}]"#.to_string(),
            nbf: now,
            exp: now + RUNTIME_TOKEN_TTL_SECS,
            iat: now,
            oidc_sub,
            oidc_extra,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ActionsError::CryptoError {
            operation: "sign_runtime_token".to_string(),
            details: e.to_string(),
        })
    }

    /// Verify a runtime token and return its claims.
    ///
    /// Only HS256 is accepted; a token signed with any other algorithm fails
    /// validation regardless of its payload.
    pub fn verify(&self, token: &str) -> Result<RuntimeClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "nbf"]);

        let data = decode::<RuntimeClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| ActionsError::InvalidToken {
            reason: e.to_string(),
        })?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn service() -> TokenService {
        TokenService::new(SECRET.to_string())
    }

    #[test]
    fn test_round_trip_without_oidc() {
        let svc = service();
        let token = svc.create(11, 22, 33, None).unwrap();
        let claims = svc.verify(&token).unwrap();

        assert_eq!(claims.task_id, 11);
        assert_eq!(claims.run_id, 22);
        assert_eq!(claims.job_id, 33);
        assert_eq!(claims.scp, "Actions.Results:22:33");
        assert!(!claims.can_generate_id_token());
        assert!(claims.oidc_sub.is_none());
    }

    #[test]
    fn test_round_trip_with_oidc() {
        let svc = service();
        let token = svc
            .create(
                1,
                2,
                3,
                Some(("repo:o/r:ref:refs/heads/main".to_string(), "{}".to_string())),
            )
            .unwrap();
        let claims = svc.verify(&token).unwrap();

        assert!(claims.can_generate_id_token());
        assert_eq!(
            claims.scp,
            "Actions.Results:2:3 generate_id_token:2:3"
        );
        assert_eq!(claims.oidc_sub.as_deref(), Some("repo:o/r:ref:refs/heads/main"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let svc = service();
        let token = svc.create(1, 2, 3, None).unwrap();

        let other = TokenService::new("another-secret-another-secret-yy".to_string());
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_non_hmac_alg_rejected() {
        // An attacker re-signing the payload with a different algorithm must
        // fail verification even if the header claims something exotic.
        let svc = service();
        let token = svc.create(1, 2, 3, None).unwrap();

        // Tamper with the header: change alg to none-style garbage.
        let parts: Vec<&str> = token.split('.').collect();
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine
            .encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let forged = format!("{}.{}.{}", header, parts[1], parts[2]);

        assert!(svc.verify(&forged).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let svc = service();
        assert!(svc.verify("not-a-jwt").is_err());
        assert!(svc.verify("").is_err());
    }

    #[test]
    fn test_scope_does_not_match_other_job() {
        let svc = service();
        let token = svc
            .create(1, 2, 3, Some(("sub".to_string(), "{}".to_string())))
            .unwrap();
        let mut claims = svc.verify(&token).unwrap();

        // The scope string names run 2 / job 3; a claims object reporting a
        // different job must not pass the scope check.
        claims.job_id = 4;
        assert!(!claims.can_generate_id_token());
    }
}
