// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OIDC ID tokens: signing key management, JWKS, and discovery.
//!
//! ID tokens are asymmetric JWTs a job can exchange with a cloud provider
//! for short-lived credentials. The signing key is loaded from a PEM file
//! or generated once (RSA-2048 for RS*, Ed25519 for EdDSA) and persisted
//! with mode 0600. The matching public key is published as a JWKS whose
//! `kid` is the base64url SHA-256 of the SPKI DER.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{ActionsError, Result};

/// ID token lifetime: one hour.
const ID_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Claim names advertised in the discovery document.
const SUPPORTED_CLAIMS: &[&str] = &[
    "sub",
    "aud",
    "exp",
    "iat",
    "iss",
    "jti",
    "nbf",
    "ref",
    "sha",
    "repository",
    "repository_owner",
    "repository_id",
    "run_id",
    "run_number",
    "run_attempt",
    "actor",
    "workflow",
    "head_ref",
    "base_ref",
    "event_name",
    "ref_type",
];

/// Signs ID tokens and publishes the matching public key.
pub struct IdTokenSigner {
    alg: Algorithm,
    alg_name: String,
    issuer: String,
    encoding_key: EncodingKey,
    jwk: Value,
    kid: String,
}

impl IdTokenSigner {
    /// Load the signing key from `key_file`, generating one when absent.
    ///
    /// RS* and EdDSA keys are generated on first use; ES256/ES384 require a
    /// provided key file because there is nothing sensible to generate
    /// without knowing the deployment's curve policy.
    pub fn load_or_generate(alg_name: &str, key_file: &Path, issuer: String) -> Result<Self> {
        let pem = if key_file.exists() {
            std::fs::read_to_string(key_file).map_err(|e| ActionsError::CryptoError {
                operation: "read_signing_key".to_string(),
                details: format!("{:?}: {}", key_file, e),
            })?
        } else {
            let pem = generate_key_pem(alg_name)?;
            write_key_file(key_file, &pem)?;
            info!(alg = alg_name, path = ?key_file, "generated new ID-token signing key");
            pem
        };

        Self::from_pem(alg_name, &pem, issuer)
    }

    /// Build a signer from an in-memory PEM (pkcs8) private key.
    pub fn from_pem(alg_name: &str, pem: &str, issuer: String) -> Result<Self> {
        let alg = parse_alg(alg_name)?;
        let (encoding_key, spki_der, jwk_fields) = key_material(alg, pem)?;

        let kid = URL_SAFE_NO_PAD.encode(Sha256::digest(&spki_der));

        let mut jwk = jwk_fields;
        if let Value::Object(ref mut map) = jwk {
            map.insert("use".to_string(), json!("sig"));
            map.insert("alg".to_string(), json!(alg_name));
            map.insert("kid".to_string(), json!(kid));
        }

        Ok(Self {
            alg,
            alg_name: alg_name.to_string(),
            issuer,
            encoding_key,
            jwk,
            kid,
        })
    }

    /// Key id of the active signing key.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Token issuer (`<AppURL>/api/actions`).
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign an ID token.
    ///
    /// `sub` and the extra claims come from the runtime token that requested
    /// it; `aud` is caller-controlled (cloud providers pin it).
    pub fn create_id_token(
        &self,
        sub: &str,
        aud: &str,
        extra: &serde_json::Map<String, Value>,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();

        let mut claims = serde_json::Map::new();
        for (key, value) in extra {
            // Registered claims below always win over extras.
            claims.insert(key.clone(), value.clone());
        }
        claims.insert("iss".to_string(), json!(self.issuer));
        claims.insert("sub".to_string(), json!(sub));
        claims.insert("aud".to_string(), json!(aud));
        claims.insert("nbf".to_string(), json!(now));
        claims.insert("iat".to_string(), json!(now));
        claims.insert("exp".to_string(), json!(now + ID_TOKEN_TTL_SECS));
        claims.insert("jti".to_string(), json!(uuid::Uuid::new_v4().to_string()));

        let mut header = Header::new(self.alg);
        header.kid = Some(self.kid.clone());

        jsonwebtoken::encode(&header, &Value::Object(claims), &self.encoding_key).map_err(|e| {
            ActionsError::CryptoError {
                operation: "sign_id_token".to_string(),
                details: e.to_string(),
            }
        })
    }

    /// JWKS document with the active public key.
    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk] })
    }

    /// OIDC discovery document.
    pub fn discovery(&self) -> Value {
        json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/.well-known/keys", self.issuer),
            "subject_types_supported": ["public"],
            "response_types_supported": ["id_token"],
            "claims_supported": SUPPORTED_CLAIMS,
            "id_token_signing_alg_values_supported": [self.alg_name],
            "scopes_supported": ["openid"],
        })
    }
}

fn parse_alg(alg_name: &str) -> Result<Algorithm> {
    match alg_name {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "EdDSA" => Ok(Algorithm::EdDSA),
        other => Err(ActionsError::CryptoError {
            operation: "parse_alg".to_string(),
            details: format!("unsupported ID-token algorithm '{}'", other),
        }),
    }
}

fn crypto_err(operation: &str) -> impl Fn(String) -> ActionsError + '_ {
    move |details| ActionsError::CryptoError {
        operation: operation.to_string(),
        details,
    }
}

/// EncodingKey, SPKI DER of the public key, and family-specific JWK fields.
fn key_material(alg: Algorithm, pem: &str) -> Result<(EncodingKey, Vec<u8>, Value)> {
    match alg {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            use rsa::pkcs1::DecodeRsaPrivateKey;
            use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
            use rsa::traits::PublicKeyParts;

            let private = rsa::RsaPrivateKey::from_pkcs8_pem(pem)
                .or_else(|_| rsa::RsaPrivateKey::from_pkcs1_pem(pem))
                .map_err(|e| crypto_err("load_rsa_key")(e.to_string()))?;
            let public = private.to_public_key();

            let spki = public
                .to_public_key_der()
                .map_err(|e| crypto_err("rsa_spki")(e.to_string()))?
                .into_vec();

            let jwk = json!({
                "kty": "RSA",
                "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
            });

            let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| crypto_err("rsa_encoding_key")(e.to_string()))?;

            Ok((encoding_key, spki, jwk))
        }
        Algorithm::ES256 => {
            use p256::elliptic_curve::sec1::ToEncodedPoint;
            use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};

            let private = p256::SecretKey::from_pkcs8_pem(pem)
                .map_err(|e| crypto_err("load_es256_key")(e.to_string()))?;
            let public = private.public_key();
            let point = public.to_encoded_point(false);

            let spki = public
                .to_public_key_der()
                .map_err(|e| crypto_err("es256_spki")(e.to_string()))?
                .into_vec();

            let jwk = json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode(point.x().map(|b| b.to_vec()).unwrap_or_default()),
                "y": URL_SAFE_NO_PAD.encode(point.y().map(|b| b.to_vec()).unwrap_or_default()),
            });

            let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| crypto_err("es256_encoding_key")(e.to_string()))?;

            Ok((encoding_key, spki, jwk))
        }
        Algorithm::ES384 => {
            use p384::elliptic_curve::sec1::ToEncodedPoint;
            use p384::pkcs8::{DecodePrivateKey, EncodePublicKey};

            let private = p384::SecretKey::from_pkcs8_pem(pem)
                .map_err(|e| crypto_err("load_es384_key")(e.to_string()))?;
            let public = private.public_key();
            let point = public.to_encoded_point(false);

            let spki = public
                .to_public_key_der()
                .map_err(|e| crypto_err("es384_spki")(e.to_string()))?
                .into_vec();

            let jwk = json!({
                "kty": "EC",
                "crv": "P-384",
                "x": URL_SAFE_NO_PAD.encode(point.x().map(|b| b.to_vec()).unwrap_or_default()),
                "y": URL_SAFE_NO_PAD.encode(point.y().map(|b| b.to_vec()).unwrap_or_default()),
            });

            let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| crypto_err("es384_encoding_key")(e.to_string()))?;

            Ok((encoding_key, spki, jwk))
        }
        Algorithm::EdDSA => {
            use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePublicKey};

            let signing = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
                .map_err(|e| crypto_err("load_ed25519_key")(e.to_string()))?;
            let verifying = signing.verifying_key();

            let spki = verifying
                .to_public_key_der()
                .map_err(|e| crypto_err("ed25519_spki")(e.to_string()))?
                .into_vec();

            let jwk = json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "x": URL_SAFE_NO_PAD.encode(verifying.to_bytes()),
            });

            let encoding_key = EncodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|e| crypto_err("ed25519_encoding_key")(e.to_string()))?;

            Ok((encoding_key, spki, jwk))
        }
        other => Err(ActionsError::CryptoError {
            operation: "key_material".to_string(),
            details: format!("unsupported algorithm {:?}", other),
        }),
    }
}

fn generate_key_pem(alg_name: &str) -> Result<String> {
    match alg_name {
        "RS256" | "RS384" | "RS512" => {
            use rsa::pkcs8::EncodePrivateKey;

            let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                .map_err(|e| crypto_err("generate_rsa_key")(e.to_string()))?;
            Ok(key
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| crypto_err("encode_rsa_key")(e.to_string()))?
                .to_string())
        }
        "EdDSA" => {
            use ed25519_dalek::pkcs8::EncodePrivateKey;

            let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
            Ok(key
                .to_pkcs8_pem(pkcs8::LineEnding::LF)
                .map_err(|e| crypto_err("encode_ed25519_key")(e.to_string()))?
                .to_string())
        }
        "ES256" | "ES384" => Err(ActionsError::CryptoError {
            operation: "generate_key".to_string(),
            details: format!(
                "{} requires a provided key file; EC keys are not auto-generated",
                alg_name
            ),
        }),
        other => Err(ActionsError::CryptoError {
            operation: "generate_key".to_string(),
            details: format!("unsupported ID-token algorithm '{}'", other),
        }),
    }
}

fn write_key_file(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            crypto_err("write_signing_key")(format!("{:?}: {}", parent, e))
        })?;
    }

    std::fs::write(path, pem)
        .map_err(|e| crypto_err("write_signing_key")(format!("{:?}: {}", path, e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| crypto_err("chmod_signing_key")(format!("{:?}: {}", path, e)))?;
    }

    Ok(())
}
