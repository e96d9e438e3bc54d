//! Signed host-key tokens
//!
//! Tokens are HS256 JWTs keyed by the per-node shared secret, so a shell
//! script on the node can mint one with nothing but `openssl`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{TrustError, TrustResult};

/// Length of generated shared secrets
const SECRET_LEN: usize = 48;

/// Claims carried by a host-key token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostKeyClaims {
    /// Node uid the key belongs to
    pub sub: String,
    /// Host public key in `authorized_keys` form: `<alg> <base64>`
    pub host_key: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct HostKeyToken;

impl HostKeyToken {
    /// Sign `host_key` for node `uid`
    pub fn sign(uid: &str, host_key: &str, secret: &str, validity: Duration) -> TrustResult<String> {
        let now = Utc::now();
        let claims = HostKeyClaims {
            sub: uid.to_string(),
            host_key: host_key.trim().to_string(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| TrustError::Signing(e.to_string()))
    }

    /// Verify a token for node `uid` and return the embedded host key
    pub fn verify(token: &str, uid: &str, secret: &str) -> TrustResult<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.sub = Some(uid.to_string());

        let data = decode::<HostKeyClaims>(
            token.trim(),
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| TrustError::Verification(e.to_string()))?;

        validate_host_key(&data.claims.host_key)?;
        Ok(data.claims.host_key)
    }
}

/// Host keys must look like `ssh-ed25519 AAAA...` with a decodable blob
fn validate_host_key(host_key: &str) -> TrustResult<()> {
    let mut parts = host_key.split_whitespace();
    let (Some(algorithm), Some(blob), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(TrustError::Verification(format!(
            "host key is not '<alg> <base64>': {}",
            host_key
        )));
    };

    if !(algorithm.starts_with("ssh-") || algorithm.starts_with("ecdsa-sha2-")) {
        return Err(TrustError::Verification(format!(
            "unsupported host key algorithm: {}",
            algorithm
        )));
    }

    STANDARD
        .decode(blob)
        .map_err(|e| TrustError::Verification(format!("host key blob is not base64: {}", e)))?;

    Ok(())
}

/// Random alphanumeric secret shared with one node
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
