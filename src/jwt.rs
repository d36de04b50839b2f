//! # Keyshare server JWTs
//!
//! Decoding of the JWTs a keyshare server signs: the auth token handed out
//! after PIN verification and the `ProofP` response of the proving phase.
//! Signatures are always verified against the scheme-provided key; `exp` is
//! never validated by the decoder so the engine can apply its own leeway.

use chrono::{DateTime, Utc};
use jsonwebtoken::{TokenData, Validation};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::configuration::KeyshareAuthKey;
use crate::proof::ProofP;

/// How long before its `exp` a keyshare auth token is considered stale:
/// covers clock drift with the server plus the time the remaining protocol
/// phases need under this token.
pub const TOKEN_EXPIRY_LEEWAY_SECS: i64 = 60;

/// The standard claims of a keyshare auth token.
#[derive(Debug, Deserialize)]
pub struct TokenClaims {
    /// Expiry, seconds since the Unix epoch. Zero when absent, which always
    /// counts as stale.
    #[serde(default)]
    pub exp: i64,

    /// The issuing keyshare server.
    #[serde(default)]
    pub iss: Option<String>,

    /// The authenticated username.
    #[serde(default)]
    pub sub: Option<String>,
}

/// The claims of a `prove/getResponse` JWT: standard claims plus the server's
/// response share.
#[derive(Debug, Deserialize)]
pub struct ProofPClaims {
    /// The server's response contribution.
    #[serde(rename = "ProofP")]
    pub proof_p: ProofP,
}

/// Decode a keyshare server JWT, verifying its signature but not its expiry.
pub fn decode<T: DeserializeOwned>(
    token: &str, key: &KeyshareAuthKey,
) -> Result<T, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(key.algorithm);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<T>(token, &key.key, &validation).map(|data: TokenData<T>| data.claims)
}

/// Whether the stored auth token must be refreshed through a PIN prompt:
/// true when it does not decode under the scheme's key, or when it expires
/// within [`TOKEN_EXPIRY_LEEWAY_SECS`] of `now`.
#[must_use]
pub fn token_needs_refresh(token: &str, key: &KeyshareAuthKey, now: DateTime<Utc>) -> bool {
    match decode::<TokenClaims>(token, key) {
        Err(_) => true,
        Ok(claims) => claims.exp < now.timestamp() + TOKEN_EXPIRY_LEEWAY_SECS,
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"test-keyshare-secret";

    fn token(exp: i64) -> String {
        encode(
            &Header::default(),
            &json!({"iss": "kss", "sub": "user", "exp": exp}),
            &EncodingKey::from_secret(SECRET),
        )
        .expect("should encode")
    }

    #[test]
    fn fresh_token_passes() {
        let key = KeyshareAuthKey::from_secret(SECRET);
        let now = Utc::now();
        let jwt = token(now.timestamp() + 3600);
        assert!(!token_needs_refresh(&jwt, &key, now));
        let claims: TokenClaims = decode(&jwt, &key).expect("should decode");
        assert_eq!(claims.sub.as_deref(), Some("user"));
    }

    #[test]
    fn expiring_or_expired_token_needs_refresh() {
        let key = KeyshareAuthKey::from_secret(SECRET);
        let now = Utc::now();
        // Expired outright.
        assert!(token_needs_refresh(&token(now.timestamp() - 1), &key, now));
        // Still valid, but within the leeway window.
        assert!(token_needs_refresh(&token(now.timestamp() + 30), &key, now));
        // Just outside the window.
        assert!(!token_needs_refresh(
            &token(now.timestamp() + TOKEN_EXPIRY_LEEWAY_SECS + 5),
            &key,
            now
        ));
    }

    #[test]
    fn wrong_key_needs_refresh() {
        let key = KeyshareAuthKey::from_secret(b"some-other-secret");
        let now = Utc::now();
        assert!(token_needs_refresh(&token(now.timestamp() + 3600), &key, now));
    }

    #[test]
    fn garbage_token_needs_refresh() {
        let key = KeyshareAuthKey::from_secret(SECRET);
        assert!(token_needs_refresh("not-a-jwt", &key, Utc::now()));
    }
}
