//! Access token claim inspection.
//!
//! The client never verifies the token signature (the backend is
//! authoritative); it only reads the `exp` claim to schedule refreshes and
//! the subject to know whose session this is. Issuer and audience are carried
//! for display but never enforced.

use anyhow::{Context, Result};
use jsonwebtoken::dangerous::insecure_decode;
use jsonwebtoken::TokenData;
use serde::{Deserialize, Serialize};

/// Claims the client cares about. Every field is optional: a token the
/// client cannot interpret is still forwarded to the backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, usually the user id
    #[serde(default)]
    pub sub: Option<String>,
    /// Explicit user id claim, when the backend sets one
    #[serde(default, rename = "userID", alias = "user_id", alias = "userId")]
    pub user_id: Option<String>,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: Option<i64>,
    /// Expiration (Unix timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
}

impl TokenClaims {
    /// The user this token was issued for.
    pub fn subject(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.sub.as_deref())
    }
}

/// Read the claims of a JWT without validating its signature or expiry.
pub fn read_claims(token: &str) -> Result<TokenClaims> {
    let token_data: TokenData<TokenClaims> =
        insecure_decode(token).context("Failed to read token claims")?;

    Ok(token_data.claims)
}

/// Expiry (`exp` claim) of a token, if it can be read.
pub fn expiry_of(token: &str) -> Option<i64> {
    read_claims(token).ok().and_then(|claims| claims.exp)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const TEST_SECRET: &str = "test-secret-key-minimum-32-chars!!";

    /// Mint an HS256 token for `user_id` expiring `ttl_secs` from now.
    pub(crate) fn mint_token(user_id: &str, ttl_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "sub": user_id,
            "iat": now,
            "exp": now + ttl_secs,
            "iss": "sprintdesk",
            "aud": "sprintdesk-web",
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("encode should succeed")
    }

    #[test]
    fn test_read_claims_without_secret() {
        let token = mint_token("user-42", 3600);
        let claims = read_claims(&token).expect("claims should be readable");
        assert_eq!(claims.subject(), Some("user-42"));
        assert_eq!(claims.iss.as_deref(), Some("sprintdesk"));
        let exp = claims.exp.unwrap();
        assert_eq!(exp - claims.iat.unwrap(), 3600);
    }

    #[test]
    fn test_expired_token_still_readable() {
        let token = mint_token("user-1", -7200);
        let exp = expiry_of(&token).expect("expired tokens still expose exp");
        assert!(exp < chrono::Utc::now().timestamp());
    }

    #[test]
    fn test_user_id_claim_preferred_over_sub() {
        let now = chrono::Utc::now().timestamp();
        let token = encode(
            &Header::default(),
            &serde_json::json!({"sub": "subject", "userID": "u-7", "exp": now + 60}),
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap();
        let claims = read_claims(&token).unwrap();
        assert_eq!(claims.subject(), Some("u-7"));
    }

    #[test]
    fn test_malformed_token_rejected() {
        assert!(read_claims("not.a.valid.jwt").is_err());
        assert!(read_claims("").is_err());
        assert!(expiry_of("just-random-text").is_none());
    }
}
