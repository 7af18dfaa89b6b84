//! Connect credentials.
//!
//! Connections must present an identity credential at handshake time, before
//! any room-level event is processed. The credential is an HMAC-SHA256 tag
//! over the userId, keyed with the shared server secret, so the surrounding
//! platform (which owns real user accounts) can mint tokens without talking
//! to this process.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SessionError;

type HmacSha256 = Hmac<Sha256>;

/// Mint a connect token for `user_id`.
pub fn mint_token(secret: &str, user_id: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(user_id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Verify a connect token. Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_token(secret: &str, user_id: &str, token: &str) -> Result<(), SessionError> {
    let tag = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| SessionError::Unauthenticated)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(user_id.as_bytes());
    mac.verify_slice(&tag)
        .map_err(|_| SessionError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_then_verify() {
        let token = mint_token("s3cret", "alice");
        assert!(verify_token("s3cret", "alice", &token).is_ok());
    }

    #[test]
    fn test_wrong_user_rejected() {
        let token = mint_token("s3cret", "alice");
        assert_eq!(
            verify_token("s3cret", "bob", &token),
            Err(SessionError::Unauthenticated)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = mint_token("s3cret", "alice");
        assert_eq!(
            verify_token("other", "alice", &token),
            Err(SessionError::Unauthenticated)
        );
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert_eq!(
            verify_token("s3cret", "alice", "not/base64!!"),
            Err(SessionError::Unauthenticated)
        );
    }
}
