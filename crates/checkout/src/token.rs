//! Signed recovery tokens for expired carts.
//!
//! A token is `b64(claim) "." b64(tag)` where the claim is
//! `cart_id:shopper_id:expiry_unix` and the tag is HMAC-SHA256 over the
//! encoded claim. Both parts use unpadded base64url so the token can travel
//! in a query string unescaped.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use common::{CartId, ShopperId};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of a recovery token.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24 * 7;

/// Why a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token is malformed")]
    Malformed,

    #[error("Token was issued for another cart")]
    CartMismatch,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature does not match")]
    BadSignature,

    #[error("Token secret must not be empty")]
    EmptySecret,
}

/// Issues and verifies recovery tokens with a server-side secret.
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Creates a signer. The secret must not be empty.
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, TokenError> {
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::EmptySecret)?;
        Ok(Self { mac, ttl })
    }

    /// Lifetime of newly issued tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a token for `cart_id` owned by `shopper_id`, valid for the TTL.
    pub fn issue(&self, cart_id: CartId, shopper_id: ShopperId, now: DateTime<Utc>) -> String {
        let expiry = (now + self.ttl).timestamp();
        let claim = URL_SAFE_NO_PAD.encode(format!("{cart_id}:{shopper_id}:{expiry}"));
        let tag = URL_SAFE_NO_PAD.encode(self.sign(claim.as_bytes()));
        format!("{claim}.{tag}")
    }

    /// Verifies a token presented for `cart_id`, returning the shopper it was issued to.
    pub fn verify(
        &self,
        token: &str,
        cart_id: CartId,
        now: DateTime<Utc>,
    ) -> Result<ShopperId, TokenError> {
        let (claim, tag) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let decoded = URL_SAFE_NO_PAD
            .decode(claim)
            .map_err(|_| TokenError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| TokenError::Malformed)?;

        let mut parts = decoded.split(':');
        let (Some(cart), Some(shopper), Some(expiry), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        let cart: CartId = cart.parse().map_err(|_| TokenError::Malformed)?;
        let shopper: ShopperId = shopper.parse().map_err(|_| TokenError::Malformed)?;
        let expiry: i64 = expiry.parse().map_err(|_| TokenError::Malformed)?;

        if cart != cart_id {
            return Err(TokenError::CartMismatch);
        }
        if expiry <= now.timestamp() {
            return Err(TokenError::Expired);
        }

        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac.clone();
        mac.update(claim.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| TokenError::BadSignature)?;

        Ok(shopper)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test-secret", Duration::hours(DEFAULT_TOKEN_TTL_HOURS)).unwrap()
    }

    #[test]
    fn test_issue_then_verify() {
        let signer = signer();
        let cart = CartId::new();
        let shopper = ShopperId::new();
        let now = Utc::now();

        let token = signer.issue(cart, shopper, now);
        assert!(!token.contains('='));
        assert_eq!(signer.verify(&token, cart, now).unwrap(), shopper);
    }

    #[test]
    fn test_other_cart_is_rejected() {
        let signer = signer();
        let now = Utc::now();
        let token = signer.issue(CartId::new(), ShopperId::new(), now);

        assert_eq!(
            signer.verify(&token, CartId::new(), now),
            Err(TokenError::CartMismatch)
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let signer = signer();
        let cart = CartId::new();
        let now = Utc::now();
        let token = signer.issue(cart, ShopperId::new(), now);

        let later = now + Duration::hours(DEFAULT_TOKEN_TTL_HOURS + 1);
        assert_eq!(signer.verify(&token, cart, later), Err(TokenError::Expired));
    }

    #[test]
    fn test_forged_claim_is_rejected() {
        let signer = signer();
        let cart = CartId::new();
        let now = Utc::now();
        let token = signer.issue(cart, ShopperId::new(), now);
        let (_, tag) = token.split_once('.').unwrap();

        // Same cart, different shopper, original tag.
        let claim = URL_SAFE_NO_PAD.encode(format!(
            "{cart}:{}:{}",
            ShopperId::new(),
            (now + Duration::hours(1)).timestamp()
        ));
        let forged = format!("{claim}.{tag}");
        assert_eq!(
            signer.verify(&forged, cart, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let cart = CartId::new();
        let now = Utc::now();
        let token = signer().issue(cart, ShopperId::new(), now);
        let other = TokenSigner::new(b"other-secret", Duration::hours(1)).unwrap();

        assert_eq!(
            other.verify(&token, cart, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        let signer = signer();
        let cart = CartId::new();
        for token in ["", "abc", "abc.def", "!!!.???"] {
            assert_eq!(
                signer.verify(token, cart, Utc::now()),
                Err(TokenError::Malformed)
            );
        }
    }

    #[test]
    fn test_empty_secret() {
        assert!(matches!(
            TokenSigner::new(b"", Duration::hours(1)),
            Err(TokenError::EmptySecret)
        ));
    }
}
