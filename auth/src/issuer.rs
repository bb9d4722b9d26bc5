//! HS256 access token issuer.
//!
//! # Security
//!
//! The signing key is handed in at construction and held immutably; there is
//! no process-global key. Access tokens are JWTs carrying `sub`, `tenant_id`,
//! `iat`, `exp`, `typ = "access"` and a unique `jti`. Refresh tokens are opaque
//! random strings; only their digests are stored.

use crate::clock::SharedClock;
use crate::constants::TOKEN_TYPE;
use crate::error::{AuthError, Result};
use crate::providers::TokenIssuer;
use crate::state::TokenPair;
use crate::utils::expires_after;
use chrono::Duration;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

const ACCESS_TOKEN_TYPE: &str = "access";

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (canonical account id).
    pub sub: String,
    /// Active tenant.
    pub tenant_id: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expires at (Unix seconds).
    pub exp: i64,
    /// Token type discriminator.
    pub typ: String,
    /// Unique token id.
    pub jti: String,
}

/// Token issuer signing access tokens with HMAC-SHA256.
#[derive(Clone)]
pub struct JwtTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    clock: SharedClock,
}

impl JwtTokenIssuer {
    /// Shortest accepted signing secret, in bytes.
    pub const MIN_SECRET_LEN: usize = 32;

    /// Create an issuer from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InternalError` if `secret` is shorter than
    /// [`Self::MIN_SECRET_LEN`].
    pub fn new(secret: &[u8], clock: SharedClock) -> Result<Self> {
        if secret.len() < Self::MIN_SECRET_LEN {
            return Err(AuthError::InternalError(format!(
                "signing secret must be at least {} bytes",
                Self::MIN_SECRET_LEN
            )));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            clock,
        })
    }

    /// Validate an access token and return its claims.
    ///
    /// Expiry is checked against the issuer's clock.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` if the signature, type, or
    /// expiry check fails.
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let claims = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AuthError::InvalidCredentials
            })?
            .claims;

        if claims.typ != ACCESS_TOKEN_TYPE || claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(claims)
    }
}

impl std::fmt::Debug for JwtTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenIssuer").finish_non_exhaustive()
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(
        &self,
        subject_user_id: &str,
        tenant_id: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<TokenPair> {
        let now = self.clock.now();
        let access_expires_at = expires_after(now, access_ttl)?;
        let refresh_expires_at = expires_after(now, refresh_ttl)?;

        let claims = AccessClaims {
            sub: subject_user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InternalError(format!("failed to sign access token: {e}")))?;

        Ok(TokenPair {
            access_token,
            refresh_token: crate::utils::generate_refresh_token(),
            access_expires_at,
            refresh_expires_at,
            token_type: TOKEN_TYPE.to_string(),
        })
    }
}
