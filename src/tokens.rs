//! Role-scoped, revocable profile tokens
//!
//! Tokens are HS256 JWTs. Each issued token also gets a row keyed by its
//! `jti`; a token whose row is gone is rejected even while its signature and
//! expiry still check out.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::store::StoreTx;
use crate::types::{IssuedToken, Profile, Token, TokenRequest};

/// Full access to the profile's token management
pub const ROLE_ADMIN: &str = "admin";
/// Read-only identity check
pub const ROLE_VERIFY: &str = "verify";

pub const DEFAULT_ROLE: &str = ROLE_ADMIN;

/// Lifetime of issued tokens as a signed duration.
///
/// Zero lifetimes and lifetimes whose expiry would fall outside the
/// representable date range are rejected.
pub fn token_lifetime(ttl: Duration) -> Result<chrono::Duration, String> {
    if ttl.is_zero() {
        return Err("token TTL must be positive".into());
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .filter(|lifetime| Utc::now().checked_add_signed(*lifetime).is_some())
        .ok_or_else(|| format!("token TTL of {}s is out of range", ttl.as_secs()))
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Profile uuid
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// A token that passed every check
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: Claims,
    pub profile: Profile,
    pub row: Token,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    roles: Vec<String>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration, roles: Vec<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
            roles,
        }
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    fn check_role(&self, role: &str) -> ApiResult<()> {
        if self.roles.iter().any(|r| r == role) {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!("Unknown role: {}", role)))
        }
    }

    /// Issue one token per request, or a single default-role token.
    ///
    /// All tokens of one call share `iat` and `exp`. Expired rows of the
    /// profile are purged first.
    pub async fn issue(
        &self,
        tx: &mut dyn StoreTx,
        profile: &Profile,
        requests: &[TokenRequest],
        now: DateTime<Utc>,
    ) -> ApiResult<Vec<IssuedToken>> {
        let defaults = [TokenRequest::default()];
        let requests = if requests.is_empty() {
            &defaults[..]
        } else {
            requests
        };

        for req in requests {
            self.check_role(req.role.as_deref().unwrap_or(DEFAULT_ROLE))?;
        }

        let purged = tx.purge_expired_tokens(profile.id, now).await?;
        if purged > 0 {
            tracing::debug!(profile = %profile.uuid, purged, "Purged expired tokens");
        }

        // JWT times have second precision; keep rows identical to claims
        let issued_at = Utc
            .timestamp_opt(now.timestamp(), 0)
            .single()
            .unwrap_or(now);
        let expires_at = token_lifetime(self.ttl)
            .ok()
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| ApiError::Internal("token TTL out of range".into()))?;

        let mut issued = Vec::with_capacity(requests.len());
        for req in requests {
            let role = req.role.clone().unwrap_or_else(|| DEFAULT_ROLE.to_string());
            let row = Token {
                uuid: Uuid::new_v4(),
                profile_id: profile.id,
                role: role.clone(),
                audience: req.audience.clone(),
                name: req.name.clone(),
                issued_at,
                expires_at,
            };
            let claims = Claims {
                sub: profile.uuid.to_string(),
                iat: issued_at.timestamp(),
                exp: expires_at.timestamp(),
                jti: row.uuid.to_string(),
                role,
                aud: row.audience.clone(),
            };
            let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
                .map_err(|e| ApiError::internal(e.to_string()))?;

            tx.insert_token(&row).await?;
            issued.push(IssuedToken {
                id: row.uuid,
                name: row.name,
                audience: row.audience,
                role: row.role,
                issued_at,
                expires_at,
                token,
            });
        }

        tracing::info!(profile = %profile.uuid, count = issued.len(), "Issued tokens");
        Ok(issued)
    }

    /// Signature and expiry only.
    pub fn decode(&self, token: &str, now: DateTime<Utc>) -> ApiResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock below
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                ApiError::InvalidToken
            })?
            .claims;

        if claims.exp <= now.timestamp() {
            return Err(ApiError::TokenExpired);
        }
        Ok(claims)
    }

    /// Full verification: signature, expiry, role, audience, then the row.
    pub async fn verify(
        &self,
        tx: &mut dyn StoreTx,
        token: &str,
        accepted_roles: &[&str],
        audience: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<VerifiedToken> {
        let claims = self.decode(token, now)?;

        if !accepted_roles.contains(&claims.role.as_str()) {
            return Err(ApiError::Forbidden(format!(
                "Role '{}' cannot access this endpoint",
                claims.role
            )));
        }
        if let Some(expected) = audience {
            if claims.aud.as_deref() != Some(expected) {
                return Err(ApiError::Forbidden("Token audience mismatch".into()));
            }
        }

        let jti = Uuid::parse_str(&claims.jti).map_err(|_| ApiError::InvalidToken)?;
        let row = tx
            .token_by_uuid(jti)
            .await?
            .filter(|row| row.expires_at > now)
            .ok_or(ApiError::TokenInvalidated)?;

        let profile = tx
            .profile_by_id(row.profile_id)
            .await?
            .filter(|p| p.uuid.to_string() == claims.sub)
            .ok_or(ApiError::TokenInvalidated)?;

        Ok(VerifiedToken {
            claims,
            profile,
            row,
        })
    }

    /// Delete the listed tokens of a profile, or all of them.
    pub async fn invalidate(
        &self,
        tx: &mut dyn StoreTx,
        profile: &Profile,
        uuids: Option<&[Uuid]>,
    ) -> ApiResult<u64> {
        let deleted = tx.delete_tokens(profile.id, uuids).await?;
        tracing::info!(profile = %profile.uuid, deleted, "Invalidated tokens");
        Ok(deleted)
    }
}
