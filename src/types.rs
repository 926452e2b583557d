//! Core types for the PFPK profile service
//!
//! Row types mirror the relational model (profiles, profile public keys,
//! chain preferences, tokens). Wire types follow the JSON contract clients
//! sign against, so their field names are camelCase.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Nonce of a profile that does not exist yet.
pub const INITIAL_NONCE: u64 = 0;

/// Message type every PFPK envelope is signed under.
pub const AUTH_MESSAGE_TYPE: &str = "PFPK";

/// Store row ID of a profile
pub type ProfileId = i64;

// ============ Row Types ============

/// NFT chosen as a profile picture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftSelection {
    pub chain_id: String,
    pub collection_address: String,
    pub token_id: String,
}

/// Core profile record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: ProfileId,
    pub uuid: Uuid,
    pub nonce: u64,
    pub name: Option<String>,
    pub nft: Option<NftSelection>,
}

/// A public key attached to a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePublicKey {
    pub id: i64,
    pub profile_id: ProfileId,
    pub key_type: String,
    pub public_key_hex: String,
    /// Cached chain-agnostic address of the key
    pub address_hex: String,
}

impl ProfilePublicKey {
    pub fn to_ref(&self) -> PublicKeyRef {
        PublicKeyRef {
            key_type: self.key_type.clone(),
            hex: self.public_key_hex.clone(),
        }
    }
}

/// Which registered key represents a profile on a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPreference {
    pub profile_id: ProfileId,
    pub chain_id: String,
    pub profile_public_key_id: i64,
}

/// Allow-list entry for an issued token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Matches the JWT `jti` claim
    pub uuid: Uuid,
    pub profile_id: ProfileId,
    pub role: String,
    pub audience: Option<String>,
    pub name: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============ Wire Types ============

/// `{type, hex}` as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyRef {
    #[serde(rename = "type")]
    pub key_type: String,
    pub hex: String,
}

/// The `auth` object every signed request carries inside `data`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthData {
    #[serde(rename = "type")]
    pub message_type: String,
    pub nonce: u64,
    pub chain_id: String,
    pub chain_fee_denom: String,
    pub chain_bech32_prefix: String,
    pub public_key_type: String,
    pub public_key_hex: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// Owner-signed request envelope.
///
/// `data` is kept as raw JSON: the signature covers its exact field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    pub data: serde_json::Value,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Profile fields to change; `null` clears, absent keeps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub nft: Option<Option<NftSelection>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileBody {
    #[serde(default)]
    pub profile: ProfileUpdate,
    /// Extra chains the authenticating key should represent the profile on
    #[serde(default)]
    pub chain_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPublicKeysBody {
    /// Nested envelopes, each signed by the key being registered
    pub public_keys: Vec<SignedRequest>,
}

/// Body of a nested registration envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowBody {
    /// UUID of the profile allowed to claim the key
    #[serde(default)]
    pub allow: Option<String>,
    #[serde(default)]
    pub chain_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPublicKeysBody {
    pub public_keys: Vec<PublicKeyRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTokensBody {
    #[serde(default)]
    pub tokens: Option<Vec<TokenRequest>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvalidateTokensBody {
    /// Token IDs to delete; all of the profile's tokens when absent
    #[serde(default)]
    pub tokens: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkProfilesRequest {
    /// Bech32 addresses
    pub addresses: Vec<String>,
}

// ============ Response Types ============

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            hint: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code.into()),
            hint: None,
        }
    }

    pub fn error_with_hint(
        code: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            hint: Some(hint.into()),
            ..Self::error(code, message)
        }
    }
}

/// Resolved NFT of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNft {
    pub chain_id: String,
    pub collection_address: String,
    pub token_id: String,
    pub image_url: String,
}

/// Key and address representing a profile on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileChain {
    pub public_key: PublicKeyRef,
    pub address: String,
}

/// Public view of a profile.
///
/// A lookup that matches nothing yields [`ProfileView::empty`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileView {
    pub uuid: Option<Uuid>,
    pub nonce: u64,
    pub name: Option<String>,
    pub nft: Option<ProfileNft>,
    pub chains: BTreeMap<String, ProfileChain>,
}

impl ProfileView {
    pub fn empty() -> Self {
        Self {
            uuid: None,
            nonce: INITIAL_NONCE,
            name: None,
            nft: None,
            chains: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NonceResponse {
    pub nonce: u64,
}

/// A freshly signed token, returned once at issuance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub id: Uuid,
    pub name: Option<String>,
    pub audience: Option<String>,
    pub role: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token: String,
}

/// Token metadata without the secret
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub id: Uuid,
    pub name: Option<String>,
    pub audience: Option<String>,
    pub role: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Token> for TokenInfo {
    fn from(t: &Token) -> Self {
        Self {
            id: t.uuid,
            name: t.name.clone(),
            audience: t.audience.clone(),
            role: t.role.clone(),
            issued_at: t.issued_at,
            expires_at: t.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokensResponse<T: Serialize> {
    pub tokens: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateTokensResponse {
    pub invalidated: u64,
}

/// Result of checking a bearer token
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCheckResponse {
    pub uuid: Uuid,
    pub role: String,
    pub audience: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of checking a signed request without mutating anything
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCheckResponse {
    pub uuid: Option<Uuid>,
    pub nonce: u64,
    pub public_key: PublicKeyRef,
    pub chain_id: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_update_distinguishes_null_and_absent() {
        let update: ProfileUpdate = serde_json::from_value(json!({ "name": null })).unwrap();
        assert_eq!(update.name, Some(None));
        assert_eq!(update.nft, None);

        let update: ProfileUpdate = serde_json::from_value(json!({ "name": "alice" })).unwrap();
        assert_eq!(update.name, Some(Some("alice".to_string())));
    }

    #[test]
    fn test_auth_data_wire_names() {
        let auth: AuthData = serde_json::from_value(json!({
            "type": "PFPK",
            "nonce": 3,
            "chainId": "juno-1",
            "chainFeeDenom": "ujuno",
            "chainBech32Prefix": "juno",
            "publicKeyType": "/cosmos.crypto.secp256k1.PubKey",
            "publicKeyHex": "02ab",
            "timestamp": 1700000000000i64
        }))
        .unwrap();
        assert_eq!(auth.message_type, AUTH_MESSAGE_TYPE);
        assert_eq!(auth.nonce, 3);
        assert_eq!(auth.chain_bech32_prefix, "juno");
    }

    #[test]
    fn test_empty_profile_view_serialization() {
        let value = serde_json::to_value(ProfileView::empty()).unwrap();
        assert_eq!(
            value,
            json!({ "uuid": null, "nonce": 0, "name": null, "nft": null, "chains": {} })
        );
    }
}
