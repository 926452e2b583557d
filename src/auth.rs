//! Owner-signed request verification
//!
//! Every mutating request carries `data.auth` and a signature over an amino
//! sign doc built from `data`. Checks run in a fixed order and stop at the
//! first failure: structure, freshness, key type, nonce, signature.
//!
//! Nothing here increments a nonce. Mutating operations do that themselves
//! with a compare-and-set inside the same unit of work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::crypto::PublicKey;
use crate::error::{ApiError, ApiResult};
use crate::store::StoreTx;
use crate::types::{AuthData, Profile, SignedRequest, AUTH_MESSAGE_TYPE, INITIAL_NONCE};

/// Outcome of a successful verification
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub auth: AuthData,
    pub public_key: PublicKey,
    /// Current owner of the signing key, if any
    pub profile: Option<Profile>,
}

impl VerifiedRequest {
    /// Nonce the signer had to present
    pub fn expected_nonce(&self) -> u64 {
        expected_nonce(self.profile.as_ref())
    }
}

pub fn expected_nonce(owner: Option<&Profile>) -> u64 {
    owner.map(|p| p.nonce).unwrap_or(INITIAL_NONCE)
}

/// Extract and structurally validate `data.auth`.
pub fn parse_auth(data: &Value) -> ApiResult<AuthData> {
    let raw = data
        .as_object()
        .ok_or_else(|| ApiError::InvalidAuthData("data must be an object".into()))?
        .get("auth")
        .ok_or_else(|| ApiError::InvalidAuthData("missing auth".into()))?;

    let auth: AuthData = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::InvalidAuthData(e.to_string()))?;

    let required = [
        ("type", &auth.message_type),
        ("chainId", &auth.chain_id),
        ("chainFeeDenom", &auth.chain_fee_denom),
        ("chainBech32Prefix", &auth.chain_bech32_prefix),
        ("publicKeyType", &auth.public_key_type),
        ("publicKeyHex", &auth.public_key_hex),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(ApiError::InvalidAuthData(format!("{} is empty", field)));
    }
    if auth.message_type != AUTH_MESSAGE_TYPE {
        return Err(ApiError::InvalidAuthData(format!(
            "type must be {}",
            AUTH_MESSAGE_TYPE
        )));
    }

    Ok(auth)
}

/// Reject timestamps further than `window` from `now`, in either direction.
pub fn check_timestamp(auth: &AuthData, now: DateTime<Utc>, window: Duration) -> ApiResult<()> {
    let skew = now.timestamp_millis().abs_diff(auth.timestamp);
    if u128::from(skew) > window.as_millis() {
        return Err(ApiError::StaleTimestamp);
    }
    Ok(())
}

pub fn check_nonce(auth: &AuthData, expected: u64) -> ApiResult<()> {
    if auth.nonce != expected {
        return Err(ApiError::InvalidNonce { expected });
    }
    Ok(())
}

/// Steps one to three: structure, freshness and key type.
pub fn parse_request(
    req: &SignedRequest,
    now: DateTime<Utc>,
    window: Duration,
) -> ApiResult<(AuthData, PublicKey)> {
    let auth = parse_auth(&req.data)?;
    check_timestamp(&auth, now, window)?;
    let public_key = PublicKey::new(&auth.public_key_type, &auth.public_key_hex)?;
    Ok((auth, public_key))
}

/// Full verification of a top-level request against the key's current owner.
pub async fn verify_signed_request(
    tx: &mut dyn StoreTx,
    req: &SignedRequest,
    now: DateTime<Utc>,
    window: Duration,
) -> ApiResult<VerifiedRequest> {
    let (auth, public_key) = parse_request(req, now, window)?;

    let profile = tx.profile_by_key(&public_key).await?;
    check_nonce(&auth, expected_nonce(profile.as_ref()))?;
    check_signature(req, &auth, &public_key)?;

    Ok(VerifiedRequest {
        auth,
        public_key,
        profile,
    })
}

/// Steps five and six: rebuild the sign doc and verify the signature.
pub fn check_signature(
    req: &SignedRequest,
    auth: &AuthData,
    public_key: &PublicKey,
) -> ApiResult<()> {
    let signature = match req.signature.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => return Err(ApiError::NoSignatureProvided),
    };

    let signer = public_key
        .bech32_address(&auth.chain_bech32_prefix)
        .map_err(|e| ApiError::InvalidAuthData(e.to_string()))?;
    let message = sign_doc_bytes(auth, &signer, &req.data)?;

    if !public_key.verify(&message, signature)? {
        tracing::debug!(
            key_type = %public_key.key_type(),
            signer = %signer,
            "Signature mismatch"
        );
        return Err(ApiError::InvalidSignature);
    }
    Ok(())
}

/// Canonical amino sign doc bytes for `data` signed by `signer`.
///
/// `data` is embedded as 2-space pretty JSON in its original field order.
/// The document itself is serialized with sorted keys and no whitespace,
/// with `&`, `<` and `>` escaped.
pub fn sign_doc_bytes(auth: &AuthData, signer: &str, data: &Value) -> ApiResult<Vec<u8>> {
    let pretty =
        serde_json::to_string_pretty(data).map_err(|e| ApiError::internal(e.to_string()))?;

    let doc = json!({
        "chain_id": auth.chain_id,
        "account_number": "0",
        "sequence": "0",
        "fee": {
            "gas": "0",
            "amount": [{ "denom": auth.chain_fee_denom, "amount": "0" }],
        },
        "msgs": [{
            "type": auth.message_type,
            "value": { "signer": signer, "data": pretty },
        }],
        "memo": "",
    });

    let compact =
        serde_json::to_string(&sort_keys(doc)).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(escape_html(&compact).into_bytes())
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn escape_html(json: &str) -> String {
    json.replace('&', "\\u0026")
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

/// Deserialize the operation fields of a signed `data` object.
pub fn request_body<T: DeserializeOwned>(data: &Value) -> ApiResult<T> {
    serde_json::from_value(data.clone()).map_err(|e| ApiError::BadRequest(e.to_string()))
}

// ============ Validation Functions ============

/// Validate profile name
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > 32 {
        return Err("Name must be at most 32 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err("Name must contain only alphanumeric characters, underscores, and periods");
    }
    Ok(())
}
