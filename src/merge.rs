//! Moving public keys between profiles
//!
//! A profile claims a key with a nested envelope signed by that key, whose
//! body names the claiming profile in `allow`. Claiming a key from another
//! profile detaches it there; a profile left without keys is deleted.
//!
//! Every entry is verified against the state before any change, then all
//! changes are applied in the caller's unit of work. Taking a key consumes
//! the donor's nonce with a compare-and-set, once per donor, so a consent
//! signed at nonce N and the donor's own request at N cannot both land.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth::{check_signature, check_timestamp, expected_nonce, parse_auth, request_body};
use crate::config::ChainRegistry;
use crate::crypto::PublicKey;
use crate::error::{ApiError, ApiResult};
use crate::store::StoreTx;
use crate::types::{
    AllowBody, Profile, ProfileId, ProfilePublicKey, PublicKeyRef, SignedRequest, INITIAL_NONCE,
};

/// A verified key claim with the chains it should represent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyClaim {
    pub public_key: PublicKey,
    pub chain_ids: Vec<String>,
    /// Profile the key is taken from, if any
    pub donor: Option<Donor>,
}

/// Previous owner of a claimed key and the nonce the consent was signed at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Donor {
    pub profile_id: ProfileId,
    pub nonce: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Keys newly attached to the target
    pub attached: usize,
    /// Profiles deleted because their last key moved
    pub deleted_profiles: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnregisterOutcome {
    pub removed: usize,
    /// The target lost its last key and was deleted
    pub profile_deleted: bool,
}

/// Verify one nested envelope for `target`.
async fn verify_claim(
    tx: &mut dyn StoreTx,
    chains: &ChainRegistry,
    target: &Profile,
    entry: &SignedRequest,
    now: DateTime<Utc>,
    window: Duration,
) -> ApiResult<KeyClaim> {
    let auth = parse_auth(&entry.data)?;
    let public_key = PublicKey::new(&auth.public_key_type, &auth.public_key_hex)?;
    let body: AllowBody = request_body(&entry.data)?;

    let chain_ids = body
        .chain_ids
        .unwrap_or_else(|| vec![auth.chain_id.clone()]);
    for chain_id in &chain_ids {
        chains.require(chain_id)?;
    }

    let owner = tx.profile_by_key(&public_key).await?;
    if owner.as_ref().map(|p| p.id) == Some(target.id) {
        // Already ours: only the preferences change
        return Ok(KeyClaim {
            public_key,
            chain_ids,
            donor: None,
        });
    }

    check_timestamp(&auth, now, window)?;

    let target_uuid = target.uuid.to_string();
    if body.allow.as_deref() != Some(target_uuid.as_str()) {
        return Err(ApiError::Forbidden(format!(
            "Public key {} does not allow profile {}",
            public_key.hex(),
            target.uuid
        )));
    }

    let expected = expected_nonce(owner.as_ref());
    if auth.nonce != expected {
        return Err(ApiError::Conflict(format!(
            "Invalid nonce for public key {}. Expected: {}",
            public_key.hex(),
            expected
        )));
    }

    check_signature(entry, &auth, &public_key)?;

    Ok(KeyClaim {
        public_key,
        chain_ids,
        donor: owner.map(|p| Donor {
            profile_id: p.id,
            nonce: expected,
        }),
    })
}

/// Merge claims for the same key, unioning chain ids in first-seen order.
pub fn coalesce(claims: Vec<KeyClaim>) -> Vec<KeyClaim> {
    let mut merged: Vec<KeyClaim> = Vec::with_capacity(claims.len());
    for claim in claims {
        match merged.iter_mut().find(|c| c.public_key == claim.public_key) {
            Some(existing) => {
                for chain_id in claim.chain_ids {
                    if !existing.chain_ids.contains(&chain_id) {
                        existing.chain_ids.push(chain_id);
                    }
                }
            }
            None => merged.push(claim),
        }
    }
    merged
}

/// Verify every entry against the current state; nothing is changed.
pub async fn verify_claims(
    tx: &mut dyn StoreTx,
    chains: &ChainRegistry,
    target: &Profile,
    entries: &[SignedRequest],
    now: DateTime<Utc>,
    window: Duration,
) -> ApiResult<Vec<KeyClaim>> {
    let mut claims = Vec::with_capacity(entries.len());
    for entry in entries {
        claims.push(verify_claim(tx, chains, target, entry, now, window).await?);
    }
    Ok(coalesce(claims))
}

/// Move verified claims onto `target`.
pub async fn apply_claims(
    tx: &mut dyn StoreTx,
    target: &Profile,
    claims: Vec<KeyClaim>,
) -> ApiResult<RegisterOutcome> {
    let mut outcome = RegisterOutcome::default();
    let mut donors: Vec<ProfileId> = Vec::new();

    for claim in claims {
        if let Some(donor) = claim.donor {
            if !donors.contains(&donor.profile_id) {
                consume_donor_nonce(tx, &claim.public_key, donor).await?;
                donors.push(donor.profile_id);
            }
        }

        let row = match tx.public_key(&claim.public_key).await? {
            Some(row) if row.profile_id == target.id => row,
            Some(row) => {
                tx.detach_public_key(row.id).await?;
                outcome.attached += 1;
                tx.attach_public_key(target.id, &claim.public_key).await?
            }
            None => {
                outcome.attached += 1;
                tx.attach_public_key(target.id, &claim.public_key).await?
            }
        };

        for chain_id in &claim.chain_ids {
            tx.upsert_chain_preference(target.id, chain_id, row.id)
                .await?;
        }
    }

    for donor_id in donors {
        if tx.public_keys(donor_id).await?.is_empty() {
            tx.delete_profile(donor_id).await?;
            outcome.deleted_profiles += 1;
            tracing::info!(profile_id = donor_id, "Deleted profile without keys");
        }
    }

    tracing::info!(
        profile = %target.uuid,
        attached = outcome.attached,
        deleted_profiles = outcome.deleted_profiles,
        "Registered public keys"
    );
    Ok(outcome)
}

/// Attach every key in `entries` to `target`.
pub async fn register_public_keys(
    tx: &mut dyn StoreTx,
    chains: &ChainRegistry,
    target: &Profile,
    entries: &[SignedRequest],
    now: DateTime<Utc>,
    window: Duration,
) -> ApiResult<RegisterOutcome> {
    let claims = verify_claims(tx, chains, target, entries, now, window).await?;
    apply_claims(tx, target, claims).await
}

/// Advance the donor's nonce past the one its consent was signed at.
async fn consume_donor_nonce(
    tx: &mut dyn StoreTx,
    public_key: &PublicKey,
    donor: Donor,
) -> ApiResult<()> {
    if tx.increment_nonce(donor.profile_id, donor.nonce).await? {
        return Ok(());
    }

    let current = tx
        .profile_by_id(donor.profile_id)
        .await?
        .map(|p| p.nonce)
        .unwrap_or(INITIAL_NONCE);
    Err(ApiError::Conflict(format!(
        "Invalid nonce for public key {}. Expected: {}",
        public_key.hex(),
        current
    )))
}

/// Detach `keys` from `target`; deletes `target` if no key remains.
pub async fn unregister_public_keys(
    tx: &mut dyn StoreTx,
    target: &Profile,
    keys: &[PublicKeyRef],
) -> ApiResult<UnregisterOutcome> {
    let mut rows: Vec<ProfilePublicKey> = Vec::with_capacity(keys.len());
    for key in keys {
        let public_key = PublicKey::from_ref(key)?;
        let row = tx
            .public_key(&public_key)
            .await?
            .filter(|row| row.profile_id == target.id)
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "Public key {} is not registered to this profile",
                    public_key.hex()
                ))
            })?;
        if !rows.iter().any(|r| r.id == row.id) {
            rows.push(row);
        }
    }

    for row in &rows {
        tx.detach_public_key(row.id).await?;
    }

    let profile_deleted = tx.public_keys(target.id).await?.is_empty();
    if profile_deleted {
        tx.delete_profile(target.id).await?;
        tracing::info!(profile = %target.uuid, "Deleted profile after last key removed");
    }

    Ok(UnregisterOutcome {
        removed: rows.len(),
        profile_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::Signer;
    use crate::store::{IdentityStore, MemoryStore};
    use serde_json::json;

    const WINDOW: Duration = Duration::from_secs(300);

    async fn profile_with(tx: &mut dyn StoreTx, signer: &Signer) -> Profile {
        let profile = tx.insert_profile().await.unwrap();
        let row = tx
            .attach_public_key(profile.id, &signer.public_key())
            .await
            .unwrap();
        tx.upsert_chain_preference(profile.id, "juno-1", row.id)
            .await
            .unwrap();
        profile
    }

    fn allow(
        signer: &Signer,
        target: &Profile,
        nonce: u64,
        chain_ids: Option<&[&str]>,
    ) -> SignedRequest {
        let mut body = json!({ "allow": target.uuid.to_string() });
        if let Some(ids) = chain_ids {
            body["chainIds"] = json!(ids);
        }
        signer.envelope(body, nonce, Utc::now())
    }

    #[tokio::test]
    async fn test_merge_deletes_emptied_profile() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;

        let entries = [allow(&key2, &a, b.nonce, None)];
        let outcome = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();

        assert_eq!(outcome.attached, 1);
        assert_eq!(outcome.deleted_profiles, 1);
        let owner = tx.profile_by_key(&key2.public_key()).await.unwrap().unwrap();
        assert_eq!(owner.uuid, a.uuid);
        assert!(tx.profile_by_uuid(b.uuid).await.unwrap().is_none());
        assert_eq!(tx.public_keys(a.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_bumps_surviving_donor_nonce() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2, key3) = (Signer::cosmos(1), Signer::cosmos(2), Signer::cosmos(3));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;
        tx.attach_public_key(b.id, &key3.public_key()).await.unwrap();

        let entries = [allow(&key2, &a, 0, None)];
        register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();

        let b = tx.profile_by_uuid(b.uuid).await.unwrap().unwrap();
        assert_eq!(b.nonce, 1);
        assert_eq!(tx.public_keys(b.id).await.unwrap().len(), 1);
        // The preference pointed at the moved key
        assert!(tx.chain_preferences(b.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_donor_request_landing_after_verification_wins() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2, key3) = (Signer::cosmos(1), Signer::cosmos(2), Signer::cosmos(3));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;
        tx.attach_public_key(b.id, &key3.public_key()).await.unwrap();

        let entries = [allow(&key2, &a, 0, None)];
        let claims = verify_claims(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();
        assert_eq!(claims[0].donor, Some(Donor { profile_id: b.id, nonce: 0 }));

        // B's own request at nonce 0 is accepted in between
        assert!(tx.increment_nonce(b.id, 0).await.unwrap());

        let err = apply_claims(tx.as_mut(), &a, claims).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(ref m) if m.ends_with("Expected: 1")));
        assert_eq!(tx.profile_by_key(&key2.public_key()).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_emptied_donor_not_deleted_when_nonce_moved() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;

        let entries = [allow(&key2, &a, 0, None)];
        let claims = verify_claims(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();
        tx.increment_nonce(b.id, 0).await.unwrap();

        assert!(apply_claims(tx.as_mut(), &a, claims).await.is_err());
        assert!(tx.profile_by_uuid(b.uuid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_surviving_donor_nonce_bumped_once() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2, key3, key4) = (
            Signer::cosmos(1),
            Signer::cosmos(2),
            Signer::cosmos(3),
            Signer::cosmos(4),
        );
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;
        tx.attach_public_key(b.id, &key3.public_key()).await.unwrap();
        tx.attach_public_key(b.id, &key4.public_key()).await.unwrap();

        let entries = [allow(&key2, &a, 0, None), allow(&key3, &a, 0, None)];
        let outcome = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();

        assert_eq!(outcome.attached, 2);
        assert_eq!(outcome.deleted_profiles, 0);
        let b = tx.profile_by_uuid(b.uuid).await.unwrap().unwrap();
        assert_eq!(b.nonce, 1);
        assert_eq!(tx.public_keys(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_merge_takes_eth_key() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, eth) = (Signer::cosmos(1), Signer::eth(9));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = tx.insert_profile().await.unwrap();
        tx.attach_public_key(b.id, &eth.public_key()).await.unwrap();

        let entries = [allow(&eth, &a, 0, None)];
        let outcome = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();
        assert_eq!(outcome.deleted_profiles, 1);

        let row = tx.public_key(&eth.public_key()).await.unwrap().unwrap();
        assert_eq!(row.profile_id, a.id);
        let prefs = tx.chain_preferences(a.id).await.unwrap();
        let inj = prefs.iter().find(|p| p.chain_id == "injective-1").unwrap();
        assert_eq!(inj.profile_public_key_id, row.id);
    }

    #[tokio::test]
    async fn test_nested_nonce_mismatch_is_conflict() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;
        tx.increment_nonce(b.id, 0).await.unwrap();

        let entries = [allow(&key2, &a, 0, None)];
        let err = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(ref m) if m.contains("Expected: 1")));
        assert_eq!(tx.profile_by_key(&key2.public_key()).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_allow_must_name_target() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2, key3) = (Signer::cosmos(1), Signer::cosmos(2), Signer::cosmos(3));
        let a = profile_with(tx.as_mut(), &key1).await;
        let c = profile_with(tx.as_mut(), &key3).await;

        // key2 allowed profile C, not A
        let entries = [allow(&key2, &c, 0, None)];
        let err = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_nested_entry_needs_signature() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;

        let mut entry = allow(&key2, &a, 0, None);
        entry.signature = None;
        let err = register_public_keys(tx.as_mut(), &chains, &a, &[entry], Utc::now(), WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NoSignatureProvided));
    }

    #[tokio::test]
    async fn test_own_key_is_preference_update_without_signature() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let key1 = Signer::cosmos(1);
        let a = profile_with(tx.as_mut(), &key1).await;

        let mut entry = allow(&key1, &a, 99, Some(&["osmosis-1"]));
        entry.signature = None;
        let outcome = register_public_keys(tx.as_mut(), &chains, &a, &[entry], Utc::now(), WINDOW)
            .await
            .unwrap();

        assert_eq!(outcome.attached, 0);
        let prefs = tx.chain_preferences(a.id).await.unwrap();
        let chains: Vec<_> = prefs.iter().map(|p| p.chain_id.as_str()).collect();
        assert_eq!(chains, vec!["juno-1", "osmosis-1"]);
    }

    #[tokio::test]
    async fn test_duplicate_entries_coalesce() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;

        let entries = [
            allow(&key2, &a, 0, Some(&["osmosis-1"])),
            allow(&key2, &a, 0, Some(&["stargaze-1", "osmosis-1"])),
        ];
        let outcome = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap();

        assert_eq!(outcome.attached, 1);
        let row = tx.public_key(&key2.public_key()).await.unwrap().unwrap();
        let prefs = tx.chain_preferences(a.id).await.unwrap();
        let for_key2: Vec<_> = prefs
            .iter()
            .filter(|p| p.profile_public_key_id == row.id)
            .map(|p| p.chain_id.as_str())
            .collect();
        assert_eq!(for_key2, vec!["osmosis-1", "stargaze-1"]);
    }

    #[test]
    fn test_coalesce_keeps_first_seen_order() {
        let key = Signer::cosmos(1).public_key();
        let claims = vec![
            KeyClaim {
                public_key: key.clone(),
                chain_ids: vec!["b".into(), "a".into()],
                donor: None,
            },
            KeyClaim {
                public_key: key.clone(),
                chain_ids: vec!["c".into(), "b".into()],
                donor: None,
            },
        ];
        let merged = coalesce(claims);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].chain_ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_unknown_chain_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let chains = ChainRegistry::builtin();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;

        let entries = [allow(&key2, &a, 0, Some(&["nochain-1"]))];
        let err = register_public_keys(tx.as_mut(), &chains, &a, &entries, Utc::now(), WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownChain(_)));
    }

    #[tokio::test]
    async fn test_unregister_last_key_deletes_profile() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;
        tx.attach_public_key(a.id, &key2.public_key()).await.unwrap();

        let outcome = unregister_public_keys(tx.as_mut(), &a, &[key2.public_key().to_ref()])
            .await
            .unwrap();
        assert_eq!(outcome.removed, 1);
        assert!(!outcome.profile_deleted);

        let outcome = unregister_public_keys(tx.as_mut(), &a, &[key1.public_key().to_ref()])
            .await
            .unwrap();
        assert!(outcome.profile_deleted);
        assert!(tx.profile_by_uuid(a.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_foreign_key_rejected() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let (key1, key2) = (Signer::cosmos(1), Signer::cosmos(2));
        let a = profile_with(tx.as_mut(), &key1).await;
        let b = profile_with(tx.as_mut(), &key2).await;

        let err = unregister_public_keys(tx.as_mut(), &a, &[key2.public_key().to_ref()])
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert_eq!(tx.profile_by_key(&key2.public_key()).await.unwrap().unwrap().id, b.id);
    }
}
