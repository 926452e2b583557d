//! In-memory storage backend
//!
//! All tables sit behind one async mutex. A unit of work holds the lock and
//! reads the live tables in place. Its first write copies the tables; commit
//! swaps the copy in. Data is lost on restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{IdentityStore, StorageError, StorageResult, StoreTx, KEY_TAKEN, NAME_TAKEN};
use crate::crypto::PublicKey;
use crate::types::{
    ChainPreference, NftSelection, Profile, ProfileId, ProfilePublicKey, Token, INITIAL_NONCE,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_profile_id: ProfileId,
    next_key_id: i64,
    profiles: BTreeMap<ProfileId, Profile>,
    public_keys: BTreeMap<i64, ProfilePublicKey>,
    /// (profile, chain) -> key row
    preferences: BTreeMap<(ProfileId, String), i64>,
    tokens: BTreeMap<Uuid, Token>,
}

impl Tables {
    fn owner_of<F>(&self, mut pred: F) -> Option<Profile>
    where
        F: FnMut(&ProfilePublicKey) -> bool,
    {
        self.public_keys
            .values()
            .find(|k| pred(k))
            .and_then(|k| self.profiles.get(&k.profile_id))
            .cloned()
    }

    fn profile_mut(&mut self, id: ProfileId) -> StorageResult<&mut Profile> {
        self.profiles
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("profile {}", id)))
    }
}

fn name_matches(profile: &Profile, lower: &str) -> bool {
    profile
        .name
        .as_deref()
        .is_some_and(|name| name.to_lowercase() == lower)
}

/// In-memory identity store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn begin_tx(&self) -> MemoryTx {
        MemoryTx {
            guard: Arc::clone(&self.tables).lock_owned().await,
            working: None,
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx>> {
        Ok(Box::new(self.begin_tx().await))
    }
}

/// Unit of work over [`MemoryStore`]
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    /// Private copy, taken on the first write
    working: Option<Tables>,
}

impl MemoryTx {
    fn tables(&self) -> &Tables {
        self.working.as_ref().unwrap_or(&*self.guard)
    }

    fn tables_mut(&mut self) -> &mut Tables {
        let guard = &self.guard;
        self.working.get_or_insert_with(|| Tables::clone(guard))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn profile_by_id(&mut self, id: ProfileId) -> StorageResult<Option<Profile>> {
        Ok(self.tables().profiles.get(&id).cloned())
    }

    async fn profile_by_uuid(&mut self, uuid: Uuid) -> StorageResult<Option<Profile>> {
        Ok(self
            .tables()
            .profiles
            .values()
            .find(|p| p.uuid == uuid)
            .cloned())
    }

    async fn profile_by_name(&mut self, name: &str) -> StorageResult<Option<Profile>> {
        let lower = name.to_lowercase();
        Ok(self
            .tables()
            .profiles
            .values()
            .find(|p| name_matches(p, &lower))
            .cloned())
    }

    async fn profile_by_public_key_hex(&mut self, hex: &str) -> StorageResult<Option<Profile>> {
        Ok(self.tables().owner_of(|k| k.public_key_hex == hex))
    }

    async fn profile_by_address_hex(
        &mut self,
        address_hex: &str,
    ) -> StorageResult<Option<Profile>> {
        Ok(self.tables().owner_of(|k| k.address_hex == address_hex))
    }

    async fn profile_by_key(&mut self, key: &PublicKey) -> StorageResult<Option<Profile>> {
        Ok(self
            .tables()
            .owner_of(|k| k.key_type == key.key_type() && k.public_key_hex == key.hex()))
    }

    async fn insert_profile(&mut self) -> StorageResult<Profile> {
        let tables = self.tables_mut();
        tables.next_profile_id += 1;
        let profile = Profile {
            id: tables.next_profile_id,
            uuid: Uuid::new_v4(),
            nonce: INITIAL_NONCE,
            name: None,
            nft: None,
        };
        tables.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn increment_nonce(&mut self, id: ProfileId, expected: u64) -> StorageResult<bool> {
        let current = self
            .tables()
            .profiles
            .get(&id)
            .map(|p| p.nonce)
            .ok_or_else(|| StorageError::NotFound(format!("profile {}", id)))?;
        if current != expected {
            return Ok(false);
        }
        self.tables_mut().profile_mut(id)?.nonce += 1;
        Ok(true)
    }

    async fn set_profile_name(&mut self, id: ProfileId, name: Option<&str>) -> StorageResult<()> {
        if let Some(name) = name {
            let lower = name.to_lowercase();
            let taken = self
                .tables()
                .profiles
                .values()
                .any(|p| p.id != id && name_matches(p, &lower));
            if taken {
                return Err(StorageError::Conflict(NAME_TAKEN.into()));
            }
        }
        self.tables_mut().profile_mut(id)?.name = name.map(str::to_string);
        Ok(())
    }

    async fn set_profile_nft(
        &mut self,
        id: ProfileId,
        nft: Option<&NftSelection>,
    ) -> StorageResult<()> {
        self.tables_mut().profile_mut(id)?.nft = nft.cloned();
        Ok(())
    }

    async fn delete_profile(&mut self, id: ProfileId) -> StorageResult<()> {
        let tables = self.tables_mut();
        tables.profiles.remove(&id);
        tables.public_keys.retain(|_, k| k.profile_id != id);
        tables.preferences.retain(|(profile_id, _), _| *profile_id != id);
        tables.tokens.retain(|_, t| t.profile_id != id);
        Ok(())
    }

    async fn public_keys(&mut self, profile_id: ProfileId) -> StorageResult<Vec<ProfilePublicKey>> {
        Ok(self
            .tables()
            .public_keys
            .values()
            .filter(|k| k.profile_id == profile_id)
            .cloned()
            .collect())
    }

    async fn public_key(&mut self, key: &PublicKey) -> StorageResult<Option<ProfilePublicKey>> {
        Ok(self
            .tables()
            .public_keys
            .values()
            .find(|k| k.key_type == key.key_type() && k.public_key_hex == key.hex())
            .cloned())
    }

    async fn attach_public_key(
        &mut self,
        profile_id: ProfileId,
        key: &PublicKey,
    ) -> StorageResult<ProfilePublicKey> {
        if self.public_key(key).await?.is_some() {
            return Err(StorageError::Conflict(KEY_TAKEN.into()));
        }
        let tables = self.tables_mut();
        tables.profile_mut(profile_id)?;

        tables.next_key_id += 1;
        let row = ProfilePublicKey {
            id: tables.next_key_id,
            profile_id,
            key_type: key.key_type().to_string(),
            public_key_hex: key.hex().to_string(),
            address_hex: key.address_hex(),
        };
        tables.public_keys.insert(row.id, row.clone());
        Ok(row)
    }

    async fn detach_public_key(&mut self, key_id: i64) -> StorageResult<()> {
        let tables = self.tables_mut();
        tables.public_keys.remove(&key_id);
        tables.preferences.retain(|_, k| *k != key_id);
        Ok(())
    }

    async fn chain_preferences(
        &mut self,
        profile_id: ProfileId,
    ) -> StorageResult<Vec<ChainPreference>> {
        Ok(self
            .tables()
            .preferences
            .iter()
            .filter(|((id, _), _)| *id == profile_id)
            .map(|((id, chain_id), key_id)| ChainPreference {
                profile_id: *id,
                chain_id: chain_id.clone(),
                profile_public_key_id: *key_id,
            })
            .collect())
    }

    async fn upsert_chain_preference(
        &mut self,
        profile_id: ProfileId,
        chain_id: &str,
        key_id: i64,
    ) -> StorageResult<()> {
        match self.tables().public_keys.get(&key_id) {
            Some(k) if k.profile_id == profile_id => {}
            _ => {
                return Err(StorageError::NotFound(format!(
                    "public key {} of profile {}",
                    key_id, profile_id
                )))
            }
        }
        self.tables_mut()
            .preferences
            .insert((profile_id, chain_id.to_string()), key_id);
        Ok(())
    }

    async fn insert_token(&mut self, token: &Token) -> StorageResult<()> {
        if self.tables().tokens.contains_key(&token.uuid) {
            return Err(StorageError::Conflict(format!("token {}", token.uuid)));
        }
        let tables = self.tables_mut();
        tables.profile_mut(token.profile_id)?;
        tables.tokens.insert(token.uuid, token.clone());
        Ok(())
    }

    async fn token_by_uuid(&mut self, uuid: Uuid) -> StorageResult<Option<Token>> {
        Ok(self.tables().tokens.get(&uuid).cloned())
    }

    async fn tokens(&mut self, profile_id: ProfileId) -> StorageResult<Vec<Token>> {
        let mut tokens: Vec<Token> = self
            .tables()
            .tokens
            .values()
            .filter(|t| t.profile_id == profile_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.issued_at);
        Ok(tokens)
    }

    async fn delete_tokens(
        &mut self,
        profile_id: ProfileId,
        uuids: Option<&[Uuid]>,
    ) -> StorageResult<u64> {
        let tokens = &mut self.tables_mut().tokens;
        let before = tokens.len();
        tokens.retain(|uuid, t| {
            t.profile_id != profile_id || uuids.is_some_and(|list| !list.contains(uuid))
        });
        Ok((before - tokens.len()) as u64)
    }

    async fn purge_expired_tokens(
        &mut self,
        profile_id: ProfileId,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let expired = self
            .tables()
            .tokens
            .values()
            .any(|t| t.profile_id == profile_id && t.expires_at <= now);
        if !expired {
            return Ok(0);
        }
        let tokens = &mut self.tables_mut().tokens;
        let before = tokens.len();
        tokens.retain(|_, t| t.profile_id != profile_id || t.expires_at > now);
        Ok((before - tokens.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTx { mut guard, working } = *self;
        if let Some(working) = working {
            *guard = working;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{public_key_hex, signing_key};
    use crate::crypto::{COSMOS_SECP256K1, INJECTIVE_ETH_SECP256K1};
    use chrono::Duration;

    fn key(seed: u8) -> PublicKey {
        PublicKey::new(COSMOS_SECP256K1, &public_key_hex(&signing_key(seed))).unwrap()
    }

    fn token(profile_id: ProfileId, expires_in: Duration) -> Token {
        let now = Utc::now();
        Token {
            uuid: Uuid::new_v4(),
            profile_id,
            role: "admin".into(),
            audience: None,
            name: None,
            issued_at: now,
            expires_at: now + expires_in,
        }
    }

    #[tokio::test]
    async fn test_commit_persists_and_drop_rolls_back() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        let kept = tx.insert_profile().await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let dropped = tx.insert_profile().await.unwrap();
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.profile_by_uuid(kept.uuid).await.unwrap().is_some());
        assert!(tx.profile_by_uuid(dropped.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_do_not_copy_tables() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let profile = tx.insert_profile().await.unwrap();
        tx.attach_public_key(profile.id, &key(7)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_tx().await;
        assert!(tx.profile_by_key(&key(7)).await.unwrap().is_some());
        assert_eq!(tx.public_keys(profile.id).await.unwrap().len(), 1);
        assert_eq!(tx.purge_expired_tokens(profile.id, Utc::now()).await.unwrap(), 0);
        // A lost compare-and-set is a read too
        assert!(!tx.increment_nonce(profile.id, 5).await.unwrap());
        assert!(tx.working.is_none());

        assert!(tx.increment_nonce(profile.id, 0).await.unwrap());
        assert!(tx.working.is_some());
        // The live tables are untouched until commit
        assert_eq!(tx.guard.profiles[&profile.id].nonce, 0);
        assert_eq!(tx.profile_by_id(profile.id).await.unwrap().unwrap().nonce, 1);
    }

    #[tokio::test]
    async fn test_increment_nonce_is_compare_and_set() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let profile = tx.insert_profile().await.unwrap();

        assert!(tx.increment_nonce(profile.id, 0).await.unwrap());
        assert!(!tx.increment_nonce(profile.id, 0).await.unwrap());
        assert!(tx.increment_nonce(profile.id, 1).await.unwrap());
        assert_eq!(tx.profile_by_id(profile.id).await.unwrap().unwrap().nonce, 2);
    }

    #[tokio::test]
    async fn test_name_is_unique_case_insensitively() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_profile().await.unwrap();
        let b = tx.insert_profile().await.unwrap();

        tx.set_profile_name(a.id, Some("Alice")).await.unwrap();
        let err = tx.set_profile_name(b.id, Some("alice")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(ref m) if m == NAME_TAKEN));

        // Renaming to your own name in another case is fine
        tx.set_profile_name(a.id, Some("ALICE")).await.unwrap();
        assert_eq!(
            tx.profile_by_name("alice").await.unwrap().unwrap().id,
            a.id
        );
    }

    #[tokio::test]
    async fn test_key_belongs_to_one_profile() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_profile().await.unwrap();
        let b = tx.insert_profile().await.unwrap();

        tx.attach_public_key(a.id, &key(1)).await.unwrap();
        let err = tx.attach_public_key(b.id, &key(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Same hex under another type is a different key
        let eth = PublicKey::new(INJECTIVE_ETH_SECP256K1, key(1).hex()).unwrap();
        tx.attach_public_key(b.id, &eth).await.unwrap();
        assert_eq!(tx.profile_by_key(&eth).await.unwrap().unwrap().id, b.id);
        assert_eq!(tx.profile_by_key(&key(1)).await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_lookups_by_hex_and_address() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let profile = tx.insert_profile().await.unwrap();
        let pk = key(2);
        tx.attach_public_key(profile.id, &pk).await.unwrap();

        let by_hex = tx.profile_by_public_key_hex(pk.hex()).await.unwrap();
        let by_address = tx.profile_by_address_hex(&pk.address_hex()).await.unwrap();
        assert_eq!(by_hex.unwrap().uuid, profile.uuid);
        assert_eq!(by_address.unwrap().uuid, profile.uuid);
        assert!(tx.profile_by_address_hex("00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preferences_upsert_and_cascade_on_detach() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let profile = tx.insert_profile().await.unwrap();
        let k1 = tx.attach_public_key(profile.id, &key(3)).await.unwrap();
        let k2 = tx.attach_public_key(profile.id, &key(4)).await.unwrap();

        tx.upsert_chain_preference(profile.id, "juno-1", k1.id).await.unwrap();
        tx.upsert_chain_preference(profile.id, "juno-1", k2.id).await.unwrap();
        tx.upsert_chain_preference(profile.id, "osmosis-1", k1.id).await.unwrap();

        let prefs = tx.chain_preferences(profile.id).await.unwrap();
        assert_eq!(prefs.len(), 2);
        let juno = prefs.iter().find(|p| p.chain_id == "juno-1").unwrap();
        assert_eq!(juno.profile_public_key_id, k2.id);

        tx.detach_public_key(k1.id).await.unwrap();
        let prefs = tx.chain_preferences(profile.id).await.unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].chain_id, "juno-1");
    }

    #[tokio::test]
    async fn test_preference_requires_own_key() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_profile().await.unwrap();
        let b = tx.insert_profile().await.unwrap();
        let kb = tx.attach_public_key(b.id, &key(5)).await.unwrap();

        assert!(tx
            .upsert_chain_preference(a.id, "juno-1", kb.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_profile_cascades() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let profile = tx.insert_profile().await.unwrap();
        let k = tx.attach_public_key(profile.id, &key(6)).await.unwrap();
        tx.upsert_chain_preference(profile.id, "juno-1", k.id).await.unwrap();
        tx.insert_token(&token(profile.id, Duration::hours(1))).await.unwrap();

        tx.delete_profile(profile.id).await.unwrap();

        assert!(tx.profile_by_key(&key(6)).await.unwrap().is_none());
        assert!(tx.public_keys(profile.id).await.unwrap().is_empty());
        assert!(tx.chain_preferences(profile.id).await.unwrap().is_empty());
        assert!(tx.tokens(profile.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_deletion_and_purge() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.insert_profile().await.unwrap();
        let b = tx.insert_profile().await.unwrap();

        let live = token(a.id, Duration::hours(1));
        let other_live = token(a.id, Duration::hours(1));
        let expired = token(a.id, Duration::seconds(-1));
        let foreign = token(b.id, Duration::seconds(-1));
        for t in [&live, &other_live, &expired, &foreign] {
            tx.insert_token(t).await.unwrap();
        }

        assert_eq!(tx.purge_expired_tokens(a.id, Utc::now()).await.unwrap(), 1);
        // Another profile's expired row is left alone
        assert!(tx.token_by_uuid(foreign.uuid).await.unwrap().is_some());

        // Cannot delete someone else's token
        assert_eq!(tx.delete_tokens(a.id, Some(&[foreign.uuid])).await.unwrap(), 0);
        assert_eq!(tx.delete_tokens(a.id, Some(&[live.uuid])).await.unwrap(), 1);
        assert_eq!(tx.delete_tokens(a.id, None).await.unwrap(), 1);
        assert!(tx.tokens(a.id).await.unwrap().is_empty());
    }
}
