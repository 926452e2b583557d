//! Identity store abstraction
//!
//! Profiles, their public keys, per-chain key preferences and issued tokens
//! live behind [`IdentityStore`]. Every read or write happens inside a unit
//! of work ([`StoreTx`]) opened with [`IdentityStore::begin`]; dropping a
//! unit of work without calling [`StoreTx::commit`] rolls it back.
//!
//! Backends:
//! - [`MemoryStore`]: default, used by tests and single-instance deployments
//! - `PostgresStore`: persistent, behind the `postgres` feature

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::crypto::PublicKey;
use crate::types::{ChainPreference, NftSelection, Profile, ProfileId, ProfilePublicKey, Token};

pub const NAME_TAKEN: &str = "Name already taken";
pub const KEY_TAKEN: &str = "Public key already registered";

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation surfaced to the caller
    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend for profile state
#[async_trait]
pub trait IdentityStore: Send + Sync + Debug {
    /// Open a unit of work.
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx>>;
}

/// A unit of work against the identity store.
///
/// Uniqueness rules enforced here:
/// - profile names are unique case-insensitively
/// - a `(type, hex)` key belongs to at most one profile
/// - at most one preference per `(profile, chain)`
///
/// Deleting a profile removes its keys, preferences and tokens. Detaching a
/// key removes the preferences that point at it.
#[async_trait]
pub trait StoreTx: Send {
    // =========================================================================
    // Profiles
    // =========================================================================

    async fn profile_by_id(&mut self, id: ProfileId) -> StorageResult<Option<Profile>>;

    async fn profile_by_uuid(&mut self, uuid: Uuid) -> StorageResult<Option<Profile>>;

    /// Case-insensitive name lookup
    async fn profile_by_name(&mut self, name: &str) -> StorageResult<Option<Profile>>;

    /// Owner of any key with this hex, whatever its type
    async fn profile_by_public_key_hex(&mut self, hex: &str) -> StorageResult<Option<Profile>>;

    async fn profile_by_address_hex(&mut self, address_hex: &str)
        -> StorageResult<Option<Profile>>;

    /// Owner of exactly this `(type, hex)` key
    async fn profile_by_key(&mut self, key: &PublicKey) -> StorageResult<Option<Profile>>;

    /// Insert a profile with a fresh uuid and the initial nonce
    async fn insert_profile(&mut self) -> StorageResult<Profile>;

    /// Compare-and-set the nonce from `expected` to `expected + 1`.
    ///
    /// Returns false when the stored nonce is not `expected`.
    async fn increment_nonce(&mut self, id: ProfileId, expected: u64) -> StorageResult<bool>;

    async fn set_profile_name(&mut self, id: ProfileId, name: Option<&str>) -> StorageResult<()>;

    async fn set_profile_nft(
        &mut self,
        id: ProfileId,
        nft: Option<&NftSelection>,
    ) -> StorageResult<()>;

    async fn delete_profile(&mut self, id: ProfileId) -> StorageResult<()>;

    // =========================================================================
    // Public Keys
    // =========================================================================

    async fn public_keys(&mut self, profile_id: ProfileId) -> StorageResult<Vec<ProfilePublicKey>>;

    async fn public_key(&mut self, key: &PublicKey) -> StorageResult<Option<ProfilePublicKey>>;

    async fn attach_public_key(
        &mut self,
        profile_id: ProfileId,
        key: &PublicKey,
    ) -> StorageResult<ProfilePublicKey>;

    async fn detach_public_key(&mut self, key_id: i64) -> StorageResult<()>;

    // =========================================================================
    // Chain Preferences
    // =========================================================================

    async fn chain_preferences(
        &mut self,
        profile_id: ProfileId,
    ) -> StorageResult<Vec<ChainPreference>>;

    async fn upsert_chain_preference(
        &mut self,
        profile_id: ProfileId,
        chain_id: &str,
        key_id: i64,
    ) -> StorageResult<()>;

    // =========================================================================
    // Tokens
    // =========================================================================

    async fn insert_token(&mut self, token: &Token) -> StorageResult<()>;

    async fn token_by_uuid(&mut self, uuid: Uuid) -> StorageResult<Option<Token>>;

    async fn tokens(&mut self, profile_id: ProfileId) -> StorageResult<Vec<Token>>;

    /// Delete the listed tokens of a profile, or all of them when `uuids` is None
    async fn delete_tokens(
        &mut self,
        profile_id: ProfileId,
        uuids: Option<&[Uuid]>,
    ) -> StorageResult<u64>;

    async fn purge_expired_tokens(
        &mut self,
        profile_id: ProfileId,
        now: DateTime<Utc>,
    ) -> StorageResult<u64>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}
