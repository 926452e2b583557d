//! PFPK Profile Service
//!
//! Cross-chain wallet profiles keyed by the public keys that own them.
//!
//! ## Architecture
//!
//! - **Profiles**: a UUID, a replay nonce, an optional name and NFT picture,
//!   and one or more secp256k1 public keys from Cosmos-SDK or Ethermint chains
//! - **Signed requests**: every mutation carries a fresh `data.auth` object and
//!   an amino-style signature over it; the nonce is consumed atomically
//! - **Merging**: registering a key owned by another profile moves it, and the
//!   donor profile is deleted once it has no keys left
//! - **Tokens**: owner-signed requests mint HS256 JWTs, each backed by a store
//!   row so they can be revoked before expiry

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod merge;
pub mod oracle;
pub mod state;
pub mod store;
pub mod tokens;
pub mod types;

pub use config::{ChainRegistry, Config};
pub use error::{ApiError, ApiResult};
pub use state::AppState;
