//! NFT ownership lookups
//!
//! Profiles may pick an NFT as their picture. The NFT is only shown while
//! one of the profile's addresses owns or stakes it. Lookups go through
//! [`OwnershipOracle`]; failures never fail a profile read.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;

use crate::types::{NftSelection, ProfileNft};

/// What the oracle knows about one NFT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftInfo {
    pub image_url: String,
    /// Bech32 address holding the token
    pub owner: String,
    /// Address the token is staked for, if held by a staking contract
    pub staker: Option<String>,
}

impl NftInfo {
    pub fn held_by(&self, address: &str) -> bool {
        self.owner == address || self.staker.as_deref() == Some(address)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle request failed: {0}")]
    Request(String),
    #[error("Oracle response invalid: {0}")]
    InvalidResponse(String),
    #[error("Oracle lookup timed out")]
    Timeout,
}

#[async_trait]
pub trait OwnershipOracle: Send + Sync + Debug {
    /// `Ok(None)` when the NFT does not exist
    async fn nft_info(
        &self,
        chain_id: &str,
        collection_address: &str,
        token_id: &str,
    ) -> Result<Option<NftInfo>, OracleError>;
}

/// Oracle that knows no NFTs
#[derive(Debug, Default)]
pub struct NoopOracle;

#[async_trait]
impl OwnershipOracle for NoopOracle {
    async fn nft_info(&self, _: &str, _: &str, _: &str) -> Result<Option<NftInfo>, OracleError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct AllNftInfoResponse {
    access: NftAccess,
    info: NftInfoBody,
    #[serde(default)]
    staker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NftAccess {
    owner: String,
}

/// `token_uri` points at a metadata document, not an image, so only the
/// extension's image is read.
#[derive(Debug, Deserialize)]
struct NftInfoBody {
    #[serde(default)]
    extension: Option<NftExtension>,
}

#[derive(Debug, Deserialize)]
struct NftExtension {
    #[serde(default)]
    image: Option<String>,
}

impl AllNftInfoResponse {
    fn into_nft_info(self) -> Result<NftInfo, OracleError> {
        let image = self
            .info
            .extension
            .and_then(|ext| ext.image)
            .ok_or_else(|| OracleError::InvalidResponse("no image".into()))?;

        Ok(NftInfo {
            image_url: gateway_url(&image),
            owner: self.access.owner,
            staker: self.staker,
        })
    }
}

fn gateway_url(uri: &str) -> String {
    match uri.strip_prefix("ipfs://") {
        Some(path) => format!("https://ipfs.io/ipfs/{}", path),
        None => uri.to_string(),
    }
}

/// cw721 indexer client
///
/// Queries `{base}/{chainId}/contract/{collection}/cw721/allNftInfo?tokenId={id}`.
/// Successful lookups are cached briefly.
#[derive(Debug)]
pub struct IndexerOracle {
    base_url: String,
    http_client: reqwest::Client,
    cache: Cache<String, Option<NftInfo>>,
}

impl IndexerOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Request(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(60))
                .max_capacity(10_000)
                .build(),
        })
    }

    async fn fetch(
        &self,
        chain_id: &str,
        collection_address: &str,
        token_id: &str,
    ) -> Result<Option<NftInfo>, OracleError> {
        let url = format!(
            "{}/{}/contract/{}/cw721/allNftInfo",
            self.base_url, chain_id, collection_address
        );

        let response = self
            .http_client
            .get(&url)
            .query(&[("tokenId", token_id)])
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(OracleError::Request(format!("indexer returned {}", status)));
        }

        let body: AllNftInfoResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        body.into_nft_info().map(Some)
    }
}

#[async_trait]
impl OwnershipOracle for IndexerOracle {
    async fn nft_info(
        &self,
        chain_id: &str,
        collection_address: &str,
        token_id: &str,
    ) -> Result<Option<NftInfo>, OracleError> {
        let key = format!("{}/{}/{}", chain_id, collection_address, token_id);
        if let Some(cached) = self.cache.get(&key).await {
            tracing::debug!(nft = %key, "Using cached NFT info");
            return Ok(cached);
        }

        let info = self.fetch(chain_id, collection_address, token_id).await?;
        self.cache.insert(key, info.clone()).await;
        Ok(info)
    }
}

/// Resolve `nft` if any of `addresses` holds it.
///
/// `Ok(None)` means the NFT is missing or held by someone else.
pub async fn owned_nft(
    oracle: &dyn OwnershipOracle,
    timeout: Duration,
    nft: &NftSelection,
    addresses: &[String],
) -> Result<Option<ProfileNft>, OracleError> {
    let lookup = oracle.nft_info(&nft.chain_id, &nft.collection_address, &nft.token_id);
    let info = tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| OracleError::Timeout)??;

    Ok(info
        .filter(|info| addresses.iter().any(|a| info.held_by(a)))
        .map(|info| ProfileNft {
            chain_id: nft.chain_id.clone(),
            collection_address: nft.collection_address.clone(),
            token_id: nft.token_id.clone(),
            image_url: info.image_url,
        }))
}
