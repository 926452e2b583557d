//! Application state for the PFPK profile service

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use uuid::Uuid;

use crate::auth::{
    expected_nonce, parse_request, request_body, validate_name, verify_signed_request,
    VerifiedRequest,
};
use crate::config::{ChainInfo, ChainRegistry, Config};
use crate::crypto::{
    address_hex_to_bech32, bech32_to_address_hex, normalize_public_key_hex, PublicKey,
};
use crate::error::{ApiError, ApiResult};
use crate::merge;
use crate::oracle::{owned_nft, NoopOracle, OwnershipOracle};
use crate::store::{IdentityStore, MemoryStore, StorageError, StoreTx};
use crate::tokens::{TokenIssuer, ROLE_ADMIN, ROLE_VERIFY};
use crate::types::*;

/// How a profile read addresses its profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileLookup {
    PublicKeyHex(String),
    AddressHex(String),
    Bech32(String),
    Name(String),
    Uuid(Uuid),
}

/// Outcome of authorizing a mutating request
enum Authorization {
    Granted(Profile),
    /// A concurrent first request attached the signing key before us
    Raced(PublicKey),
}

/// Profile row plus everything a view needs, read in one unit of work
struct ProfileSnapshot {
    profile: Profile,
    keys: Vec<ProfilePublicKey>,
    chains: BTreeMap<String, ProfileChain>,
}

/// Global application state
pub struct AppState {
    pub config: Config,
    /// Chain metadata, fixed at start-up
    pub chains: ChainRegistry,
    pub store: Arc<dyn IdentityStore>,
    pub tokens: TokenIssuer,
    pub oracle: Arc<dyn OwnershipOracle>,
    /// Start time for uptime calculation
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        chains: ChainRegistry,
        store: Arc<dyn IdentityStore>,
        oracle: Arc<dyn OwnershipOracle>,
    ) -> Arc<Self> {
        let tokens = TokenIssuer::new(
            config.jwt_secret.as_bytes(),
            config.token_ttl,
            config.token_roles.clone(),
        );

        Arc::new(Self {
            config,
            chains,
            store,
            tokens,
            oracle,
            start_time: Instant::now(),
        })
    }

    /// In-memory store, built-in chains, no NFT lookups
    pub fn in_memory(config: Config) -> Arc<Self> {
        Self::new(
            config,
            ChainRegistry::builtin(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopOracle),
        )
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".into(),
            version: self.config.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn chain_list(&self) -> Vec<ChainInfo> {
        self.chains.iter().cloned().collect()
    }

    async fn begin(&self) -> ApiResult<Box<dyn StoreTx>> {
        Ok(self.store.begin().await?)
    }

    // ============ Reads ============

    async fn find_profile(
        &self,
        tx: &mut dyn StoreTx,
        lookup: &ProfileLookup,
    ) -> ApiResult<Option<Profile>> {
        let profile = match lookup {
            ProfileLookup::PublicKeyHex(hex) => {
                let hex = normalize_public_key_hex(hex)?;
                tx.profile_by_public_key_hex(&hex).await?
            }
            ProfileLookup::AddressHex(address) => {
                let address = address.trim().trim_start_matches("0x").to_lowercase();
                tx.profile_by_address_hex(&address).await?
            }
            ProfileLookup::Bech32(address) => {
                let (_, address_hex) = bech32_to_address_hex(address)?;
                tx.profile_by_address_hex(&address_hex).await?
            }
            ProfileLookup::Name(name) => tx.profile_by_name(name).await?,
            ProfileLookup::Uuid(uuid) => tx.profile_by_uuid(*uuid).await?,
        };
        Ok(profile)
    }

    async fn snapshot(
        &self,
        tx: &mut dyn StoreTx,
        profile: Profile,
    ) -> ApiResult<ProfileSnapshot> {
        let keys = tx.public_keys(profile.id).await?;
        let mut chains = BTreeMap::new();

        for pref in tx.chain_preferences(profile.id).await? {
            let Some(key) = keys.iter().find(|k| k.id == pref.profile_public_key_id) else {
                continue;
            };
            let Some(chain) = self.chains.get(&pref.chain_id) else {
                tracing::debug!(chain_id = %pref.chain_id, "Skipping unknown chain preference");
                continue;
            };
            let address = address_hex_to_bech32(&key.address_hex, &chain.bech32_prefix)?;
            chains.insert(
                pref.chain_id.clone(),
                ProfileChain {
                    public_key: key.to_ref(),
                    address,
                },
            );
        }

        Ok(ProfileSnapshot {
            profile,
            keys,
            chains,
        })
    }

    /// Addresses of `keys` on `chain_id`
    fn addresses_on(&self, keys: &[ProfilePublicKey], chain_id: &str) -> Vec<String> {
        let Some(chain) = self.chains.get(chain_id) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| address_hex_to_bech32(&k.address_hex, &chain.bech32_prefix).ok())
            .collect()
    }

    async fn render(&self, snapshot: ProfileSnapshot) -> ProfileView {
        let ProfileSnapshot {
            profile,
            keys,
            chains,
        } = snapshot;

        let nft = match &profile.nft {
            Some(selection) => {
                let addresses = self.addresses_on(&keys, &selection.chain_id);
                match owned_nft(
                    self.oracle.as_ref(),
                    self.config.oracle_timeout,
                    selection,
                    &addresses,
                )
                .await
                {
                    Ok(nft) => nft,
                    Err(e) => {
                        tracing::warn!(
                            profile = %profile.uuid,
                            chain_id = %selection.chain_id,
                            error = %e,
                            "NFT lookup failed"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        ProfileView {
            uuid: Some(profile.uuid),
            nonce: profile.nonce,
            name: profile.name,
            nft,
            chains,
        }
    }

    /// Profile view, or the empty view when nothing matches
    pub async fn fetch_profile(&self, lookup: ProfileLookup) -> ApiResult<ProfileView> {
        let snapshot = {
            let mut tx = self.begin().await?;
            match self.find_profile(tx.as_mut(), &lookup).await? {
                Some(profile) => Some(self.snapshot(tx.as_mut(), profile).await?),
                None => None,
            }
        };

        // Oracle calls run after the unit of work is released
        match snapshot {
            Some(snapshot) => Ok(self.render(snapshot).await),
            None => Ok(ProfileView::empty()),
        }
    }

    /// Views for many bech32 addresses; a failing entry yields the empty view.
    pub async fn fetch_profiles(&self, addresses: &[String]) -> ApiResult<Vec<ProfileView>> {
        if addresses.len() > self.config.bulk_limit {
            return Err(ApiError::BadRequest(format!(
                "At most {} addresses per request",
                self.config.bulk_limit
            )));
        }

        let lookups = addresses
            .iter()
            .map(|address| self.fetch_profile(ProfileLookup::Bech32(address.clone())));

        Ok(join_all(lookups)
            .await
            .into_iter()
            .zip(addresses)
            .map(|(result, address)| {
                result.unwrap_or_else(|e| {
                    tracing::warn!(address = %address, error = %e, "Bulk lookup failed");
                    ProfileView::empty()
                })
            })
            .collect())
    }

    /// Nonce a request signed by this key must carry.
    ///
    /// Without `key_type` the first profile holding the hex under any type
    /// answers; pass the type to get exactly the nonce auth checks against.
    pub async fn nonce(
        &self,
        public_key_hex: &str,
        key_type: Option<&str>,
    ) -> ApiResult<NonceResponse> {
        let mut tx = self.begin().await?;
        let profile = match key_type {
            Some(key_type) => {
                let key = PublicKey::new(key_type, public_key_hex.trim_start_matches("0x"))?;
                tx.profile_by_key(&key).await?
            }
            None => {
                let hex = normalize_public_key_hex(public_key_hex)?;
                tx.profile_by_public_key_hex(&hex).await?
            }
        };
        Ok(NonceResponse {
            nonce: expected_nonce(profile.as_ref()),
        })
    }

    /// Verify a signed request without changing anything
    pub async fn check_auth(&self, req: SignedRequest) -> ApiResult<AuthCheckResponse> {
        let mut tx = self.begin().await?;
        let verified = self.verify(tx.as_mut(), &req, Utc::now()).await?;
        Ok(AuthCheckResponse {
            uuid: verified.profile.as_ref().map(|p| p.uuid),
            nonce: verified.expected_nonce(),
            public_key: verified.public_key.to_ref(),
            chain_id: verified.auth.chain_id,
        })
    }

    // ============ Signed Mutations ============

    async fn verify(
        &self,
        tx: &mut dyn StoreTx,
        req: &SignedRequest,
        now: DateTime<Utc>,
    ) -> ApiResult<VerifiedRequest> {
        let verified =
            verify_signed_request(tx, req, now, self.config.auth_timestamp_window).await?;
        self.chains.require(&verified.auth.chain_id)?;
        Ok(verified)
    }

    /// Open a unit of work for a signed mutation and consume its nonce.
    async fn begin_mutation(
        &self,
        req: &SignedRequest,
        now: DateTime<Utc>,
    ) -> ApiResult<(Box<dyn StoreTx>, Profile)> {
        let mut tx = self.begin().await?;
        let public_key = match self.authorize_mutation(tx.as_mut(), req, now).await? {
            Authorization::Granted(profile) => return Ok((tx, profile)),
            Authorization::Raced(public_key) => public_key,
        };

        // The failed insert may have poisoned this unit of work
        drop(tx);
        let mut tx = self.begin().await?;
        let owner = tx.profile_by_key(&public_key).await?;
        Err(ApiError::InvalidNonce {
            expected: expected_nonce(owner.as_ref()),
        })
    }

    /// Verify, create the profile on first use, and consume the nonce.
    async fn authorize_mutation(
        &self,
        tx: &mut dyn StoreTx,
        req: &SignedRequest,
        now: DateTime<Utc>,
    ) -> ApiResult<Authorization> {
        let verified = self.verify(tx, req, now).await?;
        let expected = verified.expected_nonce();

        let mut profile = match verified.profile {
            Some(profile) => profile,
            None => {
                let profile = tx.insert_profile().await?;
                let row = match tx.attach_public_key(profile.id, &verified.public_key).await {
                    Ok(row) => row,
                    Err(StorageError::Conflict(_)) => {
                        return Ok(Authorization::Raced(verified.public_key))
                    }
                    Err(e) => return Err(e.into()),
                };
                tx.upsert_chain_preference(profile.id, &verified.auth.chain_id, row.id)
                    .await?;
                tracing::info!(
                    profile = %profile.uuid,
                    key_type = %verified.public_key.key_type(),
                    "Created profile"
                );
                profile
            }
        };

        if !tx.increment_nonce(profile.id, expected).await? {
            let current = tx
                .profile_by_id(profile.id)
                .await?
                .map(|p| p.nonce)
                .unwrap_or(INITIAL_NONCE);
            return Err(ApiError::InvalidNonce { expected: current });
        }
        profile.nonce = expected + 1;
        Ok(Authorization::Granted(profile))
    }

    /// Check `nft` is held by the signer's profile before opening the write.
    async fn check_nft_ownership(
        &self,
        req: &SignedRequest,
        nft: &NftSelection,
        now: DateTime<Utc>,
    ) -> ApiResult<()> {
        self.chains.require(&nft.chain_id)?;
        let (_, public_key) = parse_request(req, now, self.config.auth_timestamp_window)?;

        let keys = {
            let mut tx = self.begin().await?;
            match tx.profile_by_key(&public_key).await? {
                Some(profile) => tx.public_keys(profile.id).await?,
                None => Vec::new(),
            }
        };
        let mut addresses = self.addresses_on(&keys, &nft.chain_id);
        if let Some(chain) = self.chains.get(&nft.chain_id) {
            addresses.push(public_key.bech32_address(&chain.bech32_prefix)?);
        }

        match owned_nft(
            self.oracle.as_ref(),
            self.config.oracle_timeout,
            nft,
            &addresses,
        )
        .await
        {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ApiError::BadRequest("NFT is not owned by this profile".into())),
            Err(e) => {
                tracing::warn!(error = %e, "NFT ownership check failed");
                Err(ApiError::BadRequest(
                    "NFT ownership could not be verified".into(),
                ))
            }
        }
    }

    pub async fn update_profile(&self, req: SignedRequest) -> ApiResult<ProfileView> {
        let now = Utc::now();
        let body: UpdateProfileBody = request_body(&req.data)?;

        if let Some(Some(name)) = &body.profile.name {
            validate_name(name).map_err(|e| ApiError::BadRequest(e.into()))?;
        }
        for chain_id in body.chain_ids.iter().flatten() {
            self.chains.require(chain_id)?;
        }
        if let Some(Some(nft)) = &body.profile.nft {
            self.check_nft_ownership(&req, nft, now).await?;
        }

        let (mut tx, profile) = self.begin_mutation(&req, now).await?;

        if let Some(name) = &body.profile.name {
            tx.set_profile_name(profile.id, name.as_deref()).await?;
        }
        if let Some(nft) = &body.profile.nft {
            tx.set_profile_nft(profile.id, nft.as_ref()).await?;
        }
        if let Some(chain_ids) = &body.chain_ids {
            let (_, public_key) = parse_request(&req, now, self.config.auth_timestamp_window)?;
            let row = tx
                .public_key(&public_key)
                .await?
                .ok_or_else(|| ApiError::internal("signing key not attached"))?;
            for chain_id in chain_ids {
                tx.upsert_chain_preference(profile.id, chain_id, row.id)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::info!(profile = %profile.uuid, nonce = profile.nonce, "Updated profile");

        self.fetch_profile(ProfileLookup::Uuid(profile.uuid)).await
    }

    pub async fn register_public_keys(&self, req: SignedRequest) -> ApiResult<ProfileView> {
        let now = Utc::now();
        let body: RegisterPublicKeysBody = request_body(&req.data)?;

        let (mut tx, profile) = self.begin_mutation(&req, now).await?;
        merge::register_public_keys(
            tx.as_mut(),
            &self.chains,
            &profile,
            &body.public_keys,
            now,
            self.config.auth_timestamp_window,
        )
        .await?;
        tx.commit().await?;

        self.fetch_profile(ProfileLookup::Uuid(profile.uuid)).await
    }

    pub async fn unregister_public_keys(&self, req: SignedRequest) -> ApiResult<ProfileView> {
        let now = Utc::now();
        let body: UnregisterPublicKeysBody = request_body(&req.data)?;

        let (mut tx, profile) = self.begin_mutation(&req, now).await?;
        let outcome = merge::unregister_public_keys(tx.as_mut(), &profile, &body.public_keys).await?;
        tx.commit().await?;

        if outcome.profile_deleted {
            return Ok(ProfileView::empty());
        }
        self.fetch_profile(ProfileLookup::Uuid(profile.uuid)).await
    }

    // ============ Tokens ============

    pub async fn create_tokens(&self, req: SignedRequest) -> ApiResult<TokensResponse<IssuedToken>> {
        let now = Utc::now();
        let body: CreateTokensBody = request_body(&req.data)?;

        let (mut tx, profile) = self.begin_mutation(&req, now).await?;
        let tokens = self
            .tokens
            .issue(
                tx.as_mut(),
                &profile,
                body.tokens.as_deref().unwrap_or_default(),
                now,
            )
            .await?;
        tx.commit().await?;

        Ok(TokensResponse { tokens })
    }

    pub async fn invalidate_tokens(&self, req: SignedRequest) -> ApiResult<InvalidateTokensResponse> {
        let now = Utc::now();
        let body: InvalidateTokensBody = request_body(&req.data)?;

        let (mut tx, profile) = self.begin_mutation(&req, now).await?;
        let invalidated = self
            .tokens
            .invalidate(tx.as_mut(), &profile, body.tokens.as_deref())
            .await?;
        tx.commit().await?;

        Ok(InvalidateTokensResponse { invalidated })
    }

    /// Live tokens of the bearer's profile; needs an admin token
    pub async fn list_tokens(&self, bearer: &str) -> ApiResult<TokensResponse<TokenInfo>> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let verified = self
            .tokens
            .verify(tx.as_mut(), bearer, &[ROLE_ADMIN], None, now)
            .await?;

        let tokens = tx
            .tokens(verified.profile.id)
            .await?
            .iter()
            .filter(|t| t.expires_at > now)
            .map(TokenInfo::from)
            .collect();
        Ok(TokensResponse { tokens })
    }

    /// Check a bearer token, optionally for one audience
    pub async fn verify_token(
        &self,
        bearer: &str,
        audience: Option<&str>,
    ) -> ApiResult<TokenCheckResponse> {
        let mut tx = self.begin().await?;
        let verified = self
            .tokens
            .verify(
                tx.as_mut(),
                bearer,
                &[ROLE_ADMIN, ROLE_VERIFY],
                audience,
                Utc::now(),
            )
            .await?;

        Ok(TokenCheckResponse {
            uuid: verified.profile.uuid,
            role: verified.claims.role,
            audience: verified.claims.aud,
            expires_at: verified.row.expires_at,
        })
    }
}
