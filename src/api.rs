use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, ProfileLookup};
use crate::types::*;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & chains
        .route("/health", get(health))
        .route("/chains", get(get_chains))
        // Profile reads
        .route("/pk/:hex", get(profile_by_public_key))
        .route("/address/:hex", get(profile_by_address_hex))
        .route("/bech32/:address", get(profile_by_bech32))
        .route("/name/:name", get(profile_by_name))
        .route("/uuid/:uuid", get(profile_by_uuid))
        .route("/bulk", post(bulk_profiles))
        .route("/nonce/:hex", get(get_nonce))
        // Signed requests
        .route("/auth-check", post(auth_check))
        .route("/update", post(update_profile))
        .route("/register", post(register_public_keys))
        .route("/unregister", post(unregister_public_keys))
        .route("/tokens", post(create_tokens).get(list_tokens))
        .route("/tokens/invalidate", post(invalidate_tokens))
        // Bearer token check
        .route("/auth", get(verify_token))
        .with_state(state)
}

// ============ Auth Helpers ============

fn extract_bearer(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::Unauthorized)
}

// ============ Health Endpoints ============

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.health()))
}

async fn get_chains(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.chain_list()))
}

// ============ Profile Endpoints ============

async fn lookup(state: &AppState, lookup: ProfileLookup) -> ApiResult<Json<ApiResponse<ProfileView>>> {
    let view = state.fetch_profile(lookup).await?;
    Ok(Json(ApiResponse::success(view)))
}

async fn profile_by_public_key(
    State(state): State<Arc<AppState>>,
    Path(hex): Path<String>,
) -> ApiResult<impl IntoResponse> {
    lookup(&state, ProfileLookup::PublicKeyHex(hex)).await
}

async fn profile_by_address_hex(
    State(state): State<Arc<AppState>>,
    Path(hex): Path<String>,
) -> ApiResult<impl IntoResponse> {
    lookup(&state, ProfileLookup::AddressHex(hex)).await
}

async fn profile_by_bech32(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<impl IntoResponse> {
    lookup(&state, ProfileLookup::Bech32(address)).await
}

async fn profile_by_name(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    lookup(&state, ProfileLookup::Name(name)).await
}

async fn profile_by_uuid(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let uuid = Uuid::parse_str(&uuid)
        .map_err(|_| ApiError::BadRequest(format!("Invalid UUID: {}", uuid)))?;
    lookup(&state, ProfileLookup::Uuid(uuid)).await
}

async fn bulk_profiles(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkProfilesRequest>,
) -> ApiResult<impl IntoResponse> {
    let views = state.fetch_profiles(&req.addresses).await?;
    Ok(Json(ApiResponse::success(views)))
}

#[derive(serde::Deserialize)]
struct KeyTypeQuery {
    #[serde(rename = "type")]
    key_type: Option<String>,
}

async fn get_nonce(
    State(state): State<Arc<AppState>>,
    Path(hex): Path<String>,
    Query(query): Query<KeyTypeQuery>,
) -> ApiResult<impl IntoResponse> {
    let nonce = state.nonce(&hex, query.key_type.as_deref()).await?;
    Ok(Json(ApiResponse::success(nonce)))
}

// ============ Signed Request Endpoints ============

async fn auth_check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let resp = state.check_auth(req).await?;
    Ok(Json(ApiResponse::success(resp)))
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let view = state.update_profile(req).await?;
    Ok(Json(ApiResponse::success(view)))
}

async fn register_public_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let view = state.register_public_keys(req).await?;
    Ok(Json(ApiResponse::success(view)))
}

async fn unregister_public_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let view = state.unregister_public_keys(req).await?;
    Ok(Json(ApiResponse::success(view)))
}

// ============ Token Endpoints ============

async fn create_tokens(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let tokens = state.create_tokens(req).await?;
    Ok(Json(ApiResponse::success(tokens)))
}

async fn invalidate_tokens(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignedRequest>,
) -> ApiResult<impl IntoResponse> {
    let resp = state.invalidate_tokens(req).await?;
    Ok(Json(ApiResponse::success(resp)))
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let bearer = extract_bearer(&headers)?;
    let tokens = state.list_tokens(bearer).await?;
    Ok(Json(ApiResponse::success(tokens)))
}

#[derive(serde::Deserialize)]
struct AudienceQuery {
    audience: Option<String>,
}

async fn verify_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AudienceQuery>,
) -> ApiResult<impl IntoResponse> {
    let bearer = extract_bearer(&headers)?;
    let resp = state
        .verify_token(bearer, query.audience.as_deref())
        .await?;
    Ok(Json(ApiResponse::success(resp)))
}
