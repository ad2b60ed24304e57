use super::{ApiError, ApiJson, AppState};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Json, Path, State};
use axum_client_ip::ClientIp;
use loopdns_api_types::{AcmeChallengeRequest, OverviewResponse, SubdomainResponse};
use uuid::Uuid;

/// Report the server version and the address the caller appears as.
#[utoipa::path(
    get,
    tag = "overview",
    path = "/overview",
    responses(
        (status = 200, description = "Server overview", body = OverviewResponse)
    ),
)]
pub async fn overview(
    State(_state): State<AppState>,
    ClientIp(client_ip): ClientIp,
) -> Result<ApiJson<OverviewResponse>, ApiError> {
    Ok(ApiJson(OverviewResponse {
        version: version_info::loopdns_version().to_string(),
        client_ip: client_ip.to_string(),
    }))
}

/// Issue a fresh subdomain. Nothing is recorded server-side; the
/// returned token is the only handle on the subdomain.
#[utoipa::path(
    post,
    tag = "subdomain",
    path = "/subdomain",
    responses(
        (status = 200, description = "Newly issued subdomain", body = SubdomainResponse)
    ),
)]
pub async fn new_subdomain(
    State(state): State<AppState>,
) -> Result<ApiJson<SubdomainResponse>, ApiError> {
    let id = Uuid::new_v4();
    let token = state.authority.mint(id);
    state.store.increment_stat("api_subdomain_new", 1);

    Ok(ApiJson(SubdomainResponse {
        id,
        token,
        domain: format!("{id}.{}", state.root_domain),
    }))
}

/// Replace the DNS-01 TXT values served at
/// `_acme-challenge.<id>.<root-domain>`.
#[utoipa::path(
    put,
    tag = "subdomain",
    path = "/subdomain/{id}/acme-challenge",
    params(
        ("id" = Uuid, Path, description = "Subdomain identifier")
    ),
    request_body = AcmeChallengeRequest,
    responses(
        (status = 200, description = "Values accepted"),
        (status = 403, description = "Token mismatch", body = loopdns_api_types::ErrorResponse)
    ),
)]
pub async fn set_acme_challenge(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<AcmeChallengeRequest>, JsonRejection>,
) -> Result<ApiJson<serde_json::Value>, ApiError> {
    let Path(id) = id?;
    let Json(request) = body?;

    if !state.authority.verify(id, &request.token) {
        state.store.increment_stat("api_token_invalid", 1);
        return Err(ApiError::InvalidToken);
    }

    state
        .store
        .set_challenge(id, request.values)
        .await
        .map_err(ApiError::Internal)?;
    state.store.increment_stat("api_acme_set", 1);

    Ok(ApiJson(serde_json::json!({})))
}
