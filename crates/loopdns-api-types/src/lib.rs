use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Server version and how the caller's address looks from the server's
/// side; useful for clients deciding which of their addresses to encode.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct OverviewResponse {
    /// Server version string.
    #[schema(example = "2026.07.01-abcd1234")]
    pub version: String,

    /// The address the request appeared to come from.
    #[schema(example = "198.51.100.7")]
    pub client_ip: String,
}

/// A freshly issued subdomain together with the bearer token that
/// authorizes ACME challenge submissions for it.
///
/// Nothing about the subdomain is stored server-side: keep the token,
/// it is the only proof of ownership.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct SubdomainResponse {
    /// Identifier of the subdomain.
    pub id: Uuid,

    /// Bearer token bound to `id`.
    #[schema(example = "9f86d081884c7d65...")]
    pub token: String,

    /// The issued zone, `<id>.<root-domain>`.
    #[schema(example = "a5e1a6e6-6d2b-4c3a-9f0e-0f95c8f6d6a1.dyn.direct")]
    pub domain: String,
}

/// Body of `PUT /subdomain/{id}/acme-challenge`.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AcmeChallengeRequest {
    /// The token returned when the subdomain was issued.
    pub token: String,

    /// TXT values to serve at `_acme-challenge.<id>.<root-domain>`.
    /// Replaces any previously submitted set.
    pub values: Vec<String>,
}

/// Uniform error body for all non-200 API responses.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable code: `bad-request`, `invalid-token`
    /// or `internal-error`.
    #[schema(example = "invalid-token")]
    pub error: String,

    /// Human-readable detail.
    pub message: String,
}
