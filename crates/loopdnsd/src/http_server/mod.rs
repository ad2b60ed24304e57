use crate::acme::AcmeManager;
use crate::store::Store;
use crate::token::TokenAuthority;
use axum::extract::{Path, State};
use axum::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::Router;
use axum_client_ip::ClientIpSource;
use loopdns_api_types::ErrorResponse;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;
use uuid::Uuid;

pub mod api_v1;

/// Hard wall-clock bound on any single API request.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "loopdns",
        description = "Issues subdomains encoding arbitrary addresses, \
                       and accepts ACME DNS-01 challenge values for them."
    ),
    paths(
        api_v1::overview,
        api_v1::new_subdomain,
        api_v1::set_acme_challenge
    ),
    components(schemas(
        loopdns_api_types::OverviewResponse,
        loopdns_api_types::SubdomainResponse,
        loopdns_api_types::AcmeChallengeRequest,
        loopdns_api_types::ErrorResponse
    ))
)]
struct ApiDoc;

fn make_docs() -> utoipa::openapi::OpenApi {
    let mut docs = ApiDoc::openapi();
    docs.info.version = version_info::loopdns_version().to_string();
    docs
}

#[derive(Clone)]
pub struct AppState {
    pub authority: TokenAuthority,
    pub store: Arc<dyn Store>,
    pub root_domain: Arc<String>,
}

/// The coarse error taxonomy exposed to clients. Everything below the
/// handler boundary is logged and folded into one of these.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("token does not match this subdomain")]
    InvalidToken,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        let error = match self {
            Self::BadRequest(_) => "bad-request",
            Self::InvalidToken => "invalid-token",
            Self::Internal(_) => "internal-error",
        };
        // The detail of internal errors stays in the logs; clients only
        // see the coarse taxonomy.
        let message = match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorResponse {
            error: error.to_string(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(err) = &self {
            tracing::error!("internal error: {err:#}");
        }
        json_response(self.status(), &self.body())
    }
}

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<axum::extract::rejection::PathRejection> for ApiError {
    fn from(rejection: axum::extract::rejection::PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// JSON responder used for every API body, success or error: explicit
/// charset and no caching anywhere between us and the client.
pub struct ApiJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> Response {
        json_response(StatusCode::OK, &self.0)
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    (
        status,
        [
            (
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            ),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        body,
    )
        .into_response()
}

async fn request_id_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("api", %request_id);
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn deadline_middleware(request: Request<axum::body::Body>, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_DEADLINE, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Internal(anyhow::anyhow!("request deadline exceeded")).into_response(),
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("panic while handling request: {detail}");
    ApiError::Internal(anyhow::anyhow!("panic while handling request")).into_response()
}

/// The API router. `behind_proxy` decides whether the peer address or
/// the rightmost forwarded hop counts as the client.
pub fn make_api_router(state: AppState, behind_proxy: bool) -> Router {
    let ip_source = if behind_proxy {
        ClientIpSource::RightmostXForwardedFor
    } else {
        ClientIpSource::ConnectInfo
    };

    Router::new()
        .route("/overview", get(api_v1::overview))
        .route("/subdomain", post(api_v1::new_subdomain))
        .route("/subdomain/{id}/acme-challenge", put(api_v1::set_acme_challenge))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", make_docs()).path("/rapidoc"))
        .layer(axum::middleware::from_fn(deadline_middleware))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(ip_source.into_extension())
        .with_state(state)
}

#[derive(Clone)]
struct RedirectState {
    api_host: Arc<String>,
    acme: Option<Arc<AcmeManager>>,
}

async fn acme_http01(
    State(state): State<RedirectState>,
    Path(token): Path<String>,
) -> Response {
    match state.acme.as_ref().and_then(|manager| manager.http01_response(&token)) {
        Some(key_auth) => key_auth.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_to_https(State(state): State<RedirectState>, uri: Uri) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::permanent(&format!("https://{}{}", state.api_host, path_and_query)).into_response()
}

/// Router for the plain-HTTP listener when the API itself is on TLS:
/// everything permanently redirects to the API host, except HTTP-01
/// challenges for our own certificate.
pub fn make_redirect_router(api_host: Arc<String>, acme: Option<Arc<AcmeManager>>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(acme_http01))
        .fallback(redirect_to_https)
        .layer(TraceLayer::new_for_http())
        .with_state(RedirectState { api_host, acme })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, MAX_ENTRIES};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request as HttpRequest;
    use loopdns_api_types::{AcmeChallengeRequest, SubdomainResponse};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Arc<MemStore>) {
        let store = Arc::new(MemStore::new(
            MAX_ENTRIES,
            tempfile::tempdir().unwrap().path().join("stats.json"),
        ));
        let state = AppState {
            authority: TokenAuthority::new(b"s3cret"),
            store: Arc::clone(&store) as Arc<dyn Store>,
            root_domain: Arc::new("dyn.direct".to_string()),
        };
        (state, store)
    }

    fn with_peer(mut request: HttpRequest<Body>) -> HttpRequest<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 4321))));
        request
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn overview_reports_version_and_peer() {
        let (state, _) = test_state();
        let router = make_api_router(state, false);
        let response = router
            .oneshot(with_peer(
                HttpRequest::get("/overview").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        assert!(response.headers().contains_key("x-request-id"));

        let overview: loopdns_api_types::OverviewResponse = body_json(response).await;
        assert_eq!(overview.client_ip, "198.51.100.7");
        assert_eq!(overview.version, version_info::loopdns_version());
    }

    #[tokio::test]
    async fn overview_honors_forwarded_header_behind_proxy() {
        let (state, _) = test_state();
        let router = make_api_router(state, true);
        let response = router
            .oneshot(with_peer(
                HttpRequest::get("/overview")
                    .header("x-forwarded-for", "203.0.113.44")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        let overview: loopdns_api_types::OverviewResponse = body_json(response).await;
        assert_eq!(overview.client_ip, "203.0.113.44");
    }

    #[tokio::test]
    async fn subdomain_mint_round_trips_token() {
        let (state, _) = test_state();
        let authority = state.authority.clone();
        let router = make_api_router(state, false);

        let response = router
            .oneshot(with_peer(
                HttpRequest::post("/subdomain").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let issued: SubdomainResponse = body_json(response).await;
        assert_eq!(issued.domain, format!("{}.dyn.direct", issued.id));
        assert_eq!(issued.token, authority.mint(issued.id));
    }

    #[tokio::test]
    async fn challenge_submission_lands_in_store() {
        let (state, store) = test_state();
        let authority = state.authority.clone();
        let router = make_api_router(state, false);

        let id = Uuid::new_v4();
        let body = serde_json::to_vec(&AcmeChallengeRequest {
            token: authority.mint(id),
            values: vec!["abc".to_string(), "def".to_string()],
        })
        .unwrap();

        let response = router
            .oneshot(with_peer(
                HttpRequest::put(format!("/subdomain/{id}/acme-challenge"))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.get_challenge(id).await.unwrap(),
            vec!["abc".to_string(), "def".to_string()]
        );
    }

    #[tokio::test]
    async fn submitted_values_resolve_over_dns() {
        let (state, store) = test_state();
        let authority = state.authority.clone();
        let router = make_api_router(state, false);

        let id = Uuid::new_v4();
        let body = serde_json::to_vec(&AcmeChallengeRequest {
            token: authority.mint(id),
            values: vec!["abc".to_string(), "def".to_string()],
        })
        .unwrap();
        let response = router
            .oneshot(with_peer(
                HttpRequest::put(format!("/subdomain/{id}/acme-challenge"))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let handler = crate::dns::DnsHandler::new(
            "dyn.direct".to_string(),
            Default::default(),
            Arc::clone(&store) as Arc<dyn Store>,
        );
        let mut request = hickory_proto::op::Message::new();
        request
            .set_id(7)
            .set_message_type(hickory_proto::op::MessageType::Query)
            .set_op_code(hickory_proto::op::OpCode::Query);
        request.add_query(hickory_proto::op::Query::query(
            hickory_proto::rr::Name::from_ascii(format!("_acme-challenge.{id}.dyn.direct."))
                .unwrap(),
            hickory_proto::rr::RecordType::TXT,
        ));

        let reply = handler.handle_message(&request).await;
        assert!(reply.authoritative());
        assert_eq!(reply.answers().len(), 2);
        assert!(reply.answers().iter().all(|record| record.ttl() == 0));
    }

    #[tokio::test]
    async fn bad_token_is_rejected_and_nothing_stored() {
        let (state, store) = test_state();
        let router = make_api_router(state, false);

        let id = Uuid::new_v4();
        let body = serde_json::to_vec(&AcmeChallengeRequest {
            token: "00".repeat(128),
            values: vec!["abc".to_string()],
        })
        .unwrap();

        let response = router
            .oneshot(with_peer(
                HttpRequest::put(format!("/subdomain/{id}/acme-challenge"))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.error, "invalid-token");
        assert!(store.get_challenge(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (state, _) = test_state();
        let router = make_api_router(state, false);

        let response = router
            .oneshot(with_peer(
                HttpRequest::put(format!("/subdomain/{}/acme-challenge", Uuid::new_v4()))
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"nope\":1}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.error, "bad-request");
    }

    #[tokio::test]
    async fn malformed_id_is_bad_request() {
        let (state, _) = test_state();
        let router = make_api_router(state, false);

        let response = router
            .oneshot(with_peer(
                HttpRequest::put("/subdomain/not-a-uuid/acme-challenge")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"token\":\"x\",\"values\":[]}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn redirect_preserves_path_and_query() {
        let router = make_redirect_router(Arc::new("v1.dyn.direct".to_string()), None);
        let response = router
            .oneshot(
                HttpRequest::get("/some/path?q=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://v1.dyn.direct/some/path?q=1"
        );
    }
}
