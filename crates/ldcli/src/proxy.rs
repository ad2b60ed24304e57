use crate::state::{self, State};
use anyhow::Context;
use axum::body::Body;
use axum::extract::State as AxumState;
use axum::http::header::HOST;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use loopdns_api_client::{AcmeDirectory, AcquireCertificateRequest, Client};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct ProxyOptions {
    pub src_port: u16,
    pub dst_url: String,
    pub override_host: bool,
    pub replace: bool,
    pub endpoint: Url,
}

#[derive(Clone)]
struct ProxyState {
    http: reqwest::Client,
    dst: Url,
    override_host: bool,
}

/// Serve HTTPS on `127.0.0.1:<src-port>` with a wildcard certificate
/// for this machine's subdomain, forwarding every request to the
/// destination URL.
pub async fn run(options: ProxyOptions) -> anyhow::Result<()> {
    let dst: Url = options
        .dst_url
        .parse()
        .with_context(|| format!("invalid destination url {}", options.dst_url))?;

    let client = Client::new(options.endpoint.clone())?;
    let state = ensure_state(&client, options.replace).await?;

    let tls = tls_config(&state)?;
    let addr = SocketAddr::from(([127, 0, 0, 1], options.src_port));

    let name = loopdns_api_client::domain_for_ip(
        &state.domain,
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
    );
    tracing::info!(
        "active: https://{name}:{} -> {dst}",
        options.src_port
    );

    let router = Router::new()
        .fallback(forward)
        .with_state(ProxyState {
            http: reqwest::Client::new(),
            dst,
            override_host: options.override_host,
        });

    axum_server::bind_rustls(addr, RustlsConfig::from_config(tls))
        .serve(router.into_make_service())
        .await
        .context("proxy listener")
}

/// Reuse the persisted subdomain and certificate when possible,
/// otherwise mint and persist fresh ones.
async fn ensure_state(client: &Client, replace: bool) -> anyhow::Result<State> {
    let mut state = if replace { State::default() } else { state::load()? };

    if !state.has_domain() {
        tracing::info!("acquiring domain");
        let issued = client.request_subdomain().await?;
        state.id = Some(issued.id);
        state.domain = issued.domain;
        state.token = issued.token;
        state.certificate.clear();
        state.private_key.clear();
        state::save(&state)?;
    }

    if !state.has_fresh_certificate() {
        tracing::info!("acquiring certificate for *.{}", state.domain);
        let id = state.id.context("state has no subdomain id")?;
        let certificate = client
            .acquire_certificate(AcquireCertificateRequest {
                id,
                domain: state.domain.clone(),
                token: state.token.clone(),
                directory: AcmeDirectory::ZeroSsl,
                timeout: ACQUIRE_TIMEOUT,
            })
            .await?;
        state.certificate = certificate.certificate_pem;
        state.private_key = certificate.private_key_pem;
        state.issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        state::save(&state)?;
    }

    Ok(state)
}

fn tls_config(state: &State) -> anyhow::Result<Arc<ServerConfig>> {
    let certificates = CertificateDer::pem_slice_iter(state.certificate.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("parsing stored certificate")?;
    let private_key = PrivateKeyDer::from_pem_slice(state.private_key.as_bytes())
        .context("parsing stored private key")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;
    Ok(Arc::new(config))
}

async fn forward(AxumState(proxy): AxumState<ProxyState>, request: Request<Body>) -> Response {
    match forward_inner(proxy, request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("forwarding failed: {err:#}");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

fn is_hop_by_hop(name: &axum::http::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
    )
}

async fn forward_inner(
    proxy: ProxyState,
    request: Request<Body>,
) -> anyhow::Result<Response> {
    let (parts, body) = request.into_parts();
    tracing::info!("{} {}", parts.method, parts.uri);

    let mut target = proxy.dst.clone();
    target.set_path(parts.uri.path());
    target.set_query(parts.uri.query());

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())?;
    let mut outgoing = proxy.http.request(method, target);

    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if name == HOST {
            // The destination's own host goes out unless the caller
            // asked to preserve the proxy-facing one.
            if !proxy.override_host {
                outgoing = outgoing.header(name, value);
            }
            continue;
        }
        outgoing = outgoing.header(name, value);
    }

    let body = axum::body::to_bytes(body, usize::MAX).await?;
    let upstream = outgoing.body(body).send().await?;

    let mut response = Response::builder().status(upstream.status().as_u16());
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }
    let bytes = upstream.bytes().await?;
    Ok(response.body(Body::from(bytes))?)
}
