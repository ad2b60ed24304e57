//! Typed client for the loopdns API: subdomain issuance, ACME
//! challenge submission, and wildcard certificate acquisition.
use loopdns_api_types::{AcmeChallengeRequest, ErrorResponse, OverviewResponse, SubdomainResponse};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

mod acme;
mod zerossl;

pub use acme::{
    AcmeDirectory, AcquireCertificateRequest, CertificateResponse, DnsChallengePresenter,
};
pub use ip_label::domain_for_ip;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered with its error taxonomy.
    #[error("api error: {status} {error_code} '{message}'")]
    Api {
        status: u16,
        error_code: String,
        message: String,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("acme: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("no dns-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("acme order failed: {0}")]
    OrderFailed(String),

    #[error("acme account creation failed: {0}")]
    AccountCreation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Submission of DNS-01 TXT values for an issued subdomain.
#[derive(Debug, Clone)]
pub struct SubdomainAcmeChallenge {
    pub id: Uuid,
    pub token: String,
    pub values: Vec<String>,
}

pub struct Client {
    endpoint: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(endpoint: Url) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(format!(
                "loopdns-client/{}",
                version_info::loopdns_version()
            ))
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self { endpoint, http })
    }

    pub async fn overview(&self) -> Result<OverviewResponse, Error> {
        let url = self.endpoint.join("overview")?;
        let response = self.http.request(Method::GET, url).send().await?;
        parse_response(response).await
    }

    /// Mint a fresh subdomain. The returned token is the only handle on
    /// it; it is never recoverable later.
    pub async fn request_subdomain(&self) -> Result<SubdomainResponse, Error> {
        let url = self.endpoint.join("subdomain")?;
        let response = self.http.request(Method::POST, url).send().await?;
        parse_response(response).await
    }

    pub async fn set_subdomain_acme_challenge(
        &self,
        request: SubdomainAcmeChallenge,
    ) -> Result<(), Error> {
        let url = self
            .endpoint
            .join(&format!("subdomain/{}/acme-challenge", request.id))?;
        let response = self
            .http
            .request(Method::PUT, url)
            .json(&AcmeChallengeRequest {
                token: request.token,
                values: request.values,
            })
            .send()
            .await?;
        parse_empty_response(response).await
    }

    /// A presenter bound to one subdomain, for driving DNS-01
    /// challenges through this server.
    pub fn dns_challenge_presenter(&self, id: Uuid, token: String) -> DnsChallengePresenter<'_> {
        DnsChallengePresenter::new(self, id, token)
    }
}

fn invalid_response(status: StatusCode, content_type: &str) -> Error {
    Error::Api {
        status: status.as_u16(),
        error_code: "invalid-response".to_string(),
        message: format!("unexpected content-type {content_type}"),
    }
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    let status = response.status();
    let ct = content_type(&response);
    if !ct.contains("json") {
        return Err(invalid_response(status, &ct));
    }

    if status == StatusCode::OK {
        return Ok(response.json().await?);
    }

    let error: ErrorResponse = response.json().await?;
    Err(Error::Api {
        status: status.as_u16(),
        error_code: error.error,
        message: error.message,
    })
}

async fn parse_empty_response(response: reqwest::Response) -> Result<(), Error> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(());
    }

    let ct = content_type(&response);
    if !ct.contains("json") {
        return Err(invalid_response(status, &ct));
    }

    let error: ErrorResponse = response.json().await?;
    Err(Error::Api {
        status: status.as_u16(),
        error_code: error.error,
        message: error.message,
    })
}
