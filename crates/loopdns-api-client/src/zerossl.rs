use crate::Error;
use data_encoding::BASE64URL_NOPAD;
use instant_acme::ExternalAccountKey;
use serde::Deserialize;

pub(crate) const ZERO_SSL_DIRECTORY: &str = "https://acme.zerossl.com/v2/DV90";
const ACCOUNT_ENDPOINT: &str = "https://api.zerossl.com/acme/eab-credentials-email";

#[derive(Deserialize)]
struct EabCredentialsResponse {
    success: bool,
    #[serde(default)]
    eab_kid: String,
    #[serde(default)]
    eab_hmac_key: String,
}

/// Fetch external-account-binding credentials for `email` from
/// ZeroSSL's registration endpoint.
pub(crate) async fn generate_eab_credentials(
    http: &reqwest::Client,
    email: &str,
) -> Result<ExternalAccountKey, Error> {
    let response = http
        .post(ACCOUNT_ENDPOINT)
        .form(&[("email", email)])
        .send()
        .await?;

    if !response.status().is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::AccountCreation(format!(
            "unexpected response: {body}"
        )));
    }

    let credentials: EabCredentialsResponse = response.json().await?;
    if !credentials.success {
        return Err(Error::AccountCreation("unknown failure".to_string()));
    }

    let hmac = BASE64URL_NOPAD
        .decode(credentials.eab_hmac_key.trim_end_matches('=').as_bytes())
        .map_err(|err| Error::AccountCreation(format!("undecodable hmac key: {err}")))?;

    Ok(ExternalAccountKey::new(credentials.eab_kid, &hmac))
}
