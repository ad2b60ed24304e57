use crate::{Client, Error, SubdomainAcmeChallenge};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use std::time::Duration;
use uuid::Uuid;

const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Certificate authorities the wildcard flow knows how to register
/// with. ZeroSSL requires external-account credentials, which are
/// fetched on the fly for a throwaway address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeDirectory {
    LetsEncrypt,
    LetsEncryptStaging,
    ZeroSsl,
}

#[derive(Debug, Clone)]
pub struct AcquireCertificateRequest {
    /// Subdomain the certificate is for.
    pub id: Uuid,
    /// The issued zone, `<id>.<root-domain>`; the certificate covers
    /// `*.<domain>`.
    pub domain: String,
    /// Bearer token bound to `id`.
    pub token: String,
    pub directory: AcmeDirectory,
    /// Wall-clock bound on the whole flow, account creation included.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CertificateResponse {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Presents DNS-01 challenge values for one subdomain by submitting
/// them to the issuing server, which serves them at
/// `_acme-challenge.<id>.<root-domain>` within seconds.
///
/// There is nothing to clean up afterwards: entries expire out of the
/// server's challenge store on their own.
pub struct DnsChallengePresenter<'a> {
    client: &'a Client,
    id: Uuid,
    token: String,
}

impl<'a> DnsChallengePresenter<'a> {
    pub(crate) fn new(client: &'a Client, id: Uuid, token: String) -> Self {
        Self { client, id, token }
    }

    pub async fn present(&self, value: &str) -> Result<(), Error> {
        self.client
            .set_subdomain_acme_challenge(SubdomainAcmeChallenge {
                id: self.id,
                token: self.token.clone(),
                values: vec![value.to_string()],
            })
            .await
    }
}

impl Client {
    /// Obtain a wildcard certificate for `*.<domain>` by driving an
    /// ACME DNS-01 order through this server's challenge plumbing.
    ///
    /// Propagation is not polled locally: split-horizon resolvers make
    /// that check a liar, so the values are submitted and the CA's own
    /// retries are relied on.
    pub async fn acquire_certificate(
        &self,
        request: AcquireCertificateRequest,
    ) -> Result<CertificateResponse, Error> {
        let timeout = request.timeout;
        tokio::time::timeout(timeout, self.acquire_certificate_inner(request))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn acquire_certificate_inner(
        &self,
        request: AcquireCertificateRequest,
    ) -> Result<CertificateResponse, Error> {
        let (directory_url, external_account) = match request.directory {
            AcmeDirectory::LetsEncrypt => (LETS_ENCRYPT_PRODUCTION, None),
            AcmeDirectory::LetsEncryptStaging => (LETS_ENCRYPT_STAGING, None),
            AcmeDirectory::ZeroSsl => {
                // The address only needs to be syntactically valid;
                // nothing is ever sent to it.
                let email = format!("{}@{}.com", Uuid::new_v4(), Uuid::new_v4());
                let key = crate::zerossl::generate_eab_credentials(&self.http, &email).await?;
                (crate::zerossl::ZERO_SSL_DIRECTORY, Some(key))
            }
        };

        let (account, _credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url.to_string(),
                external_account.as_ref(),
            )
            .await?;

        let wildcard = format!("*.{}", request.domain);
        let identifiers = [Identifier::Dns(wildcard.clone())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let presenter = self.dns_challenge_presenter(request.id, request.token.clone());

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(Error::OrderFailed(format!(
                            "unexpected authorization status {status:?}"
                        )))
                    }
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Dns01)
                    .ok_or_else(|| Error::NoDnsChallenge(wildcard.clone()))?;

                let value = challenge.key_authorization().dns_value();
                tracing::debug!("presenting dns-01 value for {wildcard}");
                presenter.present(&value).await?;
                challenge.set_ready().await?;
            }
        }

        let retry = RetryPolicy::default();
        let status = order.poll_ready(&retry).await?;
        if status != OrderStatus::Ready {
            return Err(Error::OrderFailed(format!("order status {status:?}")));
        }

        let private_key_pem = order.finalize().await?;
        let certificate_pem = order.poll_certificate(&retry).await?;

        Ok(CertificateResponse {
            domain: request.domain,
            certificate_pem,
            private_key_pem,
        })
    }
}
