use crate::lifecycle::ShutdownSubscription;
use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Certificates are reissued once they are this old. Let's Encrypt
/// certs live 90 days, so this leaves a 30 day margin for retries.
const RENEW_AFTER: Duration = Duration::from_secs(60 * 24 * 60 * 60);

const RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Serialize, Deserialize)]
struct CertMeta {
    issued_at: u64,
}

/// Obtains and renews the certificate for the API host itself via
/// HTTP-01, keeping everything under `cache/`. The challenge responses
/// are served by the plain-HTTP redirect listener.
pub struct AcmeManager {
    api_host: String,
    contact: Option<String>,
    cache_dir: PathBuf,
    http01: Mutex<HashMap<String, String>>,
}

impl AcmeManager {
    pub fn new(api_host: String, contact: Option<String>, cache_dir: PathBuf) -> Self {
        Self {
            api_host,
            contact,
            cache_dir,
            http01: Mutex::new(HashMap::new()),
        }
    }

    /// The key authorization for an HTTP-01 token currently in flight.
    pub fn http01_response(&self, token: &str) -> Option<String> {
        self.http01.lock().get(token).cloned()
    }

    fn cert_path(&self) -> PathBuf {
        self.cache_dir.join("api-cert.pem")
    }

    fn key_path(&self) -> PathBuf {
        self.cache_dir.join("api-key.pem")
    }

    fn meta_path(&self) -> PathBuf {
        self.cache_dir.join("cert-meta.json")
    }

    fn account_path(&self) -> PathBuf {
        self.cache_dir.join("acme-account.json")
    }

    /// TLS material to start serving with: the cached certificate if
    /// there is one (renewal catches up with staleness), otherwise a
    /// self-signed placeholder so the listeners can come up at all.
    pub async fn initial_tls_config(&self) -> anyhow::Result<RustlsConfig> {
        if self.cert_path().exists() && self.key_path().exists() {
            return RustlsConfig::from_pem_file(self.cert_path(), self.key_path())
                .await
                .context("loading cached api certificate");
        }

        let config = crate::tls_helpers::make_server_config(&self.api_host, &None, &None).await?;
        Ok(RustlsConfig::from_config(config))
    }

    async fn account(&self) -> anyhow::Result<Account> {
        match tokio::fs::read(self.account_path()).await {
            Ok(data) => {
                let credentials: AccountCredentials =
                    serde_json::from_slice(&data).context("parsing cached acme account")?;
                Account::builder()?
                    .from_credentials(credentials)
                    .await
                    .context("restoring acme account")
            }
            Err(_) => {
                let contact: Vec<String> = self
                    .contact
                    .iter()
                    .map(|email| format!("mailto:{email}"))
                    .collect();
                let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &contact,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        LETS_ENCRYPT_PRODUCTION.to_string(),
                        None,
                    )
                    .await
                    .context("creating acme account")?;

                write_atomic(&self.account_path(), &serde_json::to_vec(&credentials)?)?;
                Ok(account)
            }
        }
    }

    fn cert_age(&self) -> Option<Duration> {
        let data = std::fs::read(self.meta_path()).ok()?;
        let meta: CertMeta = serde_json::from_slice(&data).ok()?;
        let issued = UNIX_EPOCH + Duration::from_secs(meta.issued_at);
        SystemTime::now().duration_since(issued).ok()
    }

    /// Order a fresh certificate if the cached one is missing or due,
    /// and swap it into the running listeners.
    pub async fn ensure_certificate(&self, tls: &RustlsConfig) -> anyhow::Result<()> {
        if self.cert_path().exists() {
            if let Some(age) = self.cert_age() {
                if age < RENEW_AFTER {
                    return Ok(());
                }
            }
        }

        tracing::info!("ordering certificate for {}", self.api_host);
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(self.api_host.clone())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .context("creating acme order")?;

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.context("fetching authorization")?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => anyhow::bail!("unexpected authorization status {status:?}"),
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .context("no http-01 challenge offered")?;
                let key_auth = challenge.key_authorization().as_str().to_string();
                self.http01.lock().insert(challenge.token.clone(), key_auth);
                challenge.set_ready().await.context("challenge ready")?;
            }
        }

        let result = self.finish_order(&mut order, tls).await;
        self.http01.lock().clear();
        result
    }

    async fn finish_order(
        &self,
        order: &mut instant_acme::Order,
        tls: &RustlsConfig,
    ) -> anyhow::Result<()> {
        let status = order
            .poll_ready(&RetryPolicy::default())
            .await
            .context("waiting for order")?;
        if status != OrderStatus::Ready {
            anyhow::bail!("acme order ended in status {status:?}");
        }

        let key_pem = order.finalize().await.context("finalizing order")?;
        let cert_pem = order
            .poll_certificate(&RetryPolicy::default())
            .await
            .context("downloading certificate")?;

        write_atomic(&self.cert_path(), cert_pem.as_bytes())?;
        write_atomic(&self.key_path(), key_pem.as_bytes())?;
        let meta = CertMeta {
            issued_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        write_atomic(&self.meta_path(), &serde_json::to_vec(&meta)?)?;

        tls.reload_from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
            .await
            .context("installing renewed certificate")?;
        tracing::info!("installed certificate for {}", self.api_host);
        Ok(())
    }

    /// Keep the API host certificate fresh until shutdown. Failures are
    /// logged and retried on the next cycle; serving continues on the
    /// previous (or placeholder) certificate meanwhile.
    pub async fn run_renewal(
        self: Arc<Self>,
        tls: RustlsConfig,
        mut shutdown: ShutdownSubscription,
    ) {
        loop {
            if let Err(err) = self.ensure_certificate(&tls).await {
                tracing::error!("certificate maintenance failed: {err:#}");
            }

            tokio::select! {
                _ = tokio::time::sleep(RENEW_CHECK_INTERVAL) => {}
                _ = shutdown.shutting_down() => {
                    tracing::debug!("certificate renewal stopping");
                    return;
                }
            }
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let dir = path.parent().context("path has no parent directory")?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http01_responses_only_for_known_tokens() {
        let manager = AcmeManager::new(
            "v1.dyn.direct".to_string(),
            None,
            tempfile::tempdir().unwrap().path().to_path_buf(),
        );
        manager
            .http01
            .lock()
            .insert("tok".to_string(), "tok.auth".to_string());
        assert_eq!(manager.http01_response("tok").as_deref(), Some("tok.auth"));
        assert_eq!(manager.http01_response("other"), None);
    }

    #[test]
    fn cert_age_tracks_meta_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            AcmeManager::new("v1.dyn.direct".to_string(), None, dir.path().to_path_buf());
        assert!(manager.cert_age().is_none());

        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - 3600;
        write_atomic(
            &manager.meta_path(),
            &serde_json::to_vec(&CertMeta { issued_at: issued }).unwrap(),
        )
        .unwrap();

        let age = manager.cert_age().unwrap();
        assert!(age >= Duration::from_secs(3600));
        assert!(age < Duration::from_secs(3700));
    }
}
