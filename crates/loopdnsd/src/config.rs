use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

/// Flat server configuration, loaded from a YAML file.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The zone this server is authoritative for, e.g. `dyn.direct`.
    pub root_domain: String,

    /// Host name the API is reached at; redirect targets point here.
    #[serde(default)]
    pub api_host: Option<String>,

    #[serde(default = "Config::default_listen_http")]
    pub api_listen_http: String,

    /// When set, the API is served over TLS on this address and the
    /// HTTP address only redirects.
    #[serde(default)]
    pub api_listen_https: Option<String>,

    /// Trust the rightmost X-Forwarded-For hop for client addresses.
    #[serde(default)]
    pub api_behind_proxy: bool,

    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,

    /// Manage the API host certificate through ACME instead of
    /// `tls_cert`/`tls_key`.
    #[serde(default)]
    pub acme_enabled: bool,
    #[serde(default)]
    pub acme_contact: Option<String>,

    /// Fixed answers for the apex (`"@"`) and infrastructure labels.
    #[serde(default)]
    pub static_records: HashMap<String, StaticRecord>,

    /// Secret the per-subdomain tokens are derived from. Rotating it
    /// invalidates every outstanding token.
    pub token_key: String,

    #[serde(default)]
    pub store: StoreKind,

    #[serde(default)]
    pub redis_addr: Option<String>,
    #[serde(default)]
    pub redis_user: Option<String>,
    #[serde(default)]
    pub redis_pass: Option<String>,
    #[serde(default)]
    pub redis_db: i64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StaticRecord {
    #[serde(rename = "A", default)]
    pub a: Vec<Ipv4Addr>,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Mem,
    Redis,
}

impl Config {
    fn default_listen_http() -> String {
        "0.0.0.0:80".to_string()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.root_domain = config
            .root_domain
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if config.root_domain.is_empty() {
            anyhow::bail!("root_domain must not be empty");
        }

        Ok(config)
    }

    /// The host clients are redirected to; defaults to the root domain
    /// when not configured explicitly.
    pub fn api_host(&self) -> &str {
        self.api_host.as_deref().unwrap_or(&self.root_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let config: Config = serde_yaml::from_str(
            r#"
root_domain: Dyn.Direct.
token_key: s3cret
"#,
        )
        .unwrap();
        assert_eq!(config.api_listen_http, "0.0.0.0:80");
        assert_eq!(config.store, StoreKind::Mem);
        assert!(!config.api_behind_proxy);
    }

    #[test]
    fn static_records_parse() {
        let config: Config = serde_yaml::from_str(
            r#"
root_domain: dyn.direct
token_key: s3cret
store: redis
redis_addr: 127.0.0.1:6379
static_records:
  "@":
    A: ["203.0.113.9"]
  www:
    A: ["203.0.113.9", "203.0.113.10"]
"#,
        )
        .unwrap();
        assert_eq!(config.store, StoreKind::Redis);
        assert_eq!(config.static_records["@"].a, vec![Ipv4Addr::new(203, 0, 113, 9)]);
        assert_eq!(config.static_records["www"].a.len(), 2);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = serde_yaml::from_str::<Config>(
            r#"
root_domain: dyn.direct
token_key: s3cret
no_such_key: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no_such_key"));
    }
}
