use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Certificates are reissued once they are this old.
const REISSUE_AFTER: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// The subdomain, token and certificate material this machine holds,
/// persisted across runs in the user's config directory.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct State {
    #[serde(default)]
    pub id: Option<Uuid>,

    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub token: String,

    #[serde(rename = "cert", default)]
    pub certificate: String,

    #[serde(rename = "cert_private_key", default)]
    pub private_key: String,

    /// Unix timestamp of certificate issuance.
    #[serde(rename = "issue_date", default)]
    pub issued_at: u64,
}

impl State {
    pub fn has_domain(&self) -> bool {
        self.id.is_some() && !self.domain.is_empty() && !self.token.is_empty()
    }

    pub fn has_fresh_certificate(&self) -> bool {
        if self.certificate.is_empty() || self.private_key.is_empty() {
            return false;
        }
        let issued = UNIX_EPOCH + Duration::from_secs(self.issued_at);
        match SystemTime::now().duration_since(issued) {
            Ok(age) => age < REISSUE_AFTER,
            Err(_) => false,
        }
    }
}

fn state_path() -> anyhow::Result<PathBuf> {
    let config_dir = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(config_dir.join("loopdns").join("state.json"))
}

pub fn load() -> anyhow::Result<State> {
    let path = state_path()?;
    match std::fs::read(&path) {
        Ok(data) if !data.is_empty() => serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", path.display())),
        Ok(_) => Ok(State::default()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(State::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub fn save(state: &State) -> anyhow::Result<()> {
    let path = state_path()?;
    let dir = path.parent().context("state path has no parent")?;
    std::fs::create_dir_all(dir)?;
    let encoded = serde_json::to_vec_pretty(state)?;
    std::fs::write(&path, encoded).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let state = State {
            id: Some(Uuid::new_v4()),
            domain: "abc.dyn.direct".to_string(),
            token: "feed".to_string(),
            certificate: "---".to_string(),
            private_key: "---".to_string(),
            issued_at: 1_700_000_000,
        };
        let encoded = serde_json::to_string(&state).unwrap();
        assert!(encoded.contains("\"cert\""));
        assert!(encoded.contains("\"issue_date\""));
        let decoded: State = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.domain, state.domain);
        assert_eq!(decoded.id, state.id);
    }

    #[test]
    fn empty_state_is_not_usable() {
        let state = State::default();
        assert!(!state.has_domain());
        assert!(!state.has_fresh_certificate());
    }

    #[test]
    fn old_certificates_are_stale() {
        let state = State {
            certificate: "---".to_string(),
            private_key: "---".to_string(),
            issued_at: 0,
            ..State::default()
        };
        assert!(!state.has_fresh_certificate());

        let recent = State {
            issued_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            ..state
        };
        assert!(recent.has_fresh_certificate());
    }
}
