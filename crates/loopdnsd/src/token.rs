use sha2::{Digest, Sha512};
use uuid::Uuid;

/// Derives and checks the bearer tokens that bind a subdomain id to the
/// server secret. Tokens are pure functions of `(secret, id)`, so no
/// issued subdomain ever needs to be stored.
#[derive(Clone)]
pub struct TokenAuthority {
    /// SHA-512 of the configured secret, computed once. Immutable from
    /// here on; every mint hashes into a fresh buffer.
    secret_hash: [u8; 64],
}

impl TokenAuthority {
    pub fn new(token_key: &[u8]) -> Self {
        Self {
            secret_hash: Sha512::digest(token_key).into(),
        }
    }

    /// The token for `id`: `hex(sha512(sha512(secret) || id))`.
    pub fn mint(&self, id: Uuid) -> String {
        let mut hasher = Sha512::new();
        hasher.update(self.secret_hash);
        hasher.update(id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Constant-time check of a presented token against the expected one.
    pub fn verify(&self, id: Uuid, presented: &str) -> bool {
        let expected = self.mint(id);
        ring::constant_time::verify_slices_are_equal(expected.as_bytes(), presented.as_bytes())
            .is_ok()
    }
}
