use std::sync::Arc;

use jsonwebtoken::jwk::{Jwk, JwkSet};

use crate::{remote_jwk_set::RemoteJwkSet, Error};

/// Where the verifier gets its signing keys from: a JWK set provided up front or one fetched from a key directory.
#[derive(Clone)]
pub enum KeySource {
    Local(Arc<JwkSet>),
    Remote(RemoteJwkSet),
}

impl KeySource {
    /// Looks up the key with the given key ID. `Ok(None)` means the key set was obtained but has no such key.
    pub async fn find(&self, kid: &str) -> Result<Option<Jwk>, Error> {
        match self {
            KeySource::Local(local_jwk_set) => Ok(local_jwk_set.find(kid).cloned()),
            KeySource::Remote(remote_jwk_set) => remote_jwk_set.find(kid).await,
        }
    }
}

impl From<JwkSet> for KeySource {
    fn from(jwk_set: JwkSet) -> Self {
        KeySource::Local(Arc::new(jwk_set))
    }
}

impl From<RemoteJwkSet> for KeySource {
    fn from(remote_jwk_set: RemoteJwkSet) -> Self {
        KeySource::Remote(remote_jwk_set)
    }
}
