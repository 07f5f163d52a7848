use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{
    jwk::{
        AlgorithmParameters, CommonParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
        RSAKeyParameters, RSAKeyType,
    },
    Algorithm, EncodingKey, Header,
};
use openssl::{pkey::Private, rsa::Rsa};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

pub(crate) const ISSUER: &str = "https://issuer.example.com/";
pub(crate) const AUDIENCE: &str = "image";
const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Routes the crate's logs to the test output, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn now() -> u64 {
    jsonwebtoken::get_current_timestamp()
}

/// Claims that pass verification with `VerifierConfig::new(ISSUER, AUDIENCE)`.
pub(crate) fn valid_claims() -> serde_json::Value {
    let issued_at = now();
    serde_json::json!({
        "iss": ISSUER,
        "sub": "auth0|1234567890",
        "aud": AUDIENCE,
        "iat": issued_at,
        "exp": issued_at + 3600,
        "permissions": ["get:drinks-detail", "post:drinks"],
    })
}

/// An RSA signing key with its public half published under `kid`.
pub(crate) struct TestKey {
    kid: String,
    rsa: Rsa<Private>,
}

impl TestKey {
    pub(crate) fn generate(kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            rsa: Rsa::generate(2048).unwrap(),
        }
    }

    pub(crate) fn jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(KeyAlgorithm::RS256),
                key_id: Some(self.kid.clone()),
                ..CommonParameters::default()
            },
            algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
                key_type: RSAKeyType::RSA,
                n: URL_SAFE_NO_PAD.encode(self.rsa.n().to_vec()),
                e: URL_SAFE_NO_PAD.encode(self.rsa.e().to_vec()),
            }),
        }
    }

    /// Signs `claims` with RS256 and this key's `kid`.
    pub(crate) fn sign(&self, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        self.sign_with_header(&header, claims)
    }

    pub(crate) fn sign_with_header(&self, header: &Header, claims: &serde_json::Value) -> String {
        let encoding_key = EncodingKey::from_rsa_der(&self.rsa.private_key_to_der().unwrap());
        jsonwebtoken::encode(header, claims, &encoding_key).unwrap()
    }
}

fn jwk_set(keys: &[&TestKey]) -> JwkSet {
    JwkSet {
        keys: keys.iter().map(|key| key.jwk()).collect(),
    }
}

/// Key directory serving a JWK set at `/.well-known/jwks.json`.
pub(crate) struct MockAuthServer {
    inner_server: MockServer,
    issuer_url: Url,
}

impl MockAuthServer {
    pub(crate) async fn start(keys: &[&TestKey]) -> Self {
        init_tracing();
        let inner_server = MockServer::start().await;
        let issuer_url = Url::parse(&format!("{}/", inner_server.uri())).unwrap();
        let server = Self {
            inner_server,
            issuer_url,
        };
        server.serve_keys(keys).await;
        server
    }

    pub(crate) fn issuer_url(&self) -> &Url {
        &self.issuer_url
    }

    /// Replaces the published keys.
    pub(crate) async fn rotate_keys(&self, keys: &[&TestKey]) {
        self.inner_server.reset().await;
        self.serve_keys(keys).await;
    }

    /// Makes the key directory answer with `status` from now on.
    pub(crate) async fn fail_with(&self, status: u16) {
        self.inner_server.reset().await;
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.inner_server)
            .await;
    }

    pub(crate) async fn jwks_request_count(&self) -> usize {
        self.inner_server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == JWKS_PATH)
            .count()
    }

    async fn serve_keys(&self, keys: &[&TestKey]) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwk_set(keys)))
            .mount(&self.inner_server)
            .await;
    }
}
