//! Signature and claim verification of bearer tokens.
//!
//! Verification runs in a fixed order and stops at the first failure:
//!
//! 1. Decode the token and look up the signing key by the header's `kid`.
//! 2. Check that the header's `alg` is allowed and fits the key.
//! 3. Verify the signature over `<header>.<payload>`.
//! 4. Validate `exp`, `nbf`, `iss` and `aud`.
//!
//! Only after all of these pass do the claims become readable as [`Claims`].

use std::time::Duration;

use http::StatusCode;
use jsonwebtoken::{
    errors::ErrorKind,
    jwk::{AlgorithmParameters, Jwk, KeyAlgorithm, PublicKeyUse},
    Algorithm, DecodingKey,
};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::{
    claims::{numeric_date, Audience},
    decoder::{self, UnverifiedToken},
    error::{INCORRECT_CLAIMS, NO_MATCHING_KEY},
    key_source::KeySource,
    Claims, Error,
};

/// What a token has to look like to be accepted.
#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Expected `iss` claim, compared verbatim.
    pub issuer: String,
    /// Audience that must be contained in the `aud` claim.
    pub audience: String,
    /// Signature algorithms a token may use.
    pub algorithms: Vec<Algorithm>,
    /// Tolerance for clock skew when checking `exp` and `nbf`.
    pub leeway: Duration,
}

impl VerifierConfig {
    /// Accepts RS256 tokens without any clock skew tolerance.
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            algorithms: vec![Algorithm::RS256],
            leeway: Duration::ZERO,
        }
    }

    pub fn with_algorithms(mut self, algorithms: impl Into<Vec<Algorithm>>) -> Self {
        self.algorithms = algorithms.into();
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }
}

/// Verifies bearer tokens against the keys of a [`KeySource`].
///
/// A `Verifier` holds no per-request state and can be shared between any number of concurrent requests.
#[derive(Clone)]
pub struct Verifier {
    key_source: KeySource,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(key_source: impl Into<KeySource>, config: VerifierConfig) -> Self {
        Self {
            key_source: key_source.into(),
            config,
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verifies `token` and returns its claims.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<Claims, Error> {
        self.verify_at(token, jsonwebtoken::get_current_timestamp())
            .await
    }

    /// Like [`Verifier::verify`], but with `now` (seconds since the Unix epoch) as the reference time.
    pub async fn verify_at(&self, token: &str, now: u64) -> Result<Claims, Error> {
        let token = decoder::decode(token)?;

        let jwk = self.key_source.find(token.kid()).await?.ok_or_else(|| {
            tracing::debug!(target: "jwks_guard.verifier", kid = token.kid(), "no key found for kid");
            Error::invalid_header(NO_MATCHING_KEY, StatusCode::BAD_REQUEST)
        })?;

        let algorithm = token.header().alg;
        self.check_algorithm(algorithm, &jwk)?;
        verify_signature(&token, &jwk, algorithm)?;

        let claims = token.into_unverified_claims();
        validate_claims(&claims, &self.config, now)?;

        Claims::from_verified(claims)
    }

    /// Guards against algorithm confusion: the token must use an allowed algorithm that matches the key's type and,
    /// if the key is pinned to an algorithm, exactly that one. Keys published for encryption never verify tokens.
    fn check_algorithm(&self, algorithm: Algorithm, jwk: &Jwk) -> Result<(), Error> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            tracing::debug!(
                target: "jwks_guard.verifier",
                kid = jwk.common.key_id.as_deref(),
                "key is published for encryption, not signatures"
            );
            return Err(Error::unparseable_token());
        }
        if !self.config.algorithms.contains(&algorithm) {
            tracing::debug!(target: "jwks_guard.verifier", ?algorithm, "token algorithm not allowed");
            return Err(Error::unparseable_token());
        }
        if !key_type_supports(&jwk.algorithm, algorithm) {
            tracing::debug!(target: "jwks_guard.verifier", ?algorithm, "token algorithm doesn't fit key type");
            return Err(Error::unparseable_token());
        }
        if let Some(key_algorithm) = &jwk.common.key_algorithm {
            if !key_algorithm_matches(key_algorithm, algorithm) {
                tracing::debug!(
                    target: "jwks_guard.verifier",
                    ?algorithm,
                    ?key_algorithm,
                    "token algorithm doesn't match key algorithm"
                );
                return Err(Error::unparseable_token());
            }
        }
        Ok(())
    }
}

fn verify_signature(token: &UnverifiedToken, jwk: &Jwk, algorithm: Algorithm) -> Result<(), Error> {
    let decoding_key = decoding_key(jwk)?;
    let verified = jsonwebtoken::crypto::verify(
        token.encoded_signature(),
        token.signing_input().as_bytes(),
        &decoding_key,
        algorithm,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::Crypto(_) => {
            tracing::error!(target: "jwks_guard.verifier", error = %e, "signature verification failed unexpectedly");
            Error::Internal(format!("signature verification failed: {e}"))
        }
        _ => {
            tracing::debug!(target: "jwks_guard.verifier", error = %e, "unable to verify signature");
            Error::unparseable_token()
        }
    })?;

    if verified {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// Reconstructs the public key from the JWK's key material.
fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, Error> {
    let decoding_key = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x),
        AlgorithmParameters::OctetKey(_) => return Err(Error::unparseable_token()),
    };
    decoding_key.map_err(|e| {
        tracing::warn!(
            target: "jwks_guard.verifier",
            kid = jwk.common.key_id.as_deref(),
            error = %e,
            "JWK holds invalid key material"
        );
        Error::unparseable_token()
    })
}

/// Symmetric keys are never accepted, a key directory only publishes public keys.
fn key_type_supports(parameters: &AlgorithmParameters, algorithm: Algorithm) -> bool {
    use Algorithm::*;
    match parameters {
        AlgorithmParameters::RSA(_) => {
            matches!(algorithm, RS256 | RS384 | RS512 | PS256 | PS384 | PS512)
        }
        AlgorithmParameters::EllipticCurve(_) => matches!(algorithm, ES256 | ES384),
        AlgorithmParameters::OctetKeyPair(_) => matches!(algorithm, EdDSA),
        AlgorithmParameters::OctetKey(_) => false,
    }
}

fn key_algorithm_matches(key_algorithm: &KeyAlgorithm, algorithm: Algorithm) -> bool {
    matches!(
        (key_algorithm, algorithm),
        (KeyAlgorithm::RS256, Algorithm::RS256)
            | (KeyAlgorithm::RS384, Algorithm::RS384)
            | (KeyAlgorithm::RS512, Algorithm::RS512)
            | (KeyAlgorithm::PS256, Algorithm::PS256)
            | (KeyAlgorithm::PS384, Algorithm::PS384)
            | (KeyAlgorithm::PS512, Algorithm::PS512)
            | (KeyAlgorithm::ES256, Algorithm::ES256)
            | (KeyAlgorithm::ES384, Algorithm::ES384)
            | (KeyAlgorithm::EdDSA, Algorithm::EdDSA)
    )
}

/// Validates the registered claims of a token whose signature has already been verified.
fn validate_claims(
    claims: &Map<String, Value>,
    config: &VerifierConfig,
    now: u64,
) -> Result<(), Error> {
    let leeway = config.leeway.as_secs();

    let exp = claims
        .get("exp")
        .and_then(numeric_date)
        .ok_or_else(|| incorrect_claims("exp missing or not a number"))?;
    if exp.saturating_add(leeway) <= now {
        tracing::debug!(target: "jwks_guard.verifier", exp, now, "token expired");
        return Err(Error::TokenExpired);
    }

    if let Some(nbf) = claims.get("nbf") {
        let nbf = numeric_date(nbf)
            .ok_or_else(|| incorrect_claims("nbf not a number"))?;
        if nbf > now.saturating_add(leeway) {
            return Err(incorrect_claims("token not yet valid"));
        }
    }

    match claims.get("iss").and_then(Value::as_str) {
        Some(issuer) if issuer == config.issuer => {}
        _ => return Err(incorrect_claims("issuer mismatch")),
    }

    let audience: Option<Audience> = claims
        .get("aud")
        .and_then(|aud| serde_json::from_value(aud.clone()).ok());
    match audience {
        Some(audience) if audience.contains(&config.audience) => {}
        _ => return Err(incorrect_claims("audience mismatch")),
    }

    Ok(())
}

fn incorrect_claims(reason: &'static str) -> Error {
    tracing::debug!(target: "jwks_guard.verifier", reason, "claim validation failed");
    Error::invalid_claims(INCORRECT_CLAIMS, StatusCode::UNAUTHORIZED)
}
