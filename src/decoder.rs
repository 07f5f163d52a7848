//! Splits a compact JWS into its parts without trusting any of them.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use http::StatusCode;
use jsonwebtoken::Header;
use serde_json::{Map, Value};

use crate::error::{Error, AUTHORIZATION_MALFORMED};

/// Tokens larger than this are rejected before any decoding happens.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// A token that has been split and parsed, but not verified.
///
/// The claims are not accessible here. They only become readable as [`crate::Claims`] once
/// [`crate::Verifier`] has checked the signature and validated them.
pub struct UnverifiedToken {
    header: Header,
    kid: String,
    claims: Map<String, Value>,
    signing_input: String,
    encoded_signature: String,
    signature: Vec<u8>,
}

impl UnverifiedToken {
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The key ID from the header. Always present, tokens without one are rejected while decoding.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Raw signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The `<header>.<payload>` part the signature was computed over.
    pub(crate) fn signing_input(&self) -> &str {
        &self.signing_input
    }

    pub(crate) fn encoded_signature(&self) -> &str {
        &self.encoded_signature
    }

    pub(crate) fn into_unverified_claims(self) -> Map<String, Value> {
        self.claims
    }
}

impl fmt::Debug for UnverifiedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnverifiedToken")
            .field("header", &self.header)
            .field("claims", &"[UNVERIFIED]")
            .finish_non_exhaustive()
    }
}

/// Decodes a compact `<header>.<payload>.<signature>` token.
///
/// Fails with a 401 `invalid_header` if the token doesn't have exactly three segments or its header carries no
/// `kid`, and with a 400 `invalid_header` if any segment isn't valid base64url or the JSON segments don't parse.
pub fn decode(token: &str) -> Result<UnverifiedToken, Error> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        return Err(malformed());
    }

    let mut segments = token.split('.');
    let (Some(header_segment), Some(payload_segment), Some(signature_segment), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(malformed());
    };

    let header: Header = decode_json(header_segment)?;
    let claims: Map<String, Value> = decode_json(payload_segment)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature_segment)
        .map_err(|_| Error::unparseable_token())?;

    let kid = header.kid.clone().ok_or_else(malformed)?;

    Ok(UnverifiedToken {
        header,
        kid,
        claims,
        signing_input: format!("{header_segment}.{payload_segment}"),
        encoded_signature: signature_segment.to_string(),
        signature,
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, Error> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| Error::unparseable_token())?;
    serde_json::from_slice(&bytes).map_err(|_| Error::unparseable_token())
}

fn malformed() -> Error {
    Error::invalid_header(AUTHORIZATION_MALFORMED, StatusCode::UNAUTHORIZED)
}
