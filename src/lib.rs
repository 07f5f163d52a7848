//! Bearer token authentication and permission enforcement for [`axum`](https://docs.rs/axum), backed by the JSON Web
//! Key Set (JWKS) of an OpenID Connect provider or OAuth2 authorization server.
//!
//! ## Overview
//!
//! Every protected request goes through the same steps:
//!
//! 1. The bearer token is taken from the `Authorization` header.
//! 2. The token is decoded and the signing key is looked up by its key ID (`kid`) in the issuer's JWK set, fetched from
//!    `{issuer}/.well-known/jwks.json`.
//! 3. The signature is verified and the `exp`, `iss` and `aud` claims are validated.
//! 4. If the route requires a permission, the token's `permissions` claim has to contain it.
//!
//! Only then is the request passed on, with the verified [`Claims`] available as an extractor. Any failure is
//! answered right away with a JSON error and a status code:
//!
//! | code                        | status      | cause                                                          |
//! |-----------------------------|-------------|----------------------------------------------------------------|
//! | `invalid_header`            | 400 / 401   | missing or malformed `Authorization` header, unknown key, unparseable token |
//! | `invalid_signature`         | 401         | signature doesn't verify                                       |
//! | `token_expired`             | 401         | `exp` is in the past                                           |
//! | `invalid_claims`            | 400 / 401   | issuer or audience mismatch, no `permissions` claim            |
//! | `unauthorized`              | 403         | required permission not granted                                |
//! | `key_directory_unavailable` | 503         | the JWK set couldn't be fetched, retrying later may help       |
//! | `internal_error`            | 500         | anything else                                                  |
//!
//! ## Features
//!
//! - **Timeouts**: requests to the key directory are bounded, so an unreachable issuer can't stall requests.
//! - **Caching**: to avoid fetching the JWK set on every request, it can be cached with a configurable time-to-live.
//!   A JWT signed with a key ID that's missing from the cached set triggers a re-fetch, which picks up rotated keys.
//!   Such re-fetches happen at most once per minimum refresh interval, so made-up key IDs can't bypass the cache.
//! - **Rate Limiting**: outgoing requests for the JWK set can be rate limited to protect the key directory.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use axum::{routing::{get, post}, Router};
//! use axum_jwks_guard::{AuthConfig, AuthorizationLayer, Claims};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // AUTH_ISSUER_URL=https://your.tenant.auth0.com/ AUTH_AUDIENCE=coffeeapi AUTH_JWKS_CACHE_TTL_SECONDS=600
//!     let config = AuthConfig::from_env()?;
//!     let auth = AuthorizationLayer::new(config.build_verifier()?);
//!
//!     let router = Router::new()
//!         .route(
//!             "/drinks-detail",
//!             get(|claims: Claims| async move {
//!                 format!("Hello {}", claims.subject().unwrap_or("stranger"))
//!             })
//!             .layer(auth.with_permission("get:drinks-detail")),
//!         )
//!         .route("/drinks", post(|| async { "created" }).layer(auth.with_permission("post:drinks")));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod config;
pub mod decoder;
pub mod permissions;
pub mod verifier;

pub use authorization::{authorize_token, AuthorizationLayer, AuthorizationService};
pub use claims::{Audience, Claims};
pub use config::{AuthConfig, ConfigError, RateLimit};
pub use decoder::{decode, UnverifiedToken};
pub use error::{Error, KeyDirectoryError};
pub use key_source::KeySource;
pub use permissions::require_permission;
pub use remote_jwk_set::{RemoteJwkSet, RemoteJwkSetBuilder};
pub use verifier::{Verifier, VerifierConfig};

mod claims;
mod error;
mod jwks_cache;
mod key_source;
mod remote_jwk_set;

#[cfg(test)]
mod test_support;
