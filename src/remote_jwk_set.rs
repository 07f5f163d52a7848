use std::{
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use reqwest::Client;
use tower::{
    buffer::BufferLayer, timeout::Timeout, util::BoxCloneSyncService, Layer, Service, ServiceBuilder,
    ServiceExt,
};
use tower_layer::layer_fn;
use tracing::instrument;
use url::Url;

use crate::{error::KeyDirectoryError, jwks_cache::JwksCacheLayer, Error};

/// Well-known location of an issuer's JWK set, relative to the issuer URL.
pub const JWKS_ENDPOINT: &str = ".well-known/jwks.json";

/// Default upper bound for a single JWK set request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default minimum time between two refreshes forced by unknown key IDs.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a fetch may be answered from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FetchPolicy {
    PreferCached,
    Refresh,
}

struct CacheConfig {
    time_to_live: Duration,
}

struct RateLimitConfig {
    num: u64,
    per: Duration,
}

/// Builder for configuring a `RemoteJwkSet` with a request timeout, optional caching and rate limiting.
pub struct RemoteJwkSetBuilder {
    url: Url,
    timeout: Duration,
    cache_config: Option<CacheConfig>,
    min_refresh_interval: Duration,
    rate_limit_config: Option<RateLimitConfig>,
}

impl RemoteJwkSetBuilder {
    /// Creates a new builder with the given JWKS URL.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            timeout: DEFAULT_TIMEOUT,
            cache_config: None,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            rate_limit_config: None,
        }
    }

    /// Bounds how long a single request to the key directory may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables caching to avoid re-fetching the remote JWK set on every authentication request.
    ///
    /// Keys removed from the remote set keep verifying until the cached copy expires.
    pub fn with_cache(mut self, time_to_live: Duration) -> Self {
        self.cache_config = Some(CacheConfig { time_to_live });
        self
    }

    /// Sets how often an unknown key ID may force the cached JWK set to be re-fetched. Within the interval, unknown
    /// key IDs are looked up in the cached set only.
    ///
    /// Has no effect unless caching is enabled.
    pub fn with_min_refresh_interval(mut self, min_refresh_interval: Duration) -> Self {
        self.min_refresh_interval = min_refresh_interval;
        self
    }

    /// Limits outgoing requests to the key directory to `num` per `per`.
    ///
    /// Requests beyond the limit wait for the next window instead of failing, but no longer than the request timeout
    /// in total.
    pub fn with_rate_limit(mut self, num: u64, per: Duration) -> Self {
        self.rate_limit_config = Some(RateLimitConfig { num, per });
        self
    }

    /// Builds the `RemoteJwkSet` with the configured options.
    ///
    /// When rate limiting is enabled this spawns a background task and must be called from within a Tokio runtime.
    pub fn build(self) -> Result<RemoteJwkSet, Error> {
        let http_client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(KeyDirectoryError::from)?;
        let request_service = JwkSetRequestService {
            http_client,
            url: self.url,
        };

        let min_refresh_interval = self.min_refresh_interval;
        let refresh_gate = self
            .cache_config
            .as_ref()
            .map(|_| Arc::new(RefreshGate::new(min_refresh_interval)));
        let cache_layer = self
            .cache_config
            .map(|cache_config| JwksCacheLayer::new(cache_config.time_to_live));

        let timeout = self.timeout;
        let rate_limit_layer = self.rate_limit_config.map(|rate_limit_config| {
            layer_fn(move |inner: JwkSetRequestService| {
                let rate_limit =
                    tower::limit::RateLimitLayer::new(rate_limit_config.num, rate_limit_config.per);
                let rate_limited_service = rate_limit.layer(inner);

                // Wrap the rate limited service in another buffer service to make it `Clone`.
                let buffered_service = BufferLayer::<FetchPolicy>::new(1024).layer(rate_limited_service);

                // Waiting in the buffer counts against the timeout, too.
                let bounded_service = Timeout::new(buffered_service, timeout);

                // Finally, map any errors back to our own error type.
                bounded_service.map_err(Error::from_box_error)
            })
        });

        let service_tower = ServiceBuilder::new()
            .option_layer(cache_layer)
            .option_layer(rate_limit_layer)
            .service(request_service);

        Ok(RemoteJwkSet {
            service_tower: BoxCloneSyncService::new(service_tower),
            refresh_gate,
        })
    }
}

/// A JWK set served by a remote key directory.
///
/// Cloning is cheap, clones share the cache and the rate limit.
#[derive(Clone)]
pub struct RemoteJwkSet {
    service_tower: BoxCloneSyncService<FetchPolicy, Arc<JwkSet>, Error>,
    refresh_gate: Option<Arc<RefreshGate>>,
}

impl RemoteJwkSet {
    /// Creates a builder for configuring a `RemoteJwkSet`.
    pub fn builder(url: Url) -> RemoteJwkSetBuilder {
        RemoteJwkSetBuilder::new(url)
    }

    /// Creates a builder targeting the issuer's `/.well-known/jwks.json`.
    pub fn for_issuer(issuer_url: &Url) -> Result<RemoteJwkSetBuilder, Error> {
        let jwks_url = jwks_url(issuer_url)?;
        Ok(RemoteJwkSetBuilder::new(jwks_url))
    }

    /// Fetches the JWK set, from the cache if caching is enabled and the cached copy is still fresh.
    #[instrument(skip_all)]
    pub async fn fetch_key_set(&self) -> Result<Arc<JwkSet>, Error> {
        self.fetch(FetchPolicy::PreferCached).await
    }

    /// Finds the key with the given key ID.
    ///
    /// A cached key set that doesn't know the key ID is re-fetched once, so rotated-in keys are picked up before the
    /// cached copy expires. Such refreshes happen at most once per minimum refresh interval.
    #[instrument(skip(self))]
    pub async fn find(&self, kid: &str) -> Result<Option<Jwk>, Error> {
        let jwk_set = self.fetch(FetchPolicy::PreferCached).await?;
        if let Some(jwk) = jwk_set.find(kid) {
            return Ok(Some(jwk.clone()));
        }
        let Some(refresh_gate) = &self.refresh_gate else {
            return Ok(None);
        };
        if !refresh_gate.try_begin() {
            tracing::debug!(target: "jwks_guard.jwks", kid, "kid not in cached JWK set, refreshed too recently");
            return Ok(None);
        }

        tracing::debug!(target: "jwks_guard.jwks", kid, "kid not in cached JWK set, refreshing");
        let jwk_set = self.fetch(FetchPolicy::Refresh).await?;
        Ok(jwk_set.find(kid).cloned())
    }

    async fn fetch(&self, policy: FetchPolicy) -> Result<Arc<JwkSet>, Error> {
        self.service_tower.clone().oneshot(policy).await
    }
}

/// Allows one forced refresh per interval, shared by all clones of a `RemoteJwkSet`.
struct RefreshGate {
    min_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl RefreshGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_refresh: Mutex::new(None),
        }
    }

    /// Claims the next refresh slot. Returns `false` if the previous refresh started less than the interval ago.
    fn try_begin(&self) -> bool {
        let mut last_refresh = self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last_refresh {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                *last_refresh = Some(now);
                true
            }
        }
    }
}

/// Resolves the JWKS URL of an issuer.
///
/// The issuer URL is treated as a directory, i.e. `https://tenant.example.com/auth` and
/// `https://tenant.example.com/auth/` both resolve to `https://tenant.example.com/auth/.well-known/jwks.json`.
pub fn jwks_url(issuer_url: &Url) -> Result<Url, Error> {
    let mut base = issuer_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(JWKS_ENDPOINT)
        .map_err(|e| Error::Internal(format!("invalid issuer URL {issuer_url}: {e}")))
}

/// Helper service wrapping a `reqwest::Client` to fetch a JWK Set from a given URL.
#[derive(Clone)]
struct JwkSetRequestService {
    http_client: Client,
    url: Url,
}

impl Service<FetchPolicy> for JwkSetRequestService {
    type Response = Arc<JwkSet>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _policy: FetchPolicy) -> Self::Future {
        let http_client = self.http_client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            tracing::debug!(target: "jwks_guard.jwks", url = %url, "fetching JWK set");

            let response = http_client.get(url.clone()).send().await.map_err(|e| {
                tracing::warn!(target: "jwks_guard.jwks", url = %url, error = %e, "JWK set request failed");
                KeyDirectoryError::from(e)
            })?;

            if !response.status().is_success() {
                tracing::warn!(
                    target: "jwks_guard.jwks",
                    url = %url,
                    status = %response.status(),
                    "key directory returned an error response"
                );
                return Err(KeyDirectoryError::ErrorResponse {
                    status_code: response.status(),
                }
                .into());
            }

            let jwk_set: JwkSet = response.json().await.map_err(|e| {
                tracing::warn!(target: "jwks_guard.jwks", url = %url, error = %e, "failed to parse JWK set");
                KeyDirectoryError::from(e)
            })?;

            tracing::debug!(target: "jwks_guard.jwks", key_count = jwk_set.keys.len(), "fetched JWK set");
            Ok(Arc::new(jwk_set))
        })
    }
}
