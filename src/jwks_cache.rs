use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use jsonwebtoken::jwk::JwkSet;
use tower::{Layer, Service, ServiceExt};

use crate::{remote_jwk_set::FetchPolicy, Error};

/// Caches the JWK set returned by the inner service for a fixed time-to-live.
pub(crate) struct JwksCacheLayer {
    cache: moka::future::Cache<(), Arc<JwkSet>>,
}

impl JwksCacheLayer {
    pub(crate) fn new(time_to_live: Duration) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(1)
            .time_to_live(time_to_live)
            .build();
        JwksCacheLayer { cache }
    }
}

impl<S> Layer<S> for JwksCacheLayer {
    type Service = JwksCacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwksCacheService {
            inner,
            cache: self.cache.clone(),
        }
    }
}

/// Can safely be cloned and shared across threads since moka internally uses an Arc.
#[derive(Clone)]
pub(crate) struct JwksCacheService<S> {
    inner: S,
    cache: moka::future::Cache<(), Arc<JwkSet>>,
}

impl<S> Service<FetchPolicy> for JwksCacheService<S>
where
    S: Service<FetchPolicy, Response = Arc<JwkSet>, Error = Error> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Arc<JwkSet>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Cache hits never touch the inner service, so readiness of the inner service is only awaited on a miss.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, policy: FetchPolicy) -> Self::Future {
        let inner = self.inner.clone();
        let cache = self.cache.clone();
        Box::pin(async move {
            if policy == FetchPolicy::Refresh {
                let jwk_set = inner.oneshot(policy).await?;
                cache.insert((), jwk_set.clone()).await;
                tracing::debug!(target: "jwks_guard.jwks", "JWK set cache refreshed");
                return Ok(jwk_set);
            }

            // Concurrent misses share a single fetch.
            cache
                .try_get_with((), async move {
                    tracing::debug!(target: "jwks_guard.jwks", "JWK set cache miss");
                    inner.oneshot(policy).await
                })
                .await
                .map_err(Error::from_shared)
        })
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use jsonwebtoken::jwk::JwkSet;
    use tower::{service_fn, util::BoxCloneService, Layer, ServiceExt};

    use super::JwksCacheLayer;
    use crate::{remote_jwk_set::FetchPolicy, Error};

    fn counting_service(calls: Arc<AtomicUsize>) -> BoxCloneService<FetchPolicy, Arc<JwkSet>, Error> {
        BoxCloneService::new(service_fn(move |_policy: FetchPolicy| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(Arc::new(JwkSet { keys: vec![] }))
            }
        }))
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service =
            JwksCacheLayer::new(Duration::from_secs(60)).layer(counting_service(calls.clone()));

        for _ in 0..3 {
            service
                .clone()
                .oneshot(FetchPolicy::PreferCached)
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow_calls = calls.clone();
        let slow_service = BoxCloneService::new(service_fn(move |_policy: FetchPolicy| {
            let calls = slow_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, Error>(Arc::new(JwkSet { keys: vec![] }))
            }
        }));
        let service = JwksCacheLayer::new(Duration::from_secs(60)).layer(slow_service);

        let lookups = (0..10).map(|_| service.clone().oneshot(FetchPolicy::PreferCached));
        for result in futures::future::join_all(lookups).await {
            result.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing_calls = calls.clone();
        let failing_service = BoxCloneService::new(service_fn(move |_policy: FetchPolicy| {
            let calls = failing_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Arc<JwkSet>, _>(Error::Internal("key directory down".to_string()))
            }
        }));
        let service = JwksCacheLayer::new(Duration::from_secs(60)).layer(failing_service);

        for _ in 0..2 {
            let error = service.clone().oneshot(FetchPolicy::PreferCached).await.unwrap_err();
            assert!(matches!(error, Error::Internal(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service =
            JwksCacheLayer::new(Duration::from_secs(60)).layer(counting_service(calls.clone()));

        service.clone().oneshot(FetchPolicy::PreferCached).await.unwrap();
        service.clone().oneshot(FetchPolicy::Refresh).await.unwrap();
        service.clone().oneshot(FetchPolicy::PreferCached).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_entry_expires_after_time_to_live() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service =
            JwksCacheLayer::new(Duration::from_millis(50)).layer(counting_service(calls.clone()));

        service.clone().oneshot(FetchPolicy::PreferCached).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.clone().oneshot(FetchPolicy::PreferCached).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
