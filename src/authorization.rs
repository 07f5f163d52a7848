use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::RequestExt;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use futures::future::BoxFuture;
use http::{header, StatusCode};
use tower::Layer;
use tower_service::Service;

use crate::error::{HEADER_MISSING, HEADER_NOT_BEARER, TOKEN_MISSING};
use crate::permissions::require_permission;
use crate::remote_jwk_set::RemoteJwkSet;
use crate::verifier::{Verifier, VerifierConfig};
use crate::{Claims, Error};

/// Protects the wrapped service with bearer token verification and, optionally, a required permission.
///
/// Requests that pass have their [`Claims`] stored in the request extensions. All others are answered with the
/// error response right away, without ever reaching the wrapped service.
#[derive(Clone)]
pub struct AuthorizationLayer {
    verifier: Arc<Verifier>,
    required_permission: Option<Arc<str>>,
}

impl AuthorizationLayer {
    pub fn new(verifier: Verifier) -> Self {
        Self::from_shared(Arc::new(verifier))
    }

    /// Builds a layer around a verifier that is shared with other layers, e.g. one per route.
    pub fn from_shared(verifier: Arc<Verifier>) -> Self {
        Self {
            verifier,
            required_permission: None,
        }
    }

    pub fn with_remote_jwk_set(remote_jwk_set: RemoteJwkSet, config: VerifierConfig) -> Self {
        Self::new(Verifier::new(remote_jwk_set, config))
    }

    pub fn with_local_jwk_set(jwk_set: jsonwebtoken::jwk::JwkSet, config: VerifierConfig) -> Self {
        Self::new(Verifier::new(jwk_set, config))
    }

    /// Returns a layer that additionally requires the token to grant `permission`.
    ///
    /// ```rust,no_run
    /// # use axum::{routing::{get, post}, Router};
    /// # use axum_jwks_guard::AuthorizationLayer;
    /// # fn routes(auth: AuthorizationLayer) -> Router {
    /// Router::new()
    ///     .route("/drinks-detail", get(|| async { "detail" }).layer(auth.with_permission("get:drinks-detail")))
    ///     .route("/drinks", post(|| async { "created" }).layer(auth.with_permission("post:drinks")))
    /// # }
    /// ```
    pub fn with_permission(&self, permission: impl Into<String>) -> Self {
        let permission: String = permission.into();
        Self {
            verifier: self.verifier.clone(),
            required_permission: Some(Arc::from(permission)),
        }
    }

    pub fn required_permission(&self) -> Option<&str> {
        self.required_permission.as_deref()
    }
}

impl<S> Layer<S> for AuthorizationLayer {
    type Service = AuthorizationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationService {
            inner,
            verifier: self.verifier.clone(),
            required_permission: self.required_permission.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationService<S> {
    inner: S,
    verifier: Arc<Verifier>,
    required_permission: Option<Arc<str>>,
}

impl<S> Service<Request> for AuthorizationService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // The service that was polled ready is the one to call; the clone stays behind for the next request.
        let inner_clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner_clone);

        let verifier = self.verifier.clone();
        let required_permission = self.required_permission.clone();
        Box::pin(async move {
            let authorize_result =
                authorize_request(&mut req, &verifier, required_permission.as_deref()).await;
            match authorize_result {
                Ok(claims) => {
                    req.extensions_mut().insert(claims);
                    inner.call(req).await
                }
                Err(auth_error) => {
                    log_rejection(&auth_error);
                    Ok(auth_error.into_response())
                }
            }
        })
    }
}

async fn authorize_request(
    req: &mut Request,
    verifier: &Verifier,
    required_permission: Option<&str>,
) -> Result<Claims, Error> {
    let token = extract_bearer_token(req).await?;
    authorize_token(&token, verifier, required_permission).await
}

/// The single decision point: is `token` valid and, if a permission is required, does it grant it?
pub async fn authorize_token(
    token: &str,
    verifier: &Verifier,
    required_permission: Option<&str>,
) -> Result<Claims, Error> {
    let claims = verifier.verify(token).await?;
    if let Some(permission) = required_permission {
        require_permission(&claims, permission)?;
    }
    Ok(claims)
}

async fn extract_bearer_token(req: &mut Request) -> Result<String, Error> {
    // A bare scheme is not a bearer header to the typed extractor, but here it means the token itself is missing.
    let bare_scheme = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("bearer"));
    if bare_scheme {
        return Err(Error::invalid_header(TOKEN_MISSING, StatusCode::UNAUTHORIZED));
    }

    let TypedHeader(Authorization(bearer)) = req
        .extract_parts::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|rejection| {
            let description = if rejection.is_missing() {
                HEADER_MISSING
            } else {
                HEADER_NOT_BEARER
            };
            Error::invalid_header(description, StatusCode::UNAUTHORIZED)
        })?;

    let token = bearer.token();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(Error::invalid_header(HEADER_NOT_BEARER, StatusCode::UNAUTHORIZED));
    }
    Ok(token.to_string())
}

fn log_rejection(error: &Error) {
    match error {
        Error::KeyDirectoryUnavailable(source) => {
            tracing::warn!(target: "jwks_guard.authorization", error = %source, "key directory unavailable, rejecting request");
        }
        Error::Internal(detail) => {
            tracing::error!(target: "jwks_guard.authorization", error = %detail, "internal error during authorization");
        }
        _ => {
            tracing::debug!(
                target: "jwks_guard.authorization",
                code = error.code(),
                status = error.status_code().as_u16(),
                "request rejected"
            );
        }
    }
}
