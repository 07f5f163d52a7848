use http::StatusCode;

use crate::{error::PERMISSIONS_MISSING, Claims, Error};

/// Checks that the verified claims grant `permission`.
///
/// A token without a `permissions` claim can't express permissions at all and is rejected as a 400
/// `invalid_claims`. A token whose list doesn't contain `permission`, including an empty list, is rejected as a 403
/// `unauthorized`. Matching is exact; there are no wildcards or hierarchies.
pub fn require_permission(claims: &Claims, permission: &str) -> Result<(), Error> {
    let permissions = claims.permissions().ok_or_else(|| {
        tracing::debug!(target: "jwks_guard.authorization", "token carries no permissions claim");
        Error::invalid_claims(PERMISSIONS_MISSING, StatusCode::BAD_REQUEST)
    })?;

    if permissions.iter().any(|granted| granted == permission) {
        Ok(())
    } else {
        tracing::debug!(target: "jwks_guard.authorization", permission, "permission not granted");
        Err(Error::Unauthorized)
    }
}
