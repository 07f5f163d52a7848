use axum::extract::FromRequestParts;
use http::request::Parts;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::Error;

/// The `aud` claim, which may be a single audience or a list of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(single) => single == audience,
            Audience::Multiple(multiple) => multiple.iter().any(|candidate| candidate == audience),
        }
    }
}

/// The claims this crate reads, typed. Everything else stays in the raw map only.
#[derive(Clone, Debug, PartialEq, Deserialize)]
struct RegisteredClaims {
    iss: String,
    aud: Audience,
    #[serde(deserialize_with = "deserialize_numeric_date")]
    exp: u64,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
}

/// Reads a JWT NumericDate. Fractional seconds are allowed and truncated.
pub(crate) fn numeric_date(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .map(|seconds| seconds as u64)
    })
}

fn deserialize_numeric_date<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    numeric_date(&value).ok_or_else(|| de::Error::custom("expected a non-negative NumericDate"))
}

/// Claims of a token that passed signature verification and claim validation.
///
/// Values of this type are only ever produced by [`crate::Verifier`]. The authorization middleware stores them in the
/// request extensions, from where handlers can pick them up by using `Claims` as an extractor.
///
/// Serializing a `Claims` yields exactly the claim set carried by the token, `null` values and fractional dates
/// included.
#[derive(Clone, Debug, PartialEq)]
pub struct Claims {
    registered: RegisteredClaims,
    raw: Map<String, Value>,
}

impl Claims {
    /// Only to be called with claims whose signature and contents have been verified.
    pub(crate) fn from_verified(claims: Map<String, Value>) -> Result<Self, Error> {
        let registered = serde_json::from_value(Value::Object(claims.clone()))
            .map_err(|_| Error::unparseable_token())?;
        Ok(Claims {
            registered,
            raw: claims,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.registered.iss
    }

    pub fn audience(&self) -> &Audience {
        &self.registered.aud
    }

    /// Expiry as whole seconds since the Unix epoch.
    pub fn expires_at(&self) -> u64 {
        self.registered.exp
    }

    pub fn subject(&self) -> Option<&str> {
        self.registered.sub.as_deref()
    }

    /// The `permissions` claim. `None` if the token carries no such claim at all (or `null`), which is different from
    /// carrying an empty list.
    pub fn permissions(&self) -> Option<&[String]> {
        self.registered.permissions.as_deref()
    }

    /// Looks up any claim by name, as it appears in the token.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

impl Serialize for Claims {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.raw.serialize(serializer)
    }
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Claims>().cloned().ok_or_else(|| {
            tracing::error!(
                target: "jwks_guard.authorization",
                "claims requested by a handler that isn't protected by an AuthorizationLayer"
            );
            Error::Internal("claims missing from request extensions".to_string())
        })
    }
}

#[cfg(test)]
pub(crate) fn claims_from_json(value: Value) -> Claims {
    match value {
        Value::Object(map) => Claims::from_verified(map).unwrap(),
        _ => panic!("claims must be a JSON object"),
    }
}
