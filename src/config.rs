//! Startup configuration for token verification.
//!
//! Nothing about the issuer is hardcoded: the issuer URL, audience and accepted algorithms all come from here. The
//! configuration can either be deserialized as part of an application's own config or read from environment
//! variables.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::remote_jwk_set::{RemoteJwkSet, DEFAULT_MIN_REFRESH_INTERVAL, DEFAULT_TIMEOUT};
use crate::verifier::{Verifier, VerifierConfig};
use crate::Error;

pub const ENV_ISSUER_URL: &str = "AUTH_ISSUER_URL";
pub const ENV_AUDIENCE: &str = "AUTH_AUDIENCE";
pub const ENV_ALGORITHMS: &str = "AUTH_ALGORITHMS";
pub const ENV_LEEWAY_SECONDS: &str = "AUTH_LEEWAY_SECONDS";
pub const ENV_JWKS_TIMEOUT_SECONDS: &str = "AUTH_JWKS_TIMEOUT_SECONDS";
pub const ENV_JWKS_CACHE_TTL_SECONDS: &str = "AUTH_JWKS_CACHE_TTL_SECONDS";
pub const ENV_JWKS_RATE_LIMIT: &str = "AUTH_JWKS_RATE_LIMIT";
pub const ENV_JWKS_MIN_REFRESH_SECONDS: &str = "AUTH_JWKS_MIN_REFRESH_SECONDS";

/// Verification settings for one issuer/audience pair.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AuthConfig {
    /// Issuer base URL. Its string form is the expected `iss` claim and the JWK set is fetched from
    /// `{issuer_url}/.well-known/jwks.json`.
    pub issuer_url: Url,
    pub audience: String,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<Algorithm>,
    #[serde(default)]
    pub leeway_seconds: u64,
    #[serde(default = "default_jwks_timeout_seconds")]
    pub jwks_timeout_seconds: u64,
    /// Caching is disabled unless set.
    #[serde(default)]
    pub jwks_cache_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub jwks_rate_limit: Option<RateLimit>,
    /// Minimum time between re-fetches forced by unknown key IDs. Only relevant with caching.
    #[serde(default = "default_jwks_min_refresh_seconds")]
    pub jwks_min_refresh_seconds: u64,
}

/// At most `num` key directory requests per `per_seconds`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub num: u64,
    pub per_seconds: u64,
}

impl FromStr for RateLimit {
    type Err = ConfigError;

    /// Parses `<num>/<seconds>`, e.g. `10/60`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            ConfigError::InvalidValue(
                ENV_JWKS_RATE_LIMIT.to_string(),
                format!("expected '<num>/<seconds>', got '{value}': {reason}"),
            )
        };
        let (num, per_seconds) = value.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        let num: u64 = num.trim().parse().map_err(|_| invalid("num is not a number"))?;
        let per_seconds: u64 = per_seconds
            .trim()
            .parse()
            .map_err(|_| invalid("seconds is not a number"))?;
        if num == 0 || per_seconds == 0 {
            return Err(invalid("both values must be greater than 0"));
        }
        Ok(RateLimit { num, per_seconds })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256]
}

fn default_jwks_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_jwks_min_refresh_seconds() -> u64 {
    DEFAULT_MIN_REFRESH_INTERVAL.as_secs()
}

impl AuthConfig {
    pub fn new(issuer_url: Url, audience: impl Into<String>) -> Self {
        Self {
            issuer_url,
            audience: audience.into(),
            algorithms: default_algorithms(),
            leeway_seconds: 0,
            jwks_timeout_seconds: default_jwks_timeout_seconds(),
            jwks_cache_ttl_seconds: None,
            jwks_rate_limit: None,
            jwks_min_refresh_seconds: default_jwks_min_refresh_seconds(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let issuer_url = required(vars, ENV_ISSUER_URL)?;
        let issuer_url = Url::parse(issuer_url)
            .map_err(|e| invalid(ENV_ISSUER_URL, format!("'{issuer_url}' is not a URL: {e}")))?;

        let audience = required(vars, ENV_AUDIENCE)?.to_string();
        if audience.is_empty() {
            return Err(invalid(ENV_AUDIENCE, "must not be empty".to_string()));
        }

        let algorithms = match vars.get(ENV_ALGORITHMS) {
            Some(value) => parse_algorithms(value)?,
            None => default_algorithms(),
        };

        let leeway_seconds = optional_u64(vars, ENV_LEEWAY_SECONDS)?.unwrap_or(0);

        let jwks_timeout_seconds = optional_u64(vars, ENV_JWKS_TIMEOUT_SECONDS)?
            .unwrap_or_else(default_jwks_timeout_seconds);
        if jwks_timeout_seconds == 0 {
            return Err(invalid(
                ENV_JWKS_TIMEOUT_SECONDS,
                "must be greater than 0".to_string(),
            ));
        }

        let jwks_cache_ttl_seconds = optional_u64(vars, ENV_JWKS_CACHE_TTL_SECONDS)?;
        if jwks_cache_ttl_seconds == Some(0) {
            return Err(invalid(
                ENV_JWKS_CACHE_TTL_SECONDS,
                "must be greater than 0".to_string(),
            ));
        }

        let jwks_rate_limit = vars
            .get(ENV_JWKS_RATE_LIMIT)
            .map(|value| value.parse::<RateLimit>())
            .transpose()?;

        let jwks_min_refresh_seconds = optional_u64(vars, ENV_JWKS_MIN_REFRESH_SECONDS)?
            .unwrap_or_else(default_jwks_min_refresh_seconds);

        Ok(AuthConfig {
            issuer_url,
            audience,
            algorithms,
            leeway_seconds,
            jwks_timeout_seconds,
            jwks_cache_ttl_seconds,
            jwks_rate_limit,
            jwks_min_refresh_seconds,
        })
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig::new(self.issuer_url.as_str(), self.audience.clone())
            .with_algorithms(self.algorithms.clone())
            .with_leeway(Duration::from_secs(self.leeway_seconds))
    }

    /// Builds the key directory client for this issuer.
    pub fn remote_jwk_set(&self) -> Result<RemoteJwkSet, Error> {
        let mut builder = RemoteJwkSet::for_issuer(&self.issuer_url)?
            .with_timeout(Duration::from_secs(self.jwks_timeout_seconds))
            .with_min_refresh_interval(Duration::from_secs(self.jwks_min_refresh_seconds));
        if let Some(ttl) = self.jwks_cache_ttl_seconds {
            builder = builder.with_cache(Duration::from_secs(ttl));
        }
        if let Some(rate_limit) = self.jwks_rate_limit {
            builder =
                builder.with_rate_limit(rate_limit.num, Duration::from_secs(rate_limit.per_seconds));
        }
        builder.build()
    }

    pub fn build_verifier(&self) -> Result<Verifier, Error> {
        Ok(Verifier::new(self.remote_jwk_set()?, self.verifier_config()))
    }
}

fn required<'a>(vars: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ConfigError> {
    vars.get(name)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_u64(vars: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    vars.get(name)
        .map(|value| {
            value.parse::<u64>().map_err(|e| {
                invalid(
                    name,
                    format!("must be a valid non-negative integer, got '{value}': {e}"),
                )
            })
        })
        .transpose()
}

fn parse_algorithms(value: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let algorithms = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            Algorithm::from_str(name)
                .map_err(|_| invalid(ENV_ALGORITHMS, format!("unknown algorithm '{name}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if algorithms.is_empty() {
        return Err(invalid(ENV_ALGORITHMS, "at least one algorithm is required".to_string()));
    }
    if let Some(symmetric) = algorithms
        .iter()
        .find(|alg| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
    {
        return Err(invalid(
            ENV_ALGORITHMS,
            format!("{symmetric:?} can't be verified with a published key"),
        ));
    }
    Ok(algorithms)
}

fn invalid(name: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue(name.to_string(), reason)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::time::Duration;

    use jsonwebtoken::Algorithm;

    use super::{AuthConfig, ConfigError, RateLimit};

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "AUTH_ISSUER_URL".to_string(),
                "https://tenant.eu.auth0.com/".to_string(),
            ),
            ("AUTH_AUDIENCE".to_string(), "image".to_string()),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = AuthConfig::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.issuer_url.as_str(), "https://tenant.eu.auth0.com/");
        assert_eq!(config.audience, "image");
        assert_eq!(config.algorithms, vec![Algorithm::RS256]);
        assert_eq!(config.leeway_seconds, 0);
        assert_eq!(config.jwks_timeout_seconds, 10);
        assert_eq!(config.jwks_cache_ttl_seconds, None);
        assert_eq!(config.jwks_rate_limit, None);
        assert_eq!(config.jwks_min_refresh_seconds, 5);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("AUTH_ALGORITHMS".to_string(), "RS256, ES256".to_string());
        vars.insert("AUTH_LEEWAY_SECONDS".to_string(), "30".to_string());
        vars.insert("AUTH_JWKS_TIMEOUT_SECONDS".to_string(), "3".to_string());
        vars.insert("AUTH_JWKS_CACHE_TTL_SECONDS".to_string(), "600".to_string());
        vars.insert("AUTH_JWKS_RATE_LIMIT".to_string(), "10/60".to_string());
        vars.insert("AUTH_JWKS_MIN_REFRESH_SECONDS".to_string(), "30".to_string());

        let config = AuthConfig::from_vars(&vars).unwrap();

        assert_eq!(config.algorithms, vec![Algorithm::RS256, Algorithm::ES256]);
        assert_eq!(config.leeway_seconds, 30);
        assert_eq!(config.jwks_timeout_seconds, 3);
        assert_eq!(config.jwks_cache_ttl_seconds, Some(600));
        assert_eq!(config.jwks_min_refresh_seconds, 30);
        assert_eq!(
            config.jwks_rate_limit,
            Some(RateLimit {
                num: 10,
                per_seconds: 60
            })
        );
    }

    #[test]
    fn test_from_vars_missing_required() {
        for missing in ["AUTH_ISSUER_URL", "AUTH_AUDIENCE"] {
            let mut vars = base_vars();
            vars.remove(missing);
            match AuthConfig::from_vars(&vars) {
                Err(ConfigError::MissingEnvVar(name)) => assert_eq!(name, missing),
                other => panic!("expected MissingEnvVar, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_from_vars_rejects_invalid_values() {
        let cases = [
            ("AUTH_ISSUER_URL", "not a url"),
            ("AUTH_AUDIENCE", ""),
            ("AUTH_ALGORITHMS", "RS256,XX999"),
            ("AUTH_ALGORITHMS", " , "),
            ("AUTH_ALGORITHMS", "HS256"),
            ("AUTH_LEEWAY_SECONDS", "-1"),
            ("AUTH_JWKS_TIMEOUT_SECONDS", "0"),
            ("AUTH_JWKS_CACHE_TTL_SECONDS", "0"),
            ("AUTH_JWKS_CACHE_TTL_SECONDS", "ten"),
            ("AUTH_JWKS_RATE_LIMIT", "10"),
            ("AUTH_JWKS_RATE_LIMIT", "0/60"),
            ("AUTH_JWKS_RATE_LIMIT", "10/x"),
            ("AUTH_JWKS_MIN_REFRESH_SECONDS", "soon"),
        ];

        for (name, value) in cases {
            let mut vars = base_vars();
            vars.insert(name.to_string(), value.to_string());
            assert!(
                matches!(AuthConfig::from_vars(&vars), Err(ConfigError::InvalidValue(..))),
                "{name}={value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_verifier_config_uses_issuer_url_verbatim() {
        let mut config = AuthConfig::from_vars(&base_vars()).unwrap();
        config.leeway_seconds = 5;

        let verifier_config = config.verifier_config();
        assert_eq!(verifier_config.issuer, "https://tenant.eu.auth0.com/");
        assert_eq!(verifier_config.audience, "image");
        assert_eq!(verifier_config.leeway, Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: AuthConfig = serde_json::from_value(serde_json::json!({
            "issuer_url": "https://tenant.eu.auth0.com/",
            "audience": "coffeeapi",
            "algorithms": ["RS256", "PS256"],
            "jwks_rate_limit": {"num": 5, "per_seconds": 60},
        }))
        .unwrap();

        assert_eq!(config.algorithms, vec![Algorithm::RS256, Algorithm::PS256]);
        assert_eq!(config.jwks_timeout_seconds, 10);
        assert_eq!(config.jwks_cache_ttl_seconds, None);
        assert_eq!(
            config.jwks_rate_limit,
            Some(RateLimit {
                num: 5,
                per_seconds: 60
            })
        );
    }

    #[tokio::test]
    async fn test_build_verifier() {
        let mut config = AuthConfig::from_vars(&base_vars()).unwrap();
        config.jwks_cache_ttl_seconds = Some(60);
        config.jwks_rate_limit = Some(RateLimit {
            num: 1,
            per_seconds: 1,
        });

        let verifier = config.build_verifier().unwrap();
        assert_eq!(verifier.config().issuer, "https://tenant.eu.auth0.com/");
    }
}
