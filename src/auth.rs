use crate::error::ApiError;
use hyper::HeaderMap;
use hyper::header::AUTHORIZATION;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// How a route with `require_auth` treats the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStrategy {
    /// Header must be present; the upstream validates it.
    #[default]
    Forward,
    /// The gateway verifies the bearer token itself.
    Validate,
}

impl AuthStrategy {
    pub fn parse(strategy: &str) -> Self {
        if strategy.eq_ignore_ascii_case("validate") {
            AuthStrategy::Validate
        } else {
            AuthStrategy::Forward
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::Forward => "forward",
            AuthStrategy::Validate => "validate",
        }
    }
}

/// Claims issued by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

/// Verifies HMAC (HS256/384/512) tokens signed with the gateway's shared secret.
#[derive(Clone)]
pub struct TokenValidator {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // `exp` is checked when present but not required.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;

        Self {
            key: secret
                .filter(|s| !s.is_empty())
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
        }
    }

    pub fn has_secret(&self) -> bool {
        self.key.is_some()
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| ApiError::unauthorized("jwt secret not configured"))?;
        decode::<Claims>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                log::debug!("Rejected bearer token: {}", e);
                ApiError::unauthorized("invalid token")
            })
    }
}

/// Extracts the token from a `Bearer <token>` header value.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split(' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

/// Applies a route's auth policy to the inbound headers.
pub fn ensure_auth(
    headers: &HeaderMap,
    require_auth: bool,
    strategy: AuthStrategy,
    validator: &TokenValidator,
) -> Result<(), ApiError> {
    if !require_auth {
        return Ok(());
    }

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;

    if strategy == AuthStrategy::Forward {
        return Ok(());
    }

    let token = extract_bearer(header).ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    validator.verify(token).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use hyper::header::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, exp: Option<i64>) -> String {
        signed(Algorithm::HS256, secret, exp)
    }

    fn signed(alg: Algorithm, secret: &str, exp: Option<i64>) -> String {
        let claims = Claims {
            user_id: "u-1".to_string(),
            role: "customer".to_string(),
            exp,
        };
        encode(&Header::new(alg), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_strategy_normalization() {
        assert_eq!(AuthStrategy::parse("VALIDATE"), AuthStrategy::Validate);
        assert_eq!(AuthStrategy::parse("forward"), AuthStrategy::Forward);
        assert_eq!(AuthStrategy::parse(""), AuthStrategy::Forward);
        assert_eq!(AuthStrategy::parse("bogus"), AuthStrategy::Forward);
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer a b"), None);
    }

    #[test]
    fn test_anonymous_route_skips_checks() {
        let validator = TokenValidator::new(None);
        assert!(ensure_auth(&HeaderMap::new(), false, AuthStrategy::Validate, &validator).is_ok());
    }

    #[test]
    fn test_forward_requires_header_only() {
        let validator = TokenValidator::new(None);
        let err = ensure_auth(&HeaderMap::new(), true, AuthStrategy::Forward, &validator).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert!(ensure_auth(&headers("opaque"), true, AuthStrategy::Forward, &validator).is_ok());
    }

    #[test]
    fn test_validate_accepts_signed_token() {
        let validator = TokenValidator::new(Some("secret"));
        let value = format!("Bearer {}", token("secret", None));
        assert!(ensure_auth(&headers(&value), true, AuthStrategy::Validate, &validator).is_ok());

        let future = chrono::Utc::now().timestamp() + 3600;
        let value = format!("Bearer {}", token("secret", Some(future)));
        assert!(ensure_auth(&headers(&value), true, AuthStrategy::Validate, &validator).is_ok());
    }

    #[test]
    fn test_validate_accepts_every_hmac_algorithm() {
        let validator = TokenValidator::new(Some("secret"));
        for alg in [Algorithm::HS384, Algorithm::HS512] {
            let value = format!("Bearer {}", signed(alg, "secret", None));
            assert!(
                ensure_auth(&headers(&value), true, AuthStrategy::Validate, &validator).is_ok(),
                "{:?}",
                alg
            );
        }

        let forged = format!("Bearer {}", signed(Algorithm::HS512, "other", None));
        assert!(ensure_auth(&headers(&forged), true, AuthStrategy::Validate, &validator).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tokens() {
        let validator = TokenValidator::new(Some("secret"));

        let forged = format!("Bearer {}", token("other", None));
        let err = ensure_auth(&headers(&forged), true, AuthStrategy::Validate, &validator).unwrap_err();
        assert_eq!(err.message, "invalid token");

        let expired = format!("Bearer {}", token("secret", Some(1_000)));
        assert!(ensure_auth(&headers(&expired), true, AuthStrategy::Validate, &validator).is_err());

        let err = ensure_auth(&headers("Token abc"), true, AuthStrategy::Validate, &validator).unwrap_err();
        assert_eq!(err.message, "missing bearer token");
    }

    #[test]
    fn test_validate_without_secret() {
        let validator = TokenValidator::new(Some(""));
        assert!(!validator.has_secret());
        let value = format!("Bearer {}", token("secret", None));
        let err = ensure_auth(&headers(&value), true, AuthStrategy::Validate, &validator).unwrap_err();
        assert_eq!(err.message, "jwt secret not configured");
    }
}
