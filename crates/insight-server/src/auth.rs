use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use insight_config::Config;
use insight_kernel::{groups_from_claims, is_admin};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
        }
    }
}

/// Service-credential check plus bearer-token role resolution.
pub struct AuthGate {
    strict: bool,
    api_key_header: String,
    api_key: String,
    algorithm: Algorithm,
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
    groups_claim: String,
    exp_seconds: u64,
}

impl AuthGate {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let algorithm: Algorithm = cfg
            .auth
            .jwt
            .algorithm
            .parse()
            .map_err(|e| format!("invalid auth.jwt.algorithm: {e}"))?;
        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        let secret = cfg.auth.jwt.secret.as_bytes();
        Ok(Self {
            strict: cfg.strict_auth(),
            api_key_header: cfg.auth.api_key_header.to_ascii_lowercase(),
            api_key: cfg.auth.api_key.clone(),
            algorithm,
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation,
            groups_claim: cfg.auth.jwt.groups_claim.clone(),
            exp_seconds: cfg.auth.jwt.exp_seconds,
        })
    }

    /// True when the configured credential header carries the expected key.
    /// Always true when strict auth is off.
    pub fn check_service(&self, headers: &HeaderMap) -> bool {
        if !self.strict {
            return true;
        }
        headers
            .get(self.api_key_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| !self.api_key.is_empty() && v == self.api_key)
            .unwrap_or(false)
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
        let raw = header_value.ok_or(AuthError::MissingAuthorization)?;
        let Some(token) = raw.trim().strip_prefix("Bearer ") else {
            return Err(AuthError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }

    /// Verifies the bearer token and returns the caller's groups.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Vec<String>, AuthError> {
        let header_value = match headers.get(AUTHORIZATION) {
            Some(v) => Some(v.to_str().map_err(|_| AuthError::InvalidAuthorizationScheme)?),
            None => None,
        };
        let token = Self::extract_bearer_token(header_value)?;
        let claims = decode::<Value>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?
            .claims;
        Ok(groups_from_claims(&claims, &self.groups_claim))
    }

    /// Groups of the caller; empty on any authentication failure.
    pub fn roles(&self, headers: &HeaderMap) -> Vec<String> {
        match self.authenticate(headers) {
            Ok(groups) => groups,
            Err(err) => {
                tracing::debug!(reason = err.code(), "bearer authentication failed");
                Vec::new()
            }
        }
    }

    pub fn is_admin(&self, headers: &HeaderMap) -> bool {
        is_admin(&self.roles(headers))
    }

    /// Signs a token for `subject` carrying `groups` in the groups claim.
    pub fn issue_token(&self, subject: &str, groups: &[String]) -> Result<String, String> {
        let now = Utc::now().timestamp();
        let exp = now.saturating_add(i64::try_from(self.exp_seconds).unwrap_or(i64::MAX));
        let mut claims = Map::new();
        claims.insert("sub".to_string(), Value::String(subject.to_string()));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert("exp".to_string(), Value::from(exp));
        claims.insert(
            self.groups_claim.clone(),
            Value::Array(groups.iter().cloned().map(Value::String).collect()),
        );
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| format!("token signing failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;
    use axum::http::HeaderValue;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn issued_admin_token_grants_admin() {
        let gate = AuthGate::from_config(&test_config()).unwrap();
        let token = gate.issue_token("ops", &["admins".to_string()]).unwrap();
        let headers = bearer(&token);
        assert_eq!(gate.authenticate(&headers).unwrap(), vec!["admins".to_string()]);
        assert!(gate.is_admin(&headers));
    }

    #[test]
    fn non_admin_and_missing_tokens_have_no_admin_role() {
        let gate = AuthGate::from_config(&test_config()).unwrap();
        let token = gate.issue_token("u", &["users".to_string()]).unwrap();
        assert!(!gate.is_admin(&bearer(&token)));
        assert!(!gate.is_admin(&HeaderMap::new()));
    }

    #[test]
    fn failure_reasons_stay_distinguishable() {
        let gate = AuthGate::from_config(&test_config()).unwrap();
        assert_eq!(
            gate.authenticate(&HeaderMap::new()).unwrap_err(),
            AuthError::MissingAuthorization
        );

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(
            gate.authenticate(&basic).unwrap_err(),
            AuthError::InvalidAuthorizationScheme
        );

        assert_eq!(
            gate.authenticate(&bearer("not-a-jwt")).unwrap_err(),
            AuthError::InvalidToken
        );

        let mut other = test_config();
        other.auth.jwt.secret = "another-secret".to_string();
        let foreign = AuthGate::from_config(&other)
            .unwrap()
            .issue_token("x", &["admins".to_string()])
            .unwrap();
        assert_eq!(
            gate.authenticate(&bearer(&foreign)).unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let cfg = test_config();
        let mut claims = Map::new();
        claims.insert("sub".into(), Value::from("old"));
        claims.insert("exp".into(), Value::from(Utc::now().timestamp() - 3600));
        claims.insert("cognito:groups".into(), serde_json::json!(["admins"]));
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(cfg.auth.jwt.secret.as_bytes()),
        )
        .unwrap();

        let gate = AuthGate::from_config(&cfg).unwrap();
        assert_eq!(
            gate.authenticate(&bearer(&token)).unwrap_err(),
            AuthError::TokenExpired
        );
        assert!(!gate.is_admin(&bearer(&token)));
    }

    #[test]
    fn service_key_check_follows_strictness() {
        let mut cfg = test_config();
        let gate = AuthGate::from_config(&cfg).unwrap();
        let mut headers = HeaderMap::new();
        assert!(!gate.check_service(&headers));
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(!gate.check_service(&headers));
        headers.insert("x-api-key", HeaderValue::from_static("service-key"));
        assert!(gate.check_service(&headers));

        cfg.auth.strict_auth = Some(false);
        let relaxed = AuthGate::from_config(&cfg).unwrap();
        assert!(relaxed.check_service(&HeaderMap::new()));
    }
}
