use crate::config::{AuthConfig, AuthMode};
use crate::error::{ApiError, BridgeResult, ErrorCode};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const TOKEN_COOKIE: &str = "portal_token";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>) -> Result<Principal, ApiError>;
}

pub fn build_verifier(config: &AuthConfig) -> BridgeResult<Arc<dyn TokenVerifier>> {
    let verifier: Arc<dyn TokenVerifier> = match config.mode {
        AuthMode::Disabled => Arc::new(AllowAll),
        AuthMode::Jwt => Arc::new(JwtVerifier::new(&config.jwt_secret)),
        AuthMode::Portal => Arc::new(PortalVerifier::new(
            config.verify_url.clone(),
            Duration::from_millis(config.verify_timeout_ms),
        )?),
    };
    Ok(verifier)
}

// Query parameter, then bearer header, then the portal cookie.
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|token| !token.is_empty()) {
        return Some(token.to_string());
    }

    if let Some(value) = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok())
        && let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn missing_token() -> ApiError {
    ApiError::new(ErrorCode::Unauthorized, "Missing token")
}

fn rejected(details: impl Into<String>) -> ApiError {
    ApiError::new(ErrorCode::Unauthorized, "Invalid or expired token").with_details(details)
}

pub struct AllowAll;

#[async_trait]
impl TokenVerifier for AllowAll {
    async fn verify(&self, _token: Option<&str>) -> Result<Principal, ApiError> {
        Ok(Principal::new("anonymous"))
    }
}

#[derive(Debug, Deserialize)]
struct PortalClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Portal tokens do not always carry `exp`; it is still checked when set.
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<Principal, ApiError> {
        let token = token.ok_or_else(missing_token)?;
        let data = decode::<PortalClaims>(token, &self.key, &self.validation)
            .map_err(|err| rejected(err.to_string()))?;
        let claims = data.claims;
        let subject = claims
            .sub
            .or(claims.username)
            .or(claims.email)
            .unwrap_or_else(|| "portal-user".to_string());
        Ok(Principal::new(subject))
    }
}

pub struct PortalVerifier {
    client: Client,
    verify_url: String,
}

impl PortalVerifier {
    pub fn new(verify_url: String, timeout: Duration) -> BridgeResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to build HTTP client")
                .with_details(err.to_string())
        })?;
        Ok(Self { client, verify_url })
    }
}

#[async_trait]
impl TokenVerifier for PortalVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<Principal, ApiError> {
        let token = token.ok_or_else(missing_token)?;
        let response = self
            .client
            .get(&self.verify_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(url = %self.verify_url, error = %err, "Token verification request failed");
                ApiError::new(ErrorCode::Unauthorized, "Token verification unavailable")
                    .with_details(err.to_string())
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejected(format!("portal answered {status}")));
        }

        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        Ok(Principal::new(
            portal_subject(&body).unwrap_or_else(|| "portal-user".to_string()),
        ))
    }
}

fn portal_subject(body: &serde_json::Value) -> Option<String> {
    let user = body.get("user").unwrap_or(body);
    ["username", "email", "sub", "id"]
        .iter()
        .find_map(|field| match user.get(*field)? {
            serde_json::Value::String(value) if !value.is_empty() => Some(value.clone()),
            serde_json::Value::Number(value) => Some(value.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode")
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs()
    }

    #[test]
    fn query_token_wins_over_header_and_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(COOKIE, HeaderValue::from_static("portal_token=from-cookie"));
        assert_eq!(
            extract_token(Some("from-query"), &headers).as_deref(),
            Some("from-query")
        );
        assert_eq!(
            extract_token(Some(""), &headers).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn cookie_token_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; portal_token=abc.def.ghi; lang=en"),
        );
        assert_eq!(extract_token(None, &headers).as_deref(), Some("abc.def.ghi"));
        assert_eq!(extract_token(None, &HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn jwt_verifier_accepts_valid_tokens() {
        let verifier = JwtVerifier::new("s3cret");
        let valid = token(
            "s3cret",
            serde_json::json!({"sub": "alice", "exp": now_secs() + 3600}),
        );
        let principal = verifier.verify(Some(&valid)).await.expect("valid");
        assert_eq!(principal.subject, "alice");

        let no_exp = token("s3cret", serde_json::json!({"email": "bob@example.com"}));
        let principal = verifier.verify(Some(&no_exp)).await.expect("no exp");
        assert_eq!(principal.subject, "bob@example.com");
    }

    #[tokio::test]
    async fn jwt_verifier_rejects_bad_tokens() {
        let verifier = JwtVerifier::new("s3cret");
        let wrong_secret = token("other", serde_json::json!({"sub": "alice"}));
        let expired = token(
            "s3cret",
            serde_json::json!({"sub": "alice", "exp": now_secs() - 3600}),
        );
        for candidate in [Some(wrong_secret.as_str()), Some(expired.as_str()), Some("garbage"), None] {
            let err = verifier.verify(candidate).await.expect_err("rejected");
            assert_eq!(err.error_code, ErrorCode::Unauthorized);
        }
    }

    #[tokio::test]
    async fn allow_all_needs_no_token() {
        let principal = AllowAll.verify(None).await.expect("allowed");
        assert_eq!(principal.subject, "anonymous");
    }

    #[tokio::test]
    async fn portal_verifier_follows_endpoint_status() {
        use axum::Router;
        use axum::http::StatusCode;
        use axum::routing::get;

        async fn verify_token(headers: HeaderMap) -> Result<axum::Json<serde_json::Value>, StatusCode> {
            match headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()) {
                Some("Bearer good") => Ok(axum::Json(
                    serde_json::json!({"user": {"username": "carol"}}),
                )),
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().route("/users/verify-token", get(verify_token));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let verifier = PortalVerifier::new(
            format!("http://{addr}/users/verify-token"),
            Duration::from_secs(5),
        )
        .expect("client");
        let principal = verifier.verify(Some("good")).await.expect("accepted");
        assert_eq!(principal.subject, "carol");

        let err = verifier.verify(Some("bad")).await.expect_err("rejected");
        assert_eq!(err.error_code, ErrorCode::Unauthorized);
        assert!(err.user_message().contains("401"));
    }

    #[test]
    fn portal_subject_reads_flat_and_nested_bodies() {
        assert_eq!(
            portal_subject(&serde_json::json!({"id": 42})).as_deref(),
            Some("42")
        );
        assert_eq!(
            portal_subject(&serde_json::json!({"user": {"email": "d@example.com"}})).as_deref(),
            Some("d@example.com")
        );
        assert_eq!(portal_subject(&serde_json::Value::Null), None);
    }
}
