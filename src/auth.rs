use std::sync::Arc;

use hyper::header::{AUTHORIZATION, COOKIE};
use hyper::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::{Directory, DirectoryError, UserProfile};
use crate::UserId;

pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Claims carried by an access token. Only the subject and expiry matter here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(rename = "_id")]
    pub user_id: UserId,
    pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No token provided")]
    MissingToken,
    #[error("Access token expired")]
    Expired,
    #[error("Invalid access token: {0}")]
    InvalidToken(jsonwebtoken::errors::Error),
    #[error("Invalid access token: unknown user")]
    UnknownUser,
    #[error("user lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e),
        }
    }
}

/// Handshake gate: verifies the access token and resolves the user it names.
/// It never touches connection state.
#[derive(Clone)]
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
    directory: Arc<dyn Directory>,
}

impl Authenticator {
    pub fn new(secret: &str, directory: Arc<dyn Directory>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            directory,
        }
    }

    pub async fn authenticate(&self, token: &str) -> Result<UserProfile, AuthError> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation)?;
        self.directory
            .find_user(&data.claims.user_id)
            .await?
            .ok_or(AuthError::UnknownUser)
    }

    /// Token from the request (see [`extract_token`]), then [`Self::authenticate`].
    pub async fn authenticate_handshake(&self, headers: &HeaderMap, query: Option<&str>) -> Result<UserProfile, AuthError> {
        let token = extract_token(headers, query).ok_or(AuthError::MissingToken)?;
        self.authenticate(&token).await
    }
}

/// Looks for the access token in the `accessToken` cookie first, then the `token`
/// query parameter, then an `Authorization: Bearer` header.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    cookie_token(headers)
        .or_else(|| query.and_then(query_token))
        .or_else(|| bearer_token(headers))
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == ACCESS_TOKEN_COOKIE)
        .map(|(_, value)| decode_component(value))
        .filter(|t| !t.is_empty())
}

fn query_token(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|p| p.split_once('='))
        .find(|(name, _)| *name == TOKEN_QUERY_PARAM)
        .map(|(_, value)| decode_component(value))
        .filter(|t| !t.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn decode_component(value: &str) -> String {
    match urlencoding::decode(value) {
        Ok(s) => s.into_owned(),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryUser, MemoryDirectory};
    use chrono::Utc;
    use hyper::header::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token_for(user_id: &str, exp_offset_secs: i64, secret: &str) -> String {
        let claims = AccessClaims {
            user_id: user_id.to_string(),
            exp: (Utc::now().timestamp() + exp_offset_secs) as u64,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    async fn authenticator() -> Authenticator {
        let dir = MemoryDirectory::new();
        dir.insert_user(DirectoryUser {
            profile: UserProfile {
                id: "u1".into(),
                first_name: "Ann".into(),
                last_name: "Lee".into(),
                avatar: None,
            },
            email: "ann@example.com".into(),
            is_admin: false,
            last_active: Utc::now(),
            last_notification_sent: None,
        })
        .await;
        Authenticator::new(SECRET, Arc::new(dir))
    }

    #[tokio::test]
    async fn valid_token_resolves_user() {
        let auth = authenticator().await;
        let user = auth.authenticate(&token_for("u1", 600, SECRET)).await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.first_name, "Ann");
    }

    #[tokio::test]
    async fn rejects_expired_wrong_key_and_unknown_user() {
        let auth = authenticator().await;

        let err = auth.authenticate(&token_for("u1", -600, SECRET)).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));

        let err = auth.authenticate(&token_for("u1", 600, "other")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));

        let err = auth.authenticate(&token_for("ghost", 600, SECRET)).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownUser));

        let err = auth.authenticate("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn handshake_without_token_is_rejected() {
        let auth = authenticator().await;
        let err = auth.authenticate_handshake(&HeaderMap::new(), None).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
        assert_eq!(err.to_string(), "No token provided");
    }

    #[test]
    fn cookie_wins_over_query_and_header() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; accessToken=from%2Ecookie"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        assert_eq!(extract_token(&headers, Some("token=from-query")).as_deref(), Some("from.cookie"));
    }

    #[test]
    fn falls_back_to_query_then_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        assert_eq!(extract_token(&headers, Some("a=1&token=q")).as_deref(), Some("q"));
        assert_eq!(extract_token(&headers, Some("a=1")).as_deref(), Some("from-header"));
        assert_eq!(extract_token(&HeaderMap::new(), Some("token=")), None);
    }
}
