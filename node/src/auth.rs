//! Account login against the node community API
//!
//! Only the CLI talks to this module; the session engine needs nothing but
//! the resulting user id.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("API response is missing {0}")]
    MissingField(&'static str),

    #[error("no API key configured (set auth.api_key or FLYNN_API_KEY)")]
    NoApiKey,

    #[error("account file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid account data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tokens and identity returned by a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
}

pub struct AuthClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl AuthClient {
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, AuthError> {
        if api_key.trim().is_empty() {
            return Err(AuthError::NoApiKey);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Password grant
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        self.token("password", json!({ "email": email, "password": password }))
            .await
    }

    /// Refresh-token grant
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthSession, AuthError> {
        self.token("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }

    /// Referral code attached to the profile, if any
    pub async fn personal_code(&self, session: &AuthSession) -> Result<Option<String>, AuthError> {
        let url = format!("{}/rest/v1/profiles", self.api_url);
        let id_filter = format!("eq.{}", session.user_id);
        let response = self
            .http
            .get(&url)
            .query(&[("select", "personal_code"), ("id", id_filter.as_str())])
            .header("apikey", &self.api_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        let profiles: Value = Self::checked(response).await?.json().await?;
        Ok(parse_personal_code(&profiles))
    }

    async fn token(&self, grant: &str, body: Value) -> Result<AuthSession, AuthError> {
        let url = format!("{}/auth/v1/token", self.api_url);
        debug!("POST {} (grant_type={})", url, grant);

        let response = self
            .http
            .post(&url)
            .query(&[("grant_type", grant)])
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let token: TokenResponse = Self::checked(response).await?.json().await?;

        let user_id = match token.user {
            Some(user) if !user.id.is_empty() => user.id,
            _ => self.user_id(&token.access_token).await?,
        };

        Ok(AuthSession {
            user_id,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        })
    }

    async fn user_id(&self, access_token: &str) -> Result<String, AuthError> {
        let url = format!("{}/auth/v1/user", self.api_url);
        let response = self
            .http
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;
        let user: Value = Self::checked(response).await?.json().await?;
        user.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AuthError::MissingField("user id"))
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AuthError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_personal_code(profiles: &Value) -> Option<String> {
    profiles
        .as_array()?
        .first()?
        .get("personal_code")?
        .as_str()
        .map(str::to_string)
}

/// Persisted login details. Passwords are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_code: Option<String>,
}

pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable records load as `None`.
    pub fn load(&self) -> Option<AccountRecord> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring unreadable account file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, record: &AccountRecord) -> Result<(), AuthError> {
        let io_err = |source| AuthError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(record)?).map_err(io_err)
    }

    pub fn clear(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AuthError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_client_requires_api_key() {
        assert!(matches!(
            AuthClient::new("https://api.example.com", " "),
            Err(AuthError::NoApiKey)
        ));
        let client = AuthClient::new("https://api.example.com/", "anon").unwrap();
        assert_eq!(client.api_url, "https://api.example.com");
    }

    #[test]
    fn test_token_response_with_and_without_user() {
        let with_user: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":3600,"user":{"id":"u-1","email":"x@y"}}"#,
        )
        .unwrap();
        assert_eq!(with_user.user.unwrap().id, "u-1");

        let bare: TokenResponse = serde_json::from_str(r#"{"access_token":"a","refresh_token":"r"}"#).unwrap();
        assert!(bare.user.is_none());
    }

    #[test]
    fn test_parse_personal_code() {
        assert_eq!(
            parse_personal_code(&json!([{ "personal_code": "ABC123" }])),
            Some("ABC123".to_string())
        );
        assert_eq!(parse_personal_code(&json!([])), None);
        assert_eq!(parse_personal_code(&json!([{ "personal_code": null }])), None);
        assert_eq!(parse_personal_code(&json!({ "personal_code": "x" })), None);
    }

    #[test]
    fn test_account_store_roundtrip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = AccountStore::open(dir.path().join("account.json"));
        assert!(store.load().is_none());

        let record = AccountRecord {
            email: "node@example.com".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            personal_code: Some("ABC123".to_string()),
        };
        store.save(&record).unwrap();
        assert_eq!(store.load(), Some(record));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("refreshToken"));
        assert!(!raw.contains("password"));

        store.clear().unwrap();
        assert!(store.load().is_none());
        store.clear().unwrap();
    }
}
