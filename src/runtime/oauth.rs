//! OAuth surface (§4.13): GitHub device-code flow for Copilot, Google
//! authorization-code + PKCE flow for Antigravity, plus status/disconnect.
//!
//! Token exchange calls reuse the plain `reqwest::Client` + bearer-token
//! idiom used elsewhere in this crate's HTTP clients; the PKCE verifier/
//! challenge generation follows the same base64/SHA-256 primitives already
//! used by `vault.rs`.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;
use crate::db::queries::{self, OAuthCredentialRow, OAuthStateRow};
use crate::db::{Database, DbError};
use crate::vault::{TokenVault, VaultError};

const GITHUB_DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const GITHUB_ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const DEFAULT_GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const DEFAULT_GOOGLE_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6avd8ow6ayorg.apps.googleusercontent.com";
const DEFAULT_GOOGLE_CLIENT_SECRET: &str = "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";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("state expired or unknown")]
    StateExpired,
    #[error("authorization pending")]
    AuthorizationPending,
    #[error("slow down")]
    SlowDown,
    #[error("upstream denied: {0}")]
    Denied(String),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceStartResult {
    pub state_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct OAuthStatusEntry {
    pub provider: String,
    pub connected: bool,
    pub source: Option<String>,
    pub email: Option<String>,
    pub scope: Option<String>,
}

pub struct OAuthService {
    db: Arc<Database>,
    vault: Arc<TokenVault>,
    config: Arc<Config>,
    http: reqwest::Client,
}

impl OAuthService {
    pub fn new(db: Arc<Database>, vault: Arc<TokenVault>, config: Arc<Config>) -> Self {
        Self { db, vault, config, http: reqwest::Client::new() }
    }

    fn github_client_id(&self) -> &str {
        self.config.oauth_github_client_id.as_deref().unwrap_or(DEFAULT_GITHUB_CLIENT_ID)
    }

    fn google_client_id(&self) -> &str {
        self.config.oauth_google_client_id.as_deref().unwrap_or(DEFAULT_GOOGLE_CLIENT_ID)
    }

    fn google_client_secret(&self) -> &str {
        self.config.oauth_google_client_secret.as_deref().unwrap_or(DEFAULT_GOOGLE_CLIENT_SECRET)
    }

    /// `POST /api/oauth/github-copilot/device-start`.
    pub async fn github_device_start(&self) -> Result<DeviceStartResult, OAuthError> {
        #[derive(Deserialize)]
        struct DeviceCodeResponse {
            device_code: String,
            user_code: String,
            verification_uri: String,
            interval: u64,
        }

        let resp: DeviceCodeResponse = self
            .http
            .post(GITHUB_DEVICE_CODE_URL)
            .header("Accept", "application/json")
            .form(&[("client_id", self.github_client_id()), ("scope", "read:user")])
            .send()
            .await?
            .json()
            .await?;

        let state_id = uuid::Uuid::new_v4().to_string();
        let encrypted_device_code = self.vault.encrypt(&resp.device_code)?;
        queries::insert_oauth_state(
            &self.db,
            &OAuthStateRow {
                id: state_id.clone(),
                provider: "copilot".to_string(),
                verifier: encrypted_device_code,
                redirect_to: None,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;

        Ok(DeviceStartResult {
            state_id,
            user_code: resp.user_code,
            verification_uri: resp.verification_uri,
            interval: resp.interval,
        })
    }

    /// `POST /api/oauth/github-copilot/device-poll`. The caller polls this
    /// on the server-provided `interval`; `AuthorizationPending`/`SlowDown`
    /// are expected, retryable outcomes, not failures.
    pub async fn github_device_poll(&self, state_id: &str) -> Result<(), OAuthError> {
        let state = queries::consume_oauth_state(&self.db, state_id, "copilot")?.ok_or(OAuthError::StateExpired)?;
        let device_code = self.vault.decrypt(&state.verifier)?;

        // Re-insert the state row since `consume` deletes unconditionally
        // and this flow is polled repeatedly until a terminal outcome.
        let reinsert = |db: &Database, vault: &TokenVault| -> Result<(), OAuthError> {
            let encrypted = vault.encrypt(&device_code)?;
            queries::insert_oauth_state(
                db,
                &OAuthStateRow {
                    id: state_id.to_string(),
                    provider: "copilot".to_string(),
                    verifier: encrypted,
                    redirect_to: None,
                    created_at: state.created_at.clone(),
                },
            )?;
            Ok(())
        };

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: Option<String>,
            error: Option<String>,
        }

        let resp: TokenResponse = self
            .http
            .post(GITHUB_ACCESS_TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.github_client_id()),
                ("device_code", device_code.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ])
            .send()
            .await?
            .json()
            .await?;

        match (resp.access_token, resp.error.as_deref()) {
            (Some(token), _) => {
                queries::upsert_oauth_credential(
                    &self.db,
                    &OAuthCredentialRow {
                        provider: "copilot".to_string(),
                        source: "web-oauth".to_string(),
                        email: None,
                        scope: Some("read:user".to_string()),
                        expires_at: None,
                        encrypted_data: None,
                        access_token: Some(token),
                        refresh_token: None,
                        updated_at: chrono::Utc::now().to_rfc3339(),
                    },
                )?;
                Ok(())
            }
            (None, Some("authorization_pending")) => {
                reinsert(&self.db, &self.vault)?;
                Err(OAuthError::AuthorizationPending)
            }
            (None, Some("slow_down")) => {
                reinsert(&self.db, &self.vault)?;
                Err(OAuthError::SlowDown)
            }
            (None, Some(other)) => Err(OAuthError::Denied(other.to_string())),
            (None, None) => Err(OAuthError::Denied("unknown".to_string())),
        }
    }

    /// `GET /api/oauth/start?provider=antigravity&redirect_to=`.
    pub fn google_authorize_url(&self, redirect_to: Option<&str>) -> Result<String, OAuthError> {
        let verifier = random_url_safe_string(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        let state_id = uuid::Uuid::new_v4().to_string();
        let encrypted_verifier = self.vault.encrypt(&verifier)?;
        queries::insert_oauth_state(
            &self.db,
            &OAuthStateRow {
                id: state_id.clone(),
                provider: "antigravity".to_string(),
                verifier: encrypted_verifier,
                redirect_to: redirect_to.map(|s| s.to_string()),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;

        let redirect_uri = format!("{}/api/oauth/callback/antigravity", self.config.oauth_base_url);
        let url = format!(
            "{GOOGLE_AUTH_URL}?client_id={client_id}&redirect_uri={redirect_uri}&response_type=code\
             &scope={scope}&access_type=offline&prompt=consent&state={state_id}\
             &code_challenge={challenge}&code_challenge_method=S256",
            client_id = urlencoding_light(self.google_client_id()),
            redirect_uri = urlencoding_light(&redirect_uri),
            scope = urlencoding_light("https://www.googleapis.com/auth/cloud-platform"),
        );
        Ok(url)
    }

    /// `GET /api/oauth/callback/antigravity`.
    pub async fn google_callback(&self, state_id: &str, code: &str) -> Result<Option<String>, OAuthError> {
        let state = queries::consume_oauth_state(&self.db, state_id, "antigravity")?.ok_or(OAuthError::StateExpired)?;
        let verifier = self.vault.decrypt(&state.verifier)?;

        let redirect_uri = format!("{}/api/oauth/callback/antigravity", self.config.oauth_base_url);

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: i64,
        }

        let resp: TokenResponse = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.google_client_id()),
                ("client_secret", self.google_client_secret()),
                ("code", code),
                ("code_verifier", verifier.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        let expires_at = (chrono::Utc::now() + chrono::Duration::seconds(resp.expires_in)).to_rfc3339();
        queries::upsert_oauth_credential(
            &self.db,
            &OAuthCredentialRow {
                provider: "antigravity".to_string(),
                source: "web-oauth".to_string(),
                email: None,
                scope: Some("https://www.googleapis.com/auth/cloud-platform".to_string()),
                expires_at: Some(expires_at),
                encrypted_data: None,
                access_token: Some(resp.access_token),
                refresh_token: resp.refresh_token,
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;

        Ok(state.redirect_to)
    }

    /// `GET /api/oauth/status`.
    pub fn status(&self) -> Result<Vec<OAuthStatusEntry>, OAuthError> {
        let mut entries = Vec::new();
        for provider in ["copilot", "antigravity"] {
            let row = queries::get_oauth_credential(&self.db, provider)?;
            let connected = row.as_ref().map(|r| r.access_token.is_some()).unwrap_or(false);
            entries.push(OAuthStatusEntry {
                provider: provider.to_string(),
                connected,
                source: row.as_ref().map(|r| r.source.clone()),
                email: row.as_ref().and_then(|r| r.email.clone()),
                scope: row.as_ref().and_then(|r| r.scope.clone()),
            });
        }
        Ok(entries)
    }

    /// `POST /api/oauth/disconnect`.
    pub fn disconnect(&self, provider: &str) -> Result<(), OAuthError> {
        queries::delete_oauth_credential(&self.db, provider)?;
        Ok(())
    }

    /// A usable bearer token for `provider`, refreshing the Antigravity
    /// access token via its stored refresh token when within 60 s of expiry
    /// (§4.6). Used by the HTTP Agent Runner just before spawning a turn.
    pub async fn valid_access_token(&self, provider: &str) -> Result<String, OAuthError> {
        let row = queries::get_oauth_credential(&self.db, provider)?.ok_or(OAuthError::StateExpired)?;
        let token = row.access_token.clone().ok_or(OAuthError::StateExpired)?;

        if provider != "antigravity" {
            return Ok(token);
        }

        let expires_soon = row
            .expires_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|exp| exp.with_timezone(&chrono::Utc) - chrono::Duration::seconds(60) <= chrono::Utc::now())
            .unwrap_or(true);

        if !expires_soon {
            return Ok(token);
        }
        let Some(refresh_token) = row.refresh_token.clone() else { return Ok(token) };

        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            expires_in: i64,
        }

        let resp: RefreshResponse = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.google_client_id()),
                ("client_secret", self.google_client_secret()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .json()
            .await?;

        let expires_at = (chrono::Utc::now() + chrono::Duration::seconds(resp.expires_in)).to_rfc3339();
        queries::upsert_oauth_credential(
            &self.db,
            &OAuthCredentialRow {
                provider: "antigravity".to_string(),
                source: row.source.clone(),
                email: row.email.clone(),
                scope: row.scope.clone(),
                expires_at: Some(expires_at),
                encrypted_data: row.encrypted_data.clone(),
                access_token: Some(resp.access_token.clone()),
                refresh_token: Some(refresh_token),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        )?;
        Ok(resp.access_token)
    }
}

fn random_url_safe_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Minimal `application/x-www-form-urlencoded`-style percent-encoding for
/// query-string values, avoiding a dedicated `url`/`percent-encoding`
/// dependency for the handful of characters these URLs actually need.
fn urlencoding_light(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_light_escapes_reserved_characters() {
        assert_eq!(urlencoding_light("a b/c"), "a%20b%2Fc");
        assert_eq!(urlencoding_light("hello-world_1.0~"), "hello-world_1.0~");
    }

    #[test]
    fn random_url_safe_string_has_no_padding() {
        let s = random_url_safe_string(32);
        assert!(!s.contains('='));
    }
}
