//! The OAuth provider contract and its persisted state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::state::{self, StateRecord, STATE_TTL_SECS};
use super::store::{server_key_prefix, TokenStore};
use crate::error::{McpError, McpResult};

/// Tokens issued by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Unix seconds when the token response was received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_at: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthTokens {
    /// Bearer token with no expiry information.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_in: None,
            refresh_token: None,
            scope: None,
            obtained_at: None,
        }
    }

    /// Whether the access token is past its lifetime (with 30 s of slack).
    /// Tokens without expiry data never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.obtained_at, self.expires_in) {
            (Some(obtained), Some(lifetime)) => {
                now.timestamp() + 30 >= obtained.saturating_add(lifetime as i64)
            }
            _ => false,
        }
    }
}

/// Client credentials from registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Metadata sent with dynamic client registration.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadata {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ClientMetadata {
    /// Public client using the authorization-code grant with PKCE.
    pub fn public_client(name: &str, redirect_url: &str, scope: Option<String>) -> Self {
        Self {
            client_name: name.to_string(),
            redirect_uris: vec![redirect_url.to_string()],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: "none".into(),
            scope,
        }
    }
}

/// Result of handing an authorization URL to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// The code was captured in-process.
    Code { code: String, state: Option<String> },
    /// The user was sent away; the flow completes later via a callback.
    Pending { url: String },
}

/// Pull `code` and `state` out of a callback or redirect URL.
pub fn code_from_url(url: &str) -> Option<(String, Option<String>)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let mut code = None;
    let mut state = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    code.map(|c| (c, state))
}

const TOKENS: &str = "tokens";
const CLIENT_INFO: &str = "client_info";
const CODE_VERIFIER: &str = "code_verifier";
const LAST_AUTH_URL: &str = "last_auth_url";

/// Per-server OAuth state on top of a [`TokenStore`].
///
/// Every key carries a hash of the server URL so several servers can share
/// one store.
#[derive(Clone)]
pub struct AuthStorage {
    store: Arc<dyn TokenStore>,
    server_url: String,
    prefix: String,
}

impl std::fmt::Debug for AuthStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStorage").field("server_url", &self.server_url).finish()
    }
}

impl AuthStorage {
    pub fn new(store: Arc<dyn TokenStore>, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into();
        let prefix = server_key_prefix(&server_url);
        Self { store, server_url, prefix }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Storage key for one piece of state.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn TokenStore {
        self.store.as_ref()
    }

    pub fn client_information(&self) -> McpResult<Option<ClientInformation>> {
        self.load(CLIENT_INFO)
    }

    pub fn save_client_information(&self, info: &ClientInformation) -> McpResult<()> {
        self.store.set(&self.key(CLIENT_INFO), &state::encode_record("client information", info)?)
    }

    /// Stored tokens. A corrupt entry is purged and reported as absent.
    pub fn tokens(&self) -> McpResult<Option<OAuthTokens>> {
        self.load(TOKENS)
    }

    /// Persist tokens and drop the verifier and auth URL of the finished attempt.
    pub fn save_tokens(&self, tokens: &OAuthTokens) -> McpResult<()> {
        self.store.set(&self.key(TOKENS), &state::encode_record("tokens", tokens)?)?;
        self.store.remove(&self.key(CODE_VERIFIER))?;
        self.store.remove(&self.key(LAST_AUTH_URL))
    }

    /// The saved PKCE verifier; its absence is an error.
    pub fn code_verifier(&self) -> McpResult<String> {
        self.store.get(&self.key(CODE_VERIFIER))?.ok_or_else(|| {
            McpError::Auth(format!(
                "no code verifier saved for {}; start a new authorization",
                self.server_url
            ))
        })
    }

    pub fn save_code_verifier(&self, verifier: &str) -> McpResult<()> {
        self.store.set(&self.key(CODE_VERIFIER), verifier)
    }

    pub fn last_auth_url(&self) -> McpResult<Option<String>> {
        self.store.get(&self.key(LAST_AUTH_URL))
    }

    pub fn save_last_auth_url(&self, url: &str) -> McpResult<()> {
        self.store.set(&self.key(LAST_AUTH_URL), url)
    }

    /// Issue a single-use state nonce.
    pub fn issue_state(&self, return_url: Option<String>) -> McpResult<String> {
        state::issue(
            self.store.as_ref(),
            &self.prefix,
            return_url,
            Duration::seconds(STATE_TTL_SECS),
            Utc::now(),
        )
    }

    /// Consume a state nonce, failing closed on anything but a live nonce.
    pub fn consume_state(&self, state: &str) -> McpResult<StateRecord> {
        state::consume(self.store.as_ref(), &self.prefix, state, Utc::now())
    }

    /// Remove everything stored for this server.
    pub fn clear(&self) -> McpResult<()> {
        for key in self.store.keys(&self.prefix)? {
            self.store.remove(&key)?;
        }
        Ok(())
    }

    fn load<T: serde::de::DeserializeOwned>(&self, suffix: &str) -> McpResult<Option<T>> {
        let key = self.key(suffix);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(server = %self.server_url, key = %key, error = %e, "purging corrupt OAuth entry");
                self.store.remove(&key)?;
                Ok(None)
            }
        }
    }
}

/// Pluggable OAuth client capability used by network connectors.
///
/// Implementors supply storage and the redirect behaviour; the storage-backed
/// accessors are provided.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Per-server persisted state.
    fn storage(&self) -> &AuthStorage;

    /// Redirect URI registered with the authorization server.
    fn redirect_url(&self) -> &str;

    /// Metadata for dynamic client registration.
    fn client_metadata(&self) -> ClientMetadata;

    /// Send the user (or an HTTP client) to the authorization URL.
    async fn redirect_to_authorization(&self, url: &str) -> McpResult<AuthorizationOutcome>;

    /// Where to return after a full-page redirect completes.
    fn return_url(&self) -> Option<String> {
        None
    }

    fn server_url(&self) -> &str {
        self.storage().server_url()
    }

    fn client_information(&self) -> McpResult<Option<ClientInformation>> {
        self.storage().client_information()
    }

    fn save_client_information(&self, info: &ClientInformation) -> McpResult<()> {
        self.storage().save_client_information(info)
    }

    fn tokens(&self) -> McpResult<Option<OAuthTokens>> {
        self.storage().tokens()
    }

    fn save_tokens(&self, tokens: &OAuthTokens) -> McpResult<()> {
        self.storage().save_tokens(tokens)
    }

    fn code_verifier(&self) -> McpResult<String> {
        self.storage().code_verifier()
    }

    fn save_code_verifier(&self, verifier: &str) -> McpResult<()> {
        self.storage().save_code_verifier(verifier)
    }
}
