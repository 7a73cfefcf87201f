//! Authorization-code + PKCE flow driver.
//!
//! Connectors ask the flow for a bearer token before each request and call
//! [`OAuthFlow::authorize`] when a server answers 401.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, Url};
use serde::Deserialize;

use super::pkce::PkceChallenge;
use super::provider::{AuthorizationOutcome, ClientInformation, OAuthProvider, OAuthTokens};
use crate::error::{McpError, McpResult};

/// Authorization server endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

impl AuthServerMetadata {
    /// Conventional endpoints at the server origin.
    pub fn fallback(origin: &Url) -> McpResult<Self> {
        let join = |path: &str| {
            origin
                .join(path)
                .map(|u| u.to_string())
                .map_err(|e| McpError::Auth(format!("invalid server URL: {}", e)))
        };
        Ok(Self {
            authorization_endpoint: join("/authorize")?,
            token_endpoint: join("/token")?,
            registration_endpoint: Some(join("/register")?),
        })
    }
}

/// How an authorization attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Tokens are stored and ready to use.
    Authorized,
    /// The user was redirected; call [`OAuthFlow::finish`] with the callback.
    Redirected { url: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Drives discovery, registration, authorization, exchange and refresh.
#[derive(Clone)]
pub struct OAuthFlow {
    provider: Arc<dyn OAuthProvider>,
    http: Client,
}

impl OAuthFlow {
    pub fn new(provider: Arc<dyn OAuthProvider>) -> Self {
        Self { provider, http: Client::new() }
    }

    pub fn provider(&self) -> &Arc<dyn OAuthProvider> {
        &self.provider
    }

    fn origin(&self) -> McpResult<Url> {
        let url = Url::parse(self.provider.server_url())
            .map_err(|e| McpError::Auth(format!("invalid server URL: {}", e)))?;
        url.join("/").map_err(|e| McpError::Auth(format!("invalid server URL: {}", e)))
    }

    /// Fetch `/.well-known/oauth-authorization-server`, falling back to defaults.
    pub async fn discover(&self) -> McpResult<AuthServerMetadata> {
        let origin = self.origin()?;
        let well_known = origin
            .join("/.well-known/oauth-authorization-server")
            .map_err(|e| McpError::Auth(e.to_string()))?;

        match self.http.get(well_known.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<AuthServerMetadata>().await {
                    Ok(metadata) => return Ok(metadata),
                    Err(e) => tracing::debug!(url = %well_known, error = %e, "bad metadata document"),
                }
            }
            Ok(response) => {
                tracing::debug!(url = %well_known, status = %response.status(), "no metadata document")
            }
            Err(e) => tracing::debug!(url = %well_known, error = %e, "metadata discovery failed"),
        }
        AuthServerMetadata::fallback(&origin)
    }

    /// Stored client info, registering dynamically when absent.
    pub async fn ensure_client(&self, metadata: &AuthServerMetadata) -> McpResult<ClientInformation> {
        if let Some(info) = self.provider.client_information()? {
            return Ok(info);
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            McpError::Auth("server does not support dynamic client registration".to_string())
        })?;
        let response = self
            .http
            .post(endpoint)
            .json(&self.provider.client_metadata())
            .send()
            .await
            .map_err(|e| McpError::Auth(format!("client registration failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(McpError::Auth(format!(
                "client registration rejected with HTTP {}",
                response.status()
            )));
        }

        let info: ClientInformation = response
            .json()
            .await
            .map_err(|e| McpError::Auth(format!("invalid registration response: {}", e)))?;
        self.provider.save_client_information(&info)?;
        Ok(info)
    }

    /// Authorization URL for a fresh attempt. Saves the verifier and issues a state nonce.
    pub fn authorization_url(
        &self,
        metadata: &AuthServerMetadata,
        client: &ClientInformation,
    ) -> McpResult<String> {
        let pkce = PkceChallenge::generate();
        self.provider.save_code_verifier(&pkce.verifier)?;
        let state = self.provider.storage().issue_state(self.provider.return_url())?;

        let mut url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| McpError::Auth(format!("invalid authorization endpoint: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &client.client_id)
                .append_pair("redirect_uri", self.provider.redirect_url())
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", PkceChallenge::METHOD)
                .append_pair("state", &state);
            if let Some(scope) = &self.provider.client_metadata().scope {
                query.append_pair("scope", scope);
            }
        }
        Ok(url.to_string())
    }

    /// Run an authorization attempt end to end.
    pub async fn authorize(&self) -> McpResult<AuthResult> {
        let metadata = self.discover().await?;
        let client = self.ensure_client(&metadata).await?;
        let url = self.authorization_url(&metadata, &client)?;

        tracing::debug!(server = %self.provider.server_url(), "starting OAuth authorization");
        match self.provider.redirect_to_authorization(&url).await? {
            AuthorizationOutcome::Code { code, state } => {
                let state = state.ok_or_else(|| {
                    McpError::Auth("authorization response is missing state".to_string())
                })?;
                self.provider.storage().consume_state(&state)?;
                self.exchange(&metadata, &client, &code).await?;
                Ok(AuthResult::Authorized)
            }
            AuthorizationOutcome::Pending { url } => Ok(AuthResult::Redirected { url }),
        }
    }

    /// Complete a redirected attempt with the callback's `code` and `state`.
    pub async fn finish(&self, code: &str, state: &str) -> McpResult<Option<String>> {
        let record = self.provider.storage().consume_state(state)?;
        let metadata = self.discover().await?;
        let client = self.provider.client_information()?.ok_or_else(|| {
            McpError::Auth("no client registration for this authorization".to_string())
        })?;
        self.exchange(&metadata, &client, code).await?;
        Ok(record.return_url)
    }

    async fn exchange(
        &self,
        metadata: &AuthServerMetadata,
        client: &ClientInformation,
        code: &str,
    ) -> McpResult<()> {
        let verifier = self.provider.code_verifier()?;

        let mut form = HashMap::new();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", self.provider.redirect_url().to_string());
        form.insert("client_id", client.client_id.clone());
        form.insert("code_verifier", verifier);
        if let Some(secret) = &client.client_secret {
            form.insert("client_secret", secret.clone());
        }

        let tokens = self.token_request(&metadata.token_endpoint, &form, None).await?;
        self.provider.save_tokens(&tokens)
    }

    /// Trade the refresh token for a new access token.
    pub async fn refresh(&self, tokens: &OAuthTokens) -> McpResult<OAuthTokens> {
        let refresh_token = tokens
            .refresh_token
            .clone()
            .ok_or_else(|| McpError::Auth("no refresh token available".to_string()))?;
        let metadata = self.discover().await?;
        let client = self
            .provider
            .client_information()?
            .ok_or_else(|| McpError::Auth("no client registration to refresh with".to_string()))?;

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.clone());
        form.insert("client_id", client.client_id.clone());
        if let Some(secret) = &client.client_secret {
            form.insert("client_secret", secret.clone());
        }

        let refreshed = self.token_request(&metadata.token_endpoint, &form, Some(refresh_token)).await?;
        self.provider.save_tokens(&refreshed)?;
        Ok(refreshed)
    }

    async fn token_request(
        &self,
        endpoint: &str,
        form: &HashMap<&str, String>,
        previous_refresh: Option<String>,
    ) -> McpResult<OAuthTokens> {
        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| McpError::Auth(format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Auth(format!("token endpoint returned HTTP {}: {}", status, body)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| McpError::Auth(format!("invalid token response: {}", e)))?;
        Ok(OAuthTokens {
            access_token: body.access_token,
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in: body.expires_in,
            refresh_token: body.refresh_token.or(previous_refresh),
            scope: body.scope,
            obtained_at: Some(Utc::now().timestamp()),
        })
    }

    /// A usable access token, refreshing it first when it has expired.
    pub async fn access_token(&self) -> McpResult<Option<String>> {
        let Some(tokens) = self.provider.tokens()? else {
            return Ok(None);
        };
        if !tokens.is_expired(Utc::now()) {
            return Ok(Some(tokens.access_token));
        }
        if tokens.refresh_token.is_none() {
            return Ok(None);
        }
        match self.refresh(&tokens).await {
            Ok(refreshed) => Ok(Some(refreshed.access_token)),
            Err(e) => {
                tracing::warn!(server = %self.provider.server_url(), error = %e, "token refresh failed");
                Ok(None)
            }
        }
    }

    /// Authorize and report whether tokens are now available.
    pub async fn authorize_or_fail(&self) -> McpResult<()> {
        match self.authorize().await? {
            AuthResult::Authorized => Ok(()),
            AuthResult::Redirected { url } => Err(McpError::Auth(format!(
                "authorization required for {}; complete it at {}",
                self.provider.server_url(),
                url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::AuthStorage;
    use crate::auth::store::MemoryTokenStore;
    use crate::auth::provider::ClientMetadata;
    use crate::auth::{InteractiveMode, InteractiveOAuthProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn flow(server_url: &str) -> (OAuthFlow, Arc<InteractiveOAuthProvider>) {
        let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), server_url);
        let provider = Arc::new(
            InteractiveOAuthProvider::new(storage, "http://localhost:8765/cb")
                .mode(InteractiveMode::Redirect)
                .opener(|_| Ok(())),
        );
        (OAuthFlow::new(provider.clone()), provider)
    }

    #[test]
    fn test_fallback_metadata() {
        let origin = Url::parse("https://mcp.example.com/").unwrap();
        let metadata = AuthServerMetadata::fallback(&origin).unwrap();
        assert_eq!(metadata.authorization_endpoint, "https://mcp.example.com/authorize");
        assert_eq!(metadata.token_endpoint, "https://mcp.example.com/token");
        assert_eq!(metadata.registration_endpoint.as_deref(), Some("https://mcp.example.com/register"));
    }

    #[test]
    fn test_authorization_url_carries_pkce_and_state() {
        let (flow, provider) = flow("https://mcp.example.com/mcp");
        let metadata = AuthServerMetadata::fallback(&Url::parse("https://mcp.example.com/").unwrap()).unwrap();
        let client = ClientInformation { client_id: "cid".into(), client_secret: None };

        let url = Url::parse(&flow.authorization_url(&metadata, &client).unwrap()).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["code_challenge_method"], "S256");

        let verifier = provider.code_verifier().unwrap();
        assert_eq!(params["code_challenge"], PkceChallenge::from_verifier(verifier).challenge);
        assert!(provider.storage().consume_state(&params["state"]).is_ok());
    }

    #[tokio::test]
    async fn test_finish_rejects_unknown_state() {
        let (flow, _) = flow("http://127.0.0.1:9/mcp");
        let err = flow.finish("code", "never-issued").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_access_token_uses_stored_tokens() {
        let (flow, provider) = flow("http://127.0.0.1:9/mcp");
        assert!(flow.access_token().await.unwrap().is_none());

        provider.save_tokens(&OAuthTokens::bearer("tok")).unwrap();
        assert_eq!(flow.access_token().await.unwrap().as_deref(), Some("tok"));
    }

    /// How the captured redirect reports `state`.
    enum StateReply {
        Missing,
        Echo,
        Fixed(&'static str),
    }

    /// Provider that "captures" a code without any user agent.
    struct CapturingProvider {
        storage: AuthStorage,
        reply: StateReply,
    }

    #[async_trait]
    impl OAuthProvider for CapturingProvider {
        fn storage(&self) -> &AuthStorage {
            &self.storage
        }

        fn redirect_url(&self) -> &str {
            "http://localhost:8765/cb"
        }

        fn client_metadata(&self) -> ClientMetadata {
            ClientMetadata::public_client("test", self.redirect_url(), None)
        }

        async fn redirect_to_authorization(&self, url: &str) -> McpResult<AuthorizationOutcome> {
            let issued = Url::parse(url)
                .unwrap()
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned());
            let state = match &self.reply {
                StateReply::Missing => None,
                StateReply::Echo => issued,
                StateReply::Fixed(s) => Some(s.to_string()),
            };
            Ok(AuthorizationOutcome::Code { code: "captured-code".into(), state })
        }
    }

    /// Authorization server answering `/token` and 404 for everything else.
    async fn token_server(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = if request.starts_with("POST /token") {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"access_token":"issued","token_type":"Bearer"}"#;
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    async fn capturing_flow(reply: StateReply) -> (OAuthFlow, Arc<CapturingProvider>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = token_server(hits.clone()).await;
        let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), format!("{}/mcp", base));
        storage
            .save_client_information(&ClientInformation { client_id: "cid".into(), client_secret: None })
            .unwrap();
        let provider = Arc::new(CapturingProvider { storage, reply });
        (OAuthFlow::new(provider.clone()), provider, hits)
    }

    #[tokio::test]
    async fn test_authorize_rejects_missing_state() {
        let (flow, provider, hits) = capturing_flow(StateReply::Missing).await;

        let err = flow.authorize().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
        assert!(err.to_string().contains("missing state"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(provider.tokens().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authorize_rejects_foreign_state() {
        let (flow, provider, hits) = capturing_flow(StateReply::Fixed("forged")).await;

        let err = flow.authorize().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(provider.tokens().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_authorize_with_issued_state_saves_tokens() {
        let (flow, provider, hits) = capturing_flow(StateReply::Echo).await;

        assert_eq!(flow.authorize().await.unwrap(), AuthResult::Authorized);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(provider.tokens().unwrap().unwrap().access_token, "issued");
    }
}
