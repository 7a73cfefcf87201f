//! OAuth without a browser: the redirect is followed by an HTTP client.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{header, Client, Response, Url};

use super::provider::{code_from_url, AuthStorage, AuthorizationOutcome, ClientMetadata, OAuthProvider};
use crate::error::{McpError, McpResult};

/// Provider that captures the authorization code programmatically.
///
/// Works against authorization servers that grant consent without user
/// interaction (pre-approved clients, test servers, service accounts).
pub struct HeadlessOAuthProvider {
    storage: AuthStorage,
    redirect_url: String,
    client_name: String,
    scope: Option<String>,
    http: Client,
}

impl HeadlessOAuthProvider {
    pub fn new(storage: AuthStorage, redirect_url: impl Into<String>) -> McpResult<Self> {
        let http = Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| McpError::Auth(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            storage,
            redirect_url: redirect_url.into(),
            client_name: crate::protocol::CLIENT_NAME.to_string(),
            scope: None,
            http,
        })
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    async fn get(&self, url: &str) -> McpResult<Response> {
        self.http
            .get(url)
            .send()
            .await
            .map_err(|e| McpError::Auth(format!("authorization request failed: {}", e)))
    }
}

/// Absolute `Location` target of a redirect response.
fn location(response: &Response) -> Option<String> {
    if !response.status().is_redirection() {
        return None;
    }
    let raw = response.headers().get(header::LOCATION)?.to_str().ok()?;
    match Url::parse(raw) {
        Ok(url) => Some(url.to_string()),
        Err(_) => response.url().join(raw).ok().map(|u| u.to_string()),
    }
}

#[async_trait]
impl OAuthProvider for HeadlessOAuthProvider {
    fn storage(&self) -> &AuthStorage {
        &self.storage
    }

    fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata::public_client(&self.client_name, &self.redirect_url, self.scope.clone())
    }

    async fn redirect_to_authorization(&self, url: &str) -> McpResult<AuthorizationOutcome> {
        self.storage.save_last_auth_url(url)?;

        let first = self.get(url).await?;
        let final_url = match location(&first) {
            Some(target) => {
                if let Some((code, state)) = code_from_url(&target) {
                    return Ok(AuthorizationOutcome::Code { code, state });
                }
                // Follow exactly one hop; anything further is not chased.
                let second = self.get(&target).await?;
                location(&second).unwrap_or_else(|| second.url().to_string())
            }
            None => first.url().to_string(),
        };

        code_from_url(&final_url)
            .map(|(code, state)| AuthorizationOutcome::Code { code, state })
            .ok_or_else(|| {
                McpError::Auth(format!("no authorization code found in redirect to {}", final_url))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response per accepted connection.
    async fn serve(responses: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    fn redirect_to(location: &str) -> String {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            location
        )
    }

    fn ok() -> String {
        "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_string()
    }

    fn provider() -> HeadlessOAuthProvider {
        let storage = AuthStorage::new(Arc::new(MemoryTokenStore::new()), "https://mcp/x");
        HeadlessOAuthProvider::new(storage, "http://localhost:8765/cb").unwrap()
    }

    #[tokio::test]
    async fn test_code_in_first_redirect() {
        let base = serve(vec![redirect_to("http://localhost:8765/cb?code=abc&state=s")]).await;
        let outcome = provider().redirect_to_authorization(&format!("{}/authorize", base)).await.unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Code { code: "abc".into(), state: Some("s".into()) });
    }

    #[tokio::test]
    async fn test_code_after_one_hop() {
        let base = serve(vec![redirect_to("/consent"), redirect_to("http://localhost:8765/cb?code=xyz")])
            .await;
        let outcome = provider().redirect_to_authorization(&format!("{}/authorize", base)).await.unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Code { code: "xyz".into(), state: None });
    }

    #[tokio::test]
    async fn test_no_code_is_auth_error() {
        let base = serve(vec![ok()]).await;
        let err = provider().redirect_to_authorization(&format!("{}/authorize", base)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Auth);
    }
}
