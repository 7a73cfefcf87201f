//! OAuth for a human at a browser.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::provider::{code_from_url, AuthStorage, AuthorizationOutcome, ClientMetadata, OAuthProvider};
use crate::error::{McpError, McpResult};

/// How the authorization page is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractiveMode {
    /// Open a browser window and wait for the callback in-process.
    #[default]
    Popup,
    /// Send the user away; the caller finishes the flow when the callback arrives.
    Redirect,
}

type Opener = Arc<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

/// Open a URL with the platform's default handler.
pub fn open_in_browser(url: &str) -> io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut cmd = {
        let mut cmd = std::process::Command::new("open");
        cmd.arg(url);
        cmd
    };
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/c", "start", "", url]);
        cmd
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut cmd = {
        let mut cmd = std::process::Command::new("xdg-open");
        cmd.arg(url);
        cmd
    };

    cmd.spawn().map(|_| ())
}

/// Browser-driven provider.
pub struct InteractiveOAuthProvider {
    storage: AuthStorage,
    redirect_url: String,
    client_name: String,
    scope: Option<String>,
    mode: InteractiveMode,
    return_url: Option<String>,
    opener: Opener,
    callback_timeout: Duration,
    waiter: Mutex<Option<oneshot::Sender<(String, Option<String>)>>>,
}

impl InteractiveOAuthProvider {
    pub fn new(storage: AuthStorage, redirect_url: impl Into<String>) -> Self {
        Self {
            storage,
            redirect_url: redirect_url.into(),
            client_name: crate::protocol::CLIENT_NAME.to_string(),
            scope: None,
            mode: InteractiveMode::default(),
            return_url: None,
            opener: Arc::new(open_in_browser),
            callback_timeout: Duration::from_secs(300),
            waiter: Mutex::new(None),
        }
    }

    pub fn mode(mut self, mode: InteractiveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Page to come back to after a full redirect.
    pub fn return_to(mut self, url: impl Into<String>) -> Self {
        self.return_url = Some(url.into());
        self
    }

    /// Replace the browser launcher.
    pub fn opener(mut self, opener: impl Fn(&str) -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.opener = Arc::new(opener);
        self
    }

    /// How long a popup waits for its callback.
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Hand a received callback to the waiting popup flow.
    pub fn deliver_callback(&self, code: impl Into<String>, state: Option<String>) -> McpResult<()> {
        let sender = self
            .waiter
            .lock()
            .take()
            .ok_or_else(|| McpError::Auth("no authorization is waiting for a callback".to_string()))?;
        sender
            .send((code.into(), state))
            .map_err(|_| McpError::Auth("authorization attempt was abandoned".to_string()))
    }

    /// Parse a full callback URL and deliver it.
    pub fn deliver_callback_url(&self, url: &str) -> McpResult<()> {
        let (code, state) = code_from_url(url)
            .ok_or_else(|| McpError::Auth("callback URL carries no authorization code".to_string()))?;
        self.deliver_callback(code, state)
    }
}

#[async_trait]
impl OAuthProvider for InteractiveOAuthProvider {
    fn storage(&self) -> &AuthStorage {
        &self.storage
    }

    fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata::public_client(&self.client_name, &self.redirect_url, self.scope.clone())
    }

    fn return_url(&self) -> Option<String> {
        self.return_url.clone()
    }

    async fn redirect_to_authorization(&self, url: &str) -> McpResult<AuthorizationOutcome> {
        self.storage.save_last_auth_url(url)?;

        match self.mode {
            InteractiveMode::Redirect => {
                if let Err(e) = (self.opener)(url) {
                    tracing::warn!(error = %e, "could not open browser; visit the URL manually");
                }
                Ok(AuthorizationOutcome::Pending { url: url.to_string() })
            }
            InteractiveMode::Popup => {
                let (tx, rx) = oneshot::channel();
                *self.waiter.lock() = Some(tx);

                if let Err(e) = (self.opener)(url) {
                    self.waiter.lock().take();
                    return Err(McpError::Auth(format!("failed to open authorization popup: {}", e)));
                }

                match tokio::time::timeout(self.callback_timeout, rx).await {
                    Ok(Ok((code, state))) => Ok(AuthorizationOutcome::Code { code, state }),
                    Ok(Err(_)) => Err(McpError::Auth("authorization popup was closed".to_string())),
                    Err(_) => {
                        self.waiter.lock().take();
                        Err(McpError::Auth(format!(
                            "no authorization callback within {}s",
                            self.callback_timeout.as_secs()
                        )))
                    }
                }
            }
        }
    }
}
