//! OAuth client authentication for network transports.
//!
//! - [`OAuthProvider`]: storage plus redirect behaviour, in an interactive
//!   (browser) and a headless (HTTP client) flavour
//! - [`OAuthFlow`]: discovery, registration, PKCE code exchange and refresh
//! - [`TokenStore`]: durable or in-memory persistence, chosen by the caller

mod flow;
mod headless;
mod interactive;
mod pkce;
mod provider;
mod state;
mod store;

pub use flow::{AuthResult, AuthServerMetadata, OAuthFlow};
pub use headless::HeadlessOAuthProvider;
pub use interactive::{open_in_browser, InteractiveMode, InteractiveOAuthProvider};
pub use pkce::{random_token, PkceChallenge};
pub use provider::{
    code_from_url, AuthStorage, AuthorizationOutcome, ClientInformation, ClientMetadata,
    OAuthProvider, OAuthTokens,
};
pub use state::{StateRecord, STATE_TTL_SECS};
pub use store::{server_key_prefix, FileTokenStore, MemoryTokenStore, TokenStore};

use std::path::Path;
use std::sync::Arc;

use crate::config::{AuthMode, AuthSettings, TokenStorage};
use crate::error::McpResult;

/// Build a provider from declarative settings.
pub fn provider_from_settings(
    server_url: &str,
    settings: &AuthSettings,
    auth_dir: &Path,
) -> McpResult<Arc<dyn OAuthProvider>> {
    let store: Arc<dyn TokenStore> = match settings.storage {
        TokenStorage::File => Arc::new(FileTokenStore::new(auth_dir)),
        TokenStorage::Memory => Arc::new(MemoryTokenStore::new()),
    };
    let storage = AuthStorage::new(store, server_url);

    let provider: Arc<dyn OAuthProvider> = match settings.mode {
        AuthMode::Headless => {
            let mut provider = HeadlessOAuthProvider::new(storage, &settings.redirect_url)?
                .client_name(&settings.client_name);
            if let Some(scope) = &settings.scope {
                provider = provider.scope(scope);
            }
            Arc::new(provider)
        }
        AuthMode::Interactive => {
            let mode = if settings.popup { InteractiveMode::Popup } else { InteractiveMode::Redirect };
            let mut provider = InteractiveOAuthProvider::new(storage, &settings.redirect_url)
                .client_name(&settings.client_name)
                .mode(mode);
            if let Some(scope) = &settings.scope {
                provider = provider.scope(scope);
            }
            Arc::new(provider)
        }
    };
    Ok(provider)
}
