//! Anti-CSRF `state` nonces.
//!
//! Each nonce is stored with an expiry and removed on first use, so a replayed
//! or stale callback fails closed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::pkce::random_token;
use super::store::TokenStore;
use crate::error::{McpError, McpResult};

/// How long an issued nonce stays valid.
pub const STATE_TTL_SECS: i64 = 600;

/// What a nonce remembers about the attempt that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
}

/// Serialize a record for the token store.
pub(super) fn encode_record<T: Serialize>(what: &str, record: &T) -> McpResult<String> {
    serde_json::to_string(record).map_err(|e| McpError::Auth(format!("could not encode {}: {}", what, e)))
}

fn state_key(prefix: &str, state: &str) -> String {
    format!("{}_state_{}", prefix, state)
}

/// Issue a nonce valid until `now + ttl`.
pub fn issue(
    store: &dyn TokenStore,
    prefix: &str,
    return_url: Option<String>,
    ttl: Duration,
    now: DateTime<Utc>,
) -> McpResult<String> {
    let state = random_token();
    let record = StateRecord { expires_at: now + ttl, return_url };
    store.set(&state_key(prefix, &state), &encode_record("state", &record)?)?;
    Ok(state)
}

/// Consume a nonce. Unknown, replayed, malformed and expired nonces are all errors.
pub fn consume(
    store: &dyn TokenStore,
    prefix: &str,
    state: &str,
    now: DateTime<Utc>,
) -> McpResult<StateRecord> {
    if state.is_empty() || !state.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(McpError::Auth("unknown OAuth state".to_string()));
    }

    let key = state_key(prefix, state);
    let raw = store
        .get(&key)?
        .ok_or_else(|| McpError::Auth("unknown or already used OAuth state".to_string()))?;
    store.remove(&key)?;

    let record: StateRecord = serde_json::from_str(&raw)
        .map_err(|_| McpError::Auth("corrupt OAuth state record".to_string()))?;
    if now >= record.expires_at {
        return Err(McpError::Auth("OAuth state expired".to_string()));
    }
    Ok(record)
}

/// Drop expired nonces for `prefix`.
pub fn purge_expired(store: &dyn TokenStore, prefix: &str, now: DateTime<Utc>) -> McpResult<usize> {
    let mut purged = 0;
    for key in store.keys(&format!("{}_state_", prefix))? {
        let expired = match store.get(&key)? {
            Some(raw) => serde_json::from_str::<StateRecord>(&raw)
                .map(|r| now >= r.expires_at)
                .unwrap_or(true),
            None => false,
        };
        if expired {
            store.remove(&key)?;
            purged += 1;
        }
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use crate::error::ErrorKind;

    fn ttl() -> Duration {
        Duration::seconds(STATE_TTL_SECS)
    }

    #[test]
    fn test_state_is_single_use() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let state = issue(&store, "p", Some("/back".into()), ttl(), now).unwrap();

        let record = consume(&store, "p", &state, now).unwrap();
        assert_eq!(record.return_url.as_deref(), Some("/back"));

        let err = consume(&store, "p", &state, now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_expired_state_fails_closed() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let state = issue(&store, "p", None, ttl(), now).unwrap();

        let later = now + Duration::seconds(STATE_TTL_SECS + 1);
        let err = consume(&store, "p", &state, later).unwrap_err();
        assert!(err.to_string().contains("expired"));
        // Expired nonces are gone after the failed attempt too.
        assert!(consume(&store, "p", &state, now).is_err());
    }

    #[test]
    fn test_unknown_and_foreign_state() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        let state = issue(&store, "server-a", None, ttl(), now).unwrap();

        assert!(consume(&store, "server-b", &state, now).is_err());
        assert!(consume(&store, "server-a", "../../etc", now).is_err());
        assert!(consume(&store, "server-a", "", now).is_err());
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryTokenStore::new();
        let now = Utc::now();
        issue(&store, "p", None, Duration::seconds(-1), now).unwrap();
        let live = issue(&store, "p", None, ttl(), now).unwrap();

        assert_eq!(purge_expired(&store, "p", now).unwrap(), 1);
        assert!(consume(&store, "p", &live, now).is_ok());
    }

    #[test]
    fn test_unencodable_record_is_auth_error() {
        let record: std::collections::BTreeMap<Vec<u8>, i32> = [(vec![1u8], 1)].into_iter().collect();
        let err = encode_record("tokens", &record).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("could not encode tokens"));
    }
}
