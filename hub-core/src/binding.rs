//! Short-lived, single-use pairing tokens: a signed-in user requests a
//! token, types it into an agent, and the agent claims ownership by
//! presenting the token back over its socket.
//!
//! Grounded on `hub_server/services/binder.go`'s `BindingManager`: 3 random
//! bytes hex-encoded, 5 minute expiry, lazy sweep of expired entries under
//! the same lock held for the mutation that triggered it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::HubError;

const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    user_id: i64,
    expires_at: Instant,
}

pub struct BindingStore {
    tokens: Mutex<HashMap<String, Entry>>,
}

impl Default for BindingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingStore {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn generate(&self, user_id: i64) -> String {
        let mut tokens = self.tokens.lock();
        sweep_expired(&mut tokens);

        let mut bytes = [0u8; 3];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        tokens.insert(
            token.clone(),
            Entry {
                user_id,
                expires_at: Instant::now() + TOKEN_TTL,
            },
        );
        token
    }

    /// One-shot: the entry is removed whether it was valid or expired.
    pub fn consume(&self, token: &str) -> Result<i64, HubError> {
        let mut tokens = self.tokens.lock();
        match tokens.remove(token) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.user_id),
            _ => Err(HubError::InvalidRequest("invalid or expired token".into())),
        }
    }
}

fn sweep_expired(tokens: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    tokens.retain(|_, entry| entry.expires_at > now);
}

/// Minimal hex encoder so this module doesn't need to pull in an extra
/// crate just for 3 bytes -> 6 chars.
mod hex {
    pub fn encode(bytes: [u8; 3]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_six_hex_chars() {
        let store = BindingStore::new();
        let token = store.generate(7);
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn consume_returns_the_owning_user_id() {
        let store = BindingStore::new();
        let token = store.generate(42);
        assert_eq!(store.consume(&token).unwrap(), 42);
    }

    #[test]
    fn token_is_single_use() {
        let store = BindingStore::new();
        let token = store.generate(1);
        assert!(store.consume(&token).is_ok());
        assert!(store.consume(&token).is_err());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let store = BindingStore::new();
        assert!(store.consume("deadbe").is_err());
    }

    #[test]
    fn expired_token_is_rejected_and_removed() {
        let store = BindingStore::new();
        let token = store.generate(1);
        {
            let mut tokens = store.tokens.lock();
            let entry = tokens.get_mut(&token).unwrap();
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
        assert!(store.consume(&token).is_err());
        assert!(store.tokens.lock().is_empty());
    }
}
