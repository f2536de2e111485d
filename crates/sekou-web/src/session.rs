//! Passphrase login and single-use session tokens for the manual resync pages.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const COOKIE_NAME: &str = "authenticated";
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Outstanding tokens, stored as hex SHA-256 digests with their expiry.
pub struct SessionStore {
    passphrase: Option<[u8; 32]>,
    tokens: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl SessionStore {
    /// Without a passphrase every login attempt is refused.
    pub fn new(passphrase: Option<&str>) -> Self {
        Self {
            passphrase: passphrase.map(digest),
            tokens: Mutex::new(HashMap::new()),
            ttl: SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn login_enabled(&self) -> bool {
        self.passphrase.is_some()
    }

    /// A fresh token when `attempt` matches the passphrase.
    pub fn login(&self, attempt: &str) -> Option<String> {
        let expected = self.passphrase.as_ref()?;
        if !constant_time_eq(expected, &digest(attempt)) {
            return None;
        }
        let token = Uuid::new_v4().simple().to_string();
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        tokens.retain(|_, expires| *expires > now);
        tokens.insert(hex::encode(digest(&token)), now + self.ttl);
        Some(token)
    }

    /// Is `token` live? Leaves it in place.
    pub fn check(&self, token: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .get(&hex::encode(digest(token)))
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Is `token` live? Revokes it either way.
    pub fn consume(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens
            .remove(&hex::encode(digest(token)))
            .is_some_and(|expires| expires > Instant::now())
    }
}

pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        ttl.as_secs()
    )
}

pub fn cleared_cookie() -> String {
    format!("{COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

/// Value of the session cookie from the request's `Cookie` headers.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
