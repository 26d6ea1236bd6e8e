//! Password and token authentication.
//!
//! Passwords are bcrypt hashes on the user record. Tokens look like
//! `<token id hex>.<secret hex>`; only the md5 digest of the secret is kept,
//! in `auth/tokens/<id>`. Revoked ids are recorded in `auth/revoked/<id>`
//! until the token would have expired anyway.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use md5::{Digest, Md5};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::gid::{now_ms, Gid, GidGenerator};
use crate::session::Identity;
use crate::store::{Store, StoreError, StoreKey};
use crate::world::World;

const AUTH_NS: &str = "auth";
const TOKENS_NS: &str = "tokens";
const REVOKED_NS: &str = "revoked";
const SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Malformed credentials: {0}")]
    Malformed(String),

    #[error("Invalid credentials")]
    InvalidCredentials { retryable: bool },

    #[error("Account locked")]
    AccountLocked,

    #[error("Auth store error: {0}")]
    Store(#[from] StoreError),

    #[error("Auth internal error: {0}")]
    Internal(String),
}

/// Knobs taken from the server config.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub token_ttl: Duration,
    pub max_failed_logins: u32,
    pub lockout: Duration,
    pub bcrypt_cost: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Gid,
    pub user: Gid,
    /// md5 hex of the secret half.
    pub digest: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub id: Gid,
    pub user: Gid,
    pub revoked_at: u64,
    pub expires_at: u64,
}

/// What the client gets back after a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token_id: Gid,
    pub token: String,
    pub expires_at: u64,
}

fn token_key(id: Gid) -> Result<StoreKey, StoreError> {
    StoreKey::new([AUTH_NS, TOKENS_NS, id.to_hex().as_str()])
}

fn revoked_key(id: Gid) -> Result<StoreKey, StoreError> {
    StoreKey::new([AUTH_NS, REVOKED_NS, id.to_hex().as_str()])
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::new().chain_update(input).finalize())
}

/// Compares without stopping at the first differing byte.
fn digest_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct TokenStore {
    store: Store,
    ids: GidGenerator,
    tokens: DashMap<Gid, TokenRecord>,
    revoked: DashMap<Gid, Revocation>,
    ttl: Duration,
}

impl TokenStore {
    pub async fn load(store: Store, ttl: Duration) -> Result<Self, AuthError> {
        let tokens = DashMap::new();
        let revoked = DashMap::new();

        for name in store.list(&[AUTH_NS, TOKENS_NS]).await?.entries {
            let Ok(id) = Gid::from_hex(&name) else { continue };
            match read_json::<TokenRecord>(&store, &token_key(id)?).await {
                Some(record) if record.id == id => {
                    tokens.insert(id, record);
                }
                _ => tracing::warn!("[auth] [skip_token] file={}", name),
            }
        }
        for name in store.list(&[AUTH_NS, REVOKED_NS]).await?.entries {
            let Ok(id) = Gid::from_hex(&name) else { continue };
            match read_json::<Revocation>(&store, &revoked_key(id)?).await {
                Some(r) if r.id == id => {
                    revoked.insert(id, r);
                }
                _ => tracing::warn!("[auth] [skip_revocation] file={}", name),
            }
        }

        tracing::info!("[auth] [loaded] tokens={} revoked={}", tokens.len(), revoked.len());
        Ok(Self { store, ids: GidGenerator::new(), tokens, revoked, ttl })
    }

    pub async fn issue(&self, user: Gid) -> Result<IssuedToken, AuthError> {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        let secret = hex::encode(secret);

        let now = now_ms();
        let record = TokenRecord {
            id: self.ids.generate(),
            user,
            digest: md5_hex(&secret),
            issued_at: now,
            expires_at: now.saturating_add(self.ttl.as_millis() as u64),
        };
        write_json(&self.store, &token_key(record.id)?, &record).await?;
        self.tokens.insert(record.id, record.clone());

        Ok(IssuedToken {
            token_id: record.id,
            token: format!("{}.{}", record.id, secret),
            expires_at: record.expires_at,
        })
    }

    /// Checks a presented token. Every failure past the shape check looks
    /// the same to the caller.
    pub fn verify(&self, token: &str) -> Result<TokenRecord, AuthError> {
        let (id, secret) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("token must be <id>.<secret>".to_string()))?;
        let id = Gid::from_hex(id).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if secret.len() != SECRET_LEN * 2 || !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AuthError::Malformed("bad token secret".to_string()));
        }

        let denied = AuthError::InvalidCredentials { retryable: false };
        if self.revoked.contains_key(&id) {
            tracing::debug!("[auth] [token_denied] id={} reason=revoked", id);
            return Err(denied);
        }
        let record = match self.tokens.get(&id) {
            Some(r) => r.clone(),
            None => {
                tracing::debug!("[auth] [token_denied] id={} reason=unknown", id);
                return Err(denied);
            }
        };
        if record.expires_at <= now_ms() {
            tracing::debug!("[auth] [token_denied] id={} reason=expired", id);
            return Err(denied);
        }
        if !digest_eq(&record.digest, &md5_hex(&secret.to_ascii_lowercase())) {
            tracing::debug!("[auth] [token_denied] id={} reason=mismatch", id);
            return Err(denied);
        }
        Ok(record)
    }

    pub fn owner(&self, id: Gid) -> Option<Gid> {
        self.tokens.get(&id).map(|r| r.user)
    }

    pub fn is_revoked(&self, id: Gid) -> bool {
        self.revoked.contains_key(&id)
    }

    /// Revokes token `id`. Returns false if no such live token existed.
    pub async fn revoke(&self, id: Gid) -> Result<bool, AuthError> {
        let Some((_, record)) = self.tokens.remove(&id) else {
            return Ok(false);
        };
        let revocation = Revocation { id, user: record.user, revoked_at: now_ms(), expires_at: record.expires_at };
        self.revoked.insert(id, revocation.clone());
        write_json(&self.store, &revoked_key(id)?, &revocation).await?;
        self.store.delete(&token_key(id)?).await?;
        tracing::info!("[auth] [revoked] id={} user={}", id, record.user);
        Ok(true)
    }

    /// Forgets expired tokens and revocations of expired tokens.
    pub async fn purge_expired(&self) -> usize {
        let now = now_ms();
        let dead_tokens: Vec<Gid> = self.tokens.iter().filter(|r| r.expires_at <= now).map(|r| r.id).collect();
        let dead_revocations: Vec<Gid> = self.revoked.iter().filter(|r| r.expires_at <= now).map(|r| r.id).collect();

        let mut purged = 0;
        for id in dead_tokens {
            self.tokens.remove(&id);
            self.delete_quietly(token_key(id)).await;
            purged += 1;
        }
        for id in dead_revocations {
            self.revoked.remove(&id);
            self.delete_quietly(revoked_key(id)).await;
            purged += 1;
        }
        purged
    }

    async fn delete_quietly(&self, key: Result<StoreKey, StoreError>) {
        let result = match key {
            Ok(key) => self.store.delete(&key).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("[auth] [purge_failed] error={}", e);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(store: &Store, key: &StoreKey) -> Option<T> {
    let bytes = store.read(key).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn write_json<T: Serialize>(store: &Store, key: &StoreKey, value: &T) -> Result<(), AuthError> {
    let bytes = serde_json::to_vec(value).map_err(|e| AuthError::Internal(e.to_string()))?;
    store.write(key, &bytes).await?;
    Ok(())
}

pub struct Authenticator {
    pub tokens: TokenStore,
    failures: DashMap<Gid, VecDeque<Instant>>,
    policy: AuthPolicy,
}

impl Authenticator {
    pub fn new(tokens: TokenStore, policy: AuthPolicy) -> Self {
        Self { tokens, failures: DashMap::new(), policy }
    }

    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let cost = self.policy.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    async fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
        let (password, hash) = (password.to_string(), hash.to_string());
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    fn recent_failures(&self, user: Gid) -> usize {
        let window = self.policy.lockout;
        match self.failures.get_mut(&user) {
            Some(mut attempts) => {
                while attempts.front().is_some_and(|t| t.elapsed() >= window) {
                    attempts.pop_front();
                }
                attempts.len()
            }
            None => 0,
        }
    }

    fn record_failure(&self, user: Gid) {
        self.failures.entry(user).or_default().push_back(Instant::now());
    }

    fn is_locked(&self, user: Gid) -> bool {
        self.policy.max_failed_logins > 0 && self.recent_failures(user) >= self.policy.max_failed_logins as usize
    }

    /// Password login. Issues a fresh token on success.
    pub async fn login_password(
        &self,
        world: &World,
        username: &str,
        discriminator: u16,
        password: &str,
    ) -> Result<(Identity, IssuedToken), AuthError> {
        if username.is_empty() || password.is_empty() || discriminator == 0 {
            return Err(AuthError::Malformed("username, discriminator and password are required".to_string()));
        }

        let retry = AuthError::InvalidCredentials { retryable: true };
        let Some(user_id) = world.find_user(username, discriminator) else {
            tracing::info!("[auth] [login_failed] user={}#{:04} reason=unknown", username, discriminator);
            return Err(retry);
        };
        let (hash, disabled) = match world.users.get(&user_id) {
            Some(u) => (u.password_hash.clone(), u.disabled),
            None => return Err(retry),
        };
        if disabled || self.is_locked(user_id) {
            tracing::warn!("[auth] [login_locked] user={} disabled={}", user_id, disabled);
            return Err(AuthError::AccountLocked);
        }

        if !Self::verify_password(password, &hash).await? {
            self.record_failure(user_id);
            tracing::info!("[auth] [login_failed] user={} reason=password", user_id);
            return Err(retry);
        }

        self.failures.remove(&user_id);
        let issued = self.tokens.issue(user_id).await?;
        tracing::info!("[auth] [login] user={} token={}", user_id, issued.token_id);
        Ok((Identity { user_id, token_id: Some(issued.token_id) }, issued))
    }

    /// Token login.
    pub fn login_token(&self, world: &World, token: &str) -> Result<Identity, AuthError> {
        let record = self.tokens.verify(token)?;
        match world.users.get(&record.user) {
            Some(u) if u.disabled => Err(AuthError::AccountLocked),
            Some(_) => {
                tracing::info!("[auth] [token_login] user={} token={}", record.user, record.id);
                Ok(Identity { user_id: record.user, token_id: Some(record.id) })
            }
            None => Err(AuthError::InvalidCredentials { retryable: false }),
        }
    }
}
