//! Account records in the `"auth"` keyspace.
//!
//! A record lives at `user:<login>` and holds `<salt-hex>:<blake3-hex>`, where
//! the digest covers `salt ++ password`.

use std::sync::Arc;

use cloudata_storage::{Operation, OperationStore};
use cloudata_types::{ApplyResult, CloudataError, KeyspaceId, Value};

pub const AUTH_KEYSPACE_NAME: &str = "auth";

const SALT_LEN: usize = 16;

pub fn credential_key(login: &str) -> Vec<u8> {
    format!("user:{login}").into_bytes()
}

fn digest(salt: &[u8], password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize()
}

/// Encode a fresh salted credential for `password`.
pub fn hash_password(password: &str) -> Value {
    let salt: [u8; SALT_LEN] = rand::random();
    let record = format!("{}:{}", hex::encode(salt), digest(&salt, password).to_hex());
    Value::Bytes(record.into_bytes())
}

/// Check `password` against a stored record. Malformed records never match.
pub fn verify_password(stored: &Value, password: &str) -> bool {
    let Value::Bytes(raw) = stored else {
        return false;
    };
    let Ok(text) = std::str::from_utf8(raw) else {
        return false;
    };
    let Some((salt_hex, hash_hex)) = text.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), blake3::Hash::from_hex(hash_hex)) else {
        return false;
    };
    // blake3::Hash equality is constant-time.
    digest(&salt, password) == expected
}

/// Credential checks against one store.
pub struct Authenticator<S> {
    store: Arc<S>,
    keyspace: KeyspaceId,
}

impl<S: OperationStore> Authenticator<S> {
    pub async fn open(store: Arc<S>) -> Result<Self, CloudataError> {
        let keyspace = store.register_keyspace(AUTH_KEYSPACE_NAME).await?;
        Ok(Authenticator { store, keyspace })
    }

    pub fn keyspace(&self) -> KeyspaceId {
        self.keyspace
    }

    pub async fn check(&self, login: &str, password: &str) -> Result<bool, CloudataError> {
        match self.store.get(self.keyspace, &credential_key(login)).await? {
            Some(stored) => Ok(verify_password(&stored, password)),
            None => Ok(false),
        }
    }

    /// Create the account unless one already exists. Returns whether it was created.
    ///
    /// An existing account keeps its password.
    pub async fn ensure_user(&self, login: &str, password: &str) -> Result<bool, CloudataError> {
        if login.is_empty() {
            return Err(CloudataError::InvalidArgument("login must not be empty".into()));
        }
        let result = self
            .store
            .apply(
                self.keyspace,
                &credential_key(login),
                Operation::SetIfAbsent(hash_password(password)),
            )
            .await?;
        match result {
            ApplyResult::Applied(_) => {
                tracing::info!(login, "created account");
                Ok(true)
            }
            ApplyResult::Rejected(_) => {
                tracing::debug!(login, "account already exists");
                Ok(false)
            }
        }
    }
}
