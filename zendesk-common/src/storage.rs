//! # Storage
//!
//! Persistent key-value storage shared by ticket ingestion and user sync.
//!
//! Holds three kinds of entries, all under one key prefix:
//! * `{prefix}:ticket:{id}`: seen-ticket marker. Only presence matters.
//! * `{prefix}:user:{email}`: Zendesk user id of a requester. Never expired.
//! * `{prefix}:ingestion-lock`: held while an ingestion run is in progress.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("stored value for {key} is not valid: {value}")]
    InvalidValue { key: String, value: String },
}

/// Key-level atomic get/set. Implementations must be safe to share between tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Set only if absent, expiring after `ttl`. Returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StorageError>;

    async fn del(&self, key: &str) -> Result<(), StorageError>;
}

pub struct RedisStorage {
    connection: MultiplexedConnection,
}

impl RedisStorage {
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCall {
    pub op: &'static str,
    pub key: String,
}

/// In-process storage for tests and local runs. Records every call. Ignores TTLs.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<StorageCall>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &'static str, key: &str) {
        let mut calls = match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls.push(StorageCall {
            op,
            key: key.to_owned(),
        });
    }

    pub fn get_calls(&self) -> Vec<StorageCall> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock_entries().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.record("get", key);
        Ok(self.lock_entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.record("set", key);
        self.lock_entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
    ) -> Result<bool, StorageError> {
        self.record("set_nx_ex", key);
        let mut entries = self.lock_entries();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.record("del", key);
        self.lock_entries().remove(key);
        Ok(())
    }
}

/// Typed operations over a `Storage` backend.
#[derive(Clone)]
pub struct SyncStore {
    storage: Arc<dyn Storage>,
    prefix: String,
}

impl SyncStore {
    pub fn new(storage: Arc<dyn Storage>, prefix: &str) -> Self {
        Self {
            storage,
            prefix: prefix.to_owned(),
        }
    }

    pub fn seen_ticket_key(&self, ticket_id: u64) -> String {
        format!("{}:ticket:{}", self.prefix, ticket_id)
    }

    pub fn requester_key(&self, email: &str) -> String {
        format!("{}:user:{}", self.prefix, email)
    }

    pub fn ingestion_lock_key(&self) -> String {
        format!("{}:ingestion-lock", self.prefix)
    }

    pub async fn is_ticket_seen(&self, ticket_id: u64) -> Result<bool, StorageError> {
        Ok(self
            .storage
            .get(&self.seen_ticket_key(ticket_id))
            .await?
            .is_some())
    }

    pub async fn mark_ticket_seen(&self, ticket_id: u64) -> Result<(), StorageError> {
        self.storage
            .set(&self.seen_ticket_key(ticket_id), "true")
            .await
    }

    pub async fn requester_id(&self, email: &str) -> Result<Option<u64>, StorageError> {
        let key = self.requester_key(email);
        match self.storage.get(&key).await? {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| StorageError::InvalidValue { key, value }),
        }
    }

    /// Overwrites any id previously stored for `email`.
    pub async fn remember_requester(&self, email: &str, user_id: u64) -> Result<(), StorageError> {
        self.storage
            .set(&self.requester_key(email), &user_id.to_string())
            .await
    }

    pub async fn try_lock_ingestion(&self, holder: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.storage
            .set_nx_ex(&self.ingestion_lock_key(), holder, ttl)
            .await
    }

    pub async fn unlock_ingestion(&self) -> Result<(), StorageError> {
        self.storage.del(&self.ingestion_lock_key()).await
    }
}
