//! Key/value store abstraction over a Redis-compatible configuration table
//! and its `(key, op)` keyspace-notification event stream.
//!
//! The Config Reflector never talks to `redis` directly — it is generic
//! over [`KvStore`], so tests drive it with [`testutil::FakeKvStore`]
//! instead of a real Redis-compatible instance, mirroring
//! `solana_client::grpc`'s `GrpcClient` abstraction for hiding a real
//! network client behind a trait for unit testing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One configuration-table mutation, as delivered by a keyspace
/// notification. Payload strings `hset`, `hdel`, `del` map to the three
/// variants below; anything else is skipped before it ever reaches this
/// type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    /// A hash field was written; the full row should be re-read.
    HSet { key: String },
    /// A single hash field was removed.
    HDel { key: String },
    /// The whole key was removed.
    Del { key: String },
}

impl KeyEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::HSet { key } | Self::HDel { key } | Self::Del { key } => key,
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        matches!(self, Self::HDel { .. } | Self::Del { .. })
    }
}

/// Abstraction over the Redis-compatible configuration store. `core`
/// depends only on this trait; `RedisKvStore` is the real implementation,
/// `FakeKvStore` a test double.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Full field set of a hash row, read with one atomic `hgetall`. Empty
    /// map if the key does not exist.
    async fn hash_get_all(&self, db: u8, key: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Every existing key under `prefix` at the moment of the call, used
    /// for the Reflector's startup replay.
    async fn scan_keys(&self, db: u8, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Subscribes to `__keyspace@<db>__:<pattern>` and returns a channel of
    /// parsed events. The subscription itself runs for as long as the
    /// returned receiver is alive; dropping it unsubscribes.
    async fn subscribe_keyspace(
        &self,
        db: u8,
        pattern: &str,
    ) -> anyhow::Result<mpsc::Receiver<KeyEvent>>;
}

/// Real implementation, backed by the `redis` crate's async multiplexed
/// connection for hash reads and a dedicated pubsub connection for
/// keyspace notifications (the two cannot share a connection: pubsub mode
/// takes over the connection's request/response cycle).
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    /// Builds a client from a `BootstrapConfig`-resolved connection string.
    /// Callers pass `redis://127.0.0.1:6379/0` for TCP or
    /// `redis+unix:///var/run/redis/redis.sock` for a Unix socket — see
    /// `crate::model::KvStoreEndpoint`.
    pub fn connect(addr: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(addr)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn hash_get_all(&self, db: u8, key: &str) -> anyhow::Result<HashMap<String, String>> {
        use redis::AsyncCommands;

        let mut conn = self.client.get_connection_manager().await?;
        redis::cmd("SELECT").arg(db).exec_async(&mut conn).await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn scan_keys(&self, db: u8, prefix: &str) -> anyhow::Result<Vec<String>> {
        use redis::AsyncCommands;

        let mut conn = self.client.get_connection_manager().await?;
        redis::cmd("SELECT").arg(db).exec_async(&mut conn).await?;
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn subscribe_keyspace(
        &self,
        db: u8,
        pattern: &str,
    ) -> anyhow::Result<mpsc::Receiver<KeyEvent>> {
        use futures_util::StreamExt;

        let channel_pattern = format!("__keyspace@{db}__:{pattern}");
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(&channel_pattern).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_owned();
                let Some(key) = channel.rsplit(':').next().map(str::to_owned) else {
                    continue;
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let event = match payload.as_str() {
                    "hset" => KeyEvent::HSet { key },
                    "hdel" => KeyEvent::HDel { key },
                    "del" => KeyEvent::Del { key },
                    _ => continue,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Test doubles, gated behind `test-support` so integration tests in
/// `core/tests/` (compiled as a separate crate, where `cfg(test)` does not
/// apply to this library) can reach them too — enabled for those tests via
/// a self-referencing dev-dependency in `Cargo.toml`.
#[cfg(any(test, feature = "test-support"))]
pub mod testutil {
    use super::*;

    /// In-memory test double. Rows live in a `parking_lot::Mutex`-guarded map;
    /// `seed` / `hset` / `del` let a test script a sequence of configuration
    /// events.
    #[derive(Default)]
    pub struct FakeKvStore {
        rows: parking_lot::Mutex<HashMap<(u8, String), HashMap<String, String>>>,
        sender: parking_lot::Mutex<Option<mpsc::Sender<KeyEvent>>>,
    }

    impl FakeKvStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets (overwriting) a row's full field set without emitting an
        /// event — used to seed state that startup replay will discover.
        pub fn seed(&self, db: u8, key: &str, fields: HashMap<String, String>) {
            self.rows.lock().insert((db, key.to_owned()), fields);
        }

        /// Sets a row's fields and, if a subscriber is attached, emits an
        /// `HSet` event for it.
        pub fn hset(&self, db: u8, key: &str, fields: HashMap<String, String>) {
            self.rows.lock().insert((db, key.to_owned()), fields);
            self.emit(KeyEvent::HSet { key: key.to_owned() });
        }

        /// Removes a row entirely and, if a subscriber is attached, emits a
        /// `Del` event for it.
        pub fn del(&self, db: u8, key: &str) {
            self.rows.lock().remove(&(db, key.to_owned()));
            self.emit(KeyEvent::Del { key: key.to_owned() });
        }

        fn emit(&self, event: KeyEvent) {
            if let Some(sender) = self.sender.lock().as_ref() {
                let _ = sender.try_send(event);
            }
        }
    }

    #[async_trait]
    impl KvStore for FakeKvStore {
        async fn hash_get_all(&self, db: u8, key: &str) -> anyhow::Result<HashMap<String, String>> {
            Ok(self
                .rows
                .lock()
                .get(&(db, key.to_owned()))
                .cloned()
                .unwrap_or_default())
        }

        async fn scan_keys(&self, db: u8, prefix: &str) -> anyhow::Result<Vec<String>> {
            Ok(self
                .rows
                .lock()
                .keys()
                .filter(|(row_db, key)| *row_db == db && key.starts_with(prefix))
                .map(|(_, key)| key.clone())
                .collect())
        }

        async fn subscribe_keyspace(
            &self,
            _db: u8,
            _pattern: &str,
        ) -> anyhow::Result<mpsc::Receiver<KeyEvent>> {
            let (tx, rx) = mpsc::channel(64);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        }
    }
}
