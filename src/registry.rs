/* lxd-gateway/src/registry.rs

Key registry with pluggable storage backends.

- Default backend: sled (embedded) at ./data/keys.db.
- Optional backend: Redis (hash per key, atomic HINCRBY on the `calls` field).
- In-memory store for tests and local development.

Records are created and revoked outside the gateway. The gateway performs exactly two
operations against a record: a point lookup by `key` and an increment of `calls`.

Backend spec strings (CLI `--keys-backend` / env `LXD_KEYS_BACKEND`):
- "redis://..."  → Redis at URL
- "sled:<path>"  → sled database at path
- "memory"       → in-memory store

Stores are synchronous; the registry runs them on the blocking pool so request tasks stay
cooperatively suspendable.
*/

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ==============================
// Public model
// ==============================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    #[serde(default)]
    pub calls: u64,
}

impl KeyRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            calls: 0,
        }
    }
}

// ==============================
// Storage trait
// ==============================

pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<KeyRecord>>;
    fn put(&self, rec: &KeyRecord) -> Result<()>;
    /// Atomically add one to `calls` and return the new value.
    fn increment(&self, key: &str) -> Result<u64>;
    fn ping(&self) -> Result<()>;
}

// ==============================
// sled backend
// ==============================

mod sled_store_impl {
    use super::*;
    use std::path::PathBuf;

    pub struct SledStore {
        _db: sled::Db,
        tree: sled::Tree,
    }

    impl SledStore {
        pub fn open_path(path: PathBuf) -> Result<Self> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let db = sled::open(path)?;
            let tree = db.open_tree("api_keys")?;
            Ok(Self { _db: db, tree })
        }
    }

    impl KeyStore for SledStore {
        fn get(&self, key: &str) -> Result<Option<KeyRecord>> {
            match self.tree.get(key.as_bytes())? {
                Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
                None => Ok(None),
            }
        }

        fn put(&self, rec: &KeyRecord) -> Result<()> {
            let val = serde_json::to_vec(rec)?;
            self.tree.insert(rec.key.as_bytes(), val)?;
            self.tree.flush()?;
            Ok(())
        }

        fn increment(&self, key: &str) -> Result<u64> {
            let updated = self.tree.update_and_fetch(key.as_bytes(), |old| {
                let old = old?;
                // Unparseable records are left untouched; the decode below reports the error.
                let Ok(mut rec) = serde_json::from_slice::<KeyRecord>(old) else {
                    return Some(old.to_vec());
                };
                rec.calls = rec.calls.saturating_add(1);
                Some(serde_json::to_vec(&rec).unwrap_or_else(|_| old.to_vec()))
            })?;
            self.tree.flush()?;
            let ivec = updated.ok_or_else(|| anyhow!("key record vanished during increment"))?;
            let rec: KeyRecord = serde_json::from_slice(&ivec)?;
            Ok(rec.calls)
        }

        fn ping(&self) -> Result<()> {
            // A read round-trip is enough to prove the tree is open.
            self.tree.first()?;
            Ok(())
        }
    }
}

pub use sled_store_impl::SledStore;

// ==============================
// Redis backend
// ==============================

mod redis_store_impl {
    use super::*;

    pub struct RedisConnectionManager {
        client: redis::Client,
        connect_timeout: Duration,
    }

    /// Bump `calls` only while the record still exists. Returns -1 for a missing record.
    const INCREMENT_EXISTING: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'key') == 1 then
  return redis.call('HINCRBY', KEYS[1], 'calls', 1)
end
return -1
"#;

    /// A hash counts as a key record only when it carries the `key` field.
    pub(super) fn record_from_hash(key: &str, fields: &HashMap<String, String>) -> Option<KeyRecord> {
        fields.get("key")?;
        let calls = fields
            .get("calls")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Some(KeyRecord {
            key: key.to_string(),
            calls,
        })
    }

    impl r2d2::ManageConnection for RedisConnectionManager {
        type Connection = redis::Connection;
        type Error = redis::RedisError;

        fn connect(&self) -> Result<Self::Connection, Self::Error> {
            self.client.get_connection_with_timeout(self.connect_timeout)
        }

        fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
            let _: String = redis::cmd("PING").query(conn)?;
            Ok(())
        }

        fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
            false
        }
    }

    pub struct RedisStore {
        pool: r2d2::Pool<RedisConnectionManager>,
        key_ns: String,
    }

    impl RedisStore {
        /// Connections are opened on demand, so an unreachable server surfaces on the first
        /// lookup instead of here.
        pub fn connect_url(url: &str) -> Result<Self> {
            let connect_timeout = Duration::from_millis(env_u64("LXD_REDIS_CONNECT_TIMEOUT_MS", 2000));
            let manager = RedisConnectionManager {
                client: redis::Client::open(url)?,
                connect_timeout,
            };
            let pool = r2d2::Pool::builder()
                .max_size(env_u64("LXD_REDIS_POOL_MAX", 16).max(1) as u32)
                .min_idle(Some(0))
                .connection_timeout(connect_timeout)
                .build_unchecked(manager);
            Ok(Self {
                pool,
                key_ns: "lxd:api_keys:".to_string(),
            })
        }

        fn key_for(&self, key: &str) -> String {
            format!("{}{}", self.key_ns, key)
        }
    }

    impl KeyStore for RedisStore {
        fn get(&self, key: &str) -> Result<Option<KeyRecord>> {
            let mut conn = self.pool.get()?;
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.key_for(key))
                .query(&mut *conn)?;
            Ok(record_from_hash(key, &fields))
        }

        fn put(&self, rec: &KeyRecord) -> Result<()> {
            let mut conn = self.pool.get()?;
            let _: () = redis::cmd("HSET")
                .arg(self.key_for(&rec.key))
                .arg("key")
                .arg(&rec.key)
                .arg("calls")
                .arg(rec.calls)
                .query(&mut *conn)?;
            Ok(())
        }

        fn increment(&self, key: &str) -> Result<u64> {
            let mut conn = self.pool.get()?;
            let n: i64 = redis::Script::new(INCREMENT_EXISTING)
                .key(self.key_for(key))
                .invoke(&mut *conn)?;
            if n < 0 {
                return Err(anyhow!("key record vanished during increment"));
            }
            Ok(n as u64)
        }

        fn ping(&self) -> Result<()> {
            let mut conn = self.pool.get()?;
            let _: String = redis::cmd("PING").query(&mut *conn)?;
            Ok(())
        }
    }
}

pub use redis_store_impl::RedisStore;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

// ==============================
// In-memory store
// ==============================

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = keys.into_iter().map(|k| (k.into(), 0)).collect();
        Self {
            inner: RwLock::new(map),
        }
    }
}

impl KeyStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<KeyRecord>> {
        let map = self.inner.read().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(map.get(key).map(|calls| KeyRecord {
            key: key.to_string(),
            calls: *calls,
        }))
    }

    fn put(&self, rec: &KeyRecord) -> Result<()> {
        let mut map = self.inner.write().map_err(|_| anyhow!("memory store poisoned"))?;
        map.insert(rec.key.clone(), rec.calls);
        Ok(())
    }

    fn increment(&self, key: &str) -> Result<u64> {
        let mut map = self.inner.write().map_err(|_| anyhow!("memory store poisoned"))?;
        let calls = map
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown key record"))?;
        *calls = calls.saturating_add(1);
        Ok(*calls)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ==============================
// Backend selection
// ==============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBackend {
    Redis { url: String },
    Sled { path: std::path::PathBuf },
    Memory { seed: Vec<String> },
}

impl KeyBackend {
    /// Parse a backend spec string:
    /// - "redis://..." → Redis at URL
    /// - "sled:<path>" → sled database at path
    /// - "memory"      → in-memory backend
    pub fn from_spec(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.starts_with("redis://") || spec.starts_with("rediss://") {
            return Some(KeyBackend::Redis {
                url: spec.to_string(),
            });
        }
        if let Some(rest) = spec.strip_prefix("sled:") {
            if rest.trim().is_empty() {
                return None;
            }
            return Some(KeyBackend::Sled {
                path: std::path::PathBuf::from(rest.trim()),
            });
        }
        if spec.eq_ignore_ascii_case("memory") {
            return Some(KeyBackend::Memory { seed: Vec::new() });
        }
        None
    }

    pub fn open(&self) -> Result<Arc<dyn KeyStore>> {
        match self {
            KeyBackend::Redis { url } => Ok(Arc::new(RedisStore::connect_url(url)?)),
            KeyBackend::Sled { path } => Ok(Arc::new(SledStore::open_path(path.clone())?)),
            KeyBackend::Memory { seed } => Ok(Arc::new(MemoryStore::with_keys(seed.clone()))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            KeyBackend::Redis { .. } => "redis",
            KeyBackend::Sled { .. } => "sled",
            KeyBackend::Memory { .. } => "memory",
        }
    }
}

// ==============================
// Registry
// ==============================

pub struct KeyRegistry {
    store: Arc<dyn KeyStore>,
}

impl KeyRegistry {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Point lookup by key. Empty keys short-circuit to `None` without touching the store.
    pub async fn lookup(&self, key: &str) -> Result<Option<KeyRecord>> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let store = self.store.clone();
        let owned = key.to_string();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || store.get(&owned))
            .await
            .map_err(|e| anyhow!("registry lookup task failed: {e}"))?;
        log_store_latency("get", start.elapsed());
        result
    }

    /// Increment the record's usage counter and wait for the store to settle.
    ///
    /// Failures are logged and swallowed.
    pub async fn increment(&self, record: &KeyRecord) {
        let store = self.store.clone();
        let key = record.key.clone();
        let start = Instant::now();
        match tokio::task::spawn_blocking(move || store.increment(&key)).await {
            Ok(Ok(calls)) => debug!(calls, "usage counter incremented"),
            Ok(Err(err)) => warn!(error = %err, "usage counter increment failed"),
            Err(err) => warn!(error = %err, "usage counter increment task failed"),
        }
        log_store_latency("increment", start.elapsed());
    }

    /// Fire-and-forget increment. Runs inline if called outside a Tokio runtime.
    pub fn increment_detached(&self, record: KeyRecord) {
        let store = self.store.clone();
        let job = move || match store.increment(&record.key) {
            Ok(calls) => debug!(calls, "usage counter incremented"),
            Err(err) => warn!(error = %err, "usage counter increment failed"),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.ping())
            .await
            .map_err(|e| anyhow!("registry ping task failed: {e}"))?
    }

    /// Hand out a one-shot ticket that increments `record` exactly once.
    pub fn ticket(self: &Arc<Self>, record: KeyRecord) -> UsageTicket {
        UsageTicket {
            registry: self.clone(),
            record: Some(record),
        }
    }
}

fn log_store_latency(operation: &str, elapsed: Duration) {
    if elapsed >= Duration::from_millis(250) {
        warn!(
            duration_ms = elapsed.as_millis() as u64,
            "key store {} latency", operation
        );
    } else if elapsed >= Duration::from_millis(50) {
        debug!(
            duration_ms = elapsed.as_millis() as u64,
            "key store {} latency", operation
        );
    }
}

/// Counts one served call. Settles on `settle()` or on drop, whichever comes first.
pub struct UsageTicket {
    registry: Arc<KeyRegistry>,
    record: Option<KeyRecord>,
}

impl UsageTicket {
    pub fn settle(&mut self) {
        if let Some(record) = self.record.take() {
            self.registry.increment_detached(record);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.record.is_none()
    }
}

impl Drop for UsageTicket {
    fn drop(&mut self) {
        self.settle();
    }
}

// ==============================
// Provider
// ==============================

/// Process-wide registry handle, opened on first use and reused afterwards.
///
/// The backend is opened on the blocking pool. Only a successful open is kept; after a
/// failure the next caller tries again. Concurrent first callers wait on one open.
pub struct RegistryProvider {
    backend: Option<KeyBackend>,
    cell: tokio::sync::OnceCell<Arc<KeyRegistry>>,
}

impl RegistryProvider {
    pub fn lazy(backend: KeyBackend) -> Self {
        Self {
            backend: Some(backend),
            cell: tokio::sync::OnceCell::new(),
        }
    }

    pub fn ready(registry: Arc<KeyRegistry>) -> Self {
        Self {
            backend: None,
            cell: tokio::sync::OnceCell::new_with(Some(registry)),
        }
    }

    /// A provider whose registry never initializes.
    pub fn unavailable() -> Self {
        Self {
            backend: None,
            cell: tokio::sync::OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Option<Arc<KeyRegistry>> {
        if let Some(registry) = self.cell.get() {
            return Some(registry.clone());
        }
        let backend = self.backend.as_ref()?;
        let opened = self
            .cell
            .get_or_try_init(|| async {
                let spec = backend.clone();
                let store = tokio::task::spawn_blocking(move || spec.open())
                    .await
                    .map_err(|e| anyhow!("registry open task failed: {e}"))??;
                info!(backend = backend.label(), "key registry initialized");
                Ok::<_, anyhow::Error>(Arc::new(KeyRegistry::new(store)))
            })
            .await;
        match opened {
            Ok(registry) => Some(registry.clone()),
            Err(err) => {
                warn!(backend = backend.label(), error = %err, "key registry init failed");
                None
            }
        }
    }
}

// ==============================
// Tests
// ==============================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        gets: AtomicUsize,
        increments: AtomicUsize,
    }

    impl KeyStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<KeyRecord>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn put(&self, rec: &KeyRecord) -> Result<()> {
            self.inner.put(rec)
        }

        fn increment(&self, key: &str) -> Result<u64> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            self.inner.increment(key)
        }

        fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn empty_key_skips_store() {
        let store = Arc::new(CountingStore::default());
        let registry = KeyRegistry::new(store.clone());

        assert_eq!(registry.lookup("").await.unwrap(), None);
        assert_eq!(registry.lookup("   ").await.unwrap(), None);
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lookup_and_increment_memory_backend() {
        let store = Arc::new(MemoryStore::with_keys(["k-1"]));
        let registry = KeyRegistry::new(store.clone());

        let rec = registry.lookup("k-1").await.unwrap().expect("record");
        assert_eq!(rec.calls, 0);
        assert!(registry.lookup("missing").await.unwrap().is_none());

        registry.increment(&rec).await;
        registry.increment(&rec).await;
        assert_eq!(store.get("k-1").unwrap().unwrap().calls, 2);
    }

    #[tokio::test]
    async fn increment_failure_is_swallowed() {
        let registry = KeyRegistry::new(Arc::new(MemoryStore::default()));
        // Record absent from the store: the increment errors internally and is only logged.
        registry.increment(&KeyRecord::new("ghost")).await;
    }

    #[tokio::test]
    async fn sled_store_increments_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open_path(dir.path().join("keys.db")).unwrap();
        store.put(&KeyRecord::new("sled-key")).unwrap();

        assert_eq!(store.increment("sled-key").unwrap(), 1);
        assert_eq!(store.increment("sled-key").unwrap(), 2);
        assert_eq!(store.get("sled-key").unwrap().unwrap().calls, 2);
        assert!(store.increment("nope").is_err());
        store.ping().unwrap();
    }

    #[test]
    fn missing_calls_field_reads_as_zero() {
        let rec: KeyRecord = serde_json::from_str(r#"{"key":"abc"}"#).unwrap();
        assert_eq!(rec.calls, 0);
    }

    #[tokio::test]
    async fn ticket_settles_exactly_once() {
        let store = Arc::new(CountingStore::default());
        store.put(&KeyRecord::new("t")).unwrap();
        let registry = Arc::new(KeyRegistry::new(store.clone()));

        let mut ticket = registry.ticket(KeyRecord::new("t"));
        ticket.settle();
        ticket.settle();
        assert!(ticket.is_settled());
        drop(ticket);

        wait_for(&store.increments, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.increments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_ticket_still_counts() {
        let store = Arc::new(CountingStore::default());
        store.put(&KeyRecord::new("d")).unwrap();
        let registry = Arc::new(KeyRegistry::new(store.clone()));

        drop(registry.ticket(KeyRecord::new("d")));

        wait_for(&store.increments, 1).await;
        assert_eq!(store.increments.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backend_spec_parsing() {
        assert_eq!(
            KeyBackend::from_spec("redis://127.0.0.1/"),
            Some(KeyBackend::Redis {
                url: "redis://127.0.0.1/".into()
            })
        );
        assert_eq!(
            KeyBackend::from_spec("sled:./data/keys.db"),
            Some(KeyBackend::Sled {
                path: "./data/keys.db".into()
            })
        );
        assert_eq!(
            KeyBackend::from_spec("MEMORY"),
            Some(KeyBackend::Memory { seed: Vec::new() })
        );
        assert_eq!(KeyBackend::from_spec("sled:"), None);
        assert_eq!(KeyBackend::from_spec("postgres://x"), None);
    }

    #[tokio::test]
    async fn provider_caches_initialization() {
        let provider = RegistryProvider::lazy(KeyBackend::Memory {
            seed: vec!["seeded".into()],
        });
        let a = provider.get().await.expect("registry");
        let b = provider.get().await.expect("registry");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.lookup("seeded").await.unwrap().is_some());

        assert!(RegistryProvider::unavailable().get().await.is_none());
    }

    #[tokio::test]
    async fn failed_open_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let provider = RegistryProvider::lazy(KeyBackend::Sled {
            path: blocker.join("keys.db"),
        });

        assert!(provider.get().await.is_none());

        std::fs::remove_file(&blocker).unwrap();
        assert!(provider.get().await.is_some());
    }

    #[tokio::test]
    async fn unreachable_redis_does_not_stall_the_runtime() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let provider = RegistryProvider::lazy(KeyBackend::Redis {
            url: "redis://127.0.0.1:1/".into(),
        });
        let registry = tokio::time::timeout(Duration::from_secs(5), provider.get())
            .await
            .expect("open returns promptly")
            .expect("pool is built without connecting");
        let ping = tokio::time::timeout(Duration::from_secs(15), registry.ping())
            .await
            .expect("ping gives up");
        assert!(ping.is_err());
        assert!(ticks.load(Ordering::SeqCst) > 0);
        ticker.abort();
    }

    #[test]
    fn redis_hash_without_key_field_is_not_a_record() {
        let mut fields = HashMap::new();
        fields.insert("calls".to_string(), "1".to_string());
        assert_eq!(redis_store_impl::record_from_hash("k", &fields), None);

        fields.insert("key".to_string(), "k".to_string());
        assert_eq!(
            redis_store_impl::record_from_hash("k", &fields),
            Some(KeyRecord {
                key: "k".into(),
                calls: 1
            })
        );
    }

    /// Needs a live server: `LXD_TEST_REDIS_URL=redis://127.0.0.1/ cargo test`.
    #[test]
    fn redis_increment_does_not_resurrect_deleted_record() {
        let Ok(url) = std::env::var("LXD_TEST_REDIS_URL") else {
            return;
        };
        let store = RedisStore::connect_url(&url).unwrap();
        let key = format!("resurrect-{}", uuid::Uuid::new_v4().simple());
        store.put(&KeyRecord::new(key.clone())).unwrap();
        assert_eq!(store.increment(&key).unwrap(), 1);

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_connection().unwrap();
        let _: () = redis::cmd("DEL")
            .arg(format!("lxd:api_keys:{key}"))
            .query(&mut conn)
            .unwrap();

        assert!(store.increment(&key).is_err());
        assert_eq!(store.get(&key).unwrap(), None);
    }
}
