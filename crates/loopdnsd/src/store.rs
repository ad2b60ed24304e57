use crate::config::Config;
use crate::lifecycle::ShutdownSubscription;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long a submitted challenge set stays resolvable.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(30 * 60);

/// How often the in-memory cleaner sweeps.
pub const CLEAN_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on concurrently live challenge entries in the memory
/// backend; beyond this the oldest entries go regardless of age.
pub const MAX_ENTRIES: usize = 1_000_000;

/// TTL used by the external backend, which has no cleaner of its own.
const REDIS_TTL_SECONDS: u64 = 60 * 60;

/// The challenge store contract shared by the memory and redis
/// backends. Reads must observe the latest successful write for the
/// same id within seconds.
#[async_trait]
pub trait Store: Send + Sync {
    /// Replace the challenge values for `id`.
    async fn set_challenge(&self, id: Uuid, values: Vec<String>) -> anyhow::Result<()>;

    /// The values for `id`, or empty if absent or evicted.
    async fn get_challenge(&self, id: Uuid) -> anyhow::Result<Vec<String>>;

    /// Best-effort counter bump; must never block the caller.
    fn increment_stat(&self, key: &'static str, delta: i64);
}

struct Entry {
    stamp: Instant,
    values: Vec<String>,
}

#[derive(Default)]
struct Inner {
    challenges: HashMap<Uuid, Entry>,
    stats: HashMap<String, i64>,
}

/// Mutex-guarded map plus a periodic cleaner. Stats survive restarts
/// on a best-effort basis via `stats.json`; challenge entries do not.
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
    max_entries: usize,
    stats_path: PathBuf,
}

pub struct SweepOutcome {
    pub active: usize,
    pub removed: usize,
}

impl MemStore {
    pub fn new(max_entries: usize, stats_path: PathBuf) -> Self {
        let mut stats = HashMap::new();
        match std::fs::read(&stats_path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(loaded) => stats = loaded,
                Err(err) => {
                    tracing::warn!("failed to parse {}: {err:#}", stats_path.display());
                }
            },
            Err(err) => {
                tracing::debug!("no stats file at {}: {err:#}", stats_path.display());
            }
        }

        Self {
            inner: Arc::new(Mutex::new(Inner {
                challenges: HashMap::new(),
                stats,
            })),
            max_entries,
            stats_path,
        }
    }

    /// Drop entries past their TTL, then enforce the cardinality cap by
    /// evicting the oldest survivors.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut inner = self.inner.lock();
        let mut removed = 0;

        inner.challenges.retain(|_, entry| {
            let expired = now.duration_since(entry.stamp) >= CHALLENGE_TTL;
            if expired {
                removed += 1;
            }
            !expired
        });

        if inner.challenges.len() > self.max_entries {
            let mut by_age: Vec<(Instant, Uuid)> = inner
                .challenges
                .iter()
                .map(|(id, entry)| (entry.stamp, *id))
                .collect();
            by_age.sort_unstable_by_key(|(stamp, _)| *stamp);

            let excess = by_age.len() - self.max_entries;
            for (_, id) in by_age.into_iter().take(excess) {
                inner.challenges.remove(&id);
                removed += 1;
            }
        }

        let outcome = SweepOutcome {
            active: inner.challenges.len(),
            removed,
        };
        tracing::debug!(
            active = outcome.active,
            removed = outcome.removed,
            stats = ?inner.stats,
            "store cleaned"
        );
        outcome
    }

    /// Write the stats counters atomically next to their final path.
    /// Losing these across a crash is acceptable; failing to write them
    /// must not take the cleaner down.
    fn write_stats(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.lock().stats.clone();
        let encoded = serde_json::to_vec_pretty(&snapshot)?;

        let dir = self
            .stats_path
            .parent()
            .context("stats path has no parent directory")?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&encoded)?;
        tmp.persist(&self.stats_path)?;
        Ok(())
    }

    /// Periodic sweep; runs until shutdown.
    pub async fn run_cleaner(self: Arc<Self>, mut shutdown: ShutdownSubscription) {
        let mut interval = tokio::time::interval(CLEAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.shutting_down() => {
                    tracing::debug!("store cleaner stopping");
                    return;
                }
            }

            self.sweep(Instant::now());
            if let Err(err) = self.write_stats() {
                tracing::warn!("failed to write stats: {err:#}");
            }
        }
    }

    #[cfg(test)]
    fn insert_at(&self, id: Uuid, values: Vec<String>, stamp: Instant) {
        self.inner
            .lock()
            .challenges
            .insert(id, Entry { stamp, values });
    }

    #[cfg(test)]
    fn stat(&self, key: &str) -> i64 {
        self.inner.lock().stats.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn set_challenge(&self, id: Uuid, values: Vec<String>) -> anyhow::Result<()> {
        self.inner.lock().challenges.insert(
            id,
            Entry {
                stamp: Instant::now(),
                values,
            },
        );
        Ok(())
    }

    async fn get_challenge(&self, id: Uuid) -> anyhow::Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .challenges
            .get(&id)
            .map(|entry| entry.values.clone())
            .unwrap_or_default())
    }

    fn increment_stat(&self, key: &'static str, delta: i64) {
        // Off the request path: the caller must never contend with the
        // cleaner for the store mutex.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            *inner.lock().stats.entry(key.to_string()).or_insert(0) += delta;
        });
    }
}

/// External backend. Entries expire server-side after an hour; stats
/// are not tracked here.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let addr = config
            .redis_addr
            .as_deref()
            .context("redis_addr is required when store is \"redis\"")?;
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .with_context(|| format!("invalid redis port in {addr}"))?,
            ),
            None => (addr.to_string(), 6379),
        };

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: config.redis_db,
                username: config.redis_user.clone(),
                password: config.redis_pass.clone(),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info).context("building redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }

    fn key(id: Uuid) -> String {
        format!("{id}-acme-challenge")
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set_challenge(&self, id: Uuid, values: Vec<String>) -> anyhow::Result<()> {
        let encoded = serde_json::to_string(&values)?;
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(Self::key(id))
            .arg(encoded)
            .arg("EX")
            .arg(REDIS_TTL_SECONDS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_challenge(&self, id: Uuid) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await?;
        match value {
            Some(encoded) => Ok(serde_json::from_str(&encoded)?),
            None => Ok(vec![]),
        }
    }

    fn increment_stat(&self, _key: &'static str, _delta: i64) {}
}
