use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A held lease on a KV key.
///
/// The fencing token is monotonic per process; consumers that mutate
/// shared state under a lease record the token so a stale holder
/// (released by TTL, then racing) can be detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: u64,
}

/// Minimal KV contract the pipeline relies on.
///
/// Implementations must make `incr` and `set_nx` atomic per key; nothing
/// is atomic across keys.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    /// Atomically add `by` and return the new value. A fresh key starts
    /// at zero; `ttl` applies only when the key is created by this call.
    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> i64;

    /// Set only if absent. Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Acquire a leased mutex on `key`, or `None` if it is held.
    async fn lease(&self, key: &str, ttl: Duration) -> Option<Lease>;

    /// Best-effort release; returns false if the lease was already lost
    /// (expired and possibly re-acquired by someone else).
    async fn release(&self, lease: &Lease) -> bool;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now < deadline,
            None => true,
        }
    }
}

/// In-process KV on a concurrent map. Expired entries are dropped lazily
/// on access, which is sufficient for the small keyspace this pipeline
/// uses (locks, counters, progress records).
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, Entry>,
    fence: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        // The read guard must be dropped before remove_if takes a write
        // lock on the same shard.
        let expired = match self.entries.get(key) {
            Some(entry) if entry.live(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| !e.live(now));
        }
        None
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Option<String> {
        self.read_live(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> i64 {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: ttl.map(|t| now + t),
        });
        if !slot.live(now) {
            // Expired counter restarts from zero with a fresh TTL.
            slot.value = "0".to_string();
            slot.expires_at = ttl.map(|t| now + t);
        }
        let current: i64 = slot.value.parse().unwrap_or(0);
        let next = current + by;
        slot.value = next.to_string();
        next
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        // Drop an expired entry first so NX sees the key as absent.
        self.entries.remove_if(key, |_, e| !e.live(now));
        let mut inserted = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            }
        });
        inserted
    }

    async fn lease(&self, key: &str, ttl: Duration) -> Option<Lease> {
        let token = self.fence.fetch_add(1, Ordering::Relaxed) + 1;
        if self.set_nx(key, &token.to_string(), ttl).await {
            Some(Lease {
                key: key.to_string(),
                token,
            })
        } else {
            None
        }
    }

    async fn release(&self, lease: &Lease) -> bool {
        let held = self
            .read_live(&lease.key)
            .map(|v| v == lease.token.to_string())
            .unwrap_or(false);
        if held {
            self.entries.remove(&lease.key);
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let kv = MemoryKv::new();
        kv.set("a", "1", None).await;
        assert_eq!(kv.get("a").await.as_deref(), Some("1"));
        kv.delete("a").await;
        assert_eq!(kv.get("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("a", "1", Some(Duration::from_secs(2))).await;
        assert!(kv.get("a").await.is_some());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(kv.get("a").await, None);
    }

    #[tokio::test]
    async fn incr_is_cumulative() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("n", 1, None).await, 1);
        assert_eq!(kv.incr("n", 4, None).await, 5);
        assert_eq!(kv.incr("n", -2, None).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_counter_restarts() {
        let kv = MemoryKv::new();
        kv.incr("n", 7, Some(Duration::from_secs(1))).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(kv.incr("n", 1, Some(Duration::from_secs(1))).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_holder_until_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("lock", "a", Duration::from_secs(10)).await);
        assert!(!kv.set_nx("lock", "b", Duration::from_secs(10)).await);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(kv.set_nx("lock", "c", Duration::from_secs(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_release_is_fenced() {
        let kv = MemoryKv::new();
        let first = kv.lease("mutex", Duration::from_secs(1)).await.unwrap();
        assert!(kv.lease("mutex", Duration::from_secs(1)).await.is_none());

        // The first lease expires and someone else acquires.
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = kv.lease("mutex", Duration::from_secs(10)).await.unwrap();
        assert_ne!(first.token, second.token);

        // The stale holder's release must not free the new lease.
        assert!(!kv.release(&first).await);
        assert!(kv.lease("mutex", Duration::from_secs(1)).await.is_none());
        assert!(kv.release(&second).await);
    }
}
