//! Remote-first store with in-memory failover
//!
//! Every operation is attempted against the remote store. When the remote is
//! unreachable the operation lands in the in-memory shadow instead and the
//! touched key is marked dirty; a dirty key is non-authoritative and is
//! migrated back to the remote store on the next successful touch (records
//! are upserted, queue entries re-added). Reads merge remote and shadow with
//! the remote winning on conflict. Pub/sub messages published while the
//! remote is down reach local subscribers only; that loss is accepted and
//! subscribers reconcile through final-state reads.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::kv::{glob_match, Kv, Subscription, ZEntry};
use crate::{KvError, MemoryKv};

/// [`Kv`] adapter that prefers a remote store and degrades to [`MemoryKv`]
pub struct FailoverKv {
    remote: Option<Arc<dyn Kv>>,
    shadow: MemoryKv,
    remote_healthy: AtomicBool,
    /// String keys whose latest write exists only in the shadow
    dirty_keys: Mutex<HashSet<String>>,
    /// Sorted-set members pending re-add to the remote, per set key
    dirty_zsets: Mutex<HashMap<String, HashSet<String>>>,
}

impl FailoverKv {
    pub fn new(remote: Arc<dyn Kv>) -> Self {
        Self {
            remote: Some(remote),
            shadow: MemoryKv::new(),
            remote_healthy: AtomicBool::new(true),
            dirty_keys: Mutex::new(HashSet::new()),
            dirty_zsets: Mutex::new(HashMap::new()),
        }
    }

    /// Shadow-only store; used when no remote is configured
    pub fn memory_only() -> Self {
        Self {
            remote: None,
            shadow: MemoryKv::new(),
            remote_healthy: AtomicBool::new(false),
            dirty_keys: Mutex::new(HashSet::new()),
            dirty_zsets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the last remote operation succeeded
    pub fn remote_healthy(&self) -> bool {
        self.remote_healthy.load(Ordering::Relaxed)
    }

    fn note_remote_ok(&self) {
        if !self.remote_healthy.swap(true, Ordering::Relaxed) {
            info!("remote kv store reachable again, reconciling on touch");
        }
    }

    fn note_remote_err(&self, op: &str, e: &KvError) {
        if self.remote_healthy.swap(false, Ordering::Relaxed) {
            warn!(%op, error = %e, "remote kv store unreachable, serving from memory fallback");
        }
    }

    async fn mark_dirty(&self, key: &str) {
        self.dirty_keys.lock().await.insert(key.to_string());
    }

    async fn mark_zset_dirty(&self, key: &str, member: &str) {
        self.dirty_zsets
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    /// Upsert a dirty string key back to the remote store
    ///
    /// Carries the shadow's remaining TTL along so eviction timing survives
    /// the outage.
    async fn reconcile_key(&self, remote: &Arc<dyn Kv>, key: &str) -> Result<(), KvError> {
        let Some(value) = self.shadow.get(key).await? else {
            // Expired or deleted while dirty; nothing to migrate
            self.dirty_keys.lock().await.remove(key);
            return Ok(());
        };

        match self.shadow.ttl(key).await? {
            Some(ttl) => remote.set_ex(key, &value, ttl).await?,
            None => remote.set(key, &value).await?,
        }

        self.dirty_keys.lock().await.remove(key);
        debug!(%key, "migrated fallback write to remote store");
        Ok(())
    }

    /// Re-add dirty members of a sorted set to the remote store
    async fn reconcile_zset(&self, remote: &Arc<dyn Kv>, key: &str) -> Result<(), KvError> {
        let members: Vec<String> = {
            let dirty = self.dirty_zsets.lock().await;
            match dirty.get(key) {
                Some(members) => members.iter().cloned().collect(),
                None => return Ok(()),
            }
        };

        for member in &members {
            // The member may have been popped from the shadow already
            let entries = self.shadow.zrange(key, 0, -1).await?;
            if let Some(entry) = entries.iter().find(|e| &e.member == member) {
                remote.zadd(key, &entry.member, entry.score).await?;
            }
        }

        self.dirty_zsets.lock().await.remove(key);
        debug!(%key, count = members.len(), "re-added fallback queue entries to remote store");
        Ok(())
    }
}

#[async_trait]
impl Kv for FailoverKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.get(key).await;
        };

        match remote.get(key).await {
            Ok(remote_value) => {
                self.note_remote_ok();
                let dirty = self.dirty_keys.lock().await.contains(key);
                if dirty {
                    match &remote_value {
                        // Remote wins on conflict: drop the shadow version
                        Some(v) => {
                            self.shadow.set(key, v).await?;
                            self.dirty_keys.lock().await.remove(key);
                        }
                        // Written only to the fallback: upsert on this touch
                        None => {
                            self.reconcile_key(remote, key).await?;
                            return self.shadow.get(key).await;
                        }
                    }
                }
                Ok(remote_value)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("get", &e);
                self.shadow.get(key).await
            }
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.set(key, value).await;
        };

        match remote.set(key, value).await {
            Ok(()) => {
                self.note_remote_ok();
                self.shadow.set(key, value).await
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("set", &e);
                self.shadow.set(key, value).await?;
                self.mark_dirty(key).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.set_ex(key, value, ttl).await;
        };

        match remote.set_ex(key, value, ttl).await {
            Ok(()) => {
                self.note_remote_ok();
                self.shadow.set_ex(key, value, ttl).await
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("set_ex", &e);
                self.shadow.set_ex(key, value, ttl).await?;
                self.mark_dirty(key).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.incr(key).await;
        };

        match remote.incr(key).await {
            Ok(n) => {
                self.note_remote_ok();
                // Keep the shadow roughly in step for outage reads
                self.shadow.set(key, &n.to_string()).await?;
                Ok(n)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("incr", &e);
                let n = self.shadow.incr(key).await?;
                self.mark_dirty(key).await;
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.expire(key, ttl).await;
        };

        match remote.expire(key, ttl).await {
            Ok(set) => {
                self.note_remote_ok();
                let _ = self.shadow.expire(key, ttl).await?;
                Ok(set)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("expire", &e);
                self.shadow.expire(key, ttl).await
            }
            Err(e) => Err(e),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.ttl(key).await;
        };

        match remote.ttl(key).await {
            Ok(ttl) => {
                self.note_remote_ok();
                Ok(ttl)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("ttl", &e);
                self.shadow.ttl(key).await
            }
            Err(e) => Err(e),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        self.dirty_keys.lock().await.remove(key);
        self.dirty_zsets.lock().await.remove(key);

        let shadow_had = self.shadow.del(key).await?;
        let Some(remote) = &self.remote else {
            return Ok(shadow_had);
        };

        match remote.del(key).await {
            Ok(remote_had) => {
                self.note_remote_ok();
                Ok(remote_had || shadow_had)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("del", &e);
                Ok(shadow_had)
            }
            Err(e) => Err(e),
        }
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.scan(pattern, cursor, count).await;
        };

        match remote.scan(pattern, cursor, count).await {
            Ok((next, mut keys)) => {
                self.note_remote_ok();
                // Records written only to the fallback must still show up in
                // listings, so fold in matching dirty keys
                let dirty = self.dirty_keys.lock().await;
                for key in dirty.iter() {
                    if glob_match(pattern, key) && !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
                Ok((next, keys))
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("scan", &e);
                self.shadow.scan(pattern, cursor, count).await
            }
            Err(e) => Err(e),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.zadd(key, member, score).await;
        };

        match self.reconcile_zset(remote, key).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }

        match remote.zadd(key, member, score).await {
            Ok(()) => {
                self.note_remote_ok();
                self.shadow.zadd(key, member, score).await
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("zadd", &e);
                self.shadow.zadd(key, member, score).await?;
                self.mark_zset_dirty(key, member).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<ZEntry>, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.zpopmin(key).await;
        };

        match self.reconcile_zset(remote, key).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }

        match remote.zpopmin(key).await {
            Ok(popped) => {
                self.note_remote_ok();
                if let Some(entry) = &popped {
                    let _ = self.shadow.zrem(key, &entry.member).await?;
                }
                Ok(popped)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("zpopmin", &e);
                let popped = self.shadow.zpopmin(key).await?;
                if let Some(entry) = &popped {
                    let mut dirty = self.dirty_zsets.lock().await;
                    if let Some(members) = dirty.get_mut(key) {
                        members.remove(&entry.member);
                    }
                }
                Ok(popped)
            }
            Err(e) => Err(e),
        }
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ZEntry>, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.zrange(key, start, stop).await;
        };

        match self.reconcile_zset(remote, key).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }

        match remote.zrange(key, start, stop).await {
            Ok(entries) => {
                self.note_remote_ok();
                Ok(entries)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("zrange", &e);
                self.shadow.zrange(key, start, stop).await
            }
            Err(e) => Err(e),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        {
            let mut dirty = self.dirty_zsets.lock().await;
            if let Some(members) = dirty.get_mut(key) {
                members.remove(member);
            }
        }
        let shadow_had = self.shadow.zrem(key, member).await?;

        let Some(remote) = &self.remote else {
            return Ok(shadow_had);
        };

        match remote.zrem(key, member).await {
            Ok(remote_had) => {
                self.note_remote_ok();
                Ok(remote_had || shadow_had)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("zrem", &e);
                Ok(shadow_had)
            }
            Err(e) => Err(e),
        }
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.zcard(key).await;
        };

        match self.reconcile_zset(remote, key).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e),
        }

        match remote.zcard(key).await {
            Ok(count) => {
                self.note_remote_ok();
                Ok(count)
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("zcard", &e);
                self.shadow.zcard(key).await
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.publish(channel, message).await;
        };

        match remote.publish(channel, message).await {
            Ok(()) => {
                self.note_remote_ok();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.note_remote_err("publish", &e);
                // Local subscribers still hear the message during the outage
                self.shadow.publish(channel, message).await
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
        // Merge the shadow channel with the remote one so a subscriber hears
        // messages regardless of which path publish took
        let mut shadow_sub = self.shadow.subscribe(channel).await?;
        let (tx, rx) = mpsc::channel(1024);

        let shadow_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = shadow_sub.recv().await {
                if shadow_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        if let Some(remote) = &self.remote {
            match remote.subscribe(channel).await {
                Ok(mut remote_sub) => {
                    tokio::spawn(async move {
                        while let Some(msg) = remote_sub.recv().await {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) if e.is_transient() => {
                    self.note_remote_err("subscribe", &e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Subscription::new(rx))
    }

    async fn ping(&self) -> Result<(), KvError> {
        let Some(remote) = &self.remote else {
            return self.shadow.ping().await;
        };
        match remote.ping().await {
            Ok(()) => {
                self.note_remote_ok();
                Ok(())
            }
            Err(e) => {
                self.note_remote_err("ping", &e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remote stand-in whose reachability can be toggled
    struct FlakyRemote {
        inner: MemoryKv,
        up: AtomicBool,
    }

    impl FlakyRemote {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryKv::new(),
                up: AtomicBool::new(true),
            })
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::Relaxed);
        }

        fn check(&self) -> Result<(), KvError> {
            if self.up.load(Ordering::Relaxed) {
                Ok(())
            } else {
                Err(KvError::Unreachable("flaky remote is down".to_string()))
            }
        }
    }

    #[async_trait]
    impl Kv for FlakyRemote {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            self.check()?;
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
            self.check()?;
            self.inner.set(key, value).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
            self.check()?;
            self.inner.set_ex(key, value, ttl).await
        }
        async fn incr(&self, key: &str) -> Result<i64, KvError> {
            self.check()?;
            self.inner.incr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
            self.check()?;
            self.inner.expire(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
            self.check()?;
            self.inner.ttl(key).await
        }
        async fn del(&self, key: &str) -> Result<bool, KvError> {
            self.check()?;
            self.inner.del(key).await
        }
        async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), KvError> {
            self.check()?;
            self.inner.scan(pattern, cursor, count).await
        }
        async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
            self.check()?;
            self.inner.zadd(key, member, score).await
        }
        async fn zpopmin(&self, key: &str) -> Result<Option<ZEntry>, KvError> {
            self.check()?;
            self.inner.zpopmin(key).await
        }
        async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ZEntry>, KvError> {
            self.check()?;
            self.inner.zrange(key, start, stop).await
        }
        async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
            self.check()?;
            self.inner.zrem(key, member).await
        }
        async fn zcard(&self, key: &str) -> Result<usize, KvError> {
            self.check()?;
            self.inner.zcard(key).await
        }
        async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
            self.check()?;
            self.inner.publish(channel, message).await
        }
        async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
            self.check()?;
            self.inner.subscribe(channel).await
        }
        async fn ping(&self) -> Result<(), KvError> {
            self.check()?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_passes_through_when_remote_up() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        kv.set("k", "v").await.unwrap();
        assert_eq!(remote.inner.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert!(kv.remote_healthy());
    }

    #[tokio::test]
    async fn test_falls_back_when_remote_down() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        remote.set_up(false);
        kv.set("k", "fallback").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("fallback".to_string()));
        assert!(!kv.remote_healthy());

        // Remote never saw the write
        remote.set_up(true);
        assert_eq!(remote.inner.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconciles_dirty_key_on_read() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        remote.set_up(false);
        kv.set_ex("llm:job:a", "{\"status\":\"queued\"}", Duration::from_secs(60))
            .await
            .unwrap();

        remote.set_up(true);
        // Next touch migrates the fallback write
        let value = kv.get("llm:job:a").await.unwrap();
        assert_eq!(value, Some("{\"status\":\"queued\"}".to_string()));
        assert_eq!(
            remote.inner.get("llm:job:a").await.unwrap(),
            Some("{\"status\":\"queued\"}".to_string())
        );
    }

    #[tokio::test]
    async fn test_remote_wins_on_conflict() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        remote.inner.set("k", "remote-version").await.unwrap();
        remote.set_up(false);
        kv.set("k", "fallback-version").await.unwrap();

        remote.set_up(true);
        assert_eq!(kv.get("k").await.unwrap(), Some("remote-version".to_string()));
    }

    #[tokio::test]
    async fn test_queue_entries_readded_on_reconnect() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        remote.set_up(false);
        kv.zadd("render:queue", "render-a", 100.0).await.unwrap();
        kv.zadd("render:queue", "render-b", 200.0).await.unwrap();

        remote.set_up(true);
        // Any touch of the set reconciles it
        assert_eq!(kv.zcard("render:queue").await.unwrap(), 2);
        assert_eq!(remote.inner.zcard("render:queue").await.unwrap(), 2);

        let popped = kv.zpopmin("render:queue").await.unwrap().unwrap();
        assert_eq!(popped.member, "render-a");
    }

    #[tokio::test]
    async fn test_fallback_zpopmin_does_not_resurrect() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        remote.set_up(false);
        kv.zadd("q", "only", 1.0).await.unwrap();
        let popped = kv.zpopmin("q").await.unwrap().unwrap();
        assert_eq!(popped.member, "only");

        remote.set_up(true);
        // The popped entry must not be re-added during reconciliation
        assert_eq!(kv.zcard("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scan_includes_fallback_only_keys() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        kv.set("llm:job:remote", "r").await.unwrap();
        remote.set_up(false);
        kv.set("llm:job:shadow", "s").await.unwrap();
        remote.set_up(true);

        let (_, keys) = kv.scan("llm:job:*", 0, 100).await.unwrap();
        assert!(keys.contains(&"llm:job:remote".to_string()));
        assert!(keys.contains(&"llm:job:shadow".to_string()));
    }

    #[tokio::test]
    async fn test_local_subscribers_hear_outage_publishes() {
        let remote = FlakyRemote::new();
        let kv = FailoverKv::new(remote.clone());

        let mut sub = kv.subscribe("progress:job-1").await.unwrap();

        remote.set_up(false);
        kv.publish("progress:job-1", "50").await.unwrap();

        assert_eq!(sub.recv().await, Some("50".to_string()));
    }

    #[tokio::test]
    async fn test_memory_only_mode() {
        let kv = FailoverKv::memory_only();
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        assert!(!kv.remote_healthy());
    }
}
