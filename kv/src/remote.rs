//! Redis-backed remote store
//!
//! One command per contract operation over a shared `ConnectionManager`,
//! which transparently re-establishes dropped connections. Pub/sub runs on a
//! dedicated connection per subscription, as the protocol requires.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::kv::{Kv, Subscription, ZEntry};
use crate::KvError;

/// Buffered messages per subscription before backpressure
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Remote [`Kv`] over a Redis-protocol store
pub struct RedisKv {
    client: Client,
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(KvError::from)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(KvError::from)?;
        debug!(url, "connected to remote kv store");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await.map_err(|e| {
            let kv_err = KvError::from(e);
            match kv_err {
                KvError::Backend(msg) if msg.contains("not an integer") => KvError::NotAnInteger {
                    key: key.to_string(),
                },
                other => other,
            }
        })?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.conn();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2 = missing key, -1 = no expiry
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), KvError> {
        let mut conn = self.conn();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((next, keys))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<ZEntry>, KvError> {
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| ZEntry { member, score }))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ZEntry>, KvError> {
        let mut conn = self.conn();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| ZEntry { member, score })
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count as usize)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(KvError::from)?;
        pubsub.subscribe(channel).await.map_err(KvError::from)?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%channel, error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(%channel, "remote subscription ended");
        });

        Ok(Subscription::new(rx))
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
