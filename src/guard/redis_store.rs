//! Redis-backed guard store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, RedisResult};
use tokio::sync::RwLock;

use crate::health::{DependencyHealth, HealthCheckable};

use super::{GuardError, GuardStore};

/// INCR and start the expiry window on first increment, atomically.
const INCREMENT_WITH_EXPIRY: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// Guard store over a shared multiplexed Redis connection.
///
/// The connection is established lazily and dropped when Redis reports a
/// connection-level error, so the next operation reconnects.
pub struct RedisGuardStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    increment_script: redis::Script,
}

impl RedisGuardStore {
    pub fn new(url: &str) -> Result<Self, GuardError> {
        let client = Client::open(url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            increment_script: redis::Script::new(INCREMENT_WITH_EXPIRY),
        })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, GuardError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        let conn = self.client.get_multiplexed_tokio_connection().await?;
        *conn_guard = Some(conn.clone());
        tracing::info!("Guard store Redis connection established");
        Ok(conn)
    }

    /// Run `f` on a connection, dropping the cached connection on I/O failure.
    async fn execute<F, T, Fut>(&self, f: F) -> Result<T, GuardError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    tracing::warn!(error = %e, "Guard store connection dropped");
                }
                Err(GuardError::Redis(e))
            }
        }
    }

    /// Read a raw reply as `T`, reporting a mismatch as a malformed value.
    fn typed<T: FromRedisValue>(key: &str, value: &redis::Value) -> Result<T, GuardError> {
        redis::from_redis_value(value).map_err(|e| GuardError::MalformedValue {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl GuardStore for RedisGuardStore {
    async fn exists(&self, key: &str) -> Result<bool, GuardError> {
        let owned = key.to_string();
        let reply: redis::Value = self
            .execute(|mut conn| async move {
                redis::cmd("EXISTS").arg(&owned).query_async(&mut conn).await
            })
            .await?;

        let count: i64 = Self::typed(key, &reply)?;
        Ok(count > 0)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), GuardError> {
        let owned_key = key.to_string();
        let owned_value = value.to_string();
        let seconds = ttl.as_secs().max(1);

        let _: redis::Value = self
            .execute(|mut conn| async move {
                redis::cmd("SET")
                    .arg(&owned_key)
                    .arg(&owned_value)
                    .arg("EX")
                    .arg(seconds)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<u64, GuardError> {
        let owned = key.to_string();
        let seconds = window.as_secs().max(1);
        let script = &self.increment_script;

        let reply: redis::Value = self
            .execute(|mut conn| async move {
                script.key(&owned).arg(seconds).invoke_async(&mut conn).await
            })
            .await?;

        let count: u64 = Self::typed(key, &reply)?;
        tracing::debug!(key = %key, count = count, "Guard counter incremented");
        Ok(count)
    }
}

#[async_trait]
impl HealthCheckable for RedisGuardStore {
    fn name(&self) -> &str {
        "guard_store"
    }

    async fn check_health(&self) -> DependencyHealth {
        let ping: Result<redis::Value, GuardError> = self
            .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await;

        match ping.and_then(|reply| Self::typed::<String>("PING", &reply)) {
            Ok(pong) if pong == "PONG" => DependencyHealth::healthy(),
            Ok(other) => DependencyHealth::degraded(format!("unexpected PING reply: {}", other)),
            Err(e) => DependencyHealth::unhealthy(e.to_string()),
        }
    }
}
