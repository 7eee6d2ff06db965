//! Lazily (re)connected async Redis connection shared by the Redis adapters.

use std::sync::Arc;

use redis::FromRedisValue;
use tokio::sync::Mutex;
use tracing::warn;

/// A multiplexed connection that is opened on first use and re-opened after a
/// failed command.
#[derive(Clone)]
pub struct RedisConnection {
    client: redis::Client,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection").finish_non_exhaustive()
    }
}

impl RedisConnection {
    pub fn open(url: &str) -> redis::RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> redis::RedisResult<()> {
        if connection.is_none() {
            *connection = Some(self.client.get_multiplexed_async_connection().await?);
        }
        Ok(())
    }

    /// Run a command, reconnecting and retrying once on failure.
    pub async fn cmd<T, F>(&self, operation: &'static str, build: F) -> redis::RedisResult<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut attempt = 0;
        loop {
            let mut guard = self.connection.lock().await;
            self.ensure_connection(&mut guard).await?;
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            match build().query_async::<_, T>(conn).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    *guard = None;
                    attempt += 1;
                    warn!(operation, attempt, error = %error, "redis command failed; reconnecting");
                    if attempt >= 2 {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Run a pipeline (optionally `MULTI`/`EXEC` wrapped), same retry rules as [`cmd`](Self::cmd).
    pub async fn pipe<T, F>(&self, operation: &'static str, build: F) -> redis::RedisResult<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Pipeline,
    {
        let mut attempt = 0;
        loop {
            let mut guard = self.connection.lock().await;
            self.ensure_connection(&mut guard).await?;
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            match build().query_async::<_, T>(conn).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    *guard = None;
                    attempt += 1;
                    warn!(operation, attempt, error = %error, "redis pipeline failed; reconnecting");
                    if attempt >= 2 {
                        return Err(error);
                    }
                }
            }
        }
    }
}
