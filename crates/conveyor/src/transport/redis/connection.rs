//! Redis connection management
//!
//! A thin pool around `redis::aio::ConnectionManager`: the manager multiplexes
//! one connection and is cheap to clone, so the pool's job is reconnect policy
//! and state tracking, not connection counting.

use crate::config::RedisConfig;
use crate::error::{QueueError, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Where the pool currently stands with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Commands can be executed
    Connected,

    /// A reconnect pass is running; requests wait and retry
    Reconnecting,

    /// The last reconnect pass exhausted its budget; the next request
    /// starts a fresh one
    Failed,
}

/// Redis connection pool
#[derive(Clone, Debug)]
pub struct RedisPool {
    client: Arc<Client>,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    config: Arc<RedisConfig>,
    state: Arc<RwLock<ConnectionState>>,
}

impl RedisPool {
    /// Connect to Redis and validate the connection with a PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| QueueError::invalid("redis.url is required for the redis transport"))?;
        let client = Client::open(url.as_str())
            .map_err(|e| QueueError::backend(format!("redis client: {}", e)))?;

        let pool = Self {
            client: Arc::new(client),
            manager: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
            state: Arc::new(RwLock::new(ConnectionState::Failed)),
        };

        pool.reconnect().await?;
        info!("redis pool connected: url={}", url);

        Ok(pool)
    }

    /// Get a connection handle
    pub async fn get(&self) -> Result<ConnectionManager> {
        loop {
            let state = *self.state.read().await;
            match state {
                ConnectionState::Connected => {
                    if let Some(manager) = self.manager.read().await.as_ref() {
                        return Ok(manager.clone());
                    }
                    self.reconnect().await?;
                }
                ConnectionState::Reconnecting => {
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                ConnectionState::Failed => {
                    self.reconnect().await?;
                }
            }
        }
    }

    /// Re-establish the connection.
    ///
    /// Runs through the retry budget exactly once; the caller ends up with
    /// either a `Connected` pool or a backend error carrying the last
    /// failure.
    pub async fn reconnect(&self) -> Result<()> {
        *self.state.write().await = ConnectionState::Reconnecting;

        let budget = self.config.max_retries_per_request.max(1);
        let mut last_error = String::new();
        for attempt in 1..=budget {
            match self.attempt_connect().await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    *self.state.write().await = ConnectionState::Connected;
                    if attempt > 1 {
                        info!("redis connection restored: attempts={}", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!("redis connect {}/{}: {}", attempt, budget, e);
                    last_error = e.to_string();
                }
            }
            if attempt < budget {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        *self.state.write().await = ConnectionState::Failed;
        error!(
            "redis retry budget exhausted: budget={}, last_error={}",
            budget, last_error
        );
        Err(QueueError::backend(format!(
            "redis unreachable, budget of {} spent: {}",
            budget, last_error
        )))
    }

    async fn attempt_connect(&self) -> Result<ConnectionManager> {
        let mut manager = self.client.get_connection_manager().await?;

        let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
        if pong != "PONG" {
            return Err(QueueError::backend("redis PING failed"));
        }

        Ok(manager)
    }

    /// Check if the pool can execute commands
    pub async fn health_check(&self) -> bool {
        if *self.state.read().await != ConnectionState::Connected {
            return false;
        }
        match self.manager.read().await.as_ref() {
            Some(manager) => {
                let mut manager = manager.clone();
                let pong: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut manager).await;
                pong.is_ok()
            }
            None => false,
        }
    }

    /// Current pool state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The underlying client, needed for pub/sub connections
    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    /// Drop the connection and stop serving requests
    pub async fn close(&self) {
        info!("closing redis pool");
        *self.state.write().await = ConnectionState::Failed;
        *self.manager.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> RedisConfig {
        RedisConfig {
            url: Some("redis://127.0.0.1:6379/0".to_string()),
            max_retries_per_request: 1,
            retry_delay_on_failover_ms: 100,
            ..RedisConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pool_requires_url() {
        let config = RedisConfig::default();
        let err = RedisPool::connect(config).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    // Exercised only when a local Redis is running
    #[tokio::test]
    async fn test_pool_connect_and_ping() {
        if let Ok(pool) = RedisPool::connect(local_config()).await {
            assert_eq!(pool.state().await, ConnectionState::Connected);
            assert!(pool.health_check().await);

            pool.close().await;
            assert_eq!(pool.state().await, ConnectionState::Failed);
        }
    }
}
