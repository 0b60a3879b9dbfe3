//! Implements [`Manager`] for [`ConnectionHost`].
use crate::amqp::broker::{BrokerChannel, BrokerConnection, BrokerConnector, HealthStatus};
use crate::amqp::configuration::PoolSettings;
use crate::pool::PoolError;
use dashmap::DashMap;
use deadpool::managed::{self, Manager, Object};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping it hands the connection back to the pool, as does
/// [`ConnectionPool::return_connection`].
pub type PooledConnection = Object<ConnectionManager>;

/// One live broker connection, owned by the [`ConnectionPool`].
pub struct ConnectionHost {
    id: Uuid,
    connection: Arc<dyn BrokerConnection>,
}

impl ConnectionHost {
    fn new(connection: Arc<dyn BrokerConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> HealthStatus {
        self.connection.health()
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    /// Open a channel multiplexed over this connection.
    pub async fn open_channel(&self, ackable: bool) -> Result<Arc<dyn BrokerChannel>, PoolError> {
        Ok(self.connection.open_channel(ackable).await?)
    }
}

/// `ConnectionManager` implements [`Manager`] to create and recycle the connections of a
/// [`ConnectionPool`].
///
/// It remembers every connection it created so that they can all be closed on shutdown,
/// including the ones that are checked out at that moment.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    created: DashMap<Uuid, Weak<dyn BrokerConnection>>,
}

impl ConnectionManager {
    pub fn new(connector: impl BrokerConnector) -> Self {
        Self {
            connector: Arc::new(connector),
            created: DashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = ConnectionHost;
    type Error = PoolError;

    async fn create(&self) -> Result<ConnectionHost, PoolError> {
        let host = ConnectionHost::new(self.connector.connect().await?);
        self.created
            .insert(host.id, Arc::downgrade(&host.connection));
        debug!(connection_id = %host.id, "Opened broker connection");
        Ok(host)
    }

    async fn recycle(&self, obj: &mut ConnectionHost) -> managed::RecycleResult<PoolError> {
        match obj.status() {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::Unhealthy => {
                self.created.remove(&obj.id);
                Err(managed::RecycleError::Message(format!(
                    "Connection {} is not in an healthy state",
                    obj.id
                )))
            }
        }
    }
}

/// `ConnectionPool` hands out healthy broker connections, up to `max_connections` at once.
///
/// Connections are created lazily unless the pool is [filled](Self::fill) up front.
/// Unhealthy connections are discarded when they are checked out again and replaced by
/// fresh ones.
pub struct ConnectionPool {
    pool: managed::Pool<ConnectionManager>,
    sleep_on_error: Duration,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn new(connector: impl BrokerConnector, settings: &PoolSettings) -> Result<Self, PoolError> {
        let pool = managed::Pool::builder(ConnectionManager::new(connector))
            .max_size(settings.max_connections.max(1))
            .build()
            .map_err(|e| PoolError::Misconfigured(e.to_string()))?;
        Ok(Self {
            pool,
            sleep_on_error: settings.sleep_on_error_interval(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get a healthy connection.
    ///
    /// Waits while every connection is checked out. If a connection cannot be created the
    /// call keeps retrying, sleeping between attempts, until it succeeds or the pool is
    /// shut down.
    pub async fn get_connection(&self) -> Result<PooledConnection, PoolError> {
        loop {
            if self.is_shutdown() {
                return Err(PoolError::Shutdown);
            }
            let error = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(PoolError::Shutdown),
                result = self.pool.get() => match result.map_err(PoolError::from) {
                    Ok(connection) => return Ok(connection),
                    Err(PoolError::Shutdown) => return Err(PoolError::Shutdown),
                    Err(e) => e,
                },
            };
            warn!(error = %error, "Failed to get a broker connection, retrying");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(PoolError::Shutdown),
                _ = tokio::time::sleep(self.sleep_on_error) => {}
            }
        }
    }

    /// Open connections until the pool holds `max_connections` of them.
    ///
    /// Idle connections are handed out oldest first, so channels opened afterwards are
    /// spread over all of them.
    pub async fn fill(&self) -> Result<(), PoolError> {
        let size = self.pool.status().max_size;
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            connections.push(self.get_connection().await?);
        }
        debug!(connections = connections.len(), "Filled connection pool");
        for connection in connections {
            self.return_connection(connection);
        }
        Ok(())
    }

    /// Hand a connection back.
    ///
    /// After shutdown the connection is detached from the pool and dropped instead.
    pub fn return_connection(&self, connection: PooledConnection) {
        if self.is_shutdown() {
            let host = Object::take(connection);
            debug!(connection_id = %host.id, "Discarding connection returned after shutdown");
            return;
        }
        drop(connection);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close the pool and every connection it opened.
    ///
    /// Close failures are ignored: the connections are going away either way.
    pub async fn shutdown(&self) {
        if self.is_shutdown() {
            return;
        }
        self.shutdown.cancel();

        // Closing the pool drops its idle connections, so upgrade them first.
        let manager = self.pool.manager();
        let connections: Vec<_> = manager
            .created
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        manager.created.clear();
        self.pool.close();
        for connection in connections {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Failed to close broker connection during shutdown");
            }
        }
    }
}
