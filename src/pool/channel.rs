//! Implements [`Manager`] for [`ChannelHost`].
use crate::amqp::broker::{BrokerChannel, BrokerConnection, BrokerConnector, HealthStatus};
use crate::amqp::configuration::PoolSettings;
use crate::pool::connection::{ConnectionPool, PooledConnection};
use crate::pool::{ChannelKind, PoolError};
use dashmap::DashMap;
use deadpool::managed::{self, Manager, Object};
use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// One broker channel, either pooled by a [`ChannelPool`] or transient.
pub struct ChannelHost {
    id: u64,
    ackable: bool,
    transient: bool,
    channel: Arc<dyn BrokerChannel>,
    connection: Weak<dyn BrokerConnection>,
    connection_id: Uuid,
}

impl ChannelHost {
    fn new(id: u64, ackable: bool, transient: bool, opened: OpenedChannel) -> Self {
        Self {
            id,
            ackable,
            transient,
            channel: opened.channel,
            connection: opened.connection,
            connection_id: opened.connection_id,
        }
    }

    /// Pooled hosts count up from 1; transient ones start at the transient floor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn kind(&self) -> ChannelKind {
        if self.ackable {
            ChannelKind::Ackable
        } else {
            ChannelKind::Plain
        }
    }

    /// The id of the connection the channel was opened on.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    /// The underlying [`lapin::Channel`], if the pool is backed by `lapin`.
    pub fn lapin_channel(&self) -> Option<&lapin::Channel> {
        self.channel.as_any().downcast_ref()
    }

    /// A host is healthy when its channel is open and, if the connection is still
    /// around, when that connection is open too.
    pub fn status(&self) -> HealthStatus {
        let connection_healthy = self
            .connection
            .upgrade()
            .map_or(true, |connection| connection.health().is_healthy());
        if connection_healthy && self.channel.health().is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.channel.is_flow_controlled()
    }

    pub async fn close(&self) -> Result<(), anyhow::Error> {
        self.channel.close().await
    }

    fn replace(&mut self, opened: OpenedChannel) -> Arc<dyn BrokerChannel> {
        self.connection = opened.connection;
        self.connection_id = opened.connection_id;
        std::mem::replace(&mut self.channel, opened.channel)
    }
}

impl fmt::Debug for ChannelHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHost")
            .field("id", &self.id)
            .field("ackable", &self.ackable)
            .field("transient", &self.transient)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// A channel checked out of a [`ChannelPool`], pooled or transient.
///
/// Dereferences to its [`ChannelHost`]. It belongs to the caller until it is handed back
/// with [`ChannelPool::return_channel`]. Dropping a pooled lease returns it unflagged.
pub struct LeasedChannel(Lease);

enum Lease {
    Pooled(Object<ChannelManager>),
    Transient(ChannelHost),
}

impl Deref for LeasedChannel {
    type Target = ChannelHost;

    fn deref(&self) -> &ChannelHost {
        match &self.0 {
            Lease::Pooled(host) => &**host,
            Lease::Transient(host) => host,
        }
    }
}

impl fmt::Debug for LeasedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

struct OpenedChannel {
    channel: Arc<dyn BrokerChannel>,
    connection: Weak<dyn BrokerConnection>,
    connection_id: Uuid,
}

/// What the plain and ackable pools of a [`ChannelPool`] have in common.
struct Shared {
    settings: PoolSettings,
    connection_pool: ConnectionPool,
    flagged: DashMap<u64, bool>,
    next_channel_id: AtomicU64,
    next_transient_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get `host` ready for its next user.
    async fn prepare(&self, host: &mut ChannelHost) -> Result<(), PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        let flagged = self.flagged.get(&host.id).map_or(false, |flag| *flag);
        let healthy = host.status().is_healthy();
        if flagged || !healthy {
            warn!(
                channel_id = host.id,
                flagged, healthy, "Channel has issues, rebuilding it before use"
            );
            self.rebuild(host).await
        } else if host.is_flow_controlled() {
            self.wait_for_flow(host).await
        } else {
            Ok(())
        }
    }

    async fn wait_for_flow(&self, host: &ChannelHost) -> Result<(), PoolError> {
        debug!(channel_id = host.id, "Channel is flow controlled, waiting");
        let interval = self.settings.flow_control_poll_interval();
        while host.is_flow_controlled() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(PoolError::Shutdown),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }

    #[tracing::instrument(name = "channel_pool_create_channel", skip(self))]
    async fn create_channel(
        &self,
        id: u64,
        ackable: bool,
        transient: bool,
    ) -> Result<ChannelHost, PoolError> {
        let opened = self.open_channel(id, ackable).await?;
        debug!("Channel created");
        Ok(ChannelHost::new(id, ackable, transient, opened))
    }

    #[tracing::instrument(name = "channel_pool_rebuild_channel", skip_all, fields(channel_id = host.id))]
    async fn rebuild(&self, host: &mut ChannelHost) -> Result<(), PoolError> {
        let opened = self.open_channel(host.id, host.ackable).await?;
        let previous = host.replace(opened);
        if let Err(e) = previous.close().await {
            trace!(error = %e, "Failed to close the replaced channel");
        }
        self.flagged.insert(host.id, false);
        debug!("Channel rebuilt");
        Ok(())
    }

    /// Open a channel on a pooled connection, retrying until it works or the pool shuts
    /// down.
    ///
    /// The connection goes back to the [`ConnectionPool`] right away: channels do not
    /// hold on to a connection lease.
    async fn open_channel(&self, id: u64, ackable: bool) -> Result<OpenedChannel, PoolError> {
        loop {
            trace!(channel_id = id, "Opening channel");
            let connection = self.connection_pool.get_connection().await?;
            let result = connection.open_channel(ackable).await;
            let opened = result.map(|channel| OpenedChannel {
                channel,
                connection: Arc::downgrade(connection.connection()),
                connection_id: connection.id(),
            });
            self.return_connection(connection);

            match opened {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    warn!(channel_id = id, error = %e, "Failed to open channel, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(PoolError::Shutdown),
                        _ = tokio::time::sleep(self.settings.sleep_on_error_interval()) => {}
                    }
                }
            }
        }
    }

    fn return_connection(&self, connection: PooledConnection) {
        self.connection_pool.return_connection(connection);
    }
}

/// `ChannelManager` implements [`Manager`] for one kind of pooled channel.
///
/// New channels take the next pooled id. Recycling rebuilds a channel in place, keeping
/// its id, when it was flagged or fails its health probe, and waits while the broker
/// holds its flow.
pub(crate) struct ChannelManager {
    kind: ChannelKind,
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = ChannelHost;
    type Error = PoolError;

    async fn create(&self) -> Result<ChannelHost, PoolError> {
        if self.shared.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        let id = self.shared.next_channel_id.fetch_add(1, Ordering::SeqCst);
        let host = self
            .shared
            .create_channel(id, self.kind.is_ackable(), false)
            .await?;
        self.shared.flagged.insert(id, false);
        Ok(host)
    }

    async fn recycle(&self, host: &mut ChannelHost) -> managed::RecycleResult<PoolError> {
        match self.shared.prepare(host).await {
            Ok(()) => Ok(()),
            Err(e) => {
                close_quietly(host).await;
                Err(managed::RecycleError::Backend(e))
            }
        }
    }
}

/// `ChannelPool` leases broker channels and hides broker-side channel failures from its
/// callers.
///
/// It keeps two deadpool pools, one of plain channels and one of ackable channels,
/// filled when it is built. Checking out a channel that its previous user flagged,
/// or that fails its health probe, rebuilds it first; checking out a channel under broker
/// flow control waits for the flow to resume. During a broker outage both simply take
/// longer.
///
/// ```rust,no_run
/// use burrow::amqp::configuration::{PoolSettings, RabbitMqSettings};
/// use burrow::amqp::ConnectionFactory;
/// use burrow::pool::ChannelPool;
///
/// async fn example() -> anyhow::Result<()> {
///     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
///     let pool = ChannelPool::from_settings(factory, PoolSettings::default()).await?;
///
///     let channel = pool.get_channel().await?;
///     // ... publish on `channel.lapin_channel()` ...
///     pool.return_channel(channel, false).await?;
///
///     pool.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ChannelPool {
    shared: Arc<Shared>,
    channels: Option<managed::Pool<ChannelManager>>,
    ack_channels: Option<managed::Pool<ChannelManager>>,
    shutdown_lock: Mutex<()>,
}

impl ChannelPool {
    /// Build a [`ConnectionPool`] for `connector` and a channel pool on top of it.
    pub async fn from_settings(
        connector: impl BrokerConnector,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        let connection_pool = ConnectionPool::new(connector, &settings)?;
        Self::new(connection_pool, settings).await
    }

    /// Build the pool and open all of its connections and channels, unless only
    /// transient channels were asked for.
    ///
    /// Like any channel creation, filling the pool waits out broker outages.
    pub async fn new(
        connection_pool: ConnectionPool,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        let shared = Arc::new(Shared {
            flagged: DashMap::new(),
            next_channel_id: AtomicU64::new(1),
            next_transient_id: AtomicU64::new(settings.transient_channel_floor()),
            shutdown: CancellationToken::new(),
            connection_pool,
            settings,
        });
        let pooled = !shared.settings.only_transient_channels;
        let pool = Self {
            channels: build(&shared, ChannelKind::Plain, pooled)?,
            ack_channels: build(&shared, ChannelKind::Ackable, pooled)?,
            shutdown_lock: Mutex::new(()),
            shared,
        };

        if pooled {
            pool.shared.connection_pool.fill().await?;
            pool.fill(ChannelKind::Plain).await?;
            pool.fill(ChannelKind::Ackable).await?;
        }
        Ok(pool)
    }

    /// Check out every channel at once so that all of them get created, in id order.
    async fn fill(&self, kind: ChannelKind) -> Result<(), PoolError> {
        let Some(pool) = self.pool(kind) else {
            return Ok(());
        };
        let size = pool.status().max_size;
        let mut hosts = Vec::with_capacity(size);
        for _ in 0..size {
            hosts.push(pool.get().await?);
        }
        debug!(%kind, channels = hosts.len(), "Filled channel pool");
        // Handed back front to back, so the lowest id is leased first.
        drop(hosts);
        Ok(())
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// The id the next pooled channel would get.
    pub fn current_channel_id(&self) -> u64 {
        self.shared.next_channel_id.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Lease a plain channel.
    ///
    /// Waits while all plain channels are checked out.
    pub async fn get_channel(&self) -> Result<LeasedChannel, PoolError> {
        self.checkout(ChannelKind::Plain).await
    }

    /// Lease an ackable channel.
    ///
    /// Waits while all ackable channels are checked out.
    pub async fn get_ack_channel(&self) -> Result<LeasedChannel, PoolError> {
        self.checkout(ChannelKind::Ackable).await
    }

    /// Open a channel that the pool does not track.
    ///
    /// Closing it is the caller's responsibility. Transient channels do not count
    /// against the pool sizes.
    pub async fn get_transient_channel(&self, ackable: bool) -> Result<LeasedChannel, PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        let id = self.shared.next_transient_id.fetch_add(1, Ordering::SeqCst);
        let host = self.shared.create_channel(id, ackable, true).await?;
        Ok(LeasedChannel(Lease::Transient(host)))
    }

    /// Hand a leased channel back.
    ///
    /// Set `flag` when the channel misbehaved while you were using it: the pool will
    /// rebuild it before leasing it again. Transient channels are closed instead.
    pub async fn return_channel(&self, channel: LeasedChannel, flag: bool) -> Result<(), PoolError> {
        let host = match channel.0 {
            Lease::Pooled(host) => host,
            Lease::Transient(host) => {
                trace!(channel_id = host.id, "Closing returned transient channel");
                close_quietly(&host).await;
                return Ok(());
            }
        };
        if !self.owns(&host) {
            warn!(channel_id = host.id, "Channel returned to a pool it was not leased from");
            return Err(PoolError::ForeignChannel(host.id));
        }
        if self.is_shutdown() {
            let host = Object::take(host);
            close_quietly(&host).await;
            return Err(PoolError::Shutdown);
        }

        debug!(channel_id = host.id, flagged = flag, "Returning channel to the pool");
        self.shared.flagged.insert(host.id, flag);
        drop(host);
        Ok(())
    }

    /// Shut the pool down: close every idle channel, then the connection pool.
    ///
    /// Only the first call does any work; concurrent callers wait for it to finish.
    /// Channels that are checked out get closed when they are returned.
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.is_shutdown() {
            return;
        }
        info!("Shutting down channel pool");
        self.shared.shutdown.cancel();

        let idle = RefCell::new(Vec::new());
        for pool in [&self.channels, &self.ack_channels].into_iter().flatten() {
            pool.retain(|host, _| {
                idle.borrow_mut().push((host.id, Arc::clone(&host.channel)));
                false
            });
            pool.close();
        }
        for (id, channel) in idle.into_inner() {
            if let Err(e) = channel.close().await {
                trace!(channel_id = id, error = %e, "Failed to close channel");
            }
        }

        self.shared.connection_pool.shutdown().await;
        info!("Channel pool shut down");
    }

    fn pool(&self, kind: ChannelKind) -> Option<&managed::Pool<ChannelManager>> {
        match kind {
            ChannelKind::Plain => self.channels.as_ref(),
            ChannelKind::Ackable => self.ack_channels.as_ref(),
        }
    }

    fn owns(&self, host: &Object<ChannelManager>) -> bool {
        Object::pool(host).map_or(false, |pool| Arc::ptr_eq(&pool.manager().shared, &self.shared))
    }

    async fn checkout(&self, kind: ChannelKind) -> Result<LeasedChannel, PoolError> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        if self.shared.settings.only_transient_channels {
            return self.get_transient_channel(kind.is_ackable()).await;
        }
        let pool = self.pool(kind).ok_or(PoolError::NotConfigured(kind))?;
        let host = pool.get().await?;
        trace!(channel_id = host.id, "Checked out channel");
        Ok(LeasedChannel(Lease::Pooled(host)))
    }
}

fn build(
    shared: &Arc<Shared>,
    kind: ChannelKind,
    pooled: bool,
) -> Result<Option<managed::Pool<ChannelManager>>, PoolError> {
    let size = match kind {
        ChannelKind::Plain => shared.settings.max_channels,
        ChannelKind::Ackable => shared.settings.max_ack_channels,
    };
    if !pooled || size == 0 {
        return Ok(None);
    }
    let manager = ChannelManager {
        kind,
        shared: Arc::clone(shared),
    };
    managed::Pool::builder(manager)
        .max_size(size)
        .build()
        .map(Some)
        .map_err(|e| PoolError::Misconfigured(e.to_string()))
}

async fn close_quietly(host: &ChannelHost) {
    if let Err(e) = host.close().await {
        trace!(channel_id = host.id, error = %e, "Failed to close channel");
    }
}
