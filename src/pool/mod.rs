//! Self-healing pools of broker connections and channels.
//!
//! This module provides two key guarantees:
//! - Broken or flagged channels are rebuilt before they are handed out again, keeping
//!   their id.
//! - Connections are shared across channels, and both are recreated (with retries) when the
//!   broker goes away.
//!
//! ```rust,no_run
//! use burrow::amqp::ConnectionFactory;
//! use burrow::amqp::configuration::{PoolSettings, RabbitMqSettings};
//! use burrow::pool::{ChannelPool, ConnectionPool};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!     let pool_settings = PoolSettings {
//!         max_connections: 4,
//!         max_channels: 16,
//!         max_ack_channels: 16,
//!         ..PoolSettings::default()
//!     };
//!
//!     let connection_pool =
//!         ConnectionPool::new(ConnectionFactory::new_from_config(&settings)?, &pool_settings)?;
//!     let pool = ChannelPool::new(connection_pool, pool_settings).await?;
//!
//!     // get an ackable channel from the pool.
//!     let channel = pool.get_ack_channel().await?;
//!     pool.return_channel(channel, false).await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelHost, ChannelPool, LeasedChannel};
pub use connection::{ConnectionHost, ConnectionManager, ConnectionPool, PooledConnection};
pub use error::{ChannelKind, PoolError};
