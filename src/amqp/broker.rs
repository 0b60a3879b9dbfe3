//! The seam between the pools and the AMQP client library.
//!
//! [`BrokerConnector`], [`BrokerConnection`] and [`BrokerChannel`] capture the handful of
//! operations the pools and [`ReceivedData`] need: opening connections and channels,
//! probing their health, acknowledging deliveries and closing things down.
//! They are implemented for [`ConnectionFactory`], [`lapin::Connection`] and
//! [`lapin::Channel`]; any other client (or an in-memory fake) can plug in by implementing
//! them too.
//!
//! [`ReceivedData`]: crate::consumers::ReceivedData
//! [`ConnectionFactory`]: crate::amqp::ConnectionFactory
use amq_protocol_types::DeliveryTag;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions, ConfirmSelectOptions};
use std::any::Any;
use std::sync::Arc;

/// Reply code sent to the broker when we close a channel or connection on purpose.
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl From<bool> for HealthStatus {
    fn from(connected: bool) -> Self {
        if connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Opens new connections to a broker.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Establish a brand new connection.
    ///
    /// Fails if the broker cannot be reached; retrying is up to the caller.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, anyhow::Error>;
}

/// A live connection to a broker, able to multiplex channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn health(&self) -> HealthStatus;

    /// Open a new channel on this connection.
    ///
    /// Ackable channels are put in confirm mode.
    async fn open_channel(&self, ackable: bool) -> Result<Arc<dyn BrokerChannel>, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A channel opened on a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn health(&self) -> HealthStatus;

    /// `true` while the broker asks us to pause traffic on this channel.
    fn is_flow_controlled(&self) -> bool;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;

    /// Access the concrete channel type, e.g. to reach the raw [`lapin::Channel`].
    fn as_any(&self) -> &dyn Any;
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    fn health(&self) -> HealthStatus {
        self.status().connected().into()
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self, ackable: bool) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let channel = self.create_channel().await?;
        if ackable {
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(Arc::new(channel))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Connection::close(self, REPLY_SUCCESS, "Connection closed by pool").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    fn health(&self) -> HealthStatus {
        self.status().connected().into()
    }

    fn is_flow_controlled(&self) -> bool {
        // lapin answers `channel.flow` itself and does not surface the flag.
        false
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        self.basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Channel::close(self, REPLY_SUCCESS, "Channel closed by pool").await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
