//! Helpers for connecting to a rabbitmq broker

pub mod broker;
pub mod configuration;
pub mod convenience;
mod factory;

pub use broker::{BrokerChannel, BrokerConnection, BrokerConnector, HealthStatus};
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
