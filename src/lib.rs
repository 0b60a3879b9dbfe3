//! `burrow` keeps RabbitMQ plumbing out of the way of message processing.
//!
//! It is built on top of [`lapin`] and provides:
//! - [`ChannelPool`](crate::pool::ChannelPool), pools of broker channels over a
//!   [`ConnectionPool`](crate::pool::ConnectionPool) that rebuild broken channels and ride
//!   out broker outages without surfacing errors;
//! - [`Pipeline`](crate::pipeline::Pipeline), a typed, bounded, concurrent chain of
//!   processing steps;
//! - [`ReceivedData`](crate::consumers::ReceivedData), the unit of work that carries a
//!   delivery through a pipeline and settles it with the broker at the end.
//!
//! The broker is reached through the traits in [`amqp::broker`], so the pools can be
//! exercised against anything implementing them.

pub mod amqp;
pub mod consumers;
pub mod pipeline;
pub mod pool;
