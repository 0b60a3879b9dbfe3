use crate::amqp::broker::BrokerChannel;
use crate::consumers::completion::{Completion, CompletionError, CompletionSource};
use crate::consumers::headers::MessageHeaders;
use amq_protocol_types::DeliveryTag;
use lapin::BasicProperties;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug)]
enum Disposition {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Nack { .. } => write!(f, "nack"),
            Self::Reject { .. } => write!(f, "reject"),
        }
    }
}

/// A message received from the broker, on its way through a processing pipeline.
///
/// It remembers the channel it was delivered on so that whoever finishes processing it
/// can settle it with [`ack_message`](Self::ack_message),
/// [`nack_message`](Self::nack_message) or [`reject_message`](Self::reject_message).
/// A delivery is settled at most once: after the first successful call the channel is
/// released and further calls return `false`.
///
/// Independently of settlement, [`complete`](Self::complete) tells whoever holds a
/// [`Completion`] that the unit is done with.
pub struct ReceivedData {
    channel: Option<Arc<dyn BrokerChannel>>,
    delivery_tag: DeliveryTag,
    ackable: bool,
    consumer_tag: Option<String>,
    data: Vec<u8>,
    properties: BasicProperties,
    headers: MessageHeaders,
    failed_to_deserialize: bool,
    completion: CompletionSource,
}

impl ReceivedData {
    /// Wrap a delivery.
    ///
    /// `ackable` is `false` for messages consumed in auto-ack mode: there is nothing left to
    /// settle for those. The known headers are decoded here; a malformed one sets
    /// [`failed_to_deserialize`](Self::failed_to_deserialize) instead of failing.
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        delivery_tag: DeliveryTag,
        properties: BasicProperties,
        data: Vec<u8>,
        ackable: bool,
    ) -> Self {
        let (headers, errors) = MessageHeaders::decode(&properties);
        for e in &errors {
            warn!(delivery_tag, error = %e, "Failed to decode message header");
        }
        Self {
            channel: Some(channel),
            delivery_tag,
            ackable,
            consumer_tag: None,
            data,
            properties,
            headers,
            failed_to_deserialize: !errors.is_empty(),
            completion: CompletionSource::new(),
        }
    }

    /// Wrap a delivery received through `lapin`.
    pub fn from_delivery(
        channel: Arc<dyn BrokerChannel>,
        delivery: lapin::message::Delivery,
        ackable: bool,
    ) -> Self {
        Self::new(
            channel,
            delivery.delivery_tag,
            delivery.properties,
            delivery.data,
            ackable,
        )
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// `true` if one of the known headers could not be decoded.
    pub fn failed_to_deserialize(&self) -> bool {
        self.failed_to_deserialize
    }

    /// `true` until the delivery has been settled with the broker.
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Acknowledge the delivery.
    ///
    /// Returns `false` if it was already settled or the broker call failed. A failure
    /// leaves the delivery's fate unknown: the channel may be gone, in which case the
    /// broker will redeliver the message.
    pub async fn ack_message(&mut self) -> bool {
        self.settle(Disposition::Ack).await
    }

    pub async fn nack_message(&mut self, requeue: bool) -> bool {
        self.settle(Disposition::Nack { requeue }).await
    }

    pub async fn reject_message(&mut self, requeue: bool) -> bool {
        self.settle(Disposition::Reject { requeue }).await
    }

    /// Mark the unit as done, whether or not it was settled successfully.
    pub fn complete(&self) -> Result<(), CompletionError> {
        self.completion.complete()
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    pub fn completion(&self) -> Completion {
        self.completion.subscribe()
    }

    async fn settle(&mut self, disposition: Disposition) -> bool {
        if !self.ackable {
            return true;
        }
        let Some(channel) = &self.channel else {
            return false;
        };
        let tag = self.delivery_tag;
        let result = match disposition {
            Disposition::Ack => channel.ack(tag).await,
            Disposition::Nack { requeue } => channel.nack(tag, requeue).await,
            Disposition::Reject { requeue } => channel.reject(tag, requeue).await,
        };
        match result {
            Ok(()) => {
                self.channel = None;
                true
            }
            Err(e) => {
                warn!(
                    delivery_tag = tag,
                    error = %e,
                    "Failed to {} message", disposition
                );
                false
            }
        }
    }
}

impl fmt::Debug for ReceivedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedData")
            .field("delivery_tag", &self.delivery_tag)
            .field("ackable", &self.ackable)
            .field("consumer_tag", &self.consumer_tag)
            .field("headers", &self.headers)
            .field("failed_to_deserialize", &self.failed_to_deserialize)
            .field("settled", &self.channel.is_none())
            .finish()
    }
}
