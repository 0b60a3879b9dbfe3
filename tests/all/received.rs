use crate::helpers::{pool_settings, MockBroker, Settlement};
use burrow::amqp::configuration::{PoolSettings, RabbitMqSettings};
use burrow::amqp::convenience::set_header;
use burrow::amqp::types::AMQPValue;
use burrow::amqp::{BasicProperties, ConnectionFactory};
use burrow::consumers::{ReceivedData, COMPRESSED_HEADER, OBJECT_TYPE_HEADER};
use burrow::pipeline::{Pipeline, StepOptions};
use burrow::pool::ChannelPool;
use std::time::Duration;

#[tokio::test]
async fn a_pipeline_settles_and_completes_every_delivery() {
    // Arrange
    let broker = MockBroker::new();
    let pool = ChannelPool::from_settings(broker.connector(), pool_settings(0, 1))
        .await
        .unwrap();
    let host = pool.get_ack_channel().await.unwrap();

    let mut pipeline = Pipeline::<ReceivedData, ReceivedData>::new(1);
    pipeline
        .add_async_step_with(
            |mut data: ReceivedData| async move {
                let settled = if data.failed_to_deserialize() {
                    data.reject_message(false).await
                } else {
                    data.ack_message().await
                };
                assert!(settled);
                data
            },
            StepOptions::default().parallelism(4),
        )
        .unwrap();
    pipeline
        .finalize(|data: ReceivedData| data.complete().unwrap())
        .unwrap();

    // Act
    let mut completions = Vec::new();
    for tag in 1..=50u64 {
        let header = if tag % 10 == 0 {
            AMQPValue::LongInt(1)
        } else {
            AMQPValue::Boolean(false)
        };
        let properties = set_header(BasicProperties::default(), COMPRESSED_HEADER, header);
        let properties = set_header(
            properties,
            OBJECT_TYPE_HEADER,
            AMQPValue::LongString("Letter".into()),
        );
        let data = ReceivedData::new(host.channel().clone(), tag, properties, b"{}".to_vec(), true)
            .with_consumer_tag("consumer-1");
        completions.push(data.completion());
        pipeline.queue_for_execution(data).await.unwrap();
    }
    pipeline.await_completion().await.unwrap();

    // Assert
    for completion in &completions {
        let completed = tokio::time::timeout(Duration::from_secs(1), completion.wait()).await;
        assert_eq!(completed, Ok(true));
    }
    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 50);
    for (tag, settlement) in settlements {
        let expected = if tag % 10 == 0 {
            Settlement::Reject { requeue: false }
        } else {
            Settlement::Ack
        };
        assert_eq!(settlement, expected, "delivery {tag}");
    }
    pool.return_channel(host, false).await.unwrap();
    pool.shutdown().await;
}

#[tokio::test]
async fn settling_twice_is_refused() {
    let broker = MockBroker::new();
    let pool = ChannelPool::from_settings(broker.connector(), pool_settings(0, 1))
        .await
        .unwrap();
    let host = pool.get_ack_channel().await.unwrap();
    let mut data = ReceivedData::new(
        host.channel().clone(),
        42,
        BasicProperties::default(),
        Vec::new(),
        true,
    );

    assert!(data.ack_message().await);
    assert!(!data.ack_message().await);
    assert!(!data.nack_message(true).await);
    assert_eq!(broker.settlements(), vec![(42, Settlement::Ack)]);

    assert!(data.complete().is_ok());
    assert!(data.complete().is_err());
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker listening on localhost:5672"]
async fn pooled_channels_work_against_a_live_broker() {
    let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default()).unwrap();
    let settings = PoolSettings {
        max_connections: 1,
        max_channels: 1,
        max_ack_channels: 1,
        ..PoolSettings::default()
    };
    let pool = ChannelPool::from_settings(factory, settings).await.unwrap();

    let host = pool.get_ack_channel().await.unwrap();
    let channel = host.lapin_channel().expect("backed by lapin");
    assert!(channel.status().connected());
    assert!(host.status().is_healthy());

    pool.return_channel(host, false).await.unwrap();
    pool.shutdown().await;
}
