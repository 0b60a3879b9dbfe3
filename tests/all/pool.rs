use crate::helpers::{pool_settings, MockBroker, MockChannel};
use burrow::amqp::configuration::{PoolSettings, MIN_TRANSIENT_CHANNEL_ID};
use burrow::amqp::HealthStatus;
use burrow::pool::{ChannelKind, ChannelPool, ConnectionPool, PoolError};
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn channel_pool(broker: &MockBroker, settings: PoolSettings) -> ChannelPool {
    ChannelPool::from_settings(broker.connector(), settings)
        .await
        .unwrap()
}

#[tokio::test]
async fn connections_are_created_lazily_and_reused() {
    // Arrange
    let broker = MockBroker::new();
    let pool = ConnectionPool::new(broker.connector(), &pool_settings(0, 0)).unwrap();
    assert_eq!(broker.connections_opened(), 0);

    // Act
    let first = pool.get_connection().await.unwrap();
    let first_id = first.id();
    pool.return_connection(first);
    let second = pool.get_connection().await.unwrap();

    // Assert
    assert_eq!(second.id(), first_id);
    assert_eq!(second.status(), HealthStatus::Healthy);
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn unhealthy_connections_are_replaced() {
    // Arrange
    let broker = MockBroker::new();
    let pool = ConnectionPool::new(broker.connector(), &pool_settings(0, 0)).unwrap();
    let first = pool.get_connection().await.unwrap();
    let first_id = first.id();
    broker.connection(0).drop_connection();
    pool.return_connection(first);

    // Act
    let second = pool.get_connection().await.unwrap();

    // Assert
    assert_ne!(second.id(), first_id);
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn getting_a_connection_waits_out_an_outage() {
    // Arrange
    let broker = MockBroker::new();
    broker.set_reachable(false);
    let pool = Arc::new(ConnectionPool::new(broker.connector(), &pool_settings(0, 0)).unwrap());

    // Act
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_connection().await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    broker.set_reachable(true);

    // Assert
    assert!(waiter.await.unwrap().is_ok());
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn connection_pool_refuses_work_after_shutdown() {
    let broker = MockBroker::new();
    let pool = ConnectionPool::new(broker.connector(), &pool_settings(0, 0)).unwrap();
    let connection = pool.get_connection().await.unwrap();
    pool.return_connection(connection);

    pool.shutdown().await;

    assert!(pool.is_shutdown());
    assert!(matches!(
        pool.get_connection().await,
        Err(PoolError::Shutdown)
    ));
    assert_eq!(broker.connections_closed(), 1);
}

#[tokio::test]
async fn pooled_and_transient_channels_get_distinct_ids() {
    // Arrange
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(2, 2)).await;

    // Act
    let plain = [
        pool.get_channel().await.unwrap(),
        pool.get_channel().await.unwrap(),
    ];
    let ack = [
        pool.get_ack_channel().await.unwrap(),
        pool.get_ack_channel().await.unwrap(),
    ];
    let transient = pool.get_transient_channel(true).await.unwrap();
    let next_transient = pool.get_transient_channel(false).await.unwrap();

    // Assert
    assert_eq!(plain.iter().map(|h| h.id()).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(ack.iter().map(|h| h.id()).collect::<Vec<_>>(), vec![3, 4]);
    assert!(plain.iter().all(|h| !h.is_ackable()));
    assert!(ack.iter().all(|h| h.is_ackable() && MockChannel::of(h).ackable));
    assert_eq!(transient.id(), MIN_TRANSIENT_CHANNEL_ID);
    assert!(transient.is_transient() && transient.is_ackable());
    assert_eq!(next_transient.id(), MIN_TRANSIENT_CHANNEL_ID + 1);
    assert_eq!(pool.current_channel_id(), 5);
    assert_eq!(broker.channels_opened(), 6);
}

#[tokio::test]
async fn pooled_channels_are_spread_over_every_connection() {
    // Arrange
    let broker = MockBroker::new();
    let settings = PoolSettings {
        max_connections: 5,
        ..pool_settings(10, 10)
    };

    // Act
    let pool = channel_pool(&broker, settings).await;
    let mut hosts = Vec::new();
    for _ in 0..10 {
        hosts.push(pool.get_channel().await.unwrap());
        hosts.push(pool.get_ack_channel().await.unwrap());
    }

    // Assert
    let connections: HashSet<_> = hosts.iter().map(|h| h.connection_id()).collect();
    assert_eq!(broker.channels_opened(), 20);
    assert_eq!(broker.connections_opened(), 5);
    assert_eq!(connections.len(), 5);
}

#[tokio::test]
async fn returned_channels_are_handed_out_again_in_order() {
    // Arrange
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(2, 0)).await;

    // Act
    let first = pool.get_channel().await.unwrap();
    pool.return_channel(first, false).await.unwrap();
    let second = pool.get_channel().await.unwrap();
    let third = pool.get_channel().await.unwrap();

    // Assert
    assert_eq!(second.id(), 2);
    assert_eq!(third.id(), 1);
    assert_eq!(broker.channels_opened(), 2);
}

#[tokio::test]
async fn checkout_waits_while_every_channel_is_in_use() {
    // Arrange
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(1, 0)).await);
    let host = pool.get_channel().await.unwrap();

    // Act
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await.map(|h| h.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    pool.return_channel(host, false).await.unwrap();

    // Assert
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn flow_controlled_channels_are_held_back_until_flow_resumes() {
    // Arrange
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(1, 0)).await;
    let host = pool.get_channel().await.unwrap();
    let mock = broker.channel(0);
    mock.set_flow_controlled(true);
    pool.return_channel(host, false).await.unwrap();

    let delay = Duration::from_millis(100);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        mock.set_flow_controlled(false);
    });

    // Act
    let start = Instant::now();
    let host = pool.get_channel().await.unwrap();

    // Assert
    assert!(start.elapsed() >= delay);
    assert_eq!(host.id(), 1);
    assert!(!host.is_flow_controlled());
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn flagged_channels_are_rebuilt_with_the_same_id() {
    // Arrange
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(1, 0)).await;
    let host = pool.get_channel().await.unwrap();
    pool.return_channel(host, true).await.unwrap();

    // Act
    let host = pool.get_channel().await.unwrap();

    // Assert
    assert_eq!(host.id(), 1);
    assert_eq!(MockChannel::of(&host).seq, 1);
    assert!(broker.channel(0).is_closed());
    assert_eq!(broker.channels_opened(), 2);

    // A clean return does not trigger another rebuild.
    pool.return_channel(host, false).await.unwrap();
    let host = pool.get_channel().await.unwrap();
    assert_eq!(MockChannel::of(&host).seq, 1);
}

#[tokio::test]
async fn channels_closed_by_the_broker_are_rebuilt() {
    // Arrange
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(0, 1)).await;
    let host = pool.get_ack_channel().await.unwrap();
    MockChannel::of(&host).break_channel();
    pool.return_channel(host, false).await.unwrap();

    // Act
    let host = pool.get_ack_channel().await.unwrap();

    // Assert
    assert_eq!(host.id(), 1);
    assert_eq!(host.status(), HealthStatus::Healthy);
    assert!(host.is_ackable());
    assert_eq!(broker.channels_opened(), 2);
}

#[tokio::test]
async fn rebuilding_waits_out_a_broker_outage() {
    // Arrange
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(1, 0)).await);
    let host = pool.get_channel().await.unwrap();
    broker.set_reachable(false);
    MockChannel::of(&host).break_channel();
    pool.return_channel(host, false).await.unwrap();

    // Act
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let host = pool.get_channel().await?;
            Ok::<_, PoolError>((host.id(), host.status()))
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    broker.set_reachable(true);

    // Assert
    let (id, status) = waiter.await.unwrap().unwrap();
    assert_eq!(id, 1);
    assert_eq!(status, HealthStatus::Healthy);
}

#[tokio::test]
async fn asking_for_an_unconfigured_kind_fails_right_away() {
    let broker = MockBroker::new();
    let pool = channel_pool(&broker, pool_settings(1, 0)).await;

    let outcome = pool.get_ack_channel().await;

    assert!(matches!(
        outcome,
        Err(PoolError::NotConfigured(ChannelKind::Ackable))
    ));
}

#[tokio::test]
async fn only_transient_mode_never_fills_the_pools() {
    // Arrange
    let broker = MockBroker::new();
    let settings = PoolSettings {
        only_transient_channels: true,
        transient_channel_start_range: 20_000,
        ..pool_settings(5, 5)
    };
    let pool = channel_pool(&broker, settings).await;
    assert_eq!(broker.channels_opened(), 0);

    // Act
    let host = pool.get_ack_channel().await.unwrap();
    let id = host.id();
    pool.return_channel(host, false).await.unwrap();

    // Assert
    assert_eq!(id, 20_000);
    assert!(broker.channel(0).is_closed());
    assert_eq!(pool.current_channel_id(), 1);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_releases_waiters() {
    // Arrange
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(1, 1)).await);
    let host = pool.get_channel().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await.map(|h| h.id()) }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act
    tokio::join!(pool.shutdown(), pool.shutdown());
    pool.shutdown().await;

    // Assert
    assert!(pool.is_shutdown());
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Shutdown)));
    assert!(matches!(pool.get_ack_channel().await, Err(PoolError::Shutdown)));
    assert!(matches!(
        pool.get_transient_channel(false).await,
        Err(PoolError::Shutdown)
    ));
    // The idle ackable channel was closed by the shutdown...
    assert!(broker.channel(1).is_closed());
    // ...and the checked out one is closed when it comes back.
    assert!(matches!(
        pool.return_channel(host, false).await,
        Err(PoolError::Shutdown)
    ));
    assert!(broker.channel(0).is_closed());
    assert_eq!(broker.connections_closed(), broker.connections_opened());
}

#[tokio::test]
async fn shutdown_cancels_a_checkout_held_by_flow_control() {
    // Arrange
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(1, 0)).await);
    let host = pool.get_channel().await.unwrap();
    broker.channel(0).set_flow_controlled(true);
    pool.return_channel(host, false).await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await.map(|h| h.id()) }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    // Act
    pool.shutdown().await;

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("the checkout was not cancelled")
        .unwrap();
    assert!(matches!(outcome, Err(PoolError::Shutdown)));
    assert!(broker.channel(0).is_closed());
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn shutdown_cancels_a_rebuild_stuck_in_an_outage() {
    // Arrange
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(1, 0)).await);
    let host = pool.get_channel().await.unwrap();
    broker.set_reachable(false);
    MockChannel::of(&host).break_channel();
    pool.return_channel(host, false).await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await.map(|h| h.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // Act
    pool.shutdown().await;

    // Assert
    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("the rebuild was not cancelled")
        .unwrap();
    assert!(matches!(outcome, Err(PoolError::Shutdown)));
    assert!(broker.channel(0).is_closed());
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn channels_only_go_back_to_the_pool_that_leased_them() {
    // Arrange
    let broker = MockBroker::new();
    let first = channel_pool(&broker, pool_settings(1, 0)).await;
    let second = channel_pool(&broker, pool_settings(1, 0)).await;
    let host = first.get_channel().await.unwrap();

    // Act
    let outcome = second.return_channel(host, true).await;

    // Assert
    assert!(matches!(outcome, Err(PoolError::ForeignChannel(1))));
    assert!(!second.is_shutdown());
    // The channel is back with its own pool, and the flag was not recorded.
    let host = tokio::time::timeout(Duration::from_millis(200), first.get_channel())
        .await
        .expect("the channel never went back to its pool")
        .unwrap();
    assert_eq!(host.id(), 1);
    assert_eq!(broker.channels_opened(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_checkouts_never_share_a_channel() {
    // Arrange
    const WORKERS: usize = 8;
    const PAIRS: usize = 10_000;
    let broker = MockBroker::new();
    let pool = Arc::new(channel_pool(&broker, pool_settings(2, 2)).await);
    let checked_out = Arc::new(DashSet::new());
    let completed = Arc::new(AtomicUsize::new(0));

    // Act
    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let pool = pool.clone();
            let checked_out = checked_out.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                for i in 0..PAIRS / WORKERS {
                    let host = if (worker + i) % 2 == 0 {
                        pool.get_channel().await
                    } else {
                        pool.get_ack_channel().await
                    }
                    .expect("checkout failed");

                    assert!(checked_out.insert(host.id()), "{} handed out twice", host.id());
                    tokio::task::yield_now().await;
                    checked_out.remove(&host.id());

                    pool.return_channel(host, false).await.expect("return failed");
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    // Assert
    assert_eq!(completed.load(Ordering::SeqCst), PAIRS);
    assert_eq!(broker.channels_opened(), 4);
    assert_eq!(pool.current_channel_id(), 5);
}
