use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use carrot_post::pool::{ChannelPool, Error};

use crate::helpers::{get_channel_pool, StubBroker};

#[tokio::test]
async fn initialization_opens_every_channel_with_consecutive_ids() {
    // Arrange
    let broker = StubBroker::default();

    // Act
    let pool = get_channel_pool(&broker, 2, 3).await;

    // Assert
    assert!(pool.is_initialized());
    assert_eq!(pool.channel_count(), 2);
    assert_eq!(pool.ack_channel_count(), 3);
    assert_eq!(broker.opened(), 5);
    assert_eq!(broker.confirm_selects().len(), 3);

    let mut plain = BTreeSet::new();
    for _ in 0..2 {
        let host = pool.get_channel().await.unwrap();
        assert!(!host.is_ackable());
        plain.insert(host.channel_id());
    }
    let mut ackable = BTreeSet::new();
    for _ in 0..3 {
        let host = pool.get_ackable_channel().await.unwrap();
        assert!(host.is_ackable());
        ackable.insert(host.channel_id());
    }
    assert_eq!(plain, BTreeSet::from([0, 1]));
    assert_eq!(ackable, BTreeSet::from([2, 3, 4]));
}

#[tokio::test]
async fn initializing_twice_is_a_no_op() {
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 1).await;

    pool.initialize().await.unwrap();

    assert_eq!(broker.opened(), 2);
    assert_eq!(pool.channel_count(), 1);
    assert_eq!(pool.ack_channel_count(), 1);
}

#[tokio::test]
async fn checkout_waits_while_every_channel_is_in_use() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;
    let host = pool.get_channel().await.unwrap();

    // Act
    let blocked = tokio::time::timeout(Duration::from_millis(50), pool.get_channel()).await;

    // Assert
    assert!(blocked.is_err());

    let waiting = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_channel().await }
    });
    pool.return_channel(host).await;
    let host = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("The waiting checkout was never served")
        .unwrap()
        .unwrap();
    assert_eq!(host.channel_id(), 0);
}

#[tokio::test]
async fn with_two_channels_the_third_concurrent_checkout_waits_for_a_return() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 2, 0).await;

    // Act
    let checkouts: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_channel().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Assert
    let (served, waiting): (Vec<_>, Vec<_>) =
        checkouts.into_iter().partition(|checkout| checkout.is_finished());
    assert_eq!(served.len(), 2);
    assert_eq!(waiting.len(), 1);

    let mut hosts = Vec::new();
    for checkout in served {
        hosts.push(checkout.await.unwrap().unwrap());
    }
    let returned = hosts.pop().unwrap();
    let returned_id = returned.channel_id();
    pool.return_channel(returned).await;

    let waiting = waiting.into_iter().next().unwrap();
    let host = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("The third checkout was never served")
        .unwrap()
        .unwrap();
    assert_eq!(host.channel_id(), returned_id);
}

#[tokio::test]
async fn checking_out_a_kind_the_pool_holds_none_of_fails() {
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), pool.get_ackable_channel())
        .await
        .expect("The checkout should fail instead of waiting");

    assert!(matches!(outcome, Err(Error::NoChannels { ackable: true })));
    assert!(pool.get_channel().await.is_ok());
}

#[tokio::test]
async fn channels_are_spread_over_connections_with_room() {
    // Arrange
    let broker = StubBroker::default();
    broker.limit_channels_per_connection(2);

    // Act
    let pool = get_channel_pool(&broker, 3, 5).await;

    // Assert
    let mut per_connection: BTreeMap<(u64, bool), usize> = BTreeMap::new();
    for _ in 0..3 {
        let host = pool.get_channel().await.unwrap();
        *per_connection.entry((host.connection_id(), false)).or_default() += 1;
    }
    for _ in 0..5 {
        let host = pool.get_ackable_channel().await.unwrap();
        *per_connection.entry((host.connection_id(), true)).or_default() += 1;
    }
    assert!(per_connection.values().all(|count| *count <= 2));
    let connections: BTreeSet<u64> = per_connection.keys().map(|(id, _)| *id).collect();
    assert_eq!(connections, BTreeSet::from([0, 1, 2]));
}

#[tokio::test]
async fn a_flagged_channel_is_replaced_under_the_same_identity() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;
    let host = pool.get_channel().await.unwrap();
    let channel_id = host.channel_id();

    // Act
    pool.flag_channel(channel_id);
    pool.return_channel(host).await;
    let host = pool.get_channel().await.unwrap();

    // Assert
    assert_eq!(host.channel_id(), channel_id);
    assert!(!pool.is_channel_flagged(channel_id));
    assert_eq!(broker.opened(), 2);
    assert_eq!(broker.closed(), 1);
}

#[tokio::test]
async fn a_closed_ackable_channel_is_replaced_and_its_connection_flagged() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 0, 1).await;

    // Act
    broker.close_channel(0, "CHANNEL_ERROR - connection reset");
    let host = pool.get_ackable_channel().await.unwrap();

    // Assert
    assert_eq!(host.channel_id(), 0);
    assert!(host.is_ackable());
    assert!(host.close_reason().is_none());
    assert_eq!(broker.flagged_connections(), vec![host.connection_id()]);
    assert_eq!(broker.opened(), 2);
    assert_eq!(broker.closed(), 1);
    assert_eq!(broker.confirm_selects().len(), 2);
}

#[tokio::test]
async fn healthy_channels_are_handed_out_as_they_are() {
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 1).await;

    for _ in 0..3 {
        let host = pool.get_channel().await.unwrap();
        pool.return_channel(host).await;
        let host = pool.get_ackable_channel().await.unwrap();
        pool.return_channel(host).await;
    }

    assert_eq!(broker.opened(), 2);
    assert_eq!(broker.closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn replacement_failures_are_reported_and_retried() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;
    let host = pool.get_channel().await.unwrap();
    pool.flag_channel(host.channel_id());
    pool.return_channel(host).await;

    // Act
    broker.fail_next_opens(2);
    let host = pool.get_channel().await.unwrap();

    // Assert
    assert_eq!(host.channel_id(), 0);
    assert!(matches!(pool.try_recv_error(), Some(Error::ChannelCreation(_))));
    assert!(matches!(pool.try_recv_error(), Some(Error::ChannelCreation(_))));
    assert!(pool.try_recv_error().is_none());
}

#[tokio::test]
async fn checkout_fails_before_initialization() {
    let broker = StubBroker::default();
    let pool = ChannelPool::builder(broker.provider()).build();

    assert!(matches!(pool.get_channel().await, Err(Error::NotInitialized)));
    assert!(matches!(
        pool.get_ackable_channel().await,
        Err(Error::NotInitialized)
    ));
}

#[tokio::test]
async fn a_failed_initialization_leaves_the_pool_uninitialized() {
    // Arrange
    let broker = StubBroker::default();
    let pool = ChannelPool::builder(broker.provider())
        .max_channels(3)
        .max_ack_channels(0)
        .build();
    broker.fail_opens_after(2);

    // Act
    let outcome = pool.initialize().await;

    // Assert
    assert!(matches!(outcome, Err(Error::Initialization(_))));
    assert!(!pool.is_initialized());
    assert_eq!(broker.closed(), 2);
    assert_eq!(pool.channel_count(), 0);

    // Identities start from scratch on the next attempt.
    broker.heal();
    pool.initialize().await.unwrap();
    let mut ids = BTreeSet::new();
    for _ in 0..3 {
        ids.insert(pool.get_channel().await.unwrap().channel_id());
    }
    assert_eq!(ids, BTreeSet::from([0, 1, 2]));
}

#[tokio::test]
async fn a_connection_provider_failure_aborts_initialization() {
    let broker = StubBroker::default();
    broker.fail_initialization();
    let pool = ChannelPool::builder(broker.provider()).build();

    let outcome = pool.initialize().await;

    assert!(matches!(outcome, Err(Error::ConnectionProvider(_))));
    assert!(!pool.is_initialized());
    assert_eq!(broker.opened(), 0);
}

#[tokio::test]
async fn connections_without_room_for_channels_are_rejected() {
    let broker = StubBroker::default();
    broker.exhaust_capacity();
    let pool = ChannelPool::builder(broker.provider())
        .max_channels(1)
        .build();

    let outcome = pool.initialize().await;

    match outcome {
        Err(Error::Initialization(e)) => {
            assert!(matches!(*e, Error::CapacityExceeded { ackable: false }))
        }
        other => panic!("Expected a capacity error, got {other:?}"),
    }
    assert_eq!(broker.opened(), 0);
}

#[tokio::test]
async fn qos_and_publisher_confirms_are_set_up_on_new_channels() {
    // Arrange
    let broker = StubBroker::default();
    let pool = ChannelPool::builder(broker.provider())
        .max_channels(1)
        .max_ack_channels(2)
        .global_qos_count(5)
        .ack_no_wait(true)
        .build();

    // Act
    pool.initialize().await.unwrap();

    // Assert
    assert_eq!(broker.qos(), vec![(5, true); 3]);
    assert_eq!(broker.confirm_selects(), vec![true, true]);
}

#[tokio::test]
async fn shutdown_closes_every_channel_and_is_idempotent() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 2, 2).await;
    pool.flag_channel(1);

    // Act
    pool.shutdown().await;
    pool.shutdown().await;

    // Assert
    assert!(!pool.is_initialized());
    assert_eq!(broker.closed(), 4);
    assert_eq!(broker.shutdowns(), 1);
    assert!(!pool.is_channel_flagged(1));
    assert_eq!(pool.channel_count(), 0);
    assert_eq!(pool.ack_channel_count(), 0);
    assert!(matches!(pool.get_channel().await, Err(Error::NotInitialized)));
}

#[tokio::test]
async fn the_pool_can_be_initialized_again_after_shutdown() {
    // Arrange
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 1).await;
    let checked_out = pool.get_channel().await.unwrap();
    pool.shutdown().await;

    // Act
    pool.initialize().await.unwrap();

    // Assert
    assert!(pool.is_initialized());
    assert_eq!(pool.channel_count(), 1);
    assert_eq!(pool.ack_channel_count(), 1);
    assert_eq!(pool.get_channel().await.unwrap().channel_id(), 0);

    // A channel checked out before the shutdown is not taken back.
    let closed_before = broker.closed();
    pool.return_channel(checked_out).await;
    assert_eq!(broker.closed(), closed_before + 1);
    assert_eq!(pool.channel_count(), 0);
}

#[tokio::test]
async fn flags_are_tracked_per_channel() {
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;

    assert!(!pool.is_channel_flagged(7));
    pool.flag_channel(7);
    assert!(pool.is_channel_flagged(7));
    assert!(!pool.is_channel_flagged(8));
    pool.unflag_channel(7);
    assert!(!pool.is_channel_flagged(7));
}

#[tokio::test]
async fn pool_errors_can_be_flushed() {
    let broker = StubBroker::default();
    let pool = get_channel_pool(&broker, 1, 0).await;
    let host = pool.get_channel().await.unwrap();
    pool.flag_channel(host.channel_id());
    pool.return_channel(host).await;
    broker.fail_next_opens(1);
    let _host = pool.get_channel().await.unwrap();

    pool.flush_errors();

    assert!(pool.try_recv_error().is_none());
}
