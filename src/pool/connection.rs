//! The connection layer underneath [`ChannelPool`](super::ChannelPool).
//!
//! [`ConnectionProvider`] is the seam: the channel pool only ever leases a connection long
//! enough to open a channel on it. [`AmqpConnectionPool`] implements it on top of
//! [`deadpool`] and [`lapin`].
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context;
use deadpool::managed::{self, Manager, Object};
use lapin::options::{BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions};
use lapin::{Connection, ConnectionState};
use tokio::sync::Mutex as AsyncMutex;

use super::configuration::ConnectionPoolConfiguration;
use super::error::ConnectionError;
use super::host::{AmqpChannel, CloseNotifier, Confirmation, PendingConfirmation};
use crate::amqp::ConnectionFactory;
use crate::publishers::{inject_amqp_properties, Letter};

/// Supplies physical connections to a [`ChannelPool`](super::ChannelPool).
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    fn is_initialized(&self) -> bool;

    async fn initialize(&self) -> Result<(), anyhow::Error>;

    /// Lease a connection with room for one more channel of the requested kind.
    ///
    /// If every connection is full, one of them is leased anyway: the caller finds out through
    /// [`ConnectionHandle::can_add_channel`]. The lease must be handed back with
    /// [`ConnectionProvider::release`].
    async fn acquire(&self, ackable: bool) -> Result<Box<dyn ConnectionHandle>, anyhow::Error>;

    fn release(&self, connection: Box<dyn ConnectionHandle>);

    /// Mark a connection as suspect: it should not be leased again as-is.
    fn flag_connection(&self, connection_id: u64);

    async fn shutdown(&self);
}

/// A connection leased from a [`ConnectionProvider`].
#[async_trait::async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn connection_id(&self) -> u64;

    fn can_add_channel(&self) -> bool;

    fn can_add_ack_channel(&self) -> bool;

    async fn open_channel(&self, ackable: bool) -> Result<Box<dyn AmqpChannel>, anyhow::Error>;
}

/// A pool of [`ConnectionHost`]s.
pub type ConnectionPool = managed::Pool<ConnectionManager>;

/// One RabbitMq connection plus the bookkeeping of the channels multiplexed over it.
pub struct ConnectionHost {
    connection_id: u64,
    connection: Connection,
    channels: Arc<AtomicUsize>,
    ack_channels: Arc<AtomicUsize>,
    max_channels: usize,
    max_ack_channels: usize,
}

impl ConnectionHost {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether one more channel of the given kind fits on this connection.
    pub fn has_room(&self, ackable: bool) -> bool {
        if ackable {
            self.ack_channels.load(Ordering::SeqCst) < self.max_ack_channels
        } else {
            self.channels.load(Ordering::SeqCst) < self.max_channels
        }
    }

    /// Number of channels currently open on this connection, plain and ackable.
    pub fn channel_counts(&self) -> (usize, usize) {
        (
            self.channels.load(Ordering::SeqCst),
            self.ack_channels.load(Ordering::SeqCst),
        )
    }
}

/// `ConnectionManager` implements [Manager] for [`ConnectionHost`].
///
/// Connections flagged through [`ConnectionProvider::flag_connection`] fail the recycle
/// check and get replaced by a brand new one.
pub struct ConnectionManager {
    connection_factory: ConnectionFactory,
    configuration: ConnectionPoolConfiguration,
    next_connection_id: Arc<AtomicU64>,
    flagged_connections: Arc<Mutex<HashSet<u64>>>,
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = ConnectionHost;
    type Error = ConnectionError;

    async fn create(&self) -> Result<ConnectionHost, ConnectionError> {
        let connection = self.connection_factory.new_connection().await?;
        Ok(ConnectionHost {
            connection_id: self.next_connection_id.fetch_add(1, Ordering::SeqCst),
            connection,
            channels: Arc::default(),
            ack_channels: Arc::default(),
            max_channels: self.configuration.max_channels_per_connection,
            max_ack_channels: self.configuration.max_ack_channels_per_connection,
        })
    }

    async fn recycle(&self, obj: &mut ConnectionHost) -> managed::RecycleResult<ConnectionError> {
        let flagged = self
            .flagged_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&obj.connection_id);
        if flagged {
            return Err(managed::RecycleError::Message(format!(
                "Connection {} has been flagged as unusable",
                obj.connection_id
            )));
        }
        match obj.connection.status().state() {
            ConnectionState::Connected => Ok(()),
            state => Err(managed::RecycleError::Message(format!(
                "Connection is not in an healthy state {state:?}",
            ))),
        }
    }
}

/// A [`ConnectionProvider`] keeping a bounded pool of `lapin` connections.
///
/// ```rust
/// use std::sync::Arc;
/// use carrot_post::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
/// use carrot_post::pool::{AmqpConnectionPool, ChannelPool, ConnectionPoolConfiguration};
///
/// async fn example() -> anyhow::Result<()> {
///     let connection_factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
///     let connections = AmqpConnectionPool::new(
///         connection_factory,
///         ConnectionPoolConfiguration::default(),
///     );
///
///     let channel_pool = ChannelPool::builder(Arc::new(connections))
///         .max_channels(8)
///         .max_ack_channels(8)
///         .build();
///     channel_pool.initialize().await?;
///     Ok(())
/// }
/// ```
pub struct AmqpConnectionPool {
    connection_factory: ConnectionFactory,
    configuration: ConnectionPoolConfiguration,
    next_connection_id: Arc<AtomicU64>,
    flagged_connections: Arc<Mutex<HashSet<u64>>>,
    pool: RwLock<Option<ConnectionPool>>,
    /// Serializes leases: a lease holds on to full connections while it looks for room.
    leasing: AsyncMutex<()>,
}

impl AmqpConnectionPool {
    pub fn new(
        connection_factory: ConnectionFactory,
        configuration: ConnectionPoolConfiguration,
    ) -> Self {
        Self {
            connection_factory,
            configuration,
            next_connection_id: Arc::default(),
            flagged_connections: Arc::default(),
            pool: RwLock::new(None),
            leasing: AsyncMutex::new(()),
        }
    }

    fn current_pool(&self) -> Option<ConnectionPool> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl ConnectionProvider for AmqpConnectionPool {
    fn is_initialized(&self) -> bool {
        self.current_pool().is_some()
    }

    #[tracing::instrument(name = "rabbitmq_connection_pool_init", skip(self))]
    async fn initialize(&self) -> Result<(), anyhow::Error> {
        if self.is_initialized() {
            return Ok(());
        }
        let manager = ConnectionManager {
            connection_factory: self.connection_factory.clone(),
            configuration: self.configuration.clone(),
            next_connection_id: Arc::clone(&self.next_connection_id),
            flagged_connections: Arc::clone(&self.flagged_connections),
        };
        let pool = ConnectionPool::builder(manager)
            .max_size(self.configuration.max_connection_count.max(1))
            .build()
            .context("Failed to build the RabbitMq connection pool")?;

        // Fail early if the broker can't be reached.
        let connection = pool.get().await.map_err(ConnectionError::from)?;
        drop(connection);

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        Ok(())
    }

    async fn acquire(&self, ackable: bool) -> Result<Box<dyn ConnectionHandle>, anyhow::Error> {
        let pool = self
            .current_pool()
            .context("The RabbitMq connection pool has not been initialized")?;
        let _leasing = self.leasing.lock().await;
        let connection = lease_with_room(&pool, |host| host.has_room(ackable))
            .await
            .map_err(ConnectionError::from)?;
        Ok(Box::new(PooledConnection(connection)))
    }

    fn release(&self, connection: Box<dyn ConnectionHandle>) {
        // Dropping the deadpool object puts the connection back into the pool.
        drop(connection);
    }

    fn flag_connection(&self, connection_id: u64) {
        tracing::warn!(connection_id, "Flagging RabbitMq connection as unusable");
        self.flagged_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id);
    }

    async fn shutdown(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.close();
        }
        self.flagged_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Lease a pooled object satisfying `has_room`, opening new objects up to the pool's size.
///
/// Objects without room stay leased during the search, so the pool hands out (or creates) a
/// different one next. Once every object has been looked at, the last one is returned as is.
async fn lease_with_room<M, F>(
    pool: &managed::Pool<M>,
    has_room: F,
) -> Result<Object<M>, managed::PoolError<M::Error>>
where
    M: Manager,
    F: Fn(&M::Type) -> bool,
{
    let mut full = Vec::new();
    loop {
        let object = pool.get().await?;
        if has_room(&*object) || full.len() + 1 >= pool.status().max_size {
            return Ok(object);
        }
        full.push(object);
    }
}

struct PooledConnection(Object<ConnectionManager>);

#[async_trait::async_trait]
impl ConnectionHandle for PooledConnection {
    fn connection_id(&self) -> u64 {
        self.0.connection_id
    }

    fn can_add_channel(&self) -> bool {
        self.0.has_room(false)
    }

    fn can_add_ack_channel(&self) -> bool {
        self.0.has_room(true)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.0.connection_id))]
    async fn open_channel(&self, ackable: bool) -> Result<Box<dyn AmqpChannel>, anyhow::Error> {
        let channel = self.0.connection.create_channel().await?;
        let counter = if ackable {
            &self.0.ack_channels
        } else {
            &self.0.channels
        };
        Ok(Box::new(PooledChannel {
            channel,
            _slot: ChannelSlot::take(counter),
        }))
    }
}

/// Holds one of the connection's channel slots until dropped.
struct ChannelSlot(Arc<AtomicUsize>);

impl ChannelSlot {
    fn take(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ChannelSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PooledChannel {
    channel: lapin::Channel,
    _slot: ChannelSlot,
}

#[async_trait::async_trait]
impl AmqpChannel for PooledChannel {
    fn notify_close(&self, notifier: CloseNotifier) {
        self.channel.on_error(move |e| {
            tracing::warn!("RabbitMQ broken channel: {:?}", e);
            notifier.notify(e.to_string());
        });
    }

    async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<(), anyhow::Error> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    async fn enable_publisher_confirms(&self, nowait: bool) -> Result<(), anyhow::Error> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait })
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(letter_id = letter.letter_id))]
    async fn publish_letter(&self, letter: &Letter) -> Result<PendingConfirmation, anyhow::Error> {
        let envelope = &letter.envelope;
        let options = BasicPublishOptions {
            mandatory: envelope.mandatory,
            immediate: envelope.immediate,
        };
        let properties = inject_amqp_properties(envelope.properties());

        let confirm = self
            .channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                options,
                &letter.body,
                properties,
            )
            .await?;

        let pending: PendingConfirmation = Box::pin(async move {
            let confirmation = match confirm.await? {
                lapin::publisher_confirm::Confirmation::Ack(Some(returned)) => {
                    Confirmation::Returned {
                        reply_code: returned.reply_code,
                        reply_text: returned.reply_text.as_str().to_owned(),
                    }
                }
                lapin::publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
                lapin::publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
                lapin::publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
            };
            Ok::<_, anyhow::Error>(confirmation)
        });
        Ok(pending)
    }

    async fn close_channel(&self) -> Result<(), anyhow::Error> {
        self.channel.close(200, "Closing channel").await?;
        Ok(())
    }
}
