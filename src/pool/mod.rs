//! A bounded pool of RabbitMq channels with lazy health checking.
//!
//! This module provides two key guarantees:
//! - Disposing of broken channels and recreating new ones on-demand.
//! - Reusing connection objects across channels to limit overhead.
//!
//! ```rust
//! use std::sync::Arc;
//! use carrot_post::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
//! use carrot_post::pool::{AmqpConnectionPool, ChannelPool, ConnectionPoolConfiguration};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     // determine the maximum underlying connections.
//!     let connection_pool = AmqpConnectionPool::new(
//!         ConnectionFactory::new_from_config(&settings)?,
//!         ConnectionPoolConfiguration {
//!             max_connection_count: 2,
//!             ..Default::default()
//!         },
//!     );
//!
//!     let pool = ChannelPool::builder(Arc::new(connection_pool))
//!         .max_channels(16)
//!         .max_ack_channels(16)
//!         .build();
//!     pool.initialize().await?;
//!
//!     // get a new channel from the pool, and give it back once done.
//!     let channel = pool.get_ackable_channel().await?;
//!     pool.return_channel(channel).await;
//!     Ok(())
//! }
//! ```

mod channel;
mod configuration;
mod connection;
mod error;
mod host;

pub use channel::{ChannelPool, ChannelPoolBuilder};
pub use configuration::{ChannelPoolConfiguration, ConnectionPoolConfiguration};
pub use connection::{
    AmqpConnectionPool, ConnectionHandle, ConnectionHost, ConnectionManager, ConnectionPool,
    ConnectionProvider,
};
pub use error::{ConnectionError, Error};
pub use host::{
    AmqpChannel, ChannelClosed, ChannelHost, CloseNotifier, Confirmation, PendingConfirmation,
};
