//! `carrot-post` takes care of the publishing side of RabbitMQ, built on top of [`lapin`].
//!
//! It provides:
//!
//! - a [`ChannelPool`](crate::pool::ChannelPool), a bounded pool of reusable AMQP channels
//!   that replaces broken or flagged channels behind the scenes;
//! - a [`Publisher`](crate::publishers::Publisher), which publishes [`Letter`](crate::publishers::Letter)s
//!   with or without waiting for publisher confirms, and can drain a letter queue in the background.
//!
//! Every publish outcome is reported as a [`PublishReceipt`](crate::publishers::PublishReceipt).
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action against a local broker.

pub mod amqp;
pub mod pool;
pub mod publishers;

mod feed;
mod queue;
