//! [`ChannelHost`], a leased AMQP channel, and the [`AmqpChannel`] seam it publishes through.
use std::fmt;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::publishers::Letter;

/// The broker's verdict on a single publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The broker acknowledged the message but could not route it
    /// (only for `mandatory` publishes).
    Returned { reply_code: u16, reply_text: String },
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// Resolves once the broker confirms (or rejects) the publish it was returned for.
pub type PendingConfirmation = BoxFuture<'static, Result<Confirmation, anyhow::Error>>;

/// Why a channel (or the connection underneath it) stopped working.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelClosed {
    pub reason: String,
}

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Handed to an [`AmqpChannel`] so it can report its own failure.
///
/// Only the first failure is kept.
pub struct CloseNotifier(watch::Sender<Option<ChannelClosed>>);

impl CloseNotifier {
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.0.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(ChannelClosed { reason });
            true
        });
    }
}

/// The operations the pool and the publishers need from a protocol channel.
///
/// Implemented for the channels opened by [`AmqpConnectionPool`](super::AmqpConnectionPool).
#[async_trait::async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    /// Register `notifier` to be fired when the channel or its connection fails.
    fn notify_close(&self, notifier: CloseNotifier);

    async fn set_qos(&self, prefetch_count: u16, global: bool) -> Result<(), anyhow::Error>;

    async fn enable_publisher_confirms(&self, nowait: bool) -> Result<(), anyhow::Error>;

    /// Publish `letter`, returning as soon as the broker accepted the frames.
    ///
    /// The returned future can be awaited for the broker's confirmation, or simply dropped.
    async fn publish_letter(&self, letter: &Letter) -> Result<PendingConfirmation, anyhow::Error>;

    async fn close_channel(&self) -> Result<(), anyhow::Error>;
}

/// A protocol channel leased from a [`ChannelPool`](super::ChannelPool).
///
/// A host is either queued inside the pool or checked out by a single caller,
/// who must hand it back with [`ChannelPool::return_channel`](super::ChannelPool::return_channel).
pub struct ChannelHost {
    channel_id: u64,
    connection_id: u64,
    ackable: bool,
    generation: u64,
    channel: Box<dyn AmqpChannel>,
    closed: watch::Receiver<Option<ChannelClosed>>,
}

impl ChannelHost {
    pub(crate) fn new(
        channel_id: u64,
        connection_id: u64,
        ackable: bool,
        generation: u64,
        channel: Box<dyn AmqpChannel>,
    ) -> Self {
        let (sender, closed) = watch::channel(None);
        channel.notify_close(CloseNotifier(sender));
        Self {
            channel_id,
            connection_id,
            ackable,
            generation,
            channel,
            closed,
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether publisher confirms are enabled on this channel.
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Why the channel failed, if it did. Never waits.
    pub fn close_reason(&self) -> Option<ChannelClosed> {
        self.closed.borrow().clone()
    }

    pub async fn publish(&self, letter: &Letter) -> Result<PendingConfirmation, anyhow::Error> {
        self.channel.publish_letter(letter).await
    }

    pub(crate) fn channel(&self) -> &dyn AmqpChannel {
        self.channel.as_ref()
    }

    /// Close the underlying channel. Failures are logged: the host is gone either way.
    pub(crate) async fn close(self) {
        if let Err(e) = self.channel.close_channel().await {
            tracing::debug!(channel_id = self.channel_id, "Failed to close channel: {:?}", e);
        }
    }
}

impl fmt::Debug for ChannelHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHost")
            .field("channel_id", &self.channel_id)
            .field("connection_id", &self.connection_id)
            .field("ackable", &self.ackable)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}
