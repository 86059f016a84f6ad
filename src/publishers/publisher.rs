use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::feed::Feed;
use crate::pool::{self, ChannelClosed, ChannelHost, ChannelPool, Confirmation, PendingConfirmation};
use crate::publishers::{Letter, PublishReceipt, PublisherConfiguration};
use crate::queue::BoundedQueue;

/// A high-level interface to publish [`Letter`]s through a [`ChannelPool`].
///
/// Three delivery tiers are available:
/// - [`Publisher::publish`]: fire-and-forget, a single publish call;
/// - [`Publisher::publish_with_confirmation`]: retries until the broker confirms the
///   message or a timeout expires;
/// - auto-publishing: letters queued with [`Publisher::queue_letter`] are delivered by a
///   background task, see [`Publisher::start_auto_publishing`].
///
/// Every letter handed to a publish call results in exactly one [`PublishReceipt`], which
/// you receive with [`Publisher::recv_receipt`]. Operational problems that are not tied to
/// a specific letter (e.g. the auto-publisher losing its channel) are reported separately,
/// see [`Publisher::recv_error`].
///
/// Both streams are bounded: keep draining them, or publishing will eventually wait for you.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    channel_pool: ChannelPool,
    configuration: PublisherConfiguration,
    letters: BoundedQueue<Letter>,
    receipts: Feed<PublishReceipt>,
    errors: Feed<PublisherError>,
    /// Stops the running auto-publish loop, if any. Every run gets a signal of its own.
    auto_publisher: Mutex<Option<mpsc::Sender<()>>>,
}

impl Publisher {
    /// Start building a [`Publisher`].
    ///
    /// You will need a channel pool. It is not initialized for you, and it can be shared
    /// with other publishers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use carrot_post::amqp::configuration::RabbitMqSettings;
    /// use carrot_post::amqp::ConnectionFactory;
    /// use carrot_post::pool::{AmqpConnectionPool, ChannelPool, ConnectionPoolConfiguration};
    /// use carrot_post::publishers::Publisher;
    ///
    /// pub async fn get_publisher() -> Publisher {
    ///     let settings = RabbitMqSettings::default();
    ///     let connection_factory = ConnectionFactory::new_from_config(&settings).unwrap();
    ///     let connections =
    ///         AmqpConnectionPool::new(connection_factory, ConnectionPoolConfiguration::default());
    ///     let channel_pool = ChannelPool::builder(Arc::new(connections))
    ///         .max_channels(10)
    ///         .max_ack_channels(10)
    ///         .build();
    ///     channel_pool.initialize().await.unwrap();
    ///
    ///     Publisher::builder(channel_pool)
    ///         .sleep_on_idle_interval(std::time::Duration::from_millis(10))
    ///         .build()
    /// }
    /// ```
    pub fn builder(channel_pool: ChannelPool) -> PublisherBuilder {
        PublisherBuilder::new(channel_pool)
    }

    pub fn channel_pool(&self) -> &ChannelPool {
        &self.inner.channel_pool
    }

    /// Publish a letter once, without waiting for the broker to confirm it.
    ///
    /// A channel with publisher confirms is used unless `auto_ack` is set. The receipt only
    /// tells whether the publish call itself succeeded: a broker-side rejection, or a channel
    /// failing right after the call, goes unnoticed.
    /// Use [`Publisher::publish_with_confirmation`] for at-least-once delivery.
    #[tracing::instrument(name = "publish", skip_all, fields(letter_id = letter.letter_id))]
    pub async fn publish(&self, letter: Letter) {
        self.inner.publish(letter).await
    }

    /// Publish a letter and wait for the broker to confirm it, retrying until `timeout`.
    ///
    /// A failed publish call gets the channel discarded and the letter republished on a
    /// fresh one. A negative acknowledgement gets the letter republished on the same channel.
    ///
    /// If no positive confirmation arrives before `timeout` (waiting for a channel included),
    /// a failed receipt carrying the letter is emitted: resubmitting it is up to you.
    ///
    /// # Duplicates
    ///
    /// The timeout is local. The broker may still have received the message, and a
    /// confirmation arriving after the timeout is ignored: resubmitting a timed-out letter
    /// can deliver it twice.
    #[tracing::instrument(name = "publish_with_confirmation", skip_all, fields(letter_id = letter.letter_id))]
    pub async fn publish_with_confirmation(&self, letter: Letter, timeout: Duration) {
        let outcome = self.inner.publish_until_confirmed(&letter, timeout).await;
        self.inner.publish_receipt(letter, outcome).await;
    }

    /// Queue a letter for auto-publishing. Waits while the letter buffer is full.
    pub async fn queue_letter(&self, letter: Letter) {
        self.inner.letters.push(letter).await;
    }

    /// Queue letters for auto-publishing, in order. Waits while the letter buffer is full.
    pub async fn queue_letters<I>(&self, letters: I)
    where
        I: IntoIterator<Item = Letter>,
    {
        for letter in letters {
            self.inner.letters.push(letter).await;
        }
    }

    /// Start delivering queued letters in the background.
    ///
    /// Only one delivery task runs per publisher: calling this while it is running does
    /// nothing. Starting again right after [`Publisher::stop_auto_publish`] spawns a new task
    /// straight away, while the previous one finishes its current letter.
    /// Must be called from within a tokio runtime.
    pub async fn start_auto_publishing(&self) {
        let mut auto_publisher = self.inner.auto_publisher();
        if auto_publisher
            .as_ref()
            .is_some_and(|stop| !stop.is_closed())
        {
            return;
        }

        let (stop_sender, stop) = mpsc::channel(1);
        *auto_publisher = Some(stop_sender);
        tokio::spawn(Arc::clone(&self.inner).auto_publish(stop));
    }

    /// Ask the background delivery task to stop. It does so between two letters.
    ///
    /// Does nothing if auto-publishing is not running. Never waits for the task to exit.
    pub async fn stop_auto_publish(&self) {
        self.inner.stop_auto_publish();
    }

    pub async fn is_auto_publishing(&self) -> bool {
        self.inner
            .auto_publisher()
            .as_ref()
            .is_some_and(|stop| !stop.is_closed())
    }

    /// Wait for the next publish receipt.
    pub async fn recv_receipt(&self) -> PublishReceipt {
        self.inner.receipts.recv().await
    }

    pub fn try_recv_receipt(&self) -> Option<PublishReceipt> {
        self.inner.receipts.try_recv()
    }

    /// Throw away every pending receipt.
    pub fn flush_receipts(&self) {
        self.inner.receipts.flush();
    }

    /// Wait for the next operational error.
    pub async fn recv_error(&self) -> PublisherError {
        self.inner.errors.recv().await
    }

    pub fn try_recv_error(&self) -> Option<PublisherError> {
        self.inner.errors.try_recv()
    }

    /// Throw away every pending operational error.
    pub fn flush_errors(&self) {
        self.inner.errors.flush();
    }

    /// Stop auto-publishing and, if asked to, shut the channel pool down.
    ///
    /// Leave `also_shutdown_pool` unset if the pool is shared with other publishers.
    pub async fn shutdown(&self, also_shutdown_pool: bool) {
        self.stop_auto_publish().await;
        if also_shutdown_pool {
            self.inner.channel_pool.shutdown().await;
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // The background task holds its own reference to `inner`.
        self.inner.stop_auto_publish();
    }
}

/// The steps of [`Publisher::publish_with_confirmation`].
enum Step {
    Acquire,
    Publish(ChannelHost),
    AwaitConfirmation(ChannelHost, PendingConfirmation),
}

impl Inner {
    async fn publish(&self, letter: Letter) {
        let host = if self.configuration.auto_ack {
            self.channel_pool.get_channel().await
        } else {
            self.channel_pool.get_ackable_channel().await
        };
        let outcome = match host {
            Ok(host) => {
                let outcome = publish_once(&host, &letter).await;
                self.channel_pool.return_channel(host).await;
                outcome
            }
            Err(e) => Err(PublisherError::Pool(e)),
        };
        self.publish_receipt(letter, outcome).await;
    }

    async fn publish_until_confirmed(
        &self,
        letter: &Letter,
        timeout: Duration,
    ) -> Result<(), PublisherError> {
        let deadline = Instant::now() + timeout;
        let timed_out = || PublisherError::ConfirmationTimeout {
            letter_id: letter.letter_id,
            timeout,
        };

        let mut step = Step::Acquire;
        loop {
            step = match step {
                Step::Acquire => {
                    match time::timeout_at(deadline, self.channel_pool.get_ackable_channel()).await
                    {
                        Ok(Ok(host)) => Step::Publish(host),
                        Ok(Err(e)) => return Err(PublisherError::Pool(e)),
                        Err(_) => return Err(timed_out()),
                    }
                }
                Step::Publish(host) => match time::timeout_at(deadline, host.publish(letter)).await {
                    Ok(Ok(pending)) => Step::AwaitConfirmation(host, pending),
                    Ok(Err(e)) => {
                        debug!(channel_id = host.channel_id(), "Publish failed, switching channel: {:?}", e);
                        self.discard(host).await;
                        let pause = self.configuration.sleep_on_error_interval();
                        if time::timeout_at(deadline, time::sleep(pause)).await.is_err() {
                            return Err(timed_out());
                        }
                        Step::Acquire
                    }
                    Err(_) => {
                        self.channel_pool.return_channel(host).await;
                        return Err(timed_out());
                    }
                },
                Step::AwaitConfirmation(host, pending) => {
                    let confirmation = tokio::select! {
                        confirmation = pending => Some(confirmation),
                        _ = time::sleep_until(deadline) => None,
                    };
                    match confirmation {
                        Some(Ok(Confirmation::Nack)) => {
                            debug!(channel_id = host.channel_id(), "The broker nacked the message, republishing");
                            Step::Publish(host)
                        }
                        Some(Ok(Confirmation::Ack | Confirmation::NotRequested)) => {
                            self.channel_pool.return_channel(host).await;
                            return Ok(());
                        }
                        Some(Ok(Confirmation::Returned {
                            reply_code,
                            reply_text,
                        })) => {
                            self.channel_pool.return_channel(host).await;
                            return Err(PublisherError::Unroutable {
                                reply_code,
                                reply_text,
                            });
                        }
                        Some(Err(e)) => {
                            debug!(channel_id = host.channel_id(), "Lost the publish confirmation, switching channel: {:?}", e);
                            self.discard(host).await;
                            Step::Acquire
                        }
                        None => {
                            self.channel_pool.return_channel(host).await;
                            return Err(timed_out());
                        }
                    }
                }
            };
        }
    }

    fn auto_publisher(&self) -> MutexGuard<'_, Option<mpsc::Sender<()>>> {
        self.auto_publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_auto_publish(&self) {
        if let Some(stop) = self.auto_publisher().take() {
            // Capacity is one and the sender is gone afterwards: the loop sees either.
            let _ = stop.try_send(());
        }
    }

    /// The delivery loop behind [`Publisher::start_auto_publishing`].
    ///
    /// Runs until `stop` fires or its sender is dropped.
    async fn auto_publish(self: Arc<Self>, mut stop: mpsc::Receiver<()>) {
        info!("Auto-publishing started");
        loop {
            if stop_requested(&mut stop) {
                break;
            }

            let host = tokio::select! {
                biased;
                _ = stop.recv() => break,
                host = self.channel_pool.get_ackable_channel() => host,
            };
            let host = match host {
                Ok(host) => host,
                Err(e) => {
                    warn!("Auto-publisher could not get a channel: {:?}", e);
                    self.report(PublisherError::Pool(e));
                    self.pause(self.configuration.sleep_on_error_interval()).await;
                    continue;
                }
            };

            let stopped = self.deliver_letters(&host, &mut stop).await;

            if let Some(reason) = host.close_reason() {
                warn!(channel_id = host.channel_id(), %reason, "Auto-publisher's channel closed");
                self.channel_pool.flag_channel(host.channel_id());
                self.report(PublisherError::ChannelClosed {
                    channel_id: host.channel_id(),
                    reason,
                });
            }
            self.channel_pool.return_channel(host).await;

            if stopped {
                break;
            }
        }

        info!("Auto-publishing stopped");
    }

    /// Publish queued letters on `host` until the buffer is empty.
    ///
    /// Returns `true` if a stop was requested in the meantime.
    async fn deliver_letters(&self, host: &ChannelHost, stop: &mut mpsc::Receiver<()>) -> bool {
        let mut delivered = 0usize;
        loop {
            if stop_requested(stop) {
                return true;
            }
            let Some(letter) = self.letters.try_pop() else {
                break;
            };
            let outcome = publish_once(host, &letter).await;
            self.publish_receipt(letter, outcome).await;
            delivered += 1;
        }
        if delivered == 0 {
            self.pause(self.configuration.sleep_on_idle_interval()).await;
        }
        false
    }

    /// Flag `host` so the pool replaces it, and hand it back.
    async fn discard(&self, host: ChannelHost) {
        self.channel_pool.flag_channel(host.channel_id());
        self.channel_pool.return_channel(host).await;
    }

    async fn pause(&self, interval: Duration) {
        if interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            time::sleep(interval).await;
        }
    }

    async fn publish_receipt(&self, letter: Letter, outcome: Result<(), PublisherError>) {
        if let Err(e) = &outcome {
            debug!(letter_id = letter.letter_id, "Failed to publish letter: {}", e);
        }
        self.receipts.send(PublishReceipt::new(letter, outcome)).await;
    }

    fn report(&self, error: PublisherError) {
        if !self.errors.offer(error) {
            tracing::error!("The publisher error stream is full, dropping an error");
        }
    }
}

fn stop_requested(stop: &mut mpsc::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

async fn publish_once(host: &ChannelHost, letter: &Letter) -> Result<(), PublisherError> {
    host.publish(letter)
        .await
        .map(drop)
        .map_err(PublisherError::Publish)
}

/// Error reported by [`Publisher`], either on a receipt or on the error stream.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to acquire a healthy channel from the pool")]
    Pool(#[source] pool::Error),
    #[error("Generic error encountered when publishing to the RabbitMq broker")]
    Publish(#[source] anyhow::Error),
    #[error("The message could not be routed: {reply_code} {reply_text}")]
    Unroutable { reply_code: u16, reply_text: String },
    #[error("Publish confirmation for letter {letter_id} wasn't received within {timeout:?} - recommend manual retry")]
    ConfirmationTimeout { letter_id: u64, timeout: Duration },
    #[error("The auto-publisher's channel {channel_id} closed: {reason}")]
    ChannelClosed {
        channel_id: u64,
        reason: ChannelClosed,
    },
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    channel_pool: ChannelPool,
    configuration: PublisherConfiguration,
}

impl PublisherBuilder {
    fn new(channel_pool: ChannelPool) -> Self {
        Self {
            channel_pool,
            configuration: PublisherConfiguration::default(),
        }
    }

    /// Replace every setting at once, e.g. with values loaded from a configuration file.
    #[must_use]
    pub fn with_configuration(mut self, configuration: PublisherConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Publish without publisher confirms in [`Publisher::publish`].
    /// Defaults to `false`.
    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.configuration.auto_ack = auto_ack;
        self
    }

    /// How long the auto-publisher sleeps when there is nothing to deliver.
    #[must_use]
    pub fn sleep_on_idle_interval(mut self, interval: Duration) -> Self {
        self.configuration.sleep_on_idle_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Pause after a failed attempt, before trying again.
    #[must_use]
    pub fn sleep_on_error_interval(mut self, interval: Duration) -> Self {
        self.configuration.sleep_on_error_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Capacity of the auto-publishing letter buffer.
    #[must_use]
    pub fn letter_buffer(mut self, capacity: usize) -> Self {
        self.configuration.letter_buffer = capacity;
        self
    }

    #[must_use]
    pub fn receipt_buffer(mut self, capacity: usize) -> Self {
        self.configuration.receipt_buffer = capacity;
        self
    }

    #[must_use]
    pub fn error_buffer(mut self, capacity: usize) -> Self {
        self.configuration.error_buffer = capacity;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher {
        let configuration = self.configuration;
        Publisher {
            inner: Arc::new(Inner {
                channel_pool: self.channel_pool,
                letters: BoundedQueue::new(configuration.letter_buffer),
                receipts: Feed::new(configuration.receipt_buffer),
                errors: Feed::new(configuration.error_buffer),
                auto_publisher: Mutex::new(None),
                configuration,
            }),
        }
    }
}
