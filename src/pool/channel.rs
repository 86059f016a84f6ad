//! [`ChannelPool`]: a bounded pool of plain and ackable [`ChannelHost`]s.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

use super::configuration::ChannelPoolConfiguration;
use super::connection::{ConnectionHandle, ConnectionProvider};
use super::host::ChannelHost;
use super::Error;
use crate::feed::Feed;
use crate::queue::BoundedQueue;

/// `ChannelPool` pools [`ChannelHost`]s.
///
/// It keeps two fixed-size queues of open channels, one with publisher confirms enabled
/// ("ackable") and one without. Checking a channel out waits while its queue is empty:
/// the pool size is an upper bound on concurrent publishing.
///
/// Channels are health-checked lazily: a channel that reported a failure, or that was
/// flagged with [`ChannelPool::flag_channel`], is closed and replaced under the same
/// identity the next time somebody checks it out.
///
/// `ChannelPool` is cheap to clone and all clones share the same channels.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<Inner>,
}

struct Inner {
    configuration: ChannelPoolConfiguration,
    connection_provider: Arc<dyn ConnectionProvider>,
    /// Held while (re)initializing or shutting down.
    state: AsyncMutex<PoolState>,
    initialized: AtomicBool,
    /// Checked before anything else, without going through `state`.
    shutting_down: AtomicBool,
    /// Bumped on every shutdown, so hosts from a previous life are not taken back.
    generation: AtomicU64,
    channels: BoundedQueue<ChannelHost>,
    ack_channels: BoundedQueue<ChannelHost>,
    flagged_channels: Mutex<HashMap<u64, bool>>,
    errors: Feed<Error>,
}

#[derive(Default)]
struct PoolState {
    next_channel_id: u64,
}

impl ChannelPool {
    pub fn new(
        configuration: ChannelPoolConfiguration,
        connection_provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: BoundedQueue::new(configuration.max_channel_count),
                ack_channels: BoundedQueue::new(configuration.max_ack_channel_count),
                errors: Feed::new(configuration.error_buffer),
                configuration,
                connection_provider,
                state: AsyncMutex::new(PoolState::default()),
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                flagged_channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start building a [`ChannelPool`] on top of a [`ConnectionProvider`].
    pub fn builder(connection_provider: Arc<dyn ConnectionProvider>) -> ChannelPoolBuilder {
        ChannelPoolBuilder {
            configuration: ChannelPoolConfiguration::default(),
            connection_provider,
        }
    }

    pub fn configuration(&self) -> &ChannelPoolConfiguration {
        &self.inner.configuration
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Open every channel of the pool, initializing the connection provider first if needed.
    ///
    /// Calling it on an initialized pool is a no-op. If any channel fails to open, the ones
    /// opened so far are closed again and the pool stays uninitialized.
    #[tracing::instrument(name = "channel_pool_init", skip(self))]
    pub async fn initialize(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;

        let provider = &self.inner.connection_provider;
        if !provider.is_initialized() {
            provider
                .initialize()
                .await
                .map_err(Error::ConnectionProvider)?;
        }
        if self.is_initialized() {
            return Ok(());
        }

        let configuration = &self.inner.configuration;
        let kinds = std::iter::repeat(false)
            .take(configuration.max_channel_count)
            .chain(std::iter::repeat(true).take(configuration.max_ack_channel_count));

        let mut hosts = Vec::new();
        for ackable in kinds {
            match self.create_channel_host(state.next_channel_id, ackable).await {
                Ok(host) => {
                    state.next_channel_id += 1;
                    hosts.push(host);
                }
                Err(e) => {
                    for host in hosts {
                        host.close().await;
                    }
                    state.next_channel_id = 0;
                    return Err(Error::Initialization(Box::new(e)));
                }
            }
        }

        for host in hosts {
            let queue = self.queue_for(host.is_ackable());
            if let Err(host) = queue.try_push(host) {
                // Only possible if stale hosts were pushed concurrently.
                host.close().await;
            }
        }
        self.inner.initialized.store(true, Ordering::SeqCst);
        info!(
            channels = configuration.max_channel_count,
            ack_channels = configuration.max_ack_channel_count,
            "Channel pool initialized"
        );
        Ok(())
    }

    /// Check out a channel without publisher confirms, waiting for one to be available.
    pub async fn get_channel(&self) -> Result<ChannelHost, Error> {
        self.ensure_available()?;
        self.ensure_kind(false)?;
        let host = self.inner.channels.pop().await;
        if !self.needs_replacement(&host) {
            return Ok(host);
        }

        // The replacement runs in a task of its own: if this checkout is cancelled, the
        // channel still makes it back into the pool.
        let (sender, receiver) = oneshot::channel();
        let pool = self.clone();
        tokio::spawn(async move {
            let replaced = pool.replace(host).await;
            if let Err(Ok(replacement)) = sender.send(replaced) {
                pool.return_channel(replacement).await;
            }
        });
        match receiver.await {
            Ok(replaced) => replaced,
            Err(e) => Err(Error::ChannelCreation(e.into())),
        }
    }

    /// Check out a channel with publisher confirms enabled, waiting for one to be available.
    ///
    /// A broken ackable channel gets its connection flagged with the provider. Its
    /// replacement is put back at the end of the queue and the checkout starts over, so
    /// a fresh ackable channel stays available to everybody waiting.
    pub async fn get_ackable_channel(&self) -> Result<ChannelHost, Error> {
        loop {
            self.ensure_available()?;
            self.ensure_kind(true)?;
            let host = self.inner.ack_channels.pop().await;
            if !self.needs_replacement(&host) {
                return Ok(host);
            }
            self.inner
                .connection_provider
                .flag_connection(host.connection_id());
            let pool = self.clone();
            let replacement = tokio::spawn(async move {
                let replacement = pool.replace(host).await?;
                pool.return_channel(replacement).await;
                Ok::<_, Error>(())
            });
            replacement
                .await
                .map_err(|e| Error::ChannelCreation(e.into()))??;
        }
    }

    /// Give a checked out channel back to the pool.
    ///
    /// No health check happens here: a broken channel is dealt with at its next checkout.
    pub async fn return_channel(&self, host: ChannelHost) {
        if host.generation() != self.inner.generation.load(Ordering::SeqCst) {
            // The pool was shut down while this channel was checked out.
            host.close().await;
            return;
        }
        self.queue_for(host.is_ackable()).push(host).await;
    }

    /// Mark a channel as unusable: it will be replaced the next time it is checked out.
    pub fn flag_channel(&self, channel_id: u64) {
        self.flagged_channels().insert(channel_id, true);
    }

    pub fn unflag_channel(&self, channel_id: u64) {
        self.flagged_channels().insert(channel_id, false);
    }

    pub fn is_channel_flagged(&self, channel_id: u64) -> bool {
        self.flagged_channels()
            .get(&channel_id)
            .copied()
            .unwrap_or(false)
    }

    /// How many plain channels are waiting in the pool.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// How many ackable channels are waiting in the pool.
    pub fn ack_channel_count(&self) -> usize {
        self.inner.ack_channels.len()
    }

    /// Wait for the next operational error (e.g. a failure to replace a broken channel).
    pub async fn recv_error(&self) -> Error {
        self.inner.errors.recv().await
    }

    pub fn try_recv_error(&self) -> Option<Error> {
        self.inner.errors.try_recv()
    }

    /// Throw away every pending operational error.
    pub fn flush_errors(&self) {
        self.inner.errors.flush();
    }

    /// Close every queued channel and shut the connection provider down.
    ///
    /// Checkouts fail with [`Error::ShutDown`] while this runs. Afterwards the pool is
    /// uninitialized and can be [initialized](ChannelPool::initialize) again. Channels
    /// still checked out are closed when they are returned.
    #[tracing::instrument(name = "channel_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;

        if self.is_initialized() {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            tokio::join!(
                close_all(&self.inner.channels),
                close_all(&self.inner.ack_channels)
            );
            self.flagged_channels().clear();
            state.next_channel_id = 0;
            self.inner.initialized.store(false, Ordering::SeqCst);
            self.inner.connection_provider.shutdown().await;
            info!("Channel pool shut down");
        }

        self.inner.shutting_down.store(false, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Checkouts of a kind the pool holds none of fail instead of waiting.
    fn ensure_kind(&self, ackable: bool) -> Result<(), Error> {
        let configuration = &self.inner.configuration;
        let count = if ackable {
            configuration.max_ack_channel_count
        } else {
            configuration.max_channel_count
        };
        if count == 0 {
            return Err(Error::NoChannels { ackable });
        }
        Ok(())
    }

    fn needs_replacement(&self, host: &ChannelHost) -> bool {
        host.close_reason().is_some() || self.is_channel_flagged(host.channel_id())
    }

    /// Close `host` and open a new channel with the same identity, trying until it works.
    ///
    /// Gives up only if the pool is shut down in the meantime.
    #[tracing::instrument(skip_all, fields(channel_id = host.channel_id(), ackable = host.is_ackable()))]
    async fn replace(&self, host: ChannelHost) -> Result<ChannelHost, Error> {
        warn!(reason = ?host.close_reason(), "Replacing broken channel");
        let channel_id = host.channel_id();
        let ackable = host.is_ackable();
        host.close().await;

        loop {
            match self.create_channel_host(channel_id, ackable).await {
                Ok(replacement) => {
                    self.unflag_channel(channel_id);
                    return Ok(replacement);
                }
                Err(e) => {
                    warn!("Failed to replace channel: {:?}", e);
                    self.report(e);
                }
            }
            let interval = self.inner.configuration.sleep_on_error_interval();
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            self.ensure_available()?;
        }
    }

    /// Open a new channel on a leased connection.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_channel_host(&self, channel_id: u64, ackable: bool) -> Result<ChannelHost, Error> {
        let provider = &self.inner.connection_provider;
        let connection = provider
            .acquire(ackable)
            .await
            .map_err(Error::ChannelCreation)?;
        let host = self
            .open_channel_host(connection.as_ref(), channel_id, ackable)
            .await;
        provider.release(connection);
        host
    }

    async fn open_channel_host(
        &self,
        connection: &dyn ConnectionHandle,
        channel_id: u64,
        ackable: bool,
    ) -> Result<ChannelHost, Error> {
        let has_capacity = if ackable {
            connection.can_add_ack_channel()
        } else {
            connection.can_add_channel()
        };
        if !has_capacity {
            return Err(Error::CapacityExceeded { ackable });
        }

        let channel = connection
            .open_channel(ackable)
            .await
            .map_err(Error::ChannelCreation)?;
        let host = ChannelHost::new(
            channel_id,
            connection.connection_id(),
            ackable,
            self.inner.generation.load(Ordering::SeqCst),
            channel,
        );

        let configuration = &self.inner.configuration;
        let setup = async {
            if configuration.global_qos_count > 0 {
                host.channel()
                    .set_qos(configuration.global_qos_count, true)
                    .await?;
            }
            if ackable {
                host.channel()
                    .enable_publisher_confirms(configuration.ack_no_wait)
                    .await?;
            }
            Ok::<_, anyhow::Error>(())
        };
        match setup.await {
            Ok(()) => Ok(host),
            Err(e) => {
                host.close().await;
                Err(Error::ChannelCreation(e))
            }
        }
    }

    fn report(&self, error: Error) {
        if !self.inner.errors.offer(error) {
            tracing::error!("The channel pool error stream is full, dropping an error");
        }
    }

    fn queue_for(&self, ackable: bool) -> &BoundedQueue<ChannelHost> {
        if ackable {
            &self.inner.ack_channels
        } else {
            &self.inner.channels
        }
    }

    fn flagged_channels(&self) -> MutexGuard<'_, HashMap<u64, bool>> {
        self.inner
            .flagged_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn close_all(queue: &BoundedQueue<ChannelHost>) {
    for host in queue.drain() {
        host.close().await;
    }
}

/// A builder for [`ChannelPool`].
///
/// Use [`ChannelPool::builder`] as entrypoint.
pub struct ChannelPoolBuilder {
    configuration: ChannelPoolConfiguration,
    connection_provider: Arc<dyn ConnectionProvider>,
}

impl ChannelPoolBuilder {
    /// Replace every setting at once, e.g. with values loaded from a configuration file.
    #[must_use]
    pub fn with_configuration(mut self, configuration: ChannelPoolConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// How many channels without publisher confirms the pool keeps open.
    #[must_use]
    pub fn max_channels(mut self, count: usize) -> Self {
        self.configuration.max_channel_count = count;
        self
    }

    /// How many channels with publisher confirms the pool keeps open.
    #[must_use]
    pub fn max_ack_channels(mut self, count: usize) -> Self {
        self.configuration.max_ack_channel_count = count;
        self
    }

    /// Prefetch count applied to every channel. `0` (the default) leaves it unset.
    #[must_use]
    pub fn global_qos_count(mut self, count: u16) -> Self {
        self.configuration.global_qos_count = count;
        self
    }

    #[must_use]
    pub fn ack_no_wait(mut self, no_wait: bool) -> Self {
        self.configuration.ack_no_wait = no_wait;
        self
    }

    /// Pause between attempts at replacing a broken channel.
    #[must_use]
    pub fn sleep_on_error_interval(mut self, interval: std::time::Duration) -> Self {
        self.configuration.sleep_on_error_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn error_buffer(mut self, capacity: usize) -> Self {
        self.configuration.error_buffer = capacity;
        self
    }

    /// Finalise the builder. The pool still has to be [initialized](ChannelPool::initialize).
    pub fn build(self) -> ChannelPool {
        ChannelPool::new(self.configuration, self.connection_provider)
    }
}
