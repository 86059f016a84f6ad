/// Errors returned by [`ChannelPool`](super::ChannelPool).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Can't get a channel - the channel pool has been shut down")]
    ShutDown,
    #[error("Can't get a channel - the channel pool has not been initialized")]
    NotInitialized,
    #[error("The channel pool is not configured to hold channels of this kind (ackable: {ackable})")]
    NoChannels { ackable: bool },
    #[error("The connection can't host more channels (ackable: {ackable})")]
    CapacityExceeded { ackable: bool },
    #[error("Failed to create a channel")]
    ChannelCreation(#[source] anyhow::Error),
    #[error("The connection provider failed")]
    ConnectionProvider(#[source] anyhow::Error),
    #[error("Errors occurred while creating the channels of the pool")]
    Initialization(#[source] Box<Error>),
}

/// Connection pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct ConnectionError(#[from] anyhow::Error);

impl From<lapin::Error> for ConnectionError {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}
impl From<deadpool::managed::PoolError<ConnectionError>> for ConnectionError {
    fn from(err: deadpool::managed::PoolError<ConnectionError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(err.into()),
        }
    }
}
