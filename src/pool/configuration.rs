//! Sizing and behaviour knobs for [`ChannelPool`](super::ChannelPool) and
//! [`AmqpConnectionPool`](super::AmqpConnectionPool).
use serde::Deserialize;
use serde_aux::field_attributes::{deserialize_bool_from_anything, deserialize_number_from_string};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Configuration of a [`ChannelPool`](super::ChannelPool).
pub struct ChannelPoolConfiguration {
    /// How many plain channels the pool keeps open.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_channel_count: usize,
    /// How many channels with publisher confirms enabled the pool keeps open.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_ack_channel_count: usize,
    /// Prefetch count applied (globally) to every channel the pool creates.
    /// `0` leaves the broker default in place.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub global_qos_count: u16,
    /// Enable publisher confirms without waiting for the broker to acknowledge the request.
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub ack_no_wait: bool,
    /// Pause between two attempts at replacing a broken channel, in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub sleep_on_error_interval_ms: u64,
    /// How many operational errors can pile up, unread, on the pool's error stream.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub error_buffer: usize,
}

impl Default for ChannelPoolConfiguration {
    fn default() -> Self {
        Self {
            max_channel_count: 10,
            max_ack_channel_count: 10,
            global_qos_count: 0,
            ack_no_wait: false,
            sleep_on_error_interval_ms: 50,
            error_buffer: 10,
        }
    }
}

impl ChannelPoolConfiguration {
    pub fn sleep_on_error_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Configuration of an [`AmqpConnectionPool`](super::AmqpConnectionPool).
pub struct ConnectionPoolConfiguration {
    /// How many connections to RabbitMq are kept open.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_connection_count: usize,
    /// How many plain channels can be multiplexed over a single connection.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_channels_per_connection: usize,
    /// How many channels with publisher confirms can be multiplexed over a single connection.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_ack_channels_per_connection: usize,
}

impl Default for ConnectionPoolConfiguration {
    fn default() -> Self {
        Self {
            max_connection_count: 10,
            max_channels_per_connection: 50,
            max_ack_channels_per_connection: 50,
        }
    }
}
