use serde::Deserialize;
use serde_aux::field_attributes::{deserialize_bool_from_anything, deserialize_number_from_string};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
/// Configuration of a [`Publisher`](super::Publisher).
pub struct PublisherConfiguration {
    /// If `false`, [`Publisher::publish`](super::Publisher::publish) goes through channels
    /// with publisher confirms enabled.
    #[serde(deserialize_with = "deserialize_bool_from_anything")]
    pub auto_ack: bool,
    /// How long the auto-publisher sleeps when it finds no letter to deliver, in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub sleep_on_idle_interval_ms: u64,
    /// Pause after a failed attempt (no channel available, publish error), in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub sleep_on_error_interval_ms: u64,
    /// How many letters can be queued for auto-publishing before `queue_letter` waits.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub letter_buffer: usize,
    /// How many receipts can pile up, unread, before publishing waits.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub receipt_buffer: usize,
    /// How many operational errors can pile up, unread, before new ones are dropped.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub error_buffer: usize,
}

impl Default for PublisherConfiguration {
    fn default() -> Self {
        Self {
            auto_ack: false,
            sleep_on_idle_interval_ms: 50,
            sleep_on_error_interval_ms: 50,
            letter_buffer: 1000,
            receipt_buffer: 1000,
            error_buffer: 10,
        }
    }
}

impl PublisherConfiguration {
    pub fn sleep_on_idle_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_idle_interval_ms)
    }

    pub fn sleep_on_error_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_interval_ms)
    }
}
