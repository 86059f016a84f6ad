use std::time::{SystemTime, UNIX_EPOCH};

use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use tracing::warn;
use uuid::Uuid;

/// A message to be published via [`Publisher`](super::Publisher).
///
/// `letter_id` is assigned by the caller and echoed back on the matching
/// [`PublishReceipt`](super::PublishReceipt): keep it unique among in-flight letters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Letter {
    pub letter_id: u64,
    // The body of the message - as a sequence of bytes.
    pub body: Vec<u8>,
    pub envelope: Envelope,
}

impl Letter {
    pub fn new(letter_id: u64, body: impl Into<Vec<u8>>, envelope: Envelope) -> Self {
        Self {
            letter_id,
            body: body.into(),
            envelope,
        }
    }
}

/// Persistence of a message once it reaches a durable queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    #[default]
    Persistent = 2,
}

/// Where and how a [`Letter`] should be routed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    // The name of the exchange we are publishing the message to.
    pub exchange: String,
    // The routing key used by exchange listeners to determine if they are interested or not
    // to the message.
    pub routing_key: String,
    // Left out of the AMQP properties when empty.
    pub content_type: String,
    pub headers: FieldTable,
    pub delivery_mode: DeliveryMode,
    /// Ask the broker to return the message if it cannot be routed to any queue.
    pub mandatory: bool,
    /// The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
    /// Setting `true` against a modern broker closes the channel with a not-supported error.
    pub immediate: bool,
}

impl Envelope {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, value: impl Into<String>) -> Self {
        self.exchange = value.into();
        self
    }

    pub fn with_routing_key(mut self, value: impl Into<String>) -> Self {
        self.routing_key = value.into();
        self
    }

    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = value.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: AMQPValue) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    pub fn with_headers(mut self, value: FieldTable) -> Self {
        self.headers = value;
        self
    }

    pub fn with_delivery_mode(mut self, value: DeliveryMode) -> Self {
        self.delivery_mode = value;
        self
    }

    pub fn with_mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }

    pub fn with_immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }

    /// The AMQP properties carried by every message published with this envelope.
    pub fn properties(&self) -> BasicProperties {
        let properties = BasicProperties::default()
            .with_headers(self.headers.clone())
            .with_delivery_mode(self.delivery_mode as u8);
        if self.content_type.is_empty() {
            properties
        } else {
            properties.with_content_type(ShortString::from(self.content_type.clone()))
        }
    }
}

/// Stamp the current time and a fresh message id on `properties`, unless the caller
/// already set them.
pub(crate) fn inject_amqp_properties(props: BasicProperties) -> BasicProperties {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()))
}
