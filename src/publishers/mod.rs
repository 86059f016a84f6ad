//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod configuration;
mod letter;
mod publisher;
mod receipt;

pub use configuration::PublisherConfiguration;
pub(crate) use letter::inject_amqp_properties;
pub use letter::{DeliveryMode, Envelope, Letter};
pub use publisher::{Publisher, PublisherBuilder, PublisherError};
pub use receipt::PublishReceipt;
