//! Connecting to a RabbitMq broker.

pub mod configuration;
mod factory;
pub use configuration::{PublishingSettings, RabbitMqSettings, RabbitMqTlsSettings};
pub use factory::ConnectionFactory;

pub use lapin::{types, BasicProperties};
