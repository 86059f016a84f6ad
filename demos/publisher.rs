use std::sync::Arc;
use std::time::Duration;

use carrot_post::amqp::{ConnectionFactory, PublishingSettings};
use carrot_post::pool::{AmqpConnectionPool, ChannelPool};
use carrot_post::publishers::{Envelope, Letter, Publisher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The default settings match the out-of-the-box RabbitMq Docker image.
    let settings = PublishingSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings.rabbitmq)?;

    // A connection maps to an open TCP socket, a channel is a "logical" connection
    // multiplexed on top of it. Channels are cheap, so we keep a handful of connections
    // and many more channels.
    //
    // The channel pool keeps two kinds of channels: plain ones, and "ackable" ones with
    // publisher confirms enabled. Their number is an upper bound on how many messages can
    // be in flight at the same time.
    let connections = AmqpConnectionPool::new(connection_factory, settings.connection_pool);
    let channel_pool = ChannelPool::builder(Arc::new(connections))
        .with_configuration(settings.channel_pool)
        .build();
    channel_pool.initialize().await?;

    let publisher = Publisher::builder(channel_pool)
        .with_configuration(settings.publisher)
        .build();

    // The default exchange routes on queue names. Nobody declared `hello`, and the letter is
    // `mandatory`: the broker hands it back as unroutable.
    let envelope = Envelope::new("", "hello")
        .with_content_type("text/plain")
        .with_mandatory(true);
    publisher
        .publish_with_confirmation(
            Letter::new(1, "Hello world!", envelope.clone()),
            Duration::from_secs(3),
        )
        .await;
    let receipt = publisher.recv_receipt().await;
    println!(
        "Letter {} delivered: {} ({:?})",
        receipt.letter_id, receipt.success, receipt.error
    );

    // Letters can also be queued and delivered in the background.
    publisher.start_auto_publishing().await;
    publisher
        .queue_letters((2..=5).map(|letter_id| {
            Letter::new(letter_id, format!("Letter #{letter_id}"), envelope.clone())
        }))
        .await;
    for _ in 2..=5 {
        let receipt = publisher.recv_receipt().await;
        println!("Letter {} delivered: {}", receipt.letter_id, receipt.success);
    }

    publisher.shutdown(true).await;
    Ok(())
}
