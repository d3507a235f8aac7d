//! AMQP (RabbitMQ) broker implementation.
//!
//! Every operation borrows the shared channel from `BrokerConnection`, so
//! a dropped connection is redialed transparently on the next call.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    Acknowledger, Broker, BrokerConnection, BrokerError, Delivery, DeliveryStream, PublishTarget,
    QueueSpec, Result,
};

/// Content type stamped on every published message.
const CONTENT_TYPE: &str = "application/json";

/// Broker backed by RabbitMQ.
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<BrokerConnection>,
}

impl AmqpBroker {
    pub fn new(connection: Arc<BrokerConnection>) -> Self {
        Self { connection }
    }

    /// Build the declare arguments for a queue.
    fn queue_arguments(spec: &QueueSpec) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(exchange) = &spec.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }
        args
    }

    /// Split a publish target into (exchange, routing key).
    fn address(target: &PublishTarget) -> (&str, &str) {
        match target {
            PublishTarget::Queue(queue) => ("", queue.as_str()),
            PublishTarget::Exchange(exchange) => (exchange.as_str(), ""),
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Settle(format!("Failed to reject: {}", e)))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let channel = self.connection.get().await?;

        let queue = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                Self::queue_arguments(spec),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue: {}", e)))?;

        debug!(queue = %queue.name(), durable = spec.durable, "Declared queue");
        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.connection.get().await?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<()> {
        let channel = self.connection.get().await?;

        channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, exchange = %exchange, "Bound queue to exchange");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let channel = self.connection.get().await?;

        channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to set prefetch: {}", e)))
    }

    #[tracing::instrument(name = "broker.publish", skip_all, fields(target = %target))]
    async fn publish(&self, target: &PublishTarget, body: &[u8]) -> Result<()> {
        let channel = self.connection.get().await?;
        let (exchange, routing_key) = Self::address(target);

        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(
                "Broker refused the message".to_string(),
            ));
        }

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let channel = self.connection.get().await?;
        let tag = format!("courier-{}", uuid::Uuid::new_v4());

        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %queue, consumer_tag = %tag, "Consumer started");

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                let lapin::message::Delivery {
                    data,
                    redelivered,
                    acker,
                    ..
                } = delivery;
                Delivery::new(data, redelivered, Box::new(AmqpAcker(acker)))
            })
            .map_err(|e| BrokerError::Consume(format!("Delivery error: {}", e)))
        });

        Ok(stream.boxed())
    }
}
