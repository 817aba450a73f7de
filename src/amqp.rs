// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel over lapin
//!
//! This module implements the broker abstraction against a real RabbitMQ server
//! using lapin. `AmqpConnector` opens a connection and one channel on it;
//! `AmqpChannel` owns both and closes them together.

use crate::{
    broker::{
        BrokerChannel, BrokerConnector, BrokerDelivery, ConfirmSlot, PublishOutcome, QueueInfo,
        QueueOptions,
    },
    configs::BindingConfigs,
    errors::TransportError,
    exchange::ExchangeDefinition,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::AMQPErrorKind,
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error};

/// Reply code used when closing channels and connections normally.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connection/channel pairs to the configured broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(uri: &str, connection_name: &str) -> AmqpConnector {
        AmqpConnector {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }

    pub fn from_configs(cfg: &BindingConfigs) -> AmqpConnector {
        AmqpConnector::new(&cfg.amqp_uri(), &cfg.connection_name)
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, TransportError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(TransportError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Box::new(AmqpChannel {
                    connection,
                    channel,
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                // the connection would otherwise outlive its only channel
                let _ = connection.close(REPLY_SUCCESS, "OK").await;
                Err(TransportError::ChannelError(err.to_string()))
            }
        }
    }
}

/// A lapin connection and the single channel opened on it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

/// Maps lapin failures onto the transport taxonomy.
///
/// I/O failures, closed channels or connections and connection level protocol
/// errors are transient: a new connection fixes them.
fn map_err(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => TransportError::TransientBroker(err.to_string()),
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Hard(_) => TransportError::TransientBroker(err.to_string()),
            AMQPErrorKind::Soft(_) => TransportError::Broker(err.to_string()),
        },
        _ => TransportError::Broker(err.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        debug!("creating exchange: {}", def.name());

        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                match map_err(err) {
                    TransportError::Broker(_) => {
                        TransportError::DeclareExchangeError(def.name().to_owned())
                    }
                    other => other,
                }
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                arguments,
            )
            .await
            .map_err(|err| {
                if !options.passive {
                    error!(error = err.to_string(), name, "error to declare the queue");
                }
                match map_err(err) {
                    TransportError::Broker(_) if options.passive => {
                        TransportError::QueueNotFound(name.to_owned())
                    }
                    TransportError::Broker(_) => TransportError::DeclareQueueError(name.to_owned()),
                    other => other,
                }
            })?;

        Ok(QueueInfo {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                match map_err(err) {
                    TransportError::Broker(_) => TransportError::BindingExchangeToQueueError(
                        exchange.to_owned(),
                        queue.to_owned(),
                    ),
                    other => other,
                }
            })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|err| match map_err(err) {
                TransportError::Broker(msg) => TransportError::QoSDeclarationError(msg),
                other => other,
            })
    }

    async fn enable_confirms(&self) -> Result<(), TransportError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_err)
    }

    async fn get(&self, queue: &str) -> Result<Option<BrokerDelivery>, TransportError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(map_err)?;

        Ok(message.map(|message| {
            let delivery = &message.delivery;

            BrokerDelivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                message_count: message.message_count,
                properties: delivery.properties.clone(),
                body: delivery.data.clone(),
            }
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| match map_err(err) {
                TransportError::Broker(_) => TransportError::AckMessageError(delivery_tag),
                other => other,
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| match map_err(err) {
                TransportError::Broker(_) => TransportError::RejectMessageError(delivery_tag),
                other => other,
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<ConfirmSlot, TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                match map_err(err) {
                    TransportError::Broker(msg) => TransportError::PublishingError(msg),
                    other => other,
                }
            })?;

        let (resolver, slot) = ConfirmSlot::pending();
        tokio::spawn(async move {
            let outcome = match confirm.await {
                Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                    Ok(PublishOutcome::Acked)
                }
                Ok(Confirmation::Ack(Some(_))) => Ok(PublishOutcome::Returned),
                Ok(Confirmation::Nack(_)) => Ok(PublishOutcome::Nacked),
                Err(err) => Err(map_err(err)),
            };
            resolver.resolve(outcome);
        });

        Ok(slot)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "error closing channel");
            }
        }

        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(map_err)?;
        }

        Ok(())
    }
}
