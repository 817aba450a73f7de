// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Shared fixtures of the end-to-end scenarios.

#![allow(dead_code)]

use rabbitmq_transport::{
    configs::BindingConfigs,
    duplex::DuplexChannel,
    factory::{ChannelFactory, ChannelListener, TransportContext},
    lifecycle::CommunicationObject,
    memory::InMemoryBroker,
};
use std::{sync::Arc, time::Duration};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn context(broker: &InMemoryBroker) -> Arc<TransportContext> {
    context_with(broker, BindingConfigs::default())
}

pub fn context_with(broker: &InMemoryBroker, configs: BindingConfigs) -> Arc<TransportContext> {
    Arc::new(TransportContext::new(Arc::new(broker.clone()), configs))
}

/// An open listener on the well-known queue `queue`.
pub async fn listener(context: &Arc<TransportContext>, queue: &str) -> ChannelListener {
    let listener = ChannelListener::new(context.clone(), context.queue_address(queue));
    listener
        .open(TIMEOUT)
        .await
        .expect("listener should open");
    listener
}

pub async fn factory(context: &Arc<TransportContext>) -> ChannelFactory {
    let factory = ChannelFactory::new(context.clone());
    factory.open(TIMEOUT).await.expect("factory should open");
    factory
}

/// A client channel and the server channel accepted for it.
pub async fn session(
    factory: &ChannelFactory,
    listener: &ChannelListener,
) -> (DuplexChannel, DuplexChannel) {
    let client = factory
        .create_duplex_channel(listener.listen_address())
        .expect("factory is open");

    let (opened, accepted) = tokio::join!(
        client.open(TIMEOUT),
        listener.accept_duplex_channel(TIMEOUT)
    );
    opened.expect("client should open");
    let server = accepted
        .expect("accept should succeed")
        .expect("listener is open");

    (client, server)
}
