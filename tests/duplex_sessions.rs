// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end duplex session scenarios over the in-memory broker.

mod common;

use common::{context, factory, listener, session, TIMEOUT};
use rabbitmq_transport::{
    address::QueueAddress,
    errors::TransportError,
    lifecycle::{CommunicationObject, CommunicationState},
    memory::InMemoryBroker,
    message::Message,
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn ping_pong_then_graceful_close() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;

    let (client, server) = session(&factory, &listener).await;
    assert_eq!(client.state(), CommunicationState::Opened);
    assert_eq!(server.state(), CommunicationState::Opened);
    assert_eq!(client.remote_address(), Some(server.local_address()));
    assert_eq!(server.remote_address(), Some(client.local_address()));

    client.send(Message::new("ping"), TIMEOUT).await.unwrap();
    let ping = server.receive(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(ping.body_str(), Some("ping"));

    server.send(Message::new("pong"), TIMEOUT).await.unwrap();
    let pong = client.receive(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(pong.body_str(), Some("pong"));

    let (client_closed, (end_of_session, server_closed)) = tokio::join!(client.close(TIMEOUT), async {
        let end_of_session = server.receive(TIMEOUT).await;
        (end_of_session, server.close(TIMEOUT).await)
    });

    assert_eq!(end_of_session, Ok(None));
    assert_eq!(server_closed, Ok(()));
    assert_eq!(client_closed, Ok(()));
    assert_eq!(client.state(), CommunicationState::Closed);
    assert_eq!(server.state(), CommunicationState::Closed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!broker.queue_exists(client.local_address().queue_name()));
    assert!(!broker.queue_exists(server.local_address().queue_name()));
    assert_eq!(broker.message_count("echo"), 0);
}

#[tokio::test(start_paused = true)]
async fn messages_sent_before_close_are_delivered_first() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;
    let client = Arc::new(client);

    client.send(Message::new("m1"), TIMEOUT).await.unwrap();
    client.send(Message::new("m2"), TIMEOUT).await.unwrap();

    let closing = {
        let client = client.clone();
        tokio::spawn(async move { client.close(TIMEOUT).await })
    };

    // the close request now sits behind both messages
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.message_count(server.local_address().queue_name()), 3);

    let m1 = server.receive(TIMEOUT).await.unwrap().unwrap();
    let m2 = server.receive(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(m1.body_str(), Some("m1"));
    assert_eq!(m2.body_str(), Some("m2"));
    assert_eq!(server.receive(TIMEOUT).await, Ok(None));

    assert_eq!(
        server.send(Message::new("late"), TIMEOUT).await,
        Err(TransportError::Communication(
            "remote session was closed".into()
        ))
    );

    server.close(TIMEOUT).await.unwrap();
    assert_eq!(closing.await.unwrap(), Ok(()));
    assert_eq!(client.state(), CommunicationState::Closed);
}

#[tokio::test(start_paused = true)]
async fn server_closing_first_faults_the_client() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    server.send(Message::new("bye"), TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
    assert_eq!(server.state(), CommunicationState::Closed);

    let bye = client.receive(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(bye.body_str(), Some("bye"));
    assert_eq!(client.receive(TIMEOUT).await, Ok(None));
    assert_eq!(client.state(), CommunicationState::Faulted);

    assert_eq!(
        client.send(Message::new("hello?"), TIMEOUT).await,
        Err(TransportError::Communication(
            "remote session was closed".into()
        ))
    );

    client.close(TIMEOUT).await.unwrap();
    assert_eq!(client.state(), CommunicationState::Faulted);
    client.abort().await;
    assert_eq!(client.state(), CommunicationState::Closed);
}

#[tokio::test(start_paused = true)]
async fn client_close_after_the_server_closed_first_succeeds() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    server.send(Message::new("bye"), TIMEOUT).await.unwrap();
    server.close(TIMEOUT).await.unwrap();
    assert!(!broker.queue_exists(server.local_address().queue_name()));

    assert_eq!(client.close(TIMEOUT).await, Ok(()));
    assert_eq!(client.state(), CommunicationState::Closed);
    assert!(!broker.queue_exists(client.local_address().queue_name()));
}

#[tokio::test(start_paused = true)]
async fn both_ends_closing_at_once_succeed() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    client.send(Message::new("ping"), TIMEOUT).await.unwrap();
    server.send(Message::new("pong"), TIMEOUT).await.unwrap();

    let started = Instant::now();
    let (client_closed, server_closed) =
        tokio::join!(client.close(TIMEOUT), server.close(TIMEOUT));

    assert_eq!(client_closed, Ok(()));
    assert_eq!(server_closed, Ok(()));
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(client.state(), CommunicationState::Closed);
    assert_eq!(server.state(), CommunicationState::Closed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!broker.queue_exists(client.local_address().queue_name()));
    assert!(!broker.queue_exists(server.local_address().queue_name()));
}

#[tokio::test(start_paused = true)]
async fn sends_fail_once_the_server_aborted() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    client.send(Message::new("hello"), TIMEOUT).await.unwrap();

    let started = Instant::now();
    server.abort().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.state(), CommunicationState::Closed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let res = client.send(Message::new("again"), TIMEOUT).await;
    assert_eq!(
        res,
        Err(TransportError::RemoteQueueDoesNotExist(
            server.local_address().queue_name().to_owned()
        ))
    );
    assert_eq!(client.state(), CommunicationState::Faulted);

    client.abort().await;
    assert!(!broker.queue_exists(client.local_address().queue_name()));
}

#[tokio::test(start_paused = true)]
async fn client_abort_reaches_the_server_through_its_abort_topic() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    client.abort().await;
    assert_eq!(client.state(), CommunicationState::Closed);

    let res = server.receive(TIMEOUT).await;
    assert_eq!(
        res,
        Err(TransportError::Communication(
            "remote session was aborted".into()
        ))
    );
    assert_eq!(server.state(), CommunicationState::Faulted);

    server.abort().await;
    assert_eq!(server.state(), CommunicationState::Closed);
}

#[tokio::test(start_paused = true)]
async fn open_times_out_when_nobody_accepts() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;

    let client = factory
        .create_duplex_channel(listener.listen_address())
        .unwrap();
    let started = Instant::now();

    let res = client.open(Duration::from_secs(2)).await;

    assert_eq!(res, Err(TransportError::TimedOut(Duration::from_secs(2))));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(client.state(), CommunicationState::Faulted);
    assert!(!broker.queue_exists(client.local_address().queue_name()));
}

#[tokio::test(start_paused = true)]
async fn open_fails_fast_without_a_listener_queue() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let factory = factory(&context).await;

    let client = factory
        .create_duplex_channel(&QueueAddress::new("nobody"))
        .unwrap();

    assert_eq!(
        client.open(TIMEOUT).await,
        Err(TransportError::RemoteQueueDoesNotExist("nobody".into()))
    );
    assert_eq!(client.state(), CommunicationState::Faulted);
}

#[tokio::test(start_paused = true)]
async fn sessions_survive_a_dropped_connection() {
    let broker = InMemoryBroker::new();
    let context = context(&broker);
    let listener = listener(&context, "echo").await;
    let factory = factory(&context).await;
    let (client, server) = session(&factory, &listener).await;

    broker.sever_connections();

    client.send(Message::new("still there?"), TIMEOUT).await.unwrap();
    let message = server.receive(TIMEOUT).await.unwrap().unwrap();
    assert_eq!(message.body_str(), Some("still there?"));
}
