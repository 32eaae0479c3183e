// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use iris_client_rs::{error::Error, wire::Opcode};

use crate::support::mock_relay::MockRelay;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_reply_returns_the_body() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;
        assert_eq!(relay.read_opcode().await, Opcode::Request);
        let id = relay.read_varint().await;
        let cluster = relay.read_string().await;
        let _payload = relay.read_binary().await;
        let _timeout_ms = relay.read_varint().await;
        relay
            .send(
                iris_client_rs::wire::FrameBuilder::new(Opcode::Reply)
                    .varint(id)
                    .bool(false)
                    .bool(true)
                    .binary(b"42"),
            )
            .await;
        cluster
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let reply = connection
        .request("pricing-service", Bytes::from_static(b"quote?"), 1_000)
        .await
        .expect("request succeeds");
    assert_eq!(reply, Bytes::from_static(b"42"));

    let cluster = relay_task.await.expect("relay task");
    assert_eq!(cluster, "pricing-service");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_signalled_timeout_surfaces_as_a_timeout_error() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;
        assert_eq!(relay.read_opcode().await, Opcode::Request);
        let id = relay.read_varint().await;
        let _cluster = relay.read_string().await;
        let _payload = relay.read_binary().await;
        let _timeout_ms = relay.read_varint().await;
        relay
            .send(iris_client_rs::wire::FrameBuilder::new(Opcode::Reply).varint(id).bool(true))
            .await;
        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let err = connection
        .request("pricing-service", Bytes::from_static(b"quote?"), 50)
        .await
        .expect_err("relay signalled timeout");
    assert!(matches!(err, Error::Timeout));

    relay_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_error_string_is_surfaced_verbatim() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;
        assert_eq!(relay.read_opcode().await, Opcode::Request);
        let id = relay.read_varint().await;
        let _cluster = relay.read_string().await;
        let _payload = relay.read_binary().await;
        let _timeout_ms = relay.read_varint().await;
        relay
            .send(
                iris_client_rs::wire::FrameBuilder::new(Opcode::Reply)
                    .varint(id)
                    .bool(false)
                    .bool(false)
                    .string("pricing service unavailable"),
            )
            .await;
        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let err = connection
        .request("pricing-service", Bytes::from_static(b"quote?"), 1_000)
        .await
        .expect_err("remote returned an error");
    match err {
        Error::Remote(msg) => assert_eq!(msg, "pricing service unavailable"),
        other => panic!("expected Error::Remote, got {other:?}"),
    }

    relay_task.abort();
}
