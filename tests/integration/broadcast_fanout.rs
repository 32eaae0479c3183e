// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use iris_client_rs::{handler::BroadcastHandler, service::ServiceHandlers, wire::{FrameBuilder, Opcode}};
use tokio::sync::Notify;

use crate::support::mock_relay::MockRelay;

struct SignalingBroadcastHandler {
    seen: std::sync::Mutex<Option<Bytes>>,
    notify: Notify,
}

#[async_trait]
impl BroadcastHandler for SignalingBroadcastHandler {
    async fn handle_broadcast(&self, message: Bytes) {
        *self.seen.lock().expect("poisoned") = Some(message);
        self.notify.notify_waiters();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_broadcast_reaches_the_registered_handler() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (relay, cluster) = MockRelay::accept(listener).await;
        assert_eq!(cluster, "weather-service");
        relay.send(FrameBuilder::new(Opcode::Broadcast).binary(b"severe storm warning")).await;
        relay
    });

    let handler = Arc::new(SignalingBroadcastHandler {
        seen: std::sync::Mutex::new(None),
        notify: Notify::new(),
    });
    let handlers = ServiceHandlers {
        broadcast: Some(handler.clone()),
        ..Default::default()
    };
    let _connection = iris_client_rs::register(port, "weather-service", handlers).await.expect("register");

    tokio::time::timeout(std::time::Duration::from_secs(2), handler.notify.notified())
        .await
        .expect("broadcast delivered before timeout");
    assert_eq!(handler.seen.lock().expect("poisoned").as_ref(), Some(&Bytes::from_static(b"severe storm warning")));

    relay_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbound_broadcast_carries_cluster_and_payload() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;
        let opcode = relay.read_opcode().await;
        assert_eq!(opcode, Opcode::Broadcast);
        let cluster = relay.read_string().await;
        let payload = relay.read_binary().await;
        (cluster, payload)
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    connection
        .broadcast("weather-service", Bytes::from_static(b"hello everyone"))
        .await
        .expect("broadcast");

    let (cluster, payload) = relay_task.await.expect("relay task");
    assert_eq!(cluster, "weather-service");
    assert_eq!(payload, b"hello everyone");
}
