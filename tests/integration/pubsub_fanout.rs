// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use iris_client_rs::{handler::TopicHandler, wire::{FrameBuilder, Opcode}};
use tokio::sync::Notify;

use crate::support::mock_relay::MockRelay;

struct RecordingTopicHandler {
    received: Mutex<Vec<Bytes>>,
    notify: Notify,
}

#[async_trait]
impl TopicHandler for RecordingTopicHandler {
    async fn handle_event(&self, _topic: &str, message: Bytes) {
        self.received.lock().expect("poisoned").push(message);
        self.notify.notify_waiters();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribed_events_reach_the_handler() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, cluster) = MockRelay::accept(listener).await;
        assert_eq!(cluster, "");

        let opcode = relay.read_opcode().await;
        assert_eq!(opcode, Opcode::Subscribe);
        let topic = relay.read_string().await;
        assert_eq!(topic, "weather.updates");

        relay
            .send(FrameBuilder::new(Opcode::Publish).string(&topic).binary(b"rain expected"))
            .await;
        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let handler = Arc::new(RecordingTopicHandler {
        received: Mutex::new(Vec::new()),
        notify: Notify::new(),
    });
    connection.subscribe("weather.updates", handler.clone()).await.expect("subscribe");

    tokio::time::timeout(std::time::Duration::from_secs(2), handler.notify.notified())
        .await
        .expect("event delivered before timeout");

    let received = handler.received.lock().expect("poisoned");
    assert_eq!(received.as_slice(), &[Bytes::from_static(b"rain expected")]);
    drop(received);

    relay_task.abort();
}
