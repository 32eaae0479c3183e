// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use iris_client_rs::{cfg::config::TopicLimits, handler::TopicHandler, wire::{FrameBuilder, Opcode}};
use tokio::time::Instant;

use crate::support::mock_relay::MockRelay;

struct SlowTopicHandler {
    starts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl TopicHandler for SlowTopicHandler {
    async fn handle_event(&self, _topic: &str, _message: Bytes) {
        self.starts.lock().expect("poisoned").push(Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A topic capped at one worker processes its events strictly one at a
/// time: with four 100 ms events queued, only two have finished starting by
/// the 250 ms mark.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_threaded_topic_processes_events_serially() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (relay, _cluster) = MockRelay::accept(listener).await;
        for _ in 0..4 {
            relay.send(FrameBuilder::new(Opcode::Publish).string("orders").binary(b"event")).await;
        }
        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let handler = Arc::new(SlowTopicHandler { starts: Mutex::new(Vec::new()) });
    let limits = TopicLimits {
        event_threads: 1,
        event_memory: 1024,
    };
    connection
        .subscribe_with_limits("orders", handler.clone(), &limits)
        .await
        .expect("subscribe");

    tokio::time::sleep(Duration::from_millis(250)).await;

    let starts = handler.starts.lock().expect("poisoned");
    assert_eq!(starts.len(), 2, "exactly two of the four events have started by 250ms");

    relay_task.abort();
}
