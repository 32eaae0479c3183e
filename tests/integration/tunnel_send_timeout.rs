// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use iris_client_rs::{error::Error, wire::{FrameBuilder, Opcode}};

use crate::support::mock_relay::MockRelay;

/// A peer that confirms a tunnel but never replenishes send credit leaves
/// `send` with nothing to do but time out; no partial `TUN_TRANSFER` frame
/// is ever put on the wire.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_times_out_when_credit_is_never_granted() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;

        assert_eq!(relay.read_opcode().await, Opcode::TunInit);
        let init_id = relay.read_varint().await;
        let _cluster = relay.read_string().await;
        let _timeout_ms = relay.read_varint().await;

        let tun_id = init_id;
        let chunk_limit: u64 = 4;
        relay
            .send(FrameBuilder::new(Opcode::TunConfirm).varint(init_id).varint(tun_id).varint(chunk_limit))
            .await;

        // The client grants us an initial allowance; we never grant any back.
        assert_eq!(relay.read_opcode().await, Opcode::TunAllow);
        let _ = relay.read_varint().await;
        let _ = relay.read_varint().await;

        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let tunnel = connection.tunnel("echo-service", 2_000).await.expect("tunnel construction");

    let message = Bytes::from_static(b"hello tunnel world, more than one chunk long");
    let result = tunnel.send(message, 150).await;
    assert!(matches!(result, Err(Error::Timeout)), "expected a timeout, got {result:?}");

    relay_task.abort();
}
