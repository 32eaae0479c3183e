// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use iris_client_rs::wire::{FrameBuilder, Opcode};

use crate::support::mock_relay::MockRelay;

/// Drives a tunnel end to end against a hand-written relay stand-in:
/// construction handshake, an outbound chunked message, an inbound message,
/// and the close handshake.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tunnel_send_receive_and_close_round_trip() {
    let (listener, port) = MockRelay::bind().await;
    let relay_task = tokio::spawn(async move {
        let (mut relay, _cluster) = MockRelay::accept(listener).await;

        assert_eq!(relay.read_opcode().await, Opcode::TunInit);
        let init_id = relay.read_varint().await;
        let cluster = relay.read_string().await;
        let _timeout_ms = relay.read_varint().await;
        assert_eq!(cluster, "echo-service");

        let tun_id = init_id;
        let chunk_limit: u64 = 4;
        relay
            .send(FrameBuilder::new(Opcode::TunConfirm).varint(init_id).varint(tun_id).varint(chunk_limit))
            .await;

        // The client grants us an initial allowance before we send anything.
        assert_eq!(relay.read_opcode().await, Opcode::TunAllow);
        let allow_id = relay.read_varint().await;
        let _space = relay.read_varint().await;
        assert_eq!(allow_id, tun_id);

        // Grant the client enough credit to send its whole message in one go
        // despite the tiny chunk limit.
        relay.send(FrameBuilder::new(Opcode::TunAllow).varint(tun_id).varint(64)).await;

        // Collect the chunked outbound message.
        let mut assembled = Vec::new();
        let mut expected_total = None;
        loop {
            assert_eq!(relay.read_opcode().await, Opcode::TunTransfer);
            assert_eq!(relay.read_varint().await, tun_id);
            let size = relay.read_varint().await;
            let chunk = relay.read_binary().await;
            if size != 0 {
                expected_total = Some(size as usize);
            }
            assembled.extend_from_slice(&chunk);
            if Some(assembled.len()) == expected_total {
                break;
            }
        }
        assert_eq!(assembled, b"hello tunnel world");

        // Send a message back to the client, chunked the same way.
        let reply = b"ack";
        relay
            .send(FrameBuilder::new(Opcode::TunTransfer).varint(tun_id).varint(reply.len() as u64).binary(reply))
            .await;

        // The client refunds credit once it dequeues the message.
        assert_eq!(relay.read_opcode().await, Opcode::TunAllow);
        let _ = relay.read_varint().await;
        let _ = relay.read_varint().await;

        assert_eq!(relay.read_opcode().await, Opcode::TunClose);
        assert_eq!(relay.read_varint().await, tun_id);
        relay.send(FrameBuilder::new(Opcode::TunClose).varint(tun_id).string("")).await;

        relay
    });

    let connection = iris_client_rs::connect(port).await.expect("connect");
    let tunnel = connection.tunnel("echo-service", 2_000).await.expect("tunnel construction");

    tunnel
        .send(Bytes::from_static(b"hello tunnel world"), 2_000)
        .await
        .expect("chunked send");

    let reply = tunnel.receive(2_000).await.expect("receive reply");
    assert_eq!(reply, Bytes::from_static(b"ack"));

    tunnel.close().await.expect("close handshake");

    relay_task.await.expect("relay task");
}
