// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An in-process relay stand-in that speaks just enough of the wire protocol
//! to drive the crate's public surface from the other end of a real TCP
//! socket, the way the teacher's integration tests dial a real iSCSI target.

use std::time::Duration;

use iris_client_rs::wire::{FrameBuilder, FrameReader, FrameWriter, Opcode};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct MockRelay {
    writer: FrameWriter,
    reader: FrameReader,
}

impl MockRelay {
    /// Binds an ephemeral port and returns it alongside the still-open
    /// listener, so the caller can hand the port to `connect`/`register`
    /// before the relay side has accepted.
    pub async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let port = listener.local_addr().expect("local_addr").port();
        (listener, port)
    }

    /// Accepts one connection and performs the relay side of the init
    /// handshake, returning the joining cluster name the client announced.
    pub async fn accept(listener: TcpListener) -> (Self, String) {
        let (stream, _) = listener.accept().await.expect("accept");
        Self::from_stream(stream).await
    }

    async fn from_stream(stream: TcpStream) -> (Self, String) {
        stream.set_nodelay(true).expect("set_nodelay");
        let (r, w) = stream.into_split();
        let cancel = CancellationToken::new();
        let writer = FrameWriter::new(w, Duration::from_secs(5), cancel.clone());
        let mut reader = FrameReader::new(r, Duration::from_secs(5), cancel);

        let opcode = reader.read_opcode().await.expect("read INIT opcode");
        assert_eq!(opcode, Opcode::Init, "expected INIT as the first frame");
        let _magic = reader.read_string().await.expect("read magic");
        let cluster = reader.read_string().await.expect("read cluster");

        writer
            .send(FrameBuilder::new(Opcode::InitAck).bool(true))
            .await
            .expect("send INIT_ACK");

        (Self { writer, reader }, cluster)
    }

    pub async fn send(&self, frame: FrameBuilder) {
        self.writer.send(frame).await.expect("mock relay send");
    }

    pub async fn read_opcode(&mut self) -> Opcode {
        self.reader.read_opcode().await.expect("read opcode")
    }

    pub async fn read_bool(&mut self) -> bool {
        self.reader.read_bool().await.expect("read bool")
    }

    pub async fn read_varint(&mut self) -> u64 {
        self.reader.read_varint().await.expect("read varint")
    }

    pub async fn read_binary(&mut self) -> Vec<u8> {
        self.reader.read_binary().await.expect("read binary")
    }

    pub async fn read_string(&mut self) -> String {
        self.reader.read_string().await.expect("read string")
    }
}
