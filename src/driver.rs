//! Relay protocol driver: owns the read loop, performs the init and close
//! handshakes, and routes decoded frames to each scheme's `on_*` method.
//!
//! Grounded in the teacher's `client/client.rs::{connect, read_loop}`: a
//! connection is established, its read half handed to a loop spawned on an
//! `Arc` of the owning struct, and every fatal read-side error is logged
//! rather than propagated past the loop itself.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    cfg::config::ConnectionConfig,
    error::{Error, Result},
    handler::{BroadcastHandler, RequestHandler, TunnelHandler},
    schemes::{broadcast::BroadcastScheme, publish::PublishScheme, request::RequestScheme, tunnel::TunnelScheme},
    wire::{FrameBuilder, FrameReader, FrameWriter, Opcode, RELAY_MAGIC},
};

/// Application callbacks a registered service may supply. A plain `connect`
/// (client-only) leaves all three `None`.
#[derive(Default, Clone)]
pub struct Handlers {
    pub broadcast: Option<Arc<dyn BroadcastHandler>>,
    pub request: Option<Arc<dyn RequestHandler>>,
    pub tunnel: Option<Arc<dyn TunnelHandler>>,
}

/// Owns one codec, one reader task, and one instance of each scheme.
pub struct Driver {
    pub writer: Arc<FrameWriter>,
    pub broadcast: BroadcastScheme,
    pub request: RequestScheme,
    pub publish: PublishScheme,
    pub tunnel: Arc<TunnelScheme>,
    cancel: CancellationToken,
    close_ack: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl Driver {
    /// Connects to the relay at `127.0.0.1:port`, performs the init
    /// handshake under `cluster`, and spawns the read loop.
    pub async fn connect(port: u16, cluster: &str, cfg: &ConnectionConfig, handlers: Handlers) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();

        let cancel = CancellationToken::new();
        let writer = Arc::new(FrameWriter::new(w, cfg.io_timeout, cancel.clone()));
        let mut reader = FrameReader::new(r, cfg.io_timeout, cancel.clone());

        writer
            .send(FrameBuilder::new(Opcode::Init).string(RELAY_MAGIC).string(cluster))
            .await?;
        let ack_opcode = reader.read_opcode().await?;
        if ack_opcode != Opcode::InitAck {
            return Err(Error::Init(format!("expected INIT_ACK, got {ack_opcode:?}")));
        }
        let ok = reader.read_bool().await?;
        if !ok {
            let reason = reader.read_string().await?;
            return Err(Error::Init(reason));
        }

        let driver = Arc::new(Self {
            writer: writer.clone(),
            broadcast: BroadcastScheme::new(writer.clone(), &cfg.service, handlers.broadcast),
            request: RequestScheme::new(writer.clone(), &cfg.service, handlers.request),
            publish: PublishScheme::new(writer.clone()),
            tunnel: TunnelScheme::new(writer.clone(), cfg.tunnel_buffer, handlers.tunnel),
            cancel: cancel.clone(),
            close_ack: Mutex::new(None),
        });

        let loop_driver = driver.clone();
        tokio::spawn(async move {
            if let Err(e) = loop_driver.read_loop(reader).await {
                warn!("relay read loop exited: {e}");
            }
        });

        Ok(driver)
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let opcode = match reader.read_opcode().await {
                Ok(op) => op,
                Err(e) => {
                    self.fail_all(e.clone()).await;
                    return Err(e);
                },
            };

            if let Err(e) = self.dispatch(opcode, &mut reader).await {
                self.fail_all(e.clone()).await;
                return Err(e);
            }

            if opcode == Opcode::Close {
                return Ok(());
            }
        }
    }

    async fn dispatch(&self, opcode: Opcode, reader: &mut FrameReader) -> Result<()> {
        match opcode {
            Opcode::Broadcast => {
                let message = Bytes::from(reader.read_binary().await?);
                self.broadcast.on_broadcast(message).await;
            },
            Opcode::Request => {
                let id = reader.read_varint().await?;
                let message = Bytes::from(reader.read_binary().await?);
                let timeout_ms = reader.read_varint().await?;
                self.request.on_request(id, message, timeout_ms).await;
            },
            Opcode::Reply => {
                let id = reader.read_varint().await?;
                let timed_out = reader.read_bool().await?;
                if timed_out {
                    self.request.on_reply(id, true, false, Bytes::new(), String::new());
                } else {
                    let success = reader.read_bool().await?;
                    if success {
                        let body = Bytes::from(reader.read_binary().await?);
                        self.request.on_reply(id, false, true, body, String::new());
                    } else {
                        let error = reader.read_string().await?;
                        self.request.on_reply(id, false, false, Bytes::new(), error);
                    }
                }
            },
            Opcode::Publish => {
                let topic = reader.read_string().await?;
                let message = Bytes::from(reader.read_binary().await?);
                self.publish.on_publish(topic, message).await;
            },
            Opcode::TunInit => {
                let init_id = reader.read_varint().await?;
                let cluster = reader.read_string().await?;
                let timeout_ms = reader.read_varint().await?;
                self.tunnel.on_tun_init(init_id, cluster, timeout_ms).await;
            },
            Opcode::TunConfirm => {
                let init_id = reader.read_varint().await?;
                let tun_id = reader.read_varint().await?;
                let chunk_limit = reader.read_varint().await?;
                self.tunnel.on_tun_confirm(init_id, tun_id, chunk_limit);
            },
            Opcode::TunAllow => {
                let id = reader.read_varint().await?;
                let space = reader.read_varint().await?;
                self.tunnel.on_tun_allow(id, space).await;
            },
            Opcode::TunTransfer => {
                let id = reader.read_varint().await?;
                let size = reader.read_varint().await?;
                let chunk = reader.read_binary().await?;
                self.tunnel.on_tun_transfer(id, size, chunk).await;
            },
            Opcode::TunClose => {
                let id = reader.read_varint().await?;
                let reason = reader.read_string().await?;
                self.tunnel.on_tun_close(id, reason).await;
            },
            Opcode::Close => {
                let _reason = reader.read_string().await?;
                // If we initiated the close, this frame is the peer's
                // acknowledgement: signal the waiter and don't reply again,
                // or the two sides would ping-pong CLOSE frames forever.
                // Otherwise this is a peer-initiated close: ack it once.
                let waiting = self.close_ack.lock().await.take();
                match waiting {
                    Some(tx) => { let _ = tx.send(()); },
                    None => { self.writer.send(FrameBuilder::new(Opcode::Close).string("")).await?; },
                }
            },
            Opcode::Init | Opcode::InitAck | Opcode::Subscribe | Opcode::Unsubscribe => {
                return Err(Error::Protocol(format!("unexpected opcode after handshake: {opcode:?}")));
            },
        }
        Ok(())
    }

    /// Tears the connection down after a fatal read/dispatch error: every
    /// pending request and tunnel construction is signalled with `err`
    /// instead of being left to hang on its caller's `rx.await`, and every
    /// worker pool is cancelled immediately rather than drained gracefully,
    /// since there is no longer a connection for in-flight handlers to reply
    /// over.
    async fn fail_all(&self, err: Error) {
        self.request.fail_pending(&err);
        self.tunnel.fail_pending(&err);
        self.broadcast.shutdown(crate::pool::TerminateMode::Immediate).await;
        self.request.shutdown(crate::pool::TerminateMode::Immediate).await;
        self.publish.shutdown(crate::pool::TerminateMode::Immediate).await;
        self.tunnel.shutdown().await;
    }

    /// Sends `CLOSE`, waits for the peer's acknowledgement, then releases
    /// the reader task.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.close_ack.lock().await = Some(tx);
        self.writer.send(FrameBuilder::new(Opcode::Close).string("")).await?;
        let _ = rx.await;
        // A request or tunnel build racing this close would otherwise hang
        // forever waiting on a reply that can never arrive once the
        // connection below is torn down.
        self.request.fail_pending(&Error::Interrupted);
        self.tunnel.fail_pending(&Error::Interrupted);
        self.broadcast.shutdown(crate::pool::TerminateMode::Graceful).await;
        self.request.shutdown(crate::pool::TerminateMode::Graceful).await;
        self.publish.shutdown(crate::pool::TerminateMode::Graceful).await;
        self.tunnel.shutdown().await;
        self.cancel.cancel();
        self.writer.shutdown().await;
        Ok(())
    }
}
