//! Tunnel scheme: an ordered, reliable, credit-flow-controlled byte-message
//! pipe multiplexed over the same connection, with chunking/reassembly.
//!
//! The close handshake and cancellation-safe pending state are grounded in
//! the teacher's graceful-shutdown idiom
//! (`client/client.rs::{graceful_quiesce, wait_inflight_drained, kill_now}`);
//! the credit loop itself has no teacher analogue and is new.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Notify, oneshot};
use tracing::warn;

use crate::{
    error::{Error, Result},
    handler::TunnelHandler,
    tunnel_handle::Tunnel,
    wire::{FrameBuilder, FrameWriter, Opcode},
};

/// Chunk size offered to a peer for tunnels the relay opens towards us; we
/// have no application-supplied hint in that direction, unlike the outbound
/// case where the relay tells us its chunk limit in `TUN_CONFIRM`.
const DEFAULT_CHUNK_LIMIT: u64 = 64 * 1024;

struct PendingBuildGuard<'a> {
    scheme: &'a TunnelScheme,
    id: u64,
    disarmed: bool,
}

impl Drop for PendingBuildGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            self.scheme.pending_build.remove(&self.id);
            self.scheme.active.remove(&self.id);
        }
    }
}

/// One end of a tunnel. Owned by [`TunnelScheme`]; the public [`Tunnel`]
/// handle holds a non-owning reference (an id plus a `Weak` back-reference to
/// the scheme), so the endpoint and its scheme never form a reference cycle.
pub struct TunnelEndpoint {
    id: AtomicU64,
    chunk_limit: AtomicU64,
    credit: Mutex<u64>,
    credit_freed: Notify,
    inbound: Mutex<std::collections::VecDeque<Bytes>>,
    inbound_ready: Notify,
    assembly: Mutex<Option<(BytesMut, usize)>>,
    exit: Mutex<Option<String>>,
    exit_notify: Notify,
    send_lock: Mutex<()>,
    writer: Arc<FrameWriter>,
}

impl TunnelEndpoint {
    fn new(id: u64, chunk_limit: u64, writer: Arc<FrameWriter>) -> Self {
        Self {
            id: AtomicU64::new(id),
            chunk_limit: AtomicU64::new(chunk_limit),
            credit: Mutex::new(0),
            credit_freed: Notify::new(),
            inbound: Mutex::new(std::collections::VecDeque::new()),
            inbound_ready: Notify::new(),
            assembly: Mutex::new(None),
            exit: Mutex::new(None),
            exit_notify: Notify::new(),
            send_lock: Mutex::new(()),
            writer,
        }
    }

    fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    /// Re-keys this endpoint after the relay confirms a tunnel under an id
    /// other than the one we proposed in `TUN_INIT`.
    fn set_id(&self, v: u64) {
        self.id.store(v, Ordering::Relaxed);
    }

    fn set_chunk_limit(&self, v: u64) {
        self.chunk_limit.store(v, Ordering::Relaxed);
    }

    async fn add_credit(&self, n: u64) {
        let mut credit = self.credit.lock().await;
        *credit += n;
        drop(credit);
        self.credit_freed.notify_waiters();
    }

    async fn send_allow(&self, n: u64) {
        if let Err(e) = self.writer.send(FrameBuilder::new(Opcode::TunAllow).varint(self.id()).varint(n)).await {
            warn!("tunnel {}: failed to send initial allowance: {e}", self.id());
        }
    }

    async fn wait_for_credit(&self, need: u64, deadline: Option<tokio::time::Instant>) -> Result<()> {
        loop {
            {
                let credit = self.credit.lock().await;
                if *credit >= need {
                    return Ok(());
                }
            }
            let notified = self.credit_freed.notified();
            match deadline {
                None => notified.await,
                Some(dl) => {
                    if tokio::time::timeout_at(dl, notified).await.is_err() {
                        return Err(Error::Timeout);
                    }
                },
            }
        }
    }

    pub async fn send(&self, message: Bytes, timeout_ms: u64) -> Result<()> {
        let _serialize = self.send_lock.lock().await;
        let limit = (self.chunk_limit.load(Ordering::Relaxed) as usize).max(1);
        let total = message.len();
        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms));

        let mut pos = 0usize;
        while pos < total {
            let end = (pos + limit).min(total);
            let chunk = message.slice(pos..end);
            let size_or_continuation = if pos == 0 { total as u64 } else { 0 };

            self.wait_for_credit(chunk.len() as u64, deadline).await?;
            {
                let mut credit = self.credit.lock().await;
                *credit -= chunk.len() as u64;
            }
            self.writer
                .send(
                    FrameBuilder::new(Opcode::TunTransfer)
                        .varint(self.id())
                        .varint(size_or_continuation)
                        .binary(&chunk),
                )
                .await?;
            pos = end;
        }
        Ok(())
    }

    pub async fn receive(&self, timeout_ms: u64) -> Result<Bytes> {
        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms));
        loop {
            {
                let mut q = self.inbound.lock().await;
                if let Some(msg) = q.pop_front() {
                    drop(q);
                    let len = msg.len() as u64;
                    self.writer
                        .send(FrameBuilder::new(Opcode::TunAllow).varint(self.id()).varint(len))
                        .await?;
                    return Ok(msg);
                }
            }
            let notified = self.inbound_ready.notified();
            match deadline {
                None => notified.await,
                Some(dl) => {
                    if tokio::time::timeout_at(dl, notified).await.is_err() {
                        return Err(Error::Timeout);
                    }
                },
            }
        }
    }

    /// Called by the driver for every inbound `TUN_TRANSFER` frame. Refunding
    /// a discarded partial message is spawned off the driver's read loop so
    /// that a slow writer can never deadlock frame demultiplexing.
    async fn on_transfer(&self, size: u64, chunk: Vec<u8>) {
        let mut assembly = self.assembly.lock().await;
        if size != 0 {
            if let Some((old, _cap)) = assembly.take() {
                if !old.is_empty() {
                    let discarded = old.len() as u64;
                    let writer = self.writer.clone();
                    let id = self.id();
                    tokio::spawn(async move {
                        let _ = writer.send(FrameBuilder::new(Opcode::TunAllow).varint(id).varint(discarded)).await;
                    });
                }
            }
            *assembly = Some((BytesMut::with_capacity(chunk.len()), size as usize));
        }

        let Some((buf, capacity)) = assembly.as_mut() else {
            warn!("tunnel {}: continuation chunk with no message in progress, dropping", self.id());
            return;
        };
        buf.extend_from_slice(&chunk);
        if buf.len() >= *capacity {
            let complete = std::mem::take(buf).freeze();
            *assembly = None;
            drop(assembly);
            let mut q = self.inbound.lock().await;
            q.push_back(complete);
            drop(q);
            self.inbound_ready.notify_waiters();
        }
    }

    pub async fn close(&self) -> Result<()> {
        {
            let exit = self.exit.lock().await;
            if exit.is_some() {
                return Ok(());
            }
        }
        self.writer.send(FrameBuilder::new(Opcode::TunClose).varint(self.id())).await?;
        loop {
            {
                let exit = self.exit.lock().await;
                if let Some(reason) = exit.as_ref() {
                    return if reason.is_empty() {
                        Ok(())
                    } else {
                        Err(Error::RemoteClose(reason.clone()))
                    };
                }
            }
            self.exit_notify.notified().await;
        }
    }

    async fn on_remote_close(&self, reason: String) {
        let mut exit = self.exit.lock().await;
        *exit = Some(reason);
        drop(exit);
        self.exit_notify.notify_waiters();
    }
}

pub struct TunnelScheme {
    writer: Arc<FrameWriter>,
    ids: crate::utils::IdGen,
    pending_build: DashMap<u64, oneshot::Sender<Result<(u64, u64)>>>,
    active: DashMap<u64, Arc<TunnelEndpoint>>,
    handler: Option<Arc<dyn TunnelHandler>>,
    tunnel_buffer: u64,
    self_ref: OnceCell<Weak<TunnelScheme>>,
}

impl TunnelScheme {
    pub fn new(writer: Arc<FrameWriter>, tunnel_buffer: u64, handler: Option<Arc<dyn TunnelHandler>>) -> Arc<Self> {
        let scheme = Arc::new(Self {
            writer,
            ids: crate::utils::IdGen::new(),
            pending_build: DashMap::new(),
            active: DashMap::new(),
            handler,
            tunnel_buffer,
            self_ref: OnceCell::new(),
        });
        let _ = scheme.self_ref.set(Arc::downgrade(&scheme));
        scheme
    }

    fn weak_self(&self) -> Weak<TunnelScheme> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    pub async fn tunnel(&self, cluster: &str, timeout_ms: u64) -> Result<Tunnel> {
        let id = self.ids.next();
        let endpoint = Arc::new(TunnelEndpoint::new(id, 0, self.writer.clone()));
        self.active.insert(id, endpoint.clone());

        let (tx, rx) = oneshot::channel();
        self.pending_build.insert(id, tx);
        let mut guard = PendingBuildGuard { scheme: self, id, disarmed: false };

        self.writer
            .send(FrameBuilder::new(Opcode::TunInit).varint(id).string(cluster).varint(timeout_ms))
            .await?;

        match rx.await {
            // A relay that gives up on the construction handshake confirms
            // with chunk_limit 0 rather than leaving the pending record
            // dangling; there is no other outcome it can signal here.
            Ok(Ok((_, 0))) => Err(Error::Timeout),
            Ok(Ok((tun_id, chunk_limit))) => {
                guard.disarmed = true;
                endpoint.set_chunk_limit(chunk_limit);
                endpoint.send_allow(self.tunnel_buffer).await;
                Ok(Tunnel::new(tun_id, endpoint, self.weak_self()))
            },
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Invoked by the driver once it has parsed a `TUN_CONFIRM` frame's
    /// fields, in reply to a tunnel we initiated. The relay is free to
    /// assign its own id (`tun_id`) distinct from the one we proposed
    /// (`init_id`); every frame the endpoint builds from here on must use
    /// the relay-assigned id, so the endpoint is re-keyed under it both in
    /// the active map and in its own `id` field.
    pub fn on_tun_confirm(&self, init_id: u64, tun_id: u64, chunk_limit: u64) {
        let Some((_, tx)) = self.pending_build.remove(&init_id) else {
            return;
        };
        if chunk_limit != 0 && tun_id != init_id {
            if let Some((_, endpoint)) = self.active.remove(&init_id) {
                endpoint.set_id(tun_id);
                self.active.insert(tun_id, endpoint);
            }
        }
        let _ = tx.send(Ok((tun_id, chunk_limit)));
    }

    /// Sends `err` to every tunnel construction still awaiting `TUN_CONFIRM`
    /// and removes it from the pending table, so a caller blocked in
    /// `tunnel()`'s `rx.await` is woken instead of hanging forever. The
    /// half-built endpoint itself is left in `active` for `shutdown` to close
    /// out; `PendingBuildGuard`'s drop removes it once `tunnel()` returns.
    pub fn fail_pending(&self, err: &Error) {
        let ids: Vec<u64> = self.pending_build.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending_build.remove(&id) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Invoked by the driver for an inbound `TUN_INIT` (the relay is offering
    /// a tunnel towards us).
    pub async fn on_tun_init(&self, init_id: u64, _cluster: String, _timeout_ms: u64) {
        let Some(handler) = self.handler.clone() else {
            warn!("no tunnel handler registered; ignoring incoming tunnel offer {init_id}");
            return;
        };

        let new_id = self.ids.next();
        let endpoint = Arc::new(TunnelEndpoint::new(new_id, DEFAULT_CHUNK_LIMIT, self.writer.clone()));
        self.active.insert(new_id, endpoint.clone());

        if let Err(e) = self
            .writer
            .send(
                FrameBuilder::new(Opcode::TunConfirm)
                    .varint(init_id)
                    .varint(new_id)
                    .varint(DEFAULT_CHUNK_LIMIT),
            )
            .await
        {
            warn!("failed to confirm incoming tunnel {init_id}: {e}");
            self.active.remove(&new_id);
            return;
        }
        endpoint.send_allow(self.tunnel_buffer).await;

        let tunnel = Tunnel::new(new_id, endpoint, self.weak_self());
        tokio::spawn(async move {
            handler.handle_tunnel(tunnel).await;
        });
    }

    pub async fn on_tun_allow(&self, id: u64, space: u64) {
        // Clone out of the map before awaiting: holding a DashMap shard guard
        // across an await point risks blocking an unrelated `active.remove`
        // on the same shard for the duration of the wait.
        let endpoint = self.active.get(&id).map(|e| e.clone());
        if let Some(endpoint) = endpoint {
            endpoint.add_credit(space).await;
        }
    }

    pub async fn on_tun_transfer(&self, id: u64, size: u64, chunk: Vec<u8>) {
        let endpoint = self.active.get(&id).map(|e| e.clone());
        if let Some(endpoint) = endpoint {
            endpoint.on_transfer(size, chunk).await;
        } else {
            warn!("tunnel transfer for unknown id {id}, dropping");
        }
    }

    pub async fn on_tun_close(&self, id: u64, reason: String) {
        if let Some((_, endpoint)) = self.active.remove(&id) {
            endpoint.on_remote_close(reason).await;
        }
    }

    pub(crate) fn forget(&self, id: u64) {
        self.active.remove(&id);
    }

    pub async fn shutdown(&self) {
        let endpoints: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        for endpoint in endpoints {
            endpoint.on_remote_close(String::new()).await;
        }
    }
}
