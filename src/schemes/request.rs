//! Request/reply scheme: correlated request with timeout, backed by a
//! pending-result table keyed by a locally-generated id.
//!
//! Grounded in the teacher's ITT correlation table
//! (`client/client.rs::{send_request, read_response_raw}`): insert the
//! pending entry before writing the trigger frame, because the relay can
//! answer before the write call returns.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    cfg::config::ServiceLimits,
    error::{Error, Result},
    handler::RequestHandler,
    pool::BoundedWorkerPool,
    utils::IdGen,
    wire::{FrameBuilder, FrameWriter, Opcode},
};

enum Outcome {
    Reply(Bytes),
    Timeout,
    Remote(String),
    /// The connection failed (or was closed) while this request was still
    /// outstanding.
    Failed(Error),
}

struct PendingGuard<'a> {
    map: &'a DashMap<u64, oneshot::Sender<Outcome>>,
    id: u64,
    disarmed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.disarmed {
            self.map.remove(&self.id);
        }
    }
}

pub struct RequestScheme {
    writer: Arc<FrameWriter>,
    ids: IdGen,
    pending: DashMap<u64, oneshot::Sender<Outcome>>,
    pool: BoundedWorkerPool,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl RequestScheme {
    pub fn new(
        writer: Arc<FrameWriter>,
        limits: &ServiceLimits,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Self {
        Self {
            writer,
            ids: IdGen::new(),
            pending: DashMap::new(),
            pool: BoundedWorkerPool::new(limits.request_threads, limits.request_memory),
            handler,
        }
    }

    pub async fn request(&self, cluster: &str, message: Bytes, timeout_ms: u64) -> Result<Bytes> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // Removes the pending entry if this call is cancelled anywhere below
        // (including while suspended on `rx.await`), satisfying the
        // reader-side contract that a dropped caller leaves no stale entry.
        let mut guard = PendingGuard { map: &self.pending, id, disarmed: false };

        self.writer
            .send(
                FrameBuilder::new(Opcode::Request)
                    .varint(id)
                    .string(cluster)
                    .binary(&message)
                    .varint(timeout_ms),
            )
            .await?;

        match rx.await {
            Ok(Outcome::Reply(bytes)) => {
                guard.disarmed = true;
                Ok(bytes)
            },
            Ok(Outcome::Timeout) => {
                guard.disarmed = true;
                Err(Error::Timeout)
            },
            Ok(Outcome::Remote(msg)) => {
                guard.disarmed = true;
                Err(Error::Remote(msg))
            },
            Ok(Outcome::Failed(err)) => {
                guard.disarmed = true;
                Err(err)
            },
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Invoked by the driver once it has parsed a `REPLY` frame's fields. A
    /// reply for an id the caller already gave up on (interrupted, or this is
    /// a duplicate) is silently discarded.
    pub fn on_reply(&self, id: u64, timed_out: bool, success: bool, body: Bytes, error: String) {
        let Some((_, tx)) = self.pending.remove(&id) else {
            return;
        };
        let outcome = if timed_out {
            Outcome::Timeout
        } else if success {
            Outcome::Reply(body)
        } else {
            Outcome::Remote(error)
        };
        let _ = tx.send(outcome);
    }

    /// Invoked by the driver once it has parsed a `REQUEST` frame's fields.
    pub async fn on_request(&self, id: u64, message: Bytes, timeout_ms: u64) {
        let Some(handler) = self.handler.clone() else {
            self.reply_error(id, "no request handler registered on this connection").await;
            return;
        };

        let cost = message.len() as i64;
        let writer = self.writer.clone();
        let admitted = self
            .pool
            .schedule(cost, timeout_ms, move |cancel| async move {
                // Run the handler on its own tokio task so a panic surfaces
                // as a `JoinError` here instead of taking down the worker
                // pool's task (and with it, this reply), and so an immediate
                // shutdown can abort it instead of waiting it out.
                let mut handle = tokio::spawn(async move { handler.handle_request(message).await });
                let outcome = tokio::select! {
                    r = &mut handle => r,
                    _ = cancel.cancelled() => {
                        handle.abort();
                        return;
                    },
                };
                let reply = match outcome {
                    Ok(Ok(body)) => FrameBuilder::new(Opcode::Reply)
                        .varint(id)
                        .bool(false)
                        .bool(true)
                        .binary(&body),
                    Ok(Err(e)) => FrameBuilder::new(Opcode::Reply)
                        .varint(id)
                        .bool(false)
                        .bool(false)
                        .string(&e.to_string()),
                    Err(join_err) => FrameBuilder::new(Opcode::Reply)
                        .varint(id)
                        .bool(false)
                        .bool(false)
                        .string(&format!("request handler panicked: {join_err}")),
                };
                if let Err(e) = writer.send(reply).await {
                    warn!("failed to send reply for request {id}: {e}");
                }
            })
            .await;

        if !admitted {
            self.reply_timeout(id).await;
        }
    }

    async fn reply_error(&self, id: u64, message: &str) {
        let frame = FrameBuilder::new(Opcode::Reply).varint(id).bool(false).bool(false).string(message);
        if let Err(e) = self.writer.send(frame).await {
            warn!("failed to send error reply for request {id}: {e}");
        }
    }

    async fn reply_timeout(&self, id: u64) {
        let frame = FrameBuilder::new(Opcode::Reply).varint(id).bool(true);
        if let Err(e) = self.writer.send(frame).await {
            warn!("failed to send timeout reply for request {id}: {e}");
        }
    }

    /// Sends `err` to every request still awaiting a reply and removes it
    /// from the pending table, so a caller blocked in `request()`'s
    /// `rx.await` is woken instead of hanging forever.
    pub fn fail_pending(&self, err: &Error) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Outcome::Failed(err.clone()));
            }
        }
    }

    pub async fn shutdown(&self, mode: crate::pool::TerminateMode) {
        self.pool.terminate(mode).await;
    }
}
