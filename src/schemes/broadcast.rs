//! Broadcast scheme: fire-and-forget fan-out, no correlation id, no reply.
//!
//! Grounded in the teacher's unsolicited NOP-In handling
//! (`client/client.rs::try_handle_unsolicited_nop_in`): inbound work that
//! carries no pending continuation is simply dispatched to a handler rather
//! than matched against a table.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::{
    cfg::config::ServiceLimits,
    error::Result,
    handler::BroadcastHandler,
    pool::BoundedWorkerPool,
    wire::{FrameBuilder, FrameWriter, Opcode},
};

pub struct BroadcastScheme {
    writer: Arc<FrameWriter>,
    pool: BoundedWorkerPool,
    handler: Option<Arc<dyn BroadcastHandler>>,
}

impl BroadcastScheme {
    pub fn new(
        writer: Arc<FrameWriter>,
        limits: &ServiceLimits,
        handler: Option<Arc<dyn BroadcastHandler>>,
    ) -> Self {
        Self {
            writer,
            pool: BoundedWorkerPool::new(limits.broadcast_threads, limits.broadcast_memory),
            handler,
        }
    }

    pub async fn broadcast(&self, cluster: &str, message: Bytes) -> Result<()> {
        self.writer
            .send(FrameBuilder::new(Opcode::Broadcast).string(cluster).binary(&message))
            .await
    }

    /// Invoked by the driver after it has decoded a `BROADCAST` frame's
    /// payload. Admission failure (worker pool saturated past its memory
    /// budget) drops the broadcast silently, mirroring publish dispatch.
    pub async fn on_broadcast(&self, message: Bytes) {
        let Some(handler) = self.handler.clone() else {
            warn!("dropping broadcast: this connection has no broadcast handler registered");
            return;
        };
        let cost = message.len() as i64;
        let admitted = self
            .pool
            .schedule(cost, 0, move |cancel| async move {
                // Isolate the handler on its own task: a panic becomes a
                // `JoinError` here rather than aborting the worker pool's
                // own task, and an immediate shutdown can abort it outright.
                let mut handle = tokio::spawn(async move { handler.handle_broadcast(message).await });
                let outcome = tokio::select! {
                    r = &mut handle => r,
                    _ = cancel.cancelled() => {
                        handle.abort();
                        return;
                    },
                };
                if let Err(join_err) = outcome {
                    warn!("broadcast handler panicked: {join_err}");
                }
            })
            .await;
        if !admitted {
            warn!("dropped broadcast: worker pool rejected admission");
        }
    }

    pub async fn shutdown(&self, mode: crate::pool::TerminateMode) {
        self.pool.terminate(mode).await;
    }
}
