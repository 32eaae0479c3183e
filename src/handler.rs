//! Application-supplied callbacks invoked by the core on inbound work.
//!
//! Handlers run inside a [`crate::pool::BoundedWorkerPool`] task, never on
//! the driver's read loop, so a slow or panicking handler cannot stall frame
//! demultiplexing. A handler that panics is caught and, where the dispatch
//! has a reply to send, turned into a remote error string instead of tearing
//! the connection down.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::Result, tunnel_handle::Tunnel};

/// Handles broadcasts received by a registered service.
#[async_trait]
pub trait BroadcastHandler: Send + Sync + 'static {
    async fn handle_broadcast(&self, message: Bytes);
}

/// Handles requests received by a registered service and produces the reply
/// payload, or an `Err` whose message is relayed to the caller verbatim.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, message: Bytes) -> Result<Bytes>;
}

/// Handles events delivered to a subscribed topic.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    async fn handle_event(&self, topic: &str, message: Bytes);
}

/// Handles a tunnel the relay opened towards this service.
#[async_trait]
pub trait TunnelHandler: Send + Sync + 'static {
    async fn handle_tunnel(&self, tunnel: Tunnel);
}
