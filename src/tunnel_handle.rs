//! Public handle for an open tunnel.
//!
//! Holds a non-owning [`Weak`] reference back to the scheme that owns the
//! tunnel's state, the same cycle-avoidance shape as the teacher's
//! `client/pool_sessions.rs::Pool` back-reference from a session to its pool.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::{
    error::Result,
    schemes::tunnel::{TunnelEndpoint, TunnelScheme},
};

/// A tunnel: an ordered, credit-flow-controlled byte-message pipe to a peer.
///
/// Dropping a `Tunnel` does not close it; call [`Tunnel::close`] explicitly.
/// Other clones (if the caller chooses to clone the endpoint/scheme) may still
/// be sending or receiving on it.
pub struct Tunnel {
    id: u64,
    endpoint: Arc<TunnelEndpoint>,
    scheme: Weak<TunnelScheme>,
}

impl Tunnel {
    pub(crate) fn new(id: u64, endpoint: Arc<TunnelEndpoint>, scheme: Weak<TunnelScheme>) -> Self {
        Self { id, endpoint, scheme }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends one logical message, chunked transparently under the peer's
    /// advertised chunk limit and throttled by its advertised credit.
    pub async fn send(&self, message: Bytes, timeout_ms: u64) -> Result<()> {
        self.endpoint.send(message, timeout_ms).await
    }

    /// Waits for and returns the next complete reassembled message.
    pub async fn receive(&self, timeout_ms: u64) -> Result<Bytes> {
        self.endpoint.receive(timeout_ms).await
    }

    /// Closes the tunnel and waits for the peer's acknowledgement. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let result = self.endpoint.close().await;
        if let Some(scheme) = self.scheme.upgrade() {
            scheme.forget(self.id);
        }
        result
    }
}
