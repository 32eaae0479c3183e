//! Entry points: `connect` for a client-only binding, `register` for a
//! full service that also receives broadcasts, requests and tunnels.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{
    cfg::{config::ConnectionConfig, validators::validate_local_cluster},
    connection::Connection,
    driver::Handlers,
    error::Result,
    handler::{BroadcastHandler, RequestHandler, TunnelHandler},
};

/// Opens a client-only connection: no cluster name, no inbound handlers.
pub async fn connect(port: u16) -> Result<Connection> {
    Connection::open(port, "", ConnectionConfig::default(), Handlers::default()).await
}

/// Opens a client-only connection under an explicit configuration.
pub async fn connect_with_config(port: u16, cfg: ConnectionConfig) -> Result<Connection> {
    Connection::open(port, "", cfg, Handlers::default()).await
}

/// Builds the handler set a [`register`] call installs on its connection.
#[derive(Default, Clone)]
pub struct ServiceHandlers {
    pub broadcast: Option<Arc<dyn BroadcastHandler>>,
    pub request: Option<Arc<dyn RequestHandler>>,
    pub tunnel: Option<Arc<dyn TunnelHandler>>,
}

/// Registers `cluster` as a named service on the relay. The local cluster
/// name is validated (non-empty, no `:`) before anything touches the wire.
pub async fn register(port: u16, cluster: &str, handlers: ServiceHandlers) -> Result<Connection> {
    register_with_config(port, cluster, handlers, ConnectionConfig::default()).await
}

pub async fn register_with_config(
    port: u16,
    cluster: &str,
    handlers: ServiceHandlers,
    cfg: ConnectionConfig,
) -> Result<Connection> {
    validate_local_cluster(cluster)?;
    let handlers = Handlers {
        broadcast: handlers.broadcast,
        request: handlers.request,
        tunnel: handlers.tunnel,
    };
    Connection::open(port, cluster, cfg, handlers).await
}
