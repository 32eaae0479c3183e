//! Client-side binding for the Iris cloud messaging fabric: a multiplexer
//! that bridges broadcast, request/reply, publish/subscribe and tunnelled
//! byte streams onto one framed TCP connection to a local relay.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod connection;
pub mod driver;
pub mod error;
pub mod handler;
pub mod pool;
pub mod schemes;
pub mod service;
pub mod tunnel_handle;
pub mod utils;
pub mod wire;

pub use connection::Connection;
pub use driver::Handlers;
pub use error::{Error, Result};
pub use service::{ServiceHandlers, connect, connect_with_config, register, register_with_config};
pub use tunnel_handle::Tunnel;
