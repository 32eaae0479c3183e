//! Error taxonomy for the Iris client binding.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// All ways a call into this crate can fail.
///
/// Fatal variants (`Init`, `Protocol`, `Io`) tear down the owning connection and signal every
/// pending operation with a clone of the same error. The rest are local to the call that raised
/// them.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The relay refused the initial handshake, or replied with a disagreement.
    #[error("relay initialization failed: {0}")]
    Init(String),

    /// A frame on the wire did not follow the codec's field rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// A blocking call did not complete before its deadline.
    #[error("timed out")]
    Timeout,

    /// A peer handler returned an error string for a request.
    #[error("remote error: {0}")]
    Remote(String),

    /// A tunnel's peer closed it with a non-empty reason.
    #[error("tunnel closed by peer: {0}")]
    RemoteClose(String),

    /// The caller's own task was cancelled while waiting.
    #[error("interrupted")]
    Interrupted,

    /// A caller-supplied argument failed local validation before anything touched the wire.
    #[error("invalid argument: {0}")]
    Argument(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
