//! Framed field codec for the relay protocol.
//!
//! Every frame on the wire is an opcode byte followed by a sequence of typed
//! fields: `byte`, `bool`, `varint` (LEB128, max 10 bytes), `binary`
//! (varint-length-prefixed bytes) and `string` (binary, UTF-8). Reads happen
//! on a single owned half so no locking is required; writes are serialized
//! through [`FrameWriter`]'s internal mutex so that no two frames ever
//! interleave on the wire.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod opcode;

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

pub use opcode::Opcode;

use crate::error::{Error, Result};

/// Magic string exchanged during the initial handshake.
pub const RELAY_MAGIC: &str = "iris-relay-v1.0";

/// Maximum number of continuation bytes a varint may occupy on the wire.
const MAX_VARINT_BYTES: usize = 10;

async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Interrupted),
        res = tokio::time::timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Error::Protocol(format!("{label} timed out at the wire level"))),
            }
        }
    }
}

/// Reads typed fields off the read half of a connection. Owned exclusively by
/// the driver's read loop; never shared.
pub struct FrameReader {
    inner: OwnedReadHalf,
    io_timeout: Duration,
    cancel: CancellationToken,
}

impl FrameReader {
    pub fn new(inner: OwnedReadHalf, io_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner,
            io_timeout,
            cancel,
        }
    }

    pub async fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        io_with_timeout(
            "read byte",
            self.inner.read_exact(&mut buf),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        Ok(buf[0])
    }

    pub async fn read_bool(&mut self) -> Result<bool> {
        match self.read_byte().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Protocol(format!("bool field carried 0x{other:02x}"))),
        }
    }

    pub async fn read_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let b = self.read_byte().await?;
            let data = (b & 0x7f) as u64;
            value |= data << (7 * i);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::Protocol("varint exceeded 10 continuation bytes".into()))
    }

    pub async fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint().await? as usize;
        let mut buf = vec![0u8; len];
        io_with_timeout(
            "read binary",
            self.inner.read_exact(&mut buf),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        Ok(buf)
    }

    pub async fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary().await?;
        String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("string field was not utf-8: {e}")))
    }

    pub async fn read_opcode(&mut self) -> Result<Opcode> {
        let b = self.read_byte().await?;
        Opcode::try_from(b).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// Writes typed fields onto the write half of a connection. Shared by every
/// scheme; the internal mutex guarantees frame atomicity.
pub struct FrameWriter {
    inner: Mutex<OwnedWriteHalf>,
    io_timeout: Duration,
    cancel: CancellationToken,
}

/// Accumulates one frame's bytes before it is handed to the writer under a
/// single lock acquisition, so a frame is never partially visible on the wire.
#[derive(Default)]
pub struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            buf: vec![opcode as u8],
        }
    }

    pub fn byte(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.byte(if v { 1 } else { 0 })
    }

    pub fn varint(mut self, mut v: u64) -> Self {
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.buf.push(b);
            if v == 0 {
                break;
            }
        }
        self
    }

    pub fn binary(self, v: &[u8]) -> Self {
        self.varint(v.len() as u64).raw(v)
    }

    pub fn string(self, v: &str) -> Self {
        self.binary(v.as_bytes())
    }

    fn raw(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }
}

impl FrameWriter {
    pub fn new(inner: OwnedWriteHalf, io_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(inner),
            io_timeout,
            cancel,
        }
    }

    /// Emits a complete frame atomically: nobody else's bytes can land between
    /// this frame's first and last byte.
    pub async fn send(&self, frame: FrameBuilder) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        let mut w = self.inner.lock().await;
        io_with_timeout(
            "write frame",
            w.write_all(&frame.buf),
            self.io_timeout,
            &self.cancel,
        )
        .await?;
        io_with_timeout("flush frame", w.flush(), self.io_timeout, &self.cancel).await
    }

    pub async fn shutdown(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}
