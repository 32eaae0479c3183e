//! Wire opcodes for the relay protocol.
//!
//! The byte layout is a single leading opcode octet followed by a
//! type-specific field sequence (see [`crate::wire`]). Ordinals are part of
//! the contract with the relay and must never be reassigned.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// All opcodes defined by the Iris relay v1 wire contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Init = 0x00,
    InitAck = 0x01,
    Broadcast = 0x02,
    Request = 0x03,
    Reply = 0x04,
    Subscribe = 0x05,
    Unsubscribe = 0x06,
    Publish = 0x07,
    TunInit = 0x08,
    TunConfirm = 0x09,
    TunAllow = 0x0a,
    TunTransfer = 0x0b,
    TunClose = 0x0c,
    Close = 0x0d,
}

impl Opcode {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Init,
            0x01 => Self::InitAck,
            0x02 => Self::Broadcast,
            0x03 => Self::Request,
            0x04 => Self::Reply,
            0x05 => Self::Subscribe,
            0x06 => Self::Unsubscribe,
            0x07 => Self::Publish,
            0x08 => Self::TunInit,
            0x09 => Self::TunConfirm,
            0x0a => Self::TunAllow,
            0x0b => Self::TunTransfer,
            0x0c => Self::TunClose,
            0x0d => Self::Close,
            _ => return None,
        })
    }
}

/// Returned when a leading byte does not map to a known opcode.
#[derive(Debug, Error, Clone)]
#[error("unknown opcode: 0x{0:02x}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_u8(byte).ok_or(UnknownOpcode(byte))
    }
}
