// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common types for I2C controller drivers
//!
//! This crate is the shared vocabulary between upper-layer bus clients
//! (sensor and peripheral drivers) and the controller-mode transfer engine:
//! message and flag types, bus speeds, and the error taxonomy.  The actual
//! bus work happens in `drv-i2c-core`, parameterized per chip; nothing here
//! touches hardware.

#![cfg_attr(target_os = "none", no_std)]

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// The response code returned from the transfer engine.  These codes are
/// deliberately disjoint -- not because callers are expected to handle each
/// one differently, but to give upstack software some modicum of context
/// surrounding the error.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u32)]
pub enum ResponseCode {
    /// Malformed message sequence or argument
    BadArg = 1,
    /// Target address was NACKed: no device answered
    NoDevice = 2,
    /// A data byte was NACKed mid-write (typically an illegal register)
    NoRegister = 3,
    /// Target address is in an I2C reserved range
    ReservedAddress = 4,
    /// Requested operation is not supported (10-bit addressing, target
    /// mode, unsupported speed)
    OperationNotSupported = 5,
    /// Controller has not been configured
    NotConfigured = 6,
    /// Arbitration was lost; the bus was spontaneously reset
    BusReset = 7,
    /// Hardware flagged a bus error (misplaced START/STOP)
    BusError = 8,
    /// Bus lines are not idle and could not be freed
    BusLocked = 9,
    /// Bit-bang recovery exhausted its pulse budget without freeing SDA
    RecoveryFailed = 10,
    /// Controller appeared to be wedged busy and was reset
    ControllerBusy = 11,
    /// Transfer exceeded its deadline; the controller was reset
    BusTimeout = 12,
}

///
/// The controller identity for a given I2C bus.  The numbering here should
/// be assumed to follow the numbering for the peripheral as described by the
/// microcontroller.
///
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum Controller {
    I2C0 = 0,
    I2C1 = 1,
    I2C2 = 2,
    I2C3 = 3,
    I2C4 = 4,
    I2C5 = 5,
    I2C6 = 6,
    I2C7 = 7,
    Mock = 0xff,
}

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[allow(clippy::unusual_byte_groupings)]
#[repr(u8)]
pub enum ReservedAddress {
    GeneralCall = 0b0000_000,
    CBUSAddress = 0b0000_001,
    FutureBus = 0b0000_010,
    FuturePurposes = 0b0000_011,
    HighSpeedReserved00 = 0b0000_100,
    HighSpeedReserved01 = 0b0000_101,
    HighSpeedReserved10 = 0b0000_110,
    HighSpeedReserved11 = 0b0000_111,
    TenBit00 = 0b1111_100,
    TenBit01 = 0b1111_101,
    TenBit10 = 0b1111_110,
    TenBit11 = 0b1111_111,
}

impl ReservedAddress {
    /// Returns true if `addr` is one of the addresses the I2C specification
    /// reserves for special purposes.
    pub fn is_reserved(addr: u8) -> bool {
        Self::from_u8(addr).is_some()
    }
}

/// Bus speed, as programmed by `configure()`.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum Speed {
    /// Standard mode, 100 kHz
    Standard = 0,
    /// Fast mode, 400 kHz
    Fast = 1,
    /// Fast mode plus, 1 MHz
    FastPlus = 2,
}

impl Speed {
    pub fn hertz(&self) -> u32 {
        match self {
            Speed::Standard => 100_000,
            Speed::Fast => 400_000,
            Speed::FastPlus => 1_000_000,
        }
    }
}

/// Operating role requested of the controller.  The transfer engine is
/// controller-only; target mode exists in the vocabulary so that requesting
/// it can fail deliberately rather than being unrepresentable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    Controller,
    Target,
}

bitflags! {
    /// Per-message flags, following the semantics of the usual `i2c_msg`
    /// flag set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MessageFlags: u8 {
        /// Issue a repeated START before this message, even if the
        /// direction is unchanged from the previous message.
        const RESTART = 1 << 0;
        /// Issue a STOP after this message completes.
        const STOP = 1 << 1;
        /// The target address is 10-bit.  Rejected fast by controllers
        /// that do not support it.
        const ADDR_10BIT = 1 << 2;
    }
}

/// Direction of one message, from the controller's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Direction {
    Write = 0,
    Read = 1,
}

impl Direction {
    /// Forms the address byte clocked out after a START: the 7-bit address
    /// in the upper bits, the R/W bit in bit 0.
    pub fn address_byte(&self, addr: u8) -> u8 {
        (addr << 1) | (*self as u8)
    }
}

/// The buffer of one message; the variant carries the direction.  The
/// driver writes into `Read` buffers and reads from `Write` buffers, never
/// the reverse, and retains no reference once `transfer()` returns.
pub enum MessageBuf<'a> {
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// One directional data phase of a transfer request.
pub struct Message<'a> {
    pub body: MessageBuf<'a>,
    pub flags: MessageFlags,
}

impl<'a> Message<'a> {
    /// A write message with no flags.  A zero-length buffer is a valid
    /// address-only probe.
    pub fn write(buf: &'a [u8]) -> Self {
        Self {
            body: MessageBuf::Write(buf),
            flags: MessageFlags::empty(),
        }
    }

    /// A read message with no flags.
    pub fn read(buf: &'a mut [u8]) -> Self {
        Self {
            body: MessageBuf::Read(buf),
            flags: MessageFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.body {
            MessageBuf::Write(_) => Direction::Write,
            MessageBuf::Read(_) => Direction::Read,
        }
    }

    pub fn len(&self) -> usize {
        match &self.body {
            MessageBuf::Write(buf) => buf.len(),
            MessageBuf::Read(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
