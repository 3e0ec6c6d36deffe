// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the transfer engine and one chip's register layer.
//!
//! Each supported controller family implements [`I2cHardware`] over its own
//! register block; the engine above it is shared.  Chip quirks are expressed
//! as data in [`Capabilities`] rather than as per-chip code paths.

use bitflags::bitflags;
use drv_i2c_api::Speed;

bitflags! {
    /// Interpreted hardware status, as reported by [`I2cHardware::poll_status`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct BusStatus: u8 {
        /// The most recently issued operation has completed.
        const DONE = 1 << 0;
        /// The last address or data byte was ACKed by the target.
        const ACK = 1 << 1;
        /// The NACK (if any) happened on the address byte.  Only meaningful
        /// alongside a missing `ACK`; it lets the FIFO path distinguish
        /// no-device from bad-register the way the byte-wise path can.
        const ADDR_NACK = 1 << 2;
        /// Hardware flagged a bus error (misplaced START or STOP).
        const BUS_ERROR = 1 << 3;
        /// Arbitration was lost to another controller.
        const ARB_LOST = 1 << 4;
        /// The controller's internal state machine is busy.
        const BUSY = 1 << 5;
    }
}

/// ACK disposition armed ahead of a read byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ack {
    Ack,
    Nack,
}

/// Chip quirks and features, reported once by the hardware layer and treated
/// as data by the engine.
#[derive(Copy, Clone, Debug)]
pub struct Capabilities {
    /// Depth of the hardware FIFO/command queue, if the chip has one.  The
    /// bulk strategy is only eligible when every payload of a request fits.
    pub fifo_depth: Option<usize>,
    /// The chip's ACK-disposition register takes effect one byte late, so
    /// auto-ACK must be disabled one byte early for the final byte of a read
    /// to be NACKed on the wire.
    pub early_nack: bool,
    /// Highest bus speed the chip's clocking supports.
    pub max_speed: Speed,
}

/// Low-level transaction primitives for one controller instance.
///
/// Operations never fail synchronously; every failure surfaces through
/// [`poll_status`](Self::poll_status).  An operation is complete when a
/// subsequent poll reports [`BusStatus::DONE`].
///
/// The read path has one hard sequencing requirement, inherited from chips
/// where the data-register read is what generates the clocks for the next
/// byte: the engine always arms the ACK disposition with
/// [`prime_ack`](Self::prime_ack) *before* the [`receive_byte`](Self::receive_byte)
/// call whose register read will clock the byte that disposition governs.
pub trait I2cHardware {
    fn capabilities(&self) -> Capabilities;

    /// Drives a START (or repeated START) and begins clocking out
    /// `addr_byte` -- the 7-bit address with the R/W bit in bit 0.
    fn assert_start(&mut self, addr_byte: u8, repeated: bool);

    /// Shifts one data byte out.
    fn transmit_byte(&mut self, byte: u8);

    /// Arms the ACK/NACK disposition governing an upcoming read byte.
    fn prime_ack(&mut self, ack: Ack);

    /// Takes the byte most recently clocked in.  On some chips this very
    /// register read starts the clocks for the next byte.
    fn receive_byte(&mut self) -> u8;

    /// Drives a STOP condition.
    fn assert_stop(&mut self);

    /// Reads and interprets the hardware status bits.
    fn poll_status(&mut self) -> BusStatus;

    /// Resets the controller's internal state machine.  Called after
    /// timeouts and bus-level errors, when the state machine cannot be
    /// trusted to resume.
    fn reset(&mut self);

    /// Programs clock dividers for `speed`, returning the programmed
    /// divider value for read-back.
    fn apply_timing(&mut self, speed: Speed) -> u32;

    //
    // FIFO/command-queue hooks.  Only called when `capabilities()` reports
    // a FIFO depth; chips without one can leave the defaults.
    //

    /// Starts a hardware-sequenced transaction of `len` bytes toward
    /// `addr_byte`, with a trailing STOP if `stop`.  Outbound bytes must
    /// already be in the FIFO; completion and ACK/NACK outcome surface via
    /// `poll_status`, and the chip handles the NACK of the final read byte
    /// itself.
    fn start_fifo(&mut self, addr_byte: u8, len: usize, stop: bool) {
        let _ = (addr_byte, len, stop);
    }

    /// Loads outbound bytes, returning how many were accepted.
    fn fifo_push(&mut self, buf: &[u8]) -> usize {
        let _ = buf;
        0
    }

    /// Drains received bytes, returning how many were produced.
    fn fifo_pop(&mut self, buf: &mut [u8]) -> usize {
        let _ = buf;
        0
    }

    //
    // Bus-recovery hooks: direct line control, bypassing the controller
    // logic.  Sampling works in either mode; driving requires `bitbang`.
    //

    /// Hands the SCL/SDA pins to (or back from) direct digital I/O.
    fn bitbang(&mut self, enable: bool);
    fn set_scl(&mut self, high: bool);
    fn set_sda(&mut self, high: bool);
    fn sample_scl(&mut self) -> bool;
    fn sample_sda(&mut self) -> bool;
}

/// Environment hooks for one controller instance: interrupt plumbing and
/// time, injected by the hosting system.
///
/// `enable` unmasks the controller's interrupt and `wfi` blocks the calling
/// context until the notification fires; a polled environment can pass a
/// no-op `enable` and a `wfi` that merely yields.  `now` is a monotonic
/// millisecond clock used for every deadline in the engine, and `relax` is a
/// brief cooperative yield used while spinning on a claimed controller or a
/// busy bus.
#[derive(Copy, Clone)]
pub struct I2cControl {
    pub enable: fn(u32),
    pub wfi: fn(u32),
    pub now: fn() -> u64,
    pub relax: fn(),
}
