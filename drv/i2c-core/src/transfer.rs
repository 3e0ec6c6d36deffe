// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-wise transfer state machine.
//!
//! One `TransferState` walks one request -- an ordered array of messages
//! toward a single target -- across the hardware primitives.  The machine is
//! stepped once per completed hardware event: each call to [`TransferState::step`]
//! consumes one interpreted status word and issues at most one new bus
//! operation, so the caller owns the waiting and the deadline.
//!
//! Message chaining follows the usual rules: a repeated START is driven
//! between messages when the direction changes or the next message asks for
//! one explicitly; same-direction messages otherwise continue on the wire as
//! a single transaction.  A mid-request STOP ends the transaction and the
//! following message begins with a plain START on the then-idle bus.
//!
//! The delicate part is read ACK arming.  The data-register fetch is what
//! clocks the next byte in, so the disposition governing a byte must be
//! armed before the fetch that triggers it -- and on hardware where the
//! disposition register takes effect a byte late (`Capabilities::early_nack`)
//! the arming happens one fetch earlier still.  Both flavors reduce to a
//! remaining-byte threshold, computed over the whole read chain so that
//! chained read messages see ACKs on every byte but the last of the chain.

use crate::hardware::{Ack, BusStatus, Capabilities, I2cHardware};
use drv_i2c_api::{Direction, Message, MessageBuf, MessageFlags, ResponseCode};
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Start { addr_byte: u8, repeated: bool },
    Tx(u8),
    Rx(u8),
    Arm(Ack),
    NextMessage(u8),
    Stop,
    Error(ResponseCode),
}

ringbuf!(Trace, 64, Trace::None);

/// Where the engine stands relative to the wire; decides whether the next
/// START is plain or repeated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelStatus {
    /// The bus is not owned; the next START is a plain one.
    Normal,
    /// The bus is owned between messages; the next START is repeated.
    RepeatStart,
    /// Reception has been armed and the first fetch issued.
    WaitingForRead,
    /// The bus is owned and a same-direction continuation is in flight.
    WaitingForNext,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase {
    /// No operation outstanding; a START needs issuing.
    Start,
    /// An address byte is on the wire.
    AwaitAck,
    /// Data bytes are moving.
    Data,
    /// A STOP is on the wire.
    AwaitStop,
    Done,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// An operation is outstanding; wait for its completion and step again.
    Pending,
    /// The request has ended; consult [`TransferState::error`].
    Complete,
}

pub struct TransferState {
    caps: Capabilities,
    msg_index: usize,
    byte_index: usize,
    channel: ChannelStatus,
    phase: Phase,
    error: Option<ResponseCode>,
}

/// The final message of a request always ends with a STOP, whether or not
/// the caller flagged it; the bus is never left owned across requests.
fn effective_stop(msgs: &[Message<'_>], index: usize) -> bool {
    msgs[index].flags.contains(MessageFlags::STOP) || index == msgs.len() - 1
}

fn store_byte(msg: &mut Message<'_>, index: usize, byte: u8) {
    if let MessageBuf::Read(buf) = &mut msg.body {
        buf[index] = byte;
    }
}

impl TransferState {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            msg_index: 0,
            byte_index: 0,
            channel: ChannelStatus::Normal,
            phase: Phase::Start,
            error: None,
        }
    }

    /// The sticky, first-reported error of the request, if any.
    pub fn error(&self) -> Option<ResponseCode> {
        self.error
    }

    /// Issues the request's first operation.  Call once, before the first
    /// completed event is fed to [`step`](Self::step).
    pub fn begin<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        addr: u8,
        msgs: &[Message<'_>],
    ) {
        self.issue_start(hw, addr, msgs);
    }

    /// Consumes one completed hardware event and issues at most one new
    /// operation.
    pub fn step<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        addr: u8,
        msgs: &mut [Message<'_>],
        status: BusStatus,
    ) -> StepOutcome {
        //
        // Bus-level failures end the request on the spot, in whatever phase
        // they land: the controller state machine is no longer trustworthy,
        // so no closing STOP is attempted.  The orchestrator resets the
        // controller on the way out.
        //
        if status.contains(BusStatus::ARB_LOST) {
            return self.die(ResponseCode::BusReset);
        }
        if status.contains(BusStatus::BUS_ERROR) {
            return self.die(ResponseCode::BusError);
        }

        match self.phase {
            Phase::Start => {
                self.issue_start(hw, addr, msgs);
                StepOutcome::Pending
            }

            Phase::AwaitAck => {
                if !status.contains(BusStatus::ACK) {
                    // Nobody answered the address.
                    return self.fail(hw, ResponseCode::NoDevice);
                }

                match msgs[self.msg_index].direction() {
                    Direction::Write => {
                        if self.byte_index < msgs[self.msg_index].len() {
                            self.transmit_next(hw, msgs);
                            StepOutcome::Pending
                        } else {
                            // Zero-length probe: the ACK was the payload.
                            self.advance(hw, addr, msgs)
                        }
                    }
                    Direction::Read => {
                        let remaining = self.chain_remaining(msgs);
                        self.arm(hw, remaining);

                        // The data-register fetch starts reception; the
                        // byte it returns is stale and discarded.
                        let _ = hw.receive_byte();
                        self.channel = ChannelStatus::WaitingForRead;
                        self.phase = Phase::Data;
                        StepOutcome::Pending
                    }
                }
            }

            Phase::Data => match msgs[self.msg_index].direction() {
                Direction::Write => {
                    if !status.contains(BusStatus::ACK) {
                        // A data byte was refused: the device is there but
                        // rejected what we sent.
                        return self.fail(hw, ResponseCode::NoRegister);
                    }
                    if self.byte_index < msgs[self.msg_index].len() {
                        self.transmit_next(hw, msgs);
                        StepOutcome::Pending
                    } else {
                        self.advance(hw, addr, msgs)
                    }
                }
                Direction::Read => {
                    // A byte is sitting in the data register.  Arm for what
                    // the fetch will clock before fetching.
                    let after = self.chain_remaining(msgs) - 1;
                    if after > 0 {
                        self.arm(hw, after);
                    }

                    let byte = hw.receive_byte();
                    ringbuf_entry!(Trace::Rx(byte));
                    store_byte(&mut msgs[self.msg_index], self.byte_index, byte);
                    self.byte_index += 1;

                    if self.byte_index == msgs[self.msg_index].len() {
                        self.advance(hw, addr, msgs)
                    } else {
                        StepOutcome::Pending
                    }
                }
            },

            Phase::AwaitStop => {
                if self.error.is_some() {
                    self.phase = Phase::Done;
                    return StepOutcome::Complete;
                }
                if self.msg_index + 1 < msgs.len() {
                    // A mid-request STOP completed; the next message opens
                    // with a plain START on the now-idle bus.
                    self.msg_index += 1;
                    self.byte_index = 0;
                    self.channel = ChannelStatus::Normal;
                    self.issue_start(hw, addr, msgs);
                    StepOutcome::Pending
                } else {
                    self.phase = Phase::Done;
                    StepOutcome::Complete
                }
            }

            Phase::Done => StepOutcome::Complete,
        }
    }

    fn issue_start<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        addr: u8,
        msgs: &[Message<'_>],
    ) {
        let dir = msgs[self.msg_index].direction();

        if dir == Direction::Read {
            // On early-NACK hardware the disposition latched at START
            // governs the first byte directly, so a single-byte read must
            // be armed before the START goes out.  On immediate hardware
            // this value is overwritten before the first fetch.
            let ack = if self.chain_remaining(msgs) == 1 {
                Ack::Nack
            } else {
                Ack::Ack
            };
            ringbuf_entry!(Trace::Arm(ack));
            hw.prime_ack(ack);
        }

        let addr_byte = dir.address_byte(addr);
        let repeated = self.channel == ChannelStatus::RepeatStart;
        ringbuf_entry!(Trace::Start { addr_byte, repeated });
        hw.assert_start(addr_byte, repeated);
        self.phase = Phase::AwaitAck;
    }

    fn transmit_next<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        msgs: &[Message<'_>],
    ) {
        let byte = match &msgs[self.msg_index].body {
            MessageBuf::Write(buf) => buf[self.byte_index],
            MessageBuf::Read(_) => return,
        };
        ringbuf_entry!(Trace::Tx(byte));
        hw.transmit_byte(byte);
        self.byte_index += 1;
        self.phase = Phase::Data;
    }

    /// Arms the read disposition given how many bytes of the read chain are
    /// not yet fetched, counting the one the armed value will come to
    /// govern.  The threshold folds in the one-byte register latency of
    /// early-NACK hardware.
    fn arm<H: I2cHardware>(&mut self, hw: &mut H, remaining: usize) {
        let threshold = if self.caps.early_nack { 2 } else { 1 };
        let ack = if remaining <= threshold {
            Ack::Nack
        } else {
            Ack::Ack
        };
        ringbuf_entry!(Trace::Arm(ack));
        hw.prime_ack(ack);
    }

    /// Bytes of the current read chain not yet fetched, starting at the
    /// cursor and spanning forward through same-direction continuation
    /// messages (no STOP behind them, no RESTART ahead of them).
    fn chain_remaining(&self, msgs: &[Message<'_>]) -> usize {
        let mut total = msgs[self.msg_index].len() - self.byte_index;
        let mut i = self.msg_index;

        while !effective_stop(msgs, i) {
            let next = &msgs[i + 1];
            if next.direction() != Direction::Read
                || next.flags.contains(MessageFlags::RESTART)
            {
                break;
            }
            total += next.len();
            i += 1;
        }
        total
    }

    /// The current message is exhausted; figure out what the wire needs
    /// next.
    fn advance<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        addr: u8,
        msgs: &[Message<'_>],
    ) -> StepOutcome {
        loop {
            if effective_stop(msgs, self.msg_index) {
                ringbuf_entry!(Trace::Stop);
                hw.assert_stop();
                self.channel = ChannelStatus::Normal;
                self.phase = Phase::AwaitStop;
                return StepOutcome::Pending;
            }

            // Not a stop, so a next message exists.
            let dir = msgs[self.msg_index].direction();
            let next = &msgs[self.msg_index + 1];
            let needs_start = next.flags.contains(MessageFlags::RESTART)
                || next.direction() != dir;

            self.msg_index += 1;
            self.byte_index = 0;
            ringbuf_entry!(Trace::NextMessage(self.msg_index as u8));

            if needs_start {
                self.channel = ChannelStatus::RepeatStart;
                self.issue_start(hw, addr, msgs);
                return StepOutcome::Pending;
            }

            match msgs[self.msg_index].direction() {
                Direction::Write => {
                    if msgs[self.msg_index].is_empty() {
                        // Nothing on the wire for this one; keep going.
                        continue;
                    }
                    self.transmit_next(hw, msgs);
                    return StepOutcome::Pending;
                }
                Direction::Read => {
                    // Reception rolls on: the fetch that drained the last
                    // byte already clocked this message's first, and the
                    // chain arithmetic armed it correctly.
                    self.channel = ChannelStatus::WaitingForNext;
                    self.phase = Phase::Data;
                    return StepOutcome::Pending;
                }
            }
        }
    }

    /// Protocol-level failure: record it and close the transaction with a
    /// STOP so the bus is released.
    fn fail<H: I2cHardware>(
        &mut self,
        hw: &mut H,
        code: ResponseCode,
    ) -> StepOutcome {
        ringbuf_entry!(Trace::Error(code));
        if self.error.is_none() {
            self.error = Some(code);
        }
        hw.assert_stop();
        self.channel = ChannelStatus::Normal;
        self.phase = Phase::AwaitStop;
        StepOutcome::Pending
    }

    /// Bus-level failure: the controller cannot be asked for anything more,
    /// not even a STOP.
    fn die(&mut self, code: ResponseCode) -> StepOutcome {
        ringbuf_entry!(Trace::Error(code));
        if self.error.is_none() {
            self.error = Some(code);
        }
        self.channel = ChannelStatus::Normal;
        self.phase = Phase::Done;
        StepOutcome::Complete
    }
}
