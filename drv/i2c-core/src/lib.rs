// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller-mode I2C transfer engine.
//!
//! This crate contains the chip-independent half of an I2C controller
//! driver: request validation, controller exclusion, pre-flight bus checks,
//! the transfer state machine, strategy selection between byte-wise and
//! FIFO-sequenced execution, deadline enforcement, and bus recovery.  The
//! chip-dependent half lives behind [`I2cHardware`], implemented once per
//! controller family over its register block.
//!
//! The entry point is [`I2cController`]: construct one per controller
//! instance, `init()` it, and call [`transfer`](I2cController::transfer)
//! with a message array.  A controller is made to be shared -- every method
//! takes `&self`, and internal claiming serializes callers so that each
//! request runs whole on the wire.

#![cfg_attr(target_os = "none", no_std)]

mod claim;
pub mod hardware;
mod recovery;
mod transfer;

pub use hardware::{Ack, BusStatus, Capabilities, I2cControl, I2cHardware};

use claim::ClaimCell;
use drv_i2c_api::{
    Controller, Direction, Message, MessageBuf, MessageFlags, Mode,
    ReservedAddress, ResponseCode, Speed,
};
use ringbuf::{ringbuf, ringbuf_entry};
use transfer::{StepOutcome, TransferState};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Transfer { addr: u8, msgs: u8 },
    Strategy(Strategy),
    Configure(Speed),
    BusyWait,
    Recovering,
    Timeout,
    ResetAfter(ResponseCode),
    Done,
    Error(ResponseCode),
}

ringbuf!(Trace, 64, Trace::None);

/// Deadline for one transfer, measured from when the controller claim is
/// acquired.
const DEFAULT_TIMEOUT_MS: u64 = 100;

/// How long a transfer will wait out a controller that reports busy before
/// concluding it is wedged.
const BUSY_GRACE_MS: u64 = 10;

/// What `transfer()` does with an empty message array.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EmptyTransferPolicy {
    /// Succeed without touching the bus.
    Noop,
    /// Fail with [`ResponseCode::BadArg`].
    Reject,
}

/// Per-controller policy knobs, fixed at construction.
#[derive(Copy, Clone, Debug)]
pub struct I2cConfig {
    /// Bus speed programmed by `init()`; `configure()` can change it later.
    pub speed: Speed,
    pub timeout_ms: u64,
    pub empty_policy: EmptyTransferPolicy,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            speed: Speed::Standard,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            empty_policy: EmptyTransferPolicy::Noop,
        }
    }
}

/// Snapshot returned by [`I2cController::get_config`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CurrentConfig {
    pub mode: Mode,
    pub speed: Speed,
    /// The divider value the hardware reported programming, for read-back
    /// verification.
    pub divider: u32,
}

struct Inner<H> {
    hw: H,
    /// Speed and divider from the last successful `configure()`.
    configured: Option<(Speed, u32)>,
}

/// One I2C controller instance.
pub struct I2cController<H: I2cHardware> {
    pub controller: Controller,
    pub notification: u32,
    config: I2cConfig,
    ctrl: I2cControl,
    inner: ClaimCell<Inner<H>>,
}

/// Execution strategy for one request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Strategy {
    /// Step the state machine one bus event at a time.
    ByteWise,
    /// Hand whole message payloads to the hardware sequencer.
    Fifo,
}

/// A request is FIFO-eligible when the hardware has a FIFO, the shape is
/// one the sequencer expresses directly -- a lone write, a lone read, or a
/// write-then-read joined by a repeated START -- and every payload is
/// non-empty and fits the FIFO whole.  Everything else, including
/// zero-length probes, takes the byte-wise path.  The two paths must be
/// indistinguishable from the caller's side.
fn select_strategy(caps: &Capabilities, msgs: &[Message<'_>]) -> Strategy {
    let Some(depth) = caps.fifo_depth else {
        return Strategy::ByteWise;
    };
    let fits = |m: &Message<'_>| !m.is_empty() && m.len() <= depth;

    match msgs {
        [m] if fits(m) => Strategy::Fifo,
        [w, r]
            if w.direction() == Direction::Write
                && r.direction() == Direction::Read
                && fits(w)
                && fits(r)
                && !w.flags.contains(MessageFlags::STOP) =>
        {
            Strategy::Fifo
        }
        _ => Strategy::ByteWise,
    }
}

fn validate(addr: u8, msgs: &[Message<'_>]) -> Result<(), ResponseCode> {
    if addr > 0x7f {
        return Err(ResponseCode::BadArg);
    }
    if ReservedAddress::is_reserved(addr) {
        return Err(ResponseCode::ReservedAddress);
    }
    for msg in msgs {
        if msg.flags.contains(MessageFlags::ADDR_10BIT) {
            return Err(ResponseCode::OperationNotSupported);
        }
        // A zero-length read has no byte on which the closing NACK could
        // land; there is no way to express it on the wire.
        if msg.direction() == Direction::Read && msg.is_empty() {
            return Err(ResponseCode::BadArg);
        }
    }
    Ok(())
}

/// Maps a completed FIFO transaction's status to an outcome, mirroring the
/// byte-wise machine's classification: an address-phase NACK is a missing
/// device, a data-phase NACK a refused byte.
fn fifo_outcome(status: BusStatus) -> Result<(), ResponseCode> {
    if status.contains(BusStatus::ARB_LOST) {
        Err(ResponseCode::BusReset)
    } else if status.contains(BusStatus::BUS_ERROR) {
        Err(ResponseCode::BusError)
    } else if status.contains(BusStatus::ACK) {
        Ok(())
    } else if status.contains(BusStatus::ADDR_NACK) {
        Err(ResponseCode::NoDevice)
    } else {
        Err(ResponseCode::NoRegister)
    }
}

impl<H: I2cHardware> I2cController<H> {
    pub const fn new(
        controller: Controller,
        notification: u32,
        ctrl: I2cControl,
        config: I2cConfig,
        hw: H,
    ) -> Self {
        Self {
            controller,
            notification,
            config,
            ctrl,
            inner: ClaimCell::new(Inner {
                hw,
                configured: None,
            }),
        }
    }

    /// Resets the controller and configures it at the default speed.
    pub fn init(&self) -> Result<(), ResponseCode> {
        {
            let mut inner = self.inner.claim(self.ctrl.relax);
            inner.hw.reset();
            inner.configured = None;
        }
        self.configure(Mode::Controller, self.config.speed)
    }

    /// Applies bus timing for `speed`.  Idempotent; reconfiguring at the
    /// same speed programs the same divider.  Target mode is refused: this
    /// engine drives the bus, it does not answer on it.
    pub fn configure(
        &self,
        mode: Mode,
        speed: Speed,
    ) -> Result<(), ResponseCode> {
        if mode == Mode::Target {
            return Err(ResponseCode::OperationNotSupported);
        }

        let mut inner = self.inner.claim(self.ctrl.relax);
        if speed as u8 > inner.hw.capabilities().max_speed as u8 {
            return Err(ResponseCode::OperationNotSupported);
        }

        let divider = inner.hw.apply_timing(speed);
        ringbuf_entry!(Trace::Configure(speed));
        inner.configured = Some((speed, divider));
        Ok(())
    }

    /// Reports the operating mode, speed, and programmed divider.
    pub fn get_config(&self) -> Result<CurrentConfig, ResponseCode> {
        let inner = self.inner.claim(self.ctrl.relax);
        let (speed, divider) =
            inner.configured.ok_or(ResponseCode::NotConfigured)?;
        Ok(CurrentConfig {
            mode: Mode::Controller,
            speed,
            divider,
        })
    }

    pub fn target_register(&self, _addr: u8) -> Result<(), ResponseCode> {
        Err(ResponseCode::OperationNotSupported)
    }

    pub fn target_unregister(&self, _addr: u8) -> Result<(), ResponseCode> {
        Err(ResponseCode::OperationNotSupported)
    }

    /// Runs bus recovery on demand, e.g. after external evidence of a
    /// wedged target.
    pub fn recover_bus(&self) -> Result<(), ResponseCode> {
        let mut inner = self.inner.claim(self.ctrl.relax);
        ringbuf_entry!(Trace::Recovering);
        recovery::recover_bus(&mut inner.hw, &self.ctrl)
    }

    /// Executes one request: the messages in `msgs`, in order, toward the
    /// 7-bit address `addr`.  Read buffers are filled in place.  The whole
    /// request runs under one claim of the controller and one deadline;
    /// either every message completes or the first failure's code is
    /// returned with the bus released.
    pub fn transfer(
        &self,
        addr: u8,
        msgs: &mut [Message<'_>],
    ) -> Result<(), ResponseCode> {
        if msgs.is_empty() {
            return match self.config.empty_policy {
                EmptyTransferPolicy::Noop => Ok(()),
                EmptyTransferPolicy::Reject => Err(ResponseCode::BadArg),
            };
        }
        validate(addr, msgs)?;

        let mut inner = self.inner.claim(self.ctrl.relax);
        let inner = &mut *inner;
        if inner.configured.is_none() {
            return Err(ResponseCode::NotConfigured);
        }

        ringbuf_entry!(Trace::Transfer {
            addr,
            msgs: msgs.len() as u8,
        });

        // The clock starts once we hold the controller, not while queued
        // behind other clients.
        let deadline = (self.ctrl.now)() + self.config.timeout_ms;

        let r = match self.preflight(&mut inner.hw) {
            Ok(()) => {
                let caps = inner.hw.capabilities();
                let strategy = select_strategy(&caps, msgs);
                ringbuf_entry!(Trace::Strategy(strategy));
                match strategy {
                    Strategy::Fifo => {
                        self.run_fifo(&mut inner.hw, addr, msgs, deadline)
                    }
                    Strategy::ByteWise => {
                        self.run_bytewise(&mut inner.hw, addr, msgs, deadline)
                    }
                }
            }
            Err(code) => Err(code),
        };

        match r {
            Ok(()) => {
                ringbuf_entry!(Trace::Done);
                Ok(())
            }
            Err(code) => {
                self.reset_if_needed(&mut inner.hw, code);
                ringbuf_entry!(Trace::Error(code));
                Err(code)
            }
        }
    }

    /// Checks that the controller and the bus are fit for a transfer: waits
    /// out a briefly busy controller, and if the lines are not idle, makes
    /// one recovery attempt before giving up.
    fn preflight(&self, hw: &mut H) -> Result<(), ResponseCode> {
        let grace = (self.ctrl.now)() + BUSY_GRACE_MS;
        while hw.poll_status().contains(BusStatus::BUSY) {
            if (self.ctrl.now)() >= grace {
                return Err(ResponseCode::ControllerBusy);
            }
            ringbuf_entry!(Trace::BusyWait);
            (self.ctrl.relax)();
        }

        if hw.sample_sda() && hw.sample_scl() {
            return Ok(());
        }

        ringbuf_entry!(Trace::Recovering);
        recovery::recover_bus(hw, &self.ctrl)?;

        if hw.sample_sda() && hw.sample_scl() {
            Ok(())
        } else {
            Err(ResponseCode::BusLocked)
        }
    }

    /// Blocks until the outstanding bus operation completes, fails, or the
    /// request's deadline passes.
    fn wait_event(
        &self,
        hw: &mut H,
        deadline: u64,
    ) -> Result<BusStatus, ResponseCode> {
        loop {
            let status = hw.poll_status();
            if status.intersects(
                BusStatus::DONE | BusStatus::BUS_ERROR | BusStatus::ARB_LOST,
            ) {
                return Ok(status);
            }
            if (self.ctrl.now)() >= deadline {
                ringbuf_entry!(Trace::Timeout);
                return Err(ResponseCode::BusTimeout);
            }
            (self.ctrl.enable)(self.notification);
            (self.ctrl.wfi)(self.notification);
        }
    }

    fn run_bytewise(
        &self,
        hw: &mut H,
        addr: u8,
        msgs: &mut [Message<'_>],
        deadline: u64,
    ) -> Result<(), ResponseCode> {
        let mut state = TransferState::new(hw.capabilities());
        state.begin(hw, addr, msgs);

        loop {
            let status = self.wait_event(hw, deadline)?;
            match state.step(hw, addr, msgs, status) {
                StepOutcome::Pending => continue,
                StepOutcome::Complete => break,
            }
        }

        match state.error() {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn run_fifo(
        &self,
        hw: &mut H,
        addr: u8,
        msgs: &mut [Message<'_>],
        deadline: u64,
    ) -> Result<(), ResponseCode> {
        match msgs {
            [m] => match &mut m.body {
                MessageBuf::Write(buf) => {
                    self.fifo_write(hw, addr, buf, true, deadline)
                }
                MessageBuf::Read(buf) => {
                    self.fifo_read(hw, addr, buf, deadline)
                }
            },
            [w, r] => {
                let wbuf = match &w.body {
                    MessageBuf::Write(buf) => *buf,
                    MessageBuf::Read(_) => return Err(ResponseCode::BadArg),
                };
                self.fifo_write(hw, addr, wbuf, false, deadline)?;

                let rbuf = match &mut r.body {
                    MessageBuf::Read(buf) => &mut **buf,
                    MessageBuf::Write(_) => return Err(ResponseCode::BadArg),
                };
                self.fifo_read(hw, addr, rbuf, deadline)
            }
            _ => Err(ResponseCode::BadArg),
        }
    }

    fn fifo_write(
        &self,
        hw: &mut H,
        addr: u8,
        buf: &[u8],
        stop: bool,
        deadline: u64,
    ) -> Result<(), ResponseCode> {
        if hw.fifo_push(buf) < buf.len() {
            // Eligibility should have prevented this.
            return Err(ResponseCode::BadArg);
        }
        hw.start_fifo(Direction::Write.address_byte(addr), buf.len(), stop);
        let status = self.wait_event(hw, deadline)?;
        fifo_outcome(status)
    }

    fn fifo_read(
        &self,
        hw: &mut H,
        addr: u8,
        buf: &mut [u8],
        deadline: u64,
    ) -> Result<(), ResponseCode> {
        hw.start_fifo(Direction::Read.address_byte(addr), buf.len(), true);
        let status = self.wait_event(hw, deadline)?;
        fifo_outcome(status)?;

        if hw.fifo_pop(buf) < buf.len() {
            return Err(ResponseCode::BusError);
        }
        Ok(())
    }

    /// After a failure that implicates the controller state machine itself,
    /// reset it so the next request starts clean.  Recovery-originated
    /// codes are excluded: recovery resets on its own way out.
    fn reset_if_needed(&self, hw: &mut H, code: ResponseCode) {
        match code {
            ResponseCode::BusReset
            | ResponseCode::BusError
            | ResponseCode::BusTimeout
            | ResponseCode::ControllerBusy => {
                ringbuf_entry!(Trace::ResetAfter(code));
                hw.reset();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(fifo_depth: Option<usize>) -> Capabilities {
        Capabilities {
            fifo_depth,
            early_nack: false,
            max_speed: Speed::FastPlus,
        }
    }

    #[test]
    fn strategy_requires_a_fifo() {
        let msgs = [Message::write(&[1, 2, 3])];
        assert_eq!(select_strategy(&caps(None), &msgs), Strategy::ByteWise);
        assert_eq!(select_strategy(&caps(Some(16)), &msgs), Strategy::Fifo);
    }

    #[test]
    fn strategy_single_messages() {
        let mut buf = [0u8; 8];
        let msgs = [Message::read(&mut buf)];
        assert_eq!(select_strategy(&caps(Some(16)), &msgs), Strategy::Fifo);

        // Payload larger than the FIFO.
        let big = [0u8; 32];
        let msgs = [Message::write(&big)];
        assert_eq!(
            select_strategy(&caps(Some(16)), &msgs),
            Strategy::ByteWise
        );

        // Zero-length probes go byte-wise.
        let msgs = [Message::write(&[])];
        assert_eq!(
            select_strategy(&caps(Some(16)), &msgs),
            Strategy::ByteWise
        );
    }

    #[test]
    fn strategy_write_then_read() {
        let mut buf = [0u8; 4];
        let msgs = [Message::write(&[0x10]), Message::read(&mut buf)];
        assert_eq!(select_strategy(&caps(Some(16)), &msgs), Strategy::Fifo);

        // An intervening STOP breaks the sequencer shape.
        let mut buf = [0u8; 4];
        let msgs = [
            Message::write(&[0x10]).with_flags(MessageFlags::STOP),
            Message::read(&mut buf),
        ];
        assert_eq!(
            select_strategy(&caps(Some(16)), &msgs),
            Strategy::ByteWise
        );

        // Three messages never fit the sequencer.
        let mut buf = [0u8; 4];
        let msgs = [
            Message::write(&[0x10]),
            Message::write(&[0x11]),
            Message::read(&mut buf),
        ];
        assert_eq!(
            select_strategy(&caps(Some(16)), &msgs),
            Strategy::ByteWise
        );
    }

    #[test]
    fn validation() {
        assert_eq!(
            validate(0x80, &[Message::write(&[0])]),
            Err(ResponseCode::BadArg)
        );
        assert_eq!(
            validate(0x00, &[Message::write(&[0])]),
            Err(ResponseCode::ReservedAddress)
        );
        assert_eq!(
            validate(0x7c, &[Message::write(&[0])]),
            Err(ResponseCode::ReservedAddress)
        );

        let mut buf = [];
        assert_eq!(
            validate(0x50, &[Message::read(&mut buf)]),
            Err(ResponseCode::BadArg)
        );

        let msgs =
            [Message::write(&[0]).with_flags(MessageFlags::ADDR_10BIT)];
        assert_eq!(
            validate(0x50, &msgs),
            Err(ResponseCode::OperationNotSupported)
        );

        assert_eq!(validate(0x50, &[Message::write(&[])]), Ok(()));
    }
}
