// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated I2C controller and bus for host-side testing.
//!
//! [`MockBus`] models the wire: scripted target devices, a log of every
//! observable bus event, and knobs for injecting the faults the engine has
//! to survive (held SDA, a wedged controller, arbitration loss, stalls).
//! [`MockController`] implements [`I2cHardware`] over that bus, with a
//! selectable personality: with or without a FIFO, and with immediate or
//! byte-delayed ACK-disposition latching.
//!
//! The delayed personality is the interesting one.  It models hardware that
//! clocks ahead of software: the disposition register written while byte
//! `k` is in hand governs byte `k+2`, not `k+1`, and the value held at
//! START governs the first byte.  A correct engine produces an identical
//! event log against both personalities.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use drv_i2c_api::{Direction, Speed};
use drv_i2c_core::{Ack, BusStatus, Capabilities, I2cControl, I2cHardware};

/// A deterministic, thread-local millisecond clock, advanced by the
/// environment hooks themselves so that time moves exactly when the engine
/// waits.  Thread-local so parallel tests cannot race each other's time.
pub mod clock {
    use drv_i2c_core::I2cControl;
    use std::cell::Cell;

    thread_local! {
        static NOW: Cell<u64> = const { Cell::new(0) };
    }

    pub fn now() -> u64 {
        NOW.with(|t| t.get())
    }

    pub fn advance(ms: u64) {
        NOW.with(|t| t.set(t.get() + ms));
    }

    /// Environment hooks for tests: `wfi` and `relax` each cost one
    /// millisecond of simulated time, interrupt enabling is a no-op.
    pub fn control() -> I2cControl {
        I2cControl {
            enable: |_| {},
            wfi: |_| advance(1),
            now,
            relax: || advance(1),
        }
    }
}

/// Everything a bus observer would see, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Start { addr_byte: u8, repeated: bool },
    Write { byte: u8, acked: bool },
    Read { byte: u8, nacked: bool },
    Stop,
    RecoveryPulse,
    RecoveryStop,
    Reset,
}

/// One scripted target device.
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    pub addr: u8,
    /// Whether the device ACKs its address.
    pub present: bool,
    /// If set, NACK the Nth data byte (zero-based) of any write.
    pub write_nack_at: Option<usize>,
    /// Bytes returned on reads, then 0xff filler once exhausted.
    pub read_data: Vec<u8>,
}

impl DeviceSpec {
    pub fn new(addr: u8) -> Self {
        Self {
            addr,
            present: true,
            write_nack_at: None,
            read_data: Vec::new(),
        }
    }
}

/// A fault injected at the next START.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    ArbitrationLost,
    BusError,
}

#[derive(Debug)]
struct Device {
    spec: DeviceSpec,
    read_cursor: usize,
    written: Vec<u8>,
}

impl Device {
    fn next_read_byte(&mut self) -> u8 {
        let byte = self
            .spec
            .read_data
            .get(self.read_cursor)
            .copied()
            .unwrap_or(0xff);
        self.read_cursor += 1;
        byte
    }
}

#[derive(Debug, Default)]
struct Shared {
    devices: Vec<Device>,
    events: Vec<Event>,
    /// While nonzero, SDA samples low; each recovery SCL pulse decrements.
    sda_pulses_needed: u8,
    /// Number of upcoming status polls that report a busy controller.
    busy_polls: u32,
    /// While set, issued operations never complete.
    stall: bool,
    inject: Option<Fault>,
}

impl Shared {
    fn device_mut(&mut self, addr: u8) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.spec.addr == addr)
    }
}

/// The shared wire: build one, attach a controller, script some devices.
#[derive(Clone, Default)]
pub struct MockBus {
    shared: Arc<Mutex<Shared>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    pub fn add_device(&self, spec: DeviceSpec) {
        self.lock().devices.push(Device {
            spec,
            read_cursor: 0,
            written: Vec::new(),
        });
    }

    /// Attaches a controller with the given personality.
    pub fn controller(&self, caps: Capabilities) -> MockController {
        MockController {
            shared: Arc::clone(&self.shared),
            caps,
            pending: None,
            armed: Ack::Ack,
            pipeline: Ack::Ack,
            xfer: None,
            fifo: VecDeque::new(),
            divider: None,
            owned: false,
            bitbang: false,
            scl: true,
            sda: true,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Everything successfully written to the device at `addr`.
    pub fn written_to(&self, addr: u8) -> Vec<u8> {
        self.lock()
            .device_mut(addr)
            .map(|d| d.written.clone())
            .unwrap_or_default()
    }

    /// Holds SDA low until `pulses` recovery clocks have been driven.  More
    /// than nine means recovery cannot succeed.
    pub fn hold_sda_low(&self, pulses: u8) {
        self.lock().sda_pulses_needed = pulses;
    }

    /// Makes the controller report busy for the next `polls` status polls.
    pub fn set_busy_polls(&self, polls: u32) {
        self.lock().busy_polls = polls;
    }

    /// While stalled, issued operations never complete.
    pub fn set_stall(&self, stall: bool) {
        self.lock().stall = stall;
    }

    /// Arranges for the next START to fail with `fault`.
    pub fn inject_fault(&self, fault: Fault) {
        self.lock().inject = Some(fault);
    }
}

struct Xfer {
    addr: u8,
    dir: Direction,
    /// The byte clocked in and whether the controller NACKed it.
    data_reg: Option<(u8, bool)>,
    write_count: usize,
}

/// An [`I2cHardware`] implementation over a [`MockBus`].
pub struct MockController {
    shared: Arc<Mutex<Shared>>,
    caps: Capabilities,
    pending: Option<BusStatus>,
    armed: Ack,
    /// Delayed disposition for the early-NACK personality: the value that
    /// will govern the next byte clocked, refreshed from `armed` one byte
    /// behind software.
    pipeline: Ack,
    xfer: Option<Xfer>,
    fifo: VecDeque<u8>,
    divider: Option<u32>,
    /// A sequenced transaction ended without a STOP, so the bus is still
    /// owned and the next sequenced START is repeated.
    owned: bool,
    bitbang: bool,
    scl: bool,
    sda: bool,
}

/// Common personalities, for tests.
pub fn byte_personality() -> Capabilities {
    Capabilities {
        fifo_depth: None,
        early_nack: false,
        max_speed: Speed::FastPlus,
    }
}

pub fn early_nack_personality() -> Capabilities {
    Capabilities {
        fifo_depth: None,
        early_nack: true,
        max_speed: Speed::FastPlus,
    }
}

pub fn fifo_personality(depth: usize) -> Capabilities {
    Capabilities {
        fifo_depth: Some(depth),
        early_nack: false,
        max_speed: Speed::FastPlus,
    }
}

impl MockController {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    /// The divider last programmed by `apply_timing`, for tests that check
    /// timing was actually applied.
    pub fn divider(&self) -> Option<u32> {
        self.divider
    }

    fn complete(&mut self, status: BusStatus) {
        let stalled = self.lock().stall;
        if !stalled {
            self.pending = Some(status);
        }
    }

    /// Clocks one read byte off the wire into the data register.
    fn clock_read_byte(&mut self) {
        let Some(xfer) = &mut self.xfer else { return };
        let addr = xfer.addr;
        let disposition = if self.caps.early_nack {
            let d = self.pipeline;
            self.pipeline = self.armed;
            d
        } else {
            self.armed
        };
        let nacked = disposition == Ack::Nack;

        let mut shared = self.shared.lock().unwrap();
        let byte = match shared.device_mut(addr) {
            Some(dev) => dev.next_read_byte(),
            None => 0xff,
        };
        shared.events.push(Event::Read { byte, nacked });
        let stalled = shared.stall;
        drop(shared);

        if let Some(xfer) = &mut self.xfer {
            xfer.data_reg = Some((byte, nacked));
        }
        if !stalled {
            self.pending = Some(BusStatus::DONE | BusStatus::ACK);
        }
    }

    fn take_fault(&mut self) -> Option<BusStatus> {
        match self.lock().inject.take() {
            Some(Fault::ArbitrationLost) => Some(BusStatus::ARB_LOST),
            Some(Fault::BusError) => Some(BusStatus::BUS_ERROR),
            None => None,
        }
    }
}

impl I2cHardware for MockController {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn assert_start(&mut self, addr_byte: u8, repeated: bool) {
        self.lock()
            .events
            .push(Event::Start { addr_byte, repeated });

        if let Some(fault) = self.take_fault() {
            self.xfer = None;
            self.complete(fault);
            return;
        }

        let addr = addr_byte >> 1;
        let dir = if addr_byte & 1 == 0 {
            Direction::Write
        } else {
            Direction::Read
        };
        let present = self
            .lock()
            .device_mut(addr)
            .map(|d| d.spec.present)
            .unwrap_or(false);

        if !present {
            self.xfer = None;
            self.complete(BusStatus::DONE | BusStatus::ADDR_NACK);
            return;
        }

        if dir == Direction::Read {
            // The disposition held at START is what a clock-ahead chip
            // applies to the first byte.
            self.pipeline = self.armed;
        }
        self.xfer = Some(Xfer {
            addr,
            dir,
            data_reg: None,
            write_count: 0,
        });
        self.complete(BusStatus::DONE | BusStatus::ACK);
    }

    fn transmit_byte(&mut self, byte: u8) {
        let Some(xfer) = &mut self.xfer else { return };
        let addr = xfer.addr;
        let count = xfer.write_count;
        xfer.write_count += 1;

        let mut shared = self.shared.lock().unwrap();
        let acked = match shared.device_mut(addr) {
            Some(dev) => {
                let acked = dev.spec.write_nack_at != Some(count);
                if acked {
                    dev.written.push(byte);
                }
                acked
            }
            None => false,
        };
        shared.events.push(Event::Write { byte, acked });
        drop(shared);

        self.complete(if acked {
            BusStatus::DONE | BusStatus::ACK
        } else {
            BusStatus::DONE
        });
    }

    fn prime_ack(&mut self, ack: Ack) {
        self.armed = ack;
    }

    fn receive_byte(&mut self) -> u8 {
        let reg = match &mut self.xfer {
            Some(xfer) if xfer.dir == Direction::Read => xfer.data_reg.take(),
            _ => return 0,
        };

        match reg {
            None => {
                // Fetch with an empty register: this is what starts
                // reception rolling.
                self.clock_read_byte();
                0
            }
            Some((byte, nacked)) => {
                if !nacked {
                    // The controller ACKed, so the wire clocks right on.
                    self.clock_read_byte();
                }
                byte
            }
        }
    }

    fn assert_stop(&mut self) {
        self.lock().events.push(Event::Stop);
        self.xfer = None;
        self.complete(BusStatus::DONE);
    }

    fn poll_status(&mut self) -> BusStatus {
        {
            let mut shared = self.lock();
            if shared.busy_polls > 0 {
                shared.busy_polls -= 1;
                return BusStatus::BUSY;
            }
        }
        self.pending.take().unwrap_or(BusStatus::empty())
    }

    fn reset(&mut self) {
        self.lock().events.push(Event::Reset);
        self.xfer = None;
        self.pending = None;
        self.fifo.clear();
        self.owned = false;
        self.bitbang = false;
        self.armed = Ack::Ack;
        self.pipeline = Ack::Ack;
    }

    fn apply_timing(&mut self, speed: Speed) -> u32 {
        // A plausible divider off a 48 MHz kernel clock.
        let divider = 48_000_000 / speed.hertz();
        self.divider = Some(divider);
        divider
    }

    fn start_fifo(&mut self, addr_byte: u8, len: usize, stop: bool) {
        let repeated = self.owned;
        self.lock().events.push(Event::Start {
            addr_byte,
            repeated,
        });

        if let Some(fault) = self.take_fault() {
            self.fifo.clear();
            self.owned = false;
            self.complete(fault);
            return;
        }

        let addr = addr_byte >> 1;
        let dir = if addr_byte & 1 == 0 {
            Direction::Write
        } else {
            Direction::Read
        };

        let mut shared = self.shared.lock().unwrap();
        let present = shared
            .device_mut(addr)
            .map(|d| d.spec.present)
            .unwrap_or(false);

        if !present {
            // The sequencer closes its own failed transactions.
            shared.events.push(Event::Stop);
            drop(shared);
            self.fifo.clear();
            self.owned = false;
            self.complete(BusStatus::DONE | BusStatus::ADDR_NACK);
            return;
        }

        match dir {
            Direction::Write => {
                let mut all_acked = true;
                for i in 0..len {
                    let Some(byte) = self.fifo.pop_front() else {
                        break;
                    };
                    let dev = shared.device_mut(addr);
                    let acked = match dev {
                        Some(dev) => {
                            let acked = dev.spec.write_nack_at != Some(i);
                            if acked {
                                dev.written.push(byte);
                            }
                            acked
                        }
                        None => false,
                    };
                    shared.events.push(Event::Write { byte, acked });
                    if !acked {
                        all_acked = false;
                        break;
                    }
                }
                if !all_acked || stop {
                    shared.events.push(Event::Stop);
                }
                drop(shared);
                self.owned = all_acked && !stop;
                self.complete(if all_acked {
                    BusStatus::DONE | BusStatus::ACK
                } else {
                    BusStatus::DONE
                });
            }
            Direction::Read => {
                for i in 0..len {
                    let byte = match shared.device_mut(addr) {
                        Some(dev) => dev.next_read_byte(),
                        None => 0xff,
                    };
                    let nacked = i == len - 1;
                    shared.events.push(Event::Read { byte, nacked });
                    self.fifo.push_back(byte);
                }
                if stop {
                    shared.events.push(Event::Stop);
                }
                drop(shared);
                self.owned = !stop;
                self.complete(BusStatus::DONE | BusStatus::ACK);
            }
        }
    }

    fn fifo_push(&mut self, buf: &[u8]) -> usize {
        let depth = self.caps.fifo_depth.unwrap_or(0);
        let room = depth.saturating_sub(self.fifo.len());
        let n = room.min(buf.len());
        self.fifo.extend(&buf[..n]);
        n
    }

    fn fifo_pop(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.fifo.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        n
    }

    fn bitbang(&mut self, enable: bool) {
        self.bitbang = enable;
    }

    fn set_scl(&mut self, high: bool) {
        let rising = !self.scl && high;
        self.scl = high;
        if !self.bitbang || !rising {
            return;
        }
        let mut shared = self.lock();
        if shared.sda_pulses_needed > 0 {
            shared.sda_pulses_needed -= 1;
            shared.events.push(Event::RecoveryPulse);
        }
    }

    fn set_sda(&mut self, high: bool) {
        let rising = !self.sda && high;
        self.sda = high;
        if self.bitbang && rising && self.scl {
            self.lock().events.push(Event::RecoveryStop);
        }
    }

    fn sample_scl(&mut self) -> bool {
        true
    }

    fn sample_sda(&mut self) -> bool {
        self.lock().sda_pulses_needed == 0
    }
}
