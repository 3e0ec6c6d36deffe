// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus recovery by bit-banging.
//!
//! If a target was mid-byte when the controller died (or was reset out from
//! under it), the target can be left holding SDA low, wedging the bus.  The
//! cure is the standard one: clock SCL manually until the target's shift
//! register runs dry and it releases SDA, then drive a clean STOP.  Nine
//! pulses suffice for any byte position plus the ACK slot.

use crate::hardware::I2cHardware;
use crate::I2cControl;
use drv_i2c_api::ResponseCode;
use ringbuf::{ringbuf, ringbuf_entry};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Start,
    Pulse(u8),
    SdaReleased(u8),
    ManualStop,
    Failed,
}

ringbuf!(Trace, 32, Trace::None);

const MAX_PULSES: u8 = 9;

/// Attempts to free a wedged bus.  On success the lines are idle and the
/// controller has been reset back to a known state; on failure SDA is still
/// held low after the full pulse budget and the bus is presumed lost.
pub fn recover_bus<H: I2cHardware>(
    hw: &mut H,
    ctrl: &I2cControl,
) -> Result<(), ResponseCode> {
    ringbuf_entry!(Trace::Start);

    hw.bitbang(true);
    hw.set_scl(true);
    hw.set_sda(true);
    (ctrl.relax)();

    let mut released = hw.sample_sda();
    let mut pulses = 0;

    while !released && pulses < MAX_PULSES {
        hw.set_scl(false);
        (ctrl.relax)();
        hw.set_scl(true);
        (ctrl.relax)();
        pulses += 1;
        ringbuf_entry!(Trace::Pulse(pulses));
        released = hw.sample_sda();
    }

    if !released {
        ringbuf_entry!(Trace::Failed);
        hw.bitbang(false);
        hw.reset();
        return Err(ResponseCode::RecoveryFailed);
    }

    ringbuf_entry!(Trace::SdaReleased(pulses));

    // SDA is high; drive a STOP shape (SDA low-to-high while SCL is high)
    // so every target sees an unambiguous end of transaction.
    hw.set_sda(false);
    (ctrl.relax)();
    hw.set_scl(true);
    (ctrl.relax)();
    hw.set_sda(true);
    (ctrl.relax)();
    ringbuf_entry!(Trace::ManualStop);

    hw.bitbang(false);
    hw.reset();
    Ok(())
}
