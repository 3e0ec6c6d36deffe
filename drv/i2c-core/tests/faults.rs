// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling: NACK classification, deadlines, wedged controllers,
//! stuck buses, and recovery -- and that the engine is usable again after
//! every one of them.

use drv_i2c_api::{Controller, Message, ResponseCode};
use drv_i2c_core::{Capabilities, I2cConfig, I2cController};
use drv_i2c_mock::{
    byte_personality, clock, fifo_personality, DeviceSpec, Event, Fault,
    MockBus, MockController,
};

const ADDR: u8 = 0x50;

fn setup(caps: Capabilities) -> (MockBus, I2cController<MockController>) {
    let bus = MockBus::new();
    let controller = I2cController::new(
        Controller::Mock,
        1,
        clock::control(),
        I2cConfig::default(),
        bus.controller(caps),
    );
    controller.init().unwrap();
    bus.clear_events();
    (bus, controller)
}

#[test]
fn absent_device() {
    let (bus, controller) = setup(byte_personality());

    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::NoDevice)
    );

    // The failed address phase is closed with a STOP; the bus is released.
    assert_eq!(
        bus.events(),
        vec![
            Event::Start {
                addr_byte: 0xa0,
                repeated: false
            },
            Event::Stop,
        ]
    );

    let mut buf = [0u8; 1];
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::read(&mut buf)]),
        Err(ResponseCode::NoDevice)
    );
}

#[test]
fn refused_data_byte() {
    let (bus, controller) = setup(byte_personality());
    let mut spec = DeviceSpec::new(ADDR);
    spec.write_nack_at = Some(1);
    bus.add_device(spec);

    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01, 0x02, 0x03])]),
        Err(ResponseCode::NoRegister)
    );

    // The first byte landed, the refused one did not, and nothing was sent
    // after the NACK.
    assert_eq!(bus.written_to(ADDR), vec![0x01]);
    assert_eq!(
        bus.events(),
        vec![
            Event::Start {
                addr_byte: 0xa0,
                repeated: false
            },
            Event::Write {
                byte: 0x01,
                acked: true
            },
            Event::Write {
                byte: 0x02,
                acked: false
            },
            Event::Stop,
        ]
    );
}

#[test]
fn nack_classification_in_fifo_path() {
    let (bus, controller) = setup(fifo_personality(16));

    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::NoDevice)
    );

    let mut spec = DeviceSpec::new(ADDR);
    spec.write_nack_at = Some(0);
    bus.add_device(spec);

    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::NoRegister)
    );
}

#[test]
fn timeout_resets_and_recovers() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.set_stall(true);
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::BusTimeout)
    );
    assert!(bus.events().contains(&Event::Reset));

    // Once the bus behaves again, the next request goes through untouched.
    bus.set_stall(false);
    bus.clear_events();
    controller.transfer(ADDR, &mut [Message::write(&[0x02])]).unwrap();
    assert_eq!(bus.written_to(ADDR), vec![0x02]);
}

#[test]
fn deadline_honors_configured_timeout() {
    let bus = MockBus::new();
    let controller = I2cController::new(
        Controller::Mock,
        1,
        clock::control(),
        I2cConfig {
            timeout_ms: 5,
            ..Default::default()
        },
        bus.controller(byte_personality()),
    );
    controller.init().unwrap();
    bus.add_device(DeviceSpec::new(ADDR));

    bus.set_stall(true);
    let before = clock::now();
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::BusTimeout)
    );
    // Each simulated wait costs 1ms, so a 5ms deadline fails quickly.
    assert!(clock::now() - before < 20);
}

#[test]
fn briefly_busy_controller_is_waited_out() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.set_busy_polls(3);
    controller.transfer(ADDR, &mut [Message::write(&[0x01])]).unwrap();
    assert_eq!(bus.written_to(ADDR), vec![0x01]);
}

#[test]
fn wedged_controller_is_reset() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.set_busy_polls(100_000);
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::ControllerBusy)
    );
    assert!(bus.events().contains(&Event::Reset));
}

#[test]
fn stuck_bus_is_recovered_in_preflight() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    // A target holding SDA low through three bit positions.
    bus.hold_sda_low(3);
    controller.transfer(ADDR, &mut [Message::write(&[0x01])]).unwrap();

    let events = bus.events();
    let pulses = events
        .iter()
        .filter(|e| matches!(e, Event::RecoveryPulse))
        .count();
    assert_eq!(pulses, 3);
    assert!(events.contains(&Event::RecoveryStop));

    // The recovery happened before the transfer's START.
    let stop_at = events
        .iter()
        .position(|e| *e == Event::RecoveryStop)
        .unwrap();
    let start_at = events
        .iter()
        .position(|e| matches!(e, Event::Start { .. }))
        .unwrap();
    assert!(stop_at < start_at);

    assert_eq!(bus.written_to(ADDR), vec![0x01]);
}

#[test]
fn unrecoverable_bus_fails_after_nine_pulses() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.hold_sda_low(12);
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::RecoveryFailed)
    );

    let pulses = bus
        .events()
        .iter()
        .filter(|e| matches!(e, Event::RecoveryPulse))
        .count();
    assert_eq!(pulses, 9);
}

#[test]
fn on_demand_recovery() {
    let (bus, controller) = setup(byte_personality());

    bus.hold_sda_low(5);
    controller.recover_bus().unwrap();

    let pulses = bus
        .events()
        .iter()
        .filter(|e| matches!(e, Event::RecoveryPulse))
        .count();
    assert_eq!(pulses, 5);
    assert!(bus.events().contains(&Event::RecoveryStop));
}

#[test]
fn arbitration_loss() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.inject_fault(Fault::ArbitrationLost);
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::BusReset)
    );
    assert!(bus.events().contains(&Event::Reset));

    // And again after the reset.
    bus.clear_events();
    controller.transfer(ADDR, &mut [Message::write(&[0x02])]).unwrap();
    assert_eq!(bus.written_to(ADDR), vec![0x02]);
}

#[test]
fn bus_error() {
    let (bus, controller) = setup(byte_personality());
    bus.add_device(DeviceSpec::new(ADDR));

    bus.inject_fault(Fault::BusError);
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::BusError)
    );
    assert!(bus.events().contains(&Event::Reset));
}
