// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control surface around the engine: configuration, validation, and
//! the deliberately-unsupported operations.

use drv_i2c_api::{
    Controller, Message, MessageFlags, Mode, ResponseCode, Speed,
};
use drv_i2c_core::{
    Capabilities, EmptyTransferPolicy, I2cConfig, I2cController,
};
use drv_i2c_mock::{byte_personality, clock, DeviceSpec, MockBus};

const ADDR: u8 = 0x50;

fn make(
    bus: &MockBus,
    caps: Capabilities,
    config: I2cConfig,
) -> I2cController<drv_i2c_mock::MockController> {
    I2cController::new(
        Controller::Mock,
        1,
        clock::control(),
        config,
        bus.controller(caps),
    )
}

#[test]
fn configure_is_idempotent() {
    let bus = MockBus::new();
    let controller = make(&bus, byte_personality(), I2cConfig::default());

    controller.configure(Mode::Controller, Speed::Fast).unwrap();
    let first = controller.get_config().unwrap();
    assert_eq!(first.mode, Mode::Controller);
    assert_eq!(first.speed, Speed::Fast);

    controller.configure(Mode::Controller, Speed::Fast).unwrap();
    let second = controller.get_config().unwrap();
    assert_eq!(first, second);

    // A different speed programs a different divider.
    controller.configure(Mode::Controller, Speed::Standard).unwrap();
    let third = controller.get_config().unwrap();
    assert_eq!(third.speed, Speed::Standard);
    assert_ne!(third.divider, first.divider);
}

#[test]
fn target_mode_is_refused() {
    let bus = MockBus::new();
    let controller = make(&bus, byte_personality(), I2cConfig::default());

    assert_eq!(
        controller.configure(Mode::Target, Speed::Standard),
        Err(ResponseCode::OperationNotSupported)
    );
    assert_eq!(
        controller.target_register(0x44),
        Err(ResponseCode::OperationNotSupported)
    );
    assert_eq!(
        controller.target_unregister(0x44),
        Err(ResponseCode::OperationNotSupported)
    );
}

#[test]
fn unsupported_speed_is_refused() {
    let bus = MockBus::new();
    let caps = Capabilities {
        max_speed: Speed::Fast,
        ..byte_personality()
    };
    let controller = make(&bus, caps, I2cConfig::default());

    controller.configure(Mode::Controller, Speed::Fast).unwrap();
    assert_eq!(
        controller.configure(Mode::Controller, Speed::FastPlus),
        Err(ResponseCode::OperationNotSupported)
    );
}

#[test]
fn transfer_requires_configuration() {
    let bus = MockBus::new();
    bus.add_device(DeviceSpec::new(ADDR));
    let controller = make(&bus, byte_personality(), I2cConfig::default());

    assert_eq!(
        controller.transfer(ADDR, &mut [Message::write(&[0x01])]),
        Err(ResponseCode::NotConfigured)
    );
    assert_eq!(controller.get_config(), Err(ResponseCode::NotConfigured));

    controller.init().unwrap();
    controller.transfer(ADDR, &mut [Message::write(&[0x01])]).unwrap();
}

#[test]
fn request_validation() {
    let bus = MockBus::new();
    let controller = make(&bus, byte_personality(), I2cConfig::default());
    controller.init().unwrap();

    // Addresses that cannot be expressed or are reserved.
    assert_eq!(
        controller.transfer(0x80, &mut [Message::write(&[0])]),
        Err(ResponseCode::BadArg)
    );
    assert_eq!(
        controller.transfer(0x00, &mut [Message::write(&[0])]),
        Err(ResponseCode::ReservedAddress)
    );
    assert_eq!(
        controller.transfer(0x78, &mut [Message::write(&[0])]),
        Err(ResponseCode::ReservedAddress)
    );

    // 10-bit addressing is not implemented, deliberately.
    assert_eq!(
        controller.transfer(
            ADDR,
            &mut [Message::write(&[0]).with_flags(MessageFlags::ADDR_10BIT)]
        ),
        Err(ResponseCode::OperationNotSupported)
    );

    // A zero-length read is unexpressible on the wire.
    let mut empty = [];
    assert_eq!(
        controller.transfer(ADDR, &mut [Message::read(&mut empty)]),
        Err(ResponseCode::BadArg)
    );

    // None of the rejected requests touched the bus.
    assert_eq!(bus.events().len(), 1); // init's reset only
}

#[test]
fn empty_request_policy() {
    let bus = MockBus::new();

    let noop = make(&bus, byte_personality(), I2cConfig::default());
    noop.init().unwrap();
    assert_eq!(noop.transfer(ADDR, &mut []), Ok(()));

    let reject = make(
        &bus,
        byte_personality(),
        I2cConfig {
            empty_policy: EmptyTransferPolicy::Reject,
            ..Default::default()
        },
    );
    reject.init().unwrap();
    assert_eq!(reject.transfer(ADDR, &mut []), Err(ResponseCode::BadArg));
}

#[test]
fn init_configures_at_the_default_speed() {
    let bus = MockBus::new();
    let controller = make(
        &bus,
        byte_personality(),
        I2cConfig {
            speed: Speed::FastPlus,
            ..Default::default()
        },
    );

    controller.init().unwrap();
    let config = controller.get_config().unwrap();
    assert_eq!(config.speed, Speed::FastPlus);
}
