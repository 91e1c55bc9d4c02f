use super::*;
use crate::Status;

use hvkd::machine::Machine;
use hvkd::ErrorKind;

use pretty_assertions::assert_eq;

const IA32_LSTAR: u32 = 0xc000_0082;

fn machine(cores: u32) -> Machine {
    let mut builder = Machine::builder();
    builder.process(4, None).unwrap();
    builder.cores(cores);
    for core in 0..cores {
        builder
            .msr(Some(core), IA32_LSTAR, 0xffff_f800_0000_0000 + u64::from(core))
            .unwrap();
    }
    builder.build().unwrap()
}

fn request(action: MsrAction, core: u32, value: u64) -> MsrRequest {
    MsrRequest {
        action,
        msr: IA32_LSTAR,
        core,
        value,
    }
}

#[test]
fn all_cores_sentinel() {
    assert_eq!(CoreSelector::All, CoreSelector::from(0xffff_ffff));
    assert_eq!(CoreSelector::Single(3), CoreSelector::from(3));
}

#[test]
fn read_on_all_cores_in_core_order() {
    let machine = machine(4);
    let state = MsrBroadcastState::new(4);

    let outcome =
        read_or_write_msr(&machine, &state, &request(MsrAction::Read, ALL_CORES, 0)).unwrap();
    assert_eq!(
        vec![
            0xffff_f800_0000_0000,
            0xffff_f800_0000_0001,
            0xffff_f800_0000_0002,
            0xffff_f800_0000_0003
        ],
        outcome.values
    );

    let bytes = outcome.to_bytes();
    assert_eq!(8 * 4, bytes.len());
    assert_eq!(&[2, 0, 0, 0, 0, 0xf8, 0xff, 0xff][..], &bytes[16..24]);
}

#[test]
fn read_on_one_core() {
    let machine = machine(4);
    let state = MsrBroadcastState::new(4);

    let outcome = read_or_write_msr(&machine, &state, &request(MsrAction::Read, 2, 0)).unwrap();
    assert_eq!(vec![0xffff_f800_0000_0002], outcome.values);
    assert_eq!(8, outcome.to_bytes().len());
    // other slots were not staged
    assert_eq!(Some(MsrSlot::default()), state.slot(1));
}

#[test]
fn write_on_all_cores() {
    let machine = machine(2);
    let state = MsrBroadcastState::new(2);

    let outcome = read_or_write_msr(
        &machine,
        &state,
        &request(MsrAction::Write, ALL_CORES, 0xffff_f800_dead_0000),
    )
    .unwrap();
    assert!(outcome.to_bytes().is_empty());
    assert_eq!(Some(0xffff_f800_dead_0000), machine.msr(0, IA32_LSTAR));
    assert_eq!(Some(0xffff_f800_dead_0000), machine.msr(1, IA32_LSTAR));
}

#[test]
fn write_on_one_core() {
    let machine = machine(2);
    let state = MsrBroadcastState::new(2);

    read_or_write_msr(&machine, &state, &request(MsrAction::Write, 1, 0x1234)).unwrap();
    assert_eq!(Some(0xffff_f800_0000_0000), machine.msr(0, IA32_LSTAR));
    assert_eq!(Some(0x1234), machine.msr(1, IA32_LSTAR));
}

#[test]
fn core_out_of_range_touches_nothing() {
    let machine = machine(2);
    let state = MsrBroadcastState::new(2);

    for core in &[2, 7] {
        let err = read_or_write_msr(&machine, &state, &request(MsrAction::Write, *core, 1))
            .unwrap_err();
        assert_eq!(Status::InvalidParameter, err.status());
    }
    assert_eq!(Some(MsrSlot::default()), state.slot(0));
    assert_eq!(Some(MsrSlot::default()), state.slot(1));
    assert_eq!(Some(0xffff_f800_0000_0001), machine.msr(1, IA32_LSTAR));
}

#[test]
fn failed_dispatch_propagates() {
    let mut builder = Machine::builder();
    builder.process(4, None).unwrap();
    builder.cores(2).refusing_core(1);
    let machine = builder.build().unwrap();
    let state = MsrBroadcastState::new(2);

    match read_or_write_msr(&machine, &state, &request(MsrAction::Read, 1, 0)) {
        Err(Error::Platform(e)) => assert_eq!(ErrorKind::CoreUnavailable, e.kind()),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn unknown_msr_reads_as_zero() {
    let machine = machine(1);
    let state = MsrBroadcastState::new(1);
    let mut req = request(MsrAction::Read, 0, 0);
    req.msr = 0x4000_0000;

    let outcome = read_or_write_msr(&machine, &state, &req).unwrap();
    assert_eq!(vec![0], outcome.values);
}
