use super::*;

use pretty_assertions::assert_eq;

#[test]
fn one_descriptor_per_address() {
    let mut table = BreakpointShadowTable::new();
    let id = table.insert(0x1000, 0x55).unwrap();

    assert_eq!(None, table.insert(0x1000, 0x90));
    assert_eq!(Some(id), table.find(0x1000));
    assert_eq!(1, table.len());
}

#[test]
fn ids_stay_stable_across_removal() {
    let mut table = BreakpointShadowTable::new();
    let first = table.insert(0x1000, 0x55).unwrap();
    let second = table.insert(0x2000, 0x48).unwrap();

    assert_eq!(
        Some(BreakpointDescriptor {
            address: 0x1000,
            previous_byte: 0x55,
        }),
        table.remove(first)
    );
    assert_eq!(None, table.remove(first));
    assert_eq!(0x2000, table.get(second).unwrap().address);

    // the vacant slot is reused
    let third = table.insert(0x3000, 0x8b).unwrap();
    assert_eq!(first, third);
    assert_eq!(2, table.len());
}

#[test]
fn unshadow_restores_only_trap_bytes() {
    let mut table = BreakpointShadowTable::new();
    table.insert(0x1001, 0x55).unwrap();
    table.insert(0x1003, 0x8b).unwrap();

    // 0x1003 was overwritten by something else since
    let mut buf = [0x90, 0xcc, 0x90, 0xc3];
    assert_eq!(1, table.unshadow(0x1000, &mut buf));
    assert_eq!([0x90, 0x55, 0x90, 0xc3], buf);
}

#[test]
fn unshadow_ignores_descriptors_outside_window() {
    let mut table = BreakpointShadowTable::new();
    table.insert(0xfff, 0x11).unwrap();
    table.insert(0x1004, 0x22).unwrap();

    let mut buf = [0xcc; 4];
    assert_eq!(0, table.unshadow(0x1000, &mut buf));
    assert_eq!([0xcc; 4], buf);
}
