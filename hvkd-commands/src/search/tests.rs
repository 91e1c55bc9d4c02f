use super::*;
use crate::Status;

use hvkd::machine::{Machine, Primitive, PHYSMAP_BASE};
use hvkd::PhysicalAddr;

use mockall::predicate::*;
use mockall::{mock, Sequence};

use pretty_assertions::assert_eq;

use rand::prelude::*;
use rand_pcg::Pcg64Mcg;

const PID: ProcessId = 4;
const OTHER: ProcessId = 1200;
const SYSTEM_MAX: usize = 0x1000;

mock! {
    pub Layout {}
    trait AddressSpaceSwitcher {
        fn current_process_id(&self) -> ProcessId;
        fn target_process_cr3(&self) -> Cr3;
        fn switch_to_process(&self, pid: ProcessId) -> hvkd::Result<Cr3>;
        fn switch_to_cr3(&self, cr3: Cr3) -> Cr3;
        fn restore(&self, previous: Cr3);
    }
    trait Translator {
        fn virt_to_phys(&self, v_addr: VirtualAddr) -> Option<PhysicalAddr>;
        fn virt_to_phys_by_process(&self, v_addr: VirtualAddr, pid: ProcessId)
            -> Option<PhysicalAddr>;
        fn phys_to_virt(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr>;
        fn phys_to_virt_by_process(&self, p_addr: PhysicalAddr, pid: ProcessId)
            -> Option<VirtualAddr>;
        fn phys_to_virt_on_target(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr>;
    }
}

/// Process `PID` owns [0x2000, 0x4000) and [0x5000, 0x6000), leaving a hole
/// at 0x4000. The halted process `OTHER` owns one page at 0x2000.
fn machine() -> Machine {
    let mut builder = Machine::builder();
    builder.process(PID, Some(false)).unwrap();
    builder.process(OTHER, Some(false)).unwrap();
    builder.map(PID, 0x2000, 2).unwrap();
    builder.map(PID, 0x5000, 1).unwrap();
    builder.map(OTHER, 0x2000, 1).unwrap();
    builder
        .write_virtual(PID, 0x2040, &[0xdd, 0xcc, 0xbb, 0xaa])
        .unwrap();
    builder
        .write_virtual(OTHER, 0x2100, &[0xdd, 0xcc, 0xbb, 0xaa])
        .unwrap();
    builder.current_process(PID).target_process(OTHER);
    builder.build().unwrap()
}

fn request(address: u64, length: u64, chunk_size: u32, pattern: Vec<u64>) -> SearchMemoryRequest {
    SearchMemoryRequest {
        pid: PID,
        address,
        length,
        kind: MemoryKind::Virtual,
        chunk_size,
        count: pattern.len() as u32,
        pattern,
        max_results: 0,
    }
}

fn search(machine: &Machine, req: &SearchMemoryRequest) -> Result<SearchOutcome> {
    search_memory(machine, SYSTEM_MAX, ExecutionContext::Normal, req)
}

#[test]
fn dword_pattern_found_once() {
    let machine = machine();

    let outcome = search(&machine, &request(0x2000, 0x1000, 4, vec![0xaabb_ccdd])).unwrap();
    assert_eq!(vec![0x2040], outcome.results);
    assert_eq!(1, outcome.matched());
    assert!(!outcome.truncated);
    assert_eq!(0, machine.outstanding_scratch());
}

#[test]
fn pattern_is_compared_at_chunk_width() {
    let machine = machine();

    // the upper half of the slot is not part of a dword pattern
    let outcome = search(
        &machine,
        &request(0x2000, 0x1000, 4, vec![0xffff_ffff_aabb_ccdd]),
    )
    .unwrap();
    assert_eq!(vec![0x2040], outcome.results);
}

#[test]
fn multi_chunk_pattern_restarts_after_mismatch() {
    let mut builder = Machine::builder();
    builder.process(PID, None).unwrap();
    builder.map(PID, 0x2000, 1).unwrap();
    builder
        .write_virtual(PID, 0x2000, &[1, 1, 1, 2, 1, 2])
        .unwrap();
    let machine = builder.build().unwrap();

    let outcome = search(&machine, &request(0x2000, 0x1000, 1, vec![1, 1, 2])).unwrap();
    assert_eq!(vec![0x2001], outcome.results);

    let outcome = search(&machine, &request(0x2000, 0x1000, 1, vec![1, 2])).unwrap();
    assert_eq!(vec![0x2002, 0x2004], outcome.results);
}

#[test]
fn unmapped_page_rejects_whole_range() {
    let machine = machine();
    let own = machine.loaded_cr3();

    let err = search(&machine, &request(0x2000, 0x3100, 4, vec![0xaabb_ccdd])).unwrap_err();
    assert_eq!(Status::NotContiguous, err.status());
    assert_eq!(own, machine.loaded_cr3());
    assert_eq!(0, machine.outstanding_scratch());
    // nothing was compared
    assert_eq!(0, machine.accesses().len());
}

#[test]
fn overflow_truncates_results() {
    let machine = machine();
    // [0x5000, 0x5010) is zero, so every byte position matches
    let mut req = request(0x5001, 0x10, 1, vec![0]);
    req.max_results = 3;

    let outcome = search(&machine, &req).unwrap();
    assert_eq!(vec![0x5001, 0x5002, 0x5003], outcome.results);
    assert!(outcome.truncated);
    assert_eq!(0, machine.outstanding_scratch());
}

#[test]
fn exact_fit_is_not_truncated() {
    let machine = machine();
    let mut req = request(0x5000, 4, 1, vec![0]);
    req.max_results = 4;

    let outcome = search(&machine, &req).unwrap();
    assert_eq!(4, outcome.matched());
    assert!(!outcome.truncated);
}

#[test]
fn request_limit_never_exceeds_system_maximum() {
    let machine = machine();
    let mut req = request(0x5000, 0x100, 8, vec![0]);
    req.max_results = 0x10_0000;

    let outcome = search_memory(&machine, 8, ExecutionContext::Normal, &req).unwrap();
    assert_eq!(8, outcome.matched());
    assert!(outcome.truncated);
}

#[test]
fn scan_stays_inside_requested_range() {
    let machine = machine();

    // the match at 0x2040 starts before the range
    let outcome = search(&machine, &request(0x2041, 0x100, 1, vec![0xcc])).unwrap();
    assert_eq!(vec![0x2041], outcome.results);
    let outcome = search(&machine, &request(0x2042, 0x100, 4, vec![0xaabb_ccdd])).unwrap();
    assert_eq!(Vec::<u64>::new(), outcome.results);

    // the pattern would end past the range
    let outcome = search(&machine, &request(0x2000, 0x43, 4, vec![0xaabb_ccdd])).unwrap();
    assert_eq!(Vec::<u64>::new(), outcome.results);
    let outcome = search(&machine, &request(0x2000, 0x44, 4, vec![0xaabb_ccdd])).unwrap();
    assert_eq!(vec![0x2040], outcome.results);
}

#[test]
fn compaction_keeps_both_bounds() {
    let slots = [0x10, 0x0f, 0x20, 0x21, 0x18, 0, 0x11];
    assert_eq!(vec![0x10, 0x20, 0x18], compact(&slots, 0x10, 0x20));
}

#[test]
fn malformed_requests() {
    let machine = machine();

    let bad = vec![
        request(0x2000, 0x1000, 2, vec![1]),
        request(0x2000, 0x1000, 4, vec![]),
        request(0x2000, 0, 4, vec![1]),
        request(u64::max_value(), 2, 1, vec![1]),
    ];
    for req in &bad {
        let err = search(&machine, req).unwrap_err();
        assert_eq!(Status::InvalidParameter, err.status());
    }

    let mut req = request(0x2000, 0x1000, 4, vec![1, 2]);
    req.count = 1;
    assert_eq!(
        Status::InvalidParameter,
        search(&machine, &req).unwrap_err().status()
    );
    assert_eq!(0, machine.outstanding_scratch());
}

#[test]
fn missing_process_is_rejected() {
    let machine = machine();
    let mut req = request(0x2000, 0x1000, 4, vec![0xaabb_ccdd]);
    req.pid = 31337;

    let err = search(&machine, &req).unwrap_err();
    assert_eq!(Status::InvalidParameter, err.status());
    assert_eq!(0, machine.outstanding_scratch());
}

#[test]
fn search_in_other_process_restores_address_space() {
    let machine = machine();
    let own = machine.loaded_cr3();
    let mut req = request(0x2000, 0x1000, 4, vec![0xaabb_ccdd]);
    req.pid = OTHER;

    let outcome = search(&machine, &req).unwrap();
    assert_eq!(vec![0x2100], outcome.results);
    assert_eq!(own, machine.loaded_cr3());
}

#[test]
fn refused_scratch_buffer() {
    let mut builder = Machine::builder();
    builder.process(PID, None).unwrap();
    builder.map(PID, 0x2000, 1).unwrap();
    builder.scratch_limit(SYSTEM_MAX - 1);
    let machine = builder.build().unwrap();

    let err = search(&machine, &request(0x2000, 0x1000, 1, vec![0])).unwrap_err();
    assert_eq!(Status::AllocationFailure, err.status());
    assert_eq!(0, machine.accesses().len());
}

#[test]
fn physical_search_reports_physical_addresses() {
    let machine = machine();
    let p_page = machine.virt_to_phys(0x2000).unwrap();
    let mut req = request(p_page, 0x1000, 4, vec![0xaabb_ccdd]);
    req.kind = MemoryKind::Physical;

    let outcome = search(&machine, &req).unwrap();
    assert_eq!(vec![p_page + 0x40], outcome.results);

    let scan = locate(&machine, ExecutionContext::Normal, &req).unwrap();
    assert_eq!(SearchSpace::PhysicalFromVirtual, scan.space);
    assert_eq!(PHYSMAP_BASE + p_page, scan.start);
    assert_eq!(PHYSMAP_BASE + p_page + 0x1000, scan.end);
}

#[test]
fn physical_search_of_missing_memory() {
    let machine = machine();
    let mut req = request(0x7_0000_0000, 0x1000, 4, vec![0]);
    req.kind = MemoryKind::Physical;

    let err = search(&machine, &req).unwrap_err();
    assert_eq!(Status::InvalidAddress, err.status());
}

#[test]
fn restricted_search_scans_halted_process() {
    let machine = machine();
    let own = machine.loaded_cr3();

    let outcome = search_memory(
        &machine,
        SYSTEM_MAX,
        ExecutionContext::Restricted,
        &request(0x2000, 0x1000, 4, vec![0xaabb_ccdd]),
    )
    .unwrap();
    assert_eq!(vec![0x2100], outcome.results);
    assert_eq!(own, machine.loaded_cr3());
    assert!(machine
        .accesses()
        .iter()
        .all(|a| a.primitive == Primitive::ReadVirtualSafe));
}

#[test]
fn interactive_search_reports_as_it_goes() {
    let machine = machine();
    let mut seen = vec![];
    let mut req = request(0x2000, 0x1000, 1, vec![0xcc]);

    let outcome =
        search_memory_interactive(&machine, SYSTEM_MAX, &req, &mut |a| seen.push(a)).unwrap();
    assert_eq!(vec![0x2101], seen);
    assert_eq!(
        InteractiveOutcome {
            matched: 1,
            truncated: false,
        },
        outcome
    );

    req.pattern = vec![0];
    req.max_results = 2;
    let mut seen = vec![];
    let outcome =
        search_memory_interactive(&machine, SYSTEM_MAX, &req, &mut |a| seen.push(a)).unwrap();
    assert_eq!(vec![0x2000, 0x2001], seen);
    assert!(outcome.truncated);
    assert_eq!(0, machine.outstanding_scratch());
}

#[test]
fn validation_switches_once_and_restores() {
    let mut seq = Sequence::new();
    let mut layout = MockLayout::default();

    layout
        .expect_switch_to_process()
        .once()
        .in_sequence(&mut seq)
        .with(eq(OTHER))
        .return_once(|_| Ok(Cr3(0x1000)));
    for page in &[0x1000u64, 0x2000, 0x3000] {
        layout
            .expect_virt_to_phys()
            .once()
            .in_sequence(&mut seq)
            .with(eq(*page))
            .return_once(|v_addr| Some(v_addr + 0x10_0000));
    }
    layout
        .expect_restore()
        .once()
        .in_sequence(&mut seq)
        .with(eq(Cr3(0x1000)))
        .return_const(());

    validate_contiguous(&layout, Layout::Process(OTHER), 0x1ff0, 0x3010).unwrap();
}

#[test]
fn failed_validation_still_restores() {
    let mut seq = Sequence::new();
    let mut layout = MockLayout::default();

    layout
        .expect_target_process_cr3()
        .once()
        .in_sequence(&mut seq)
        .return_const(Cr3(0x9000));
    layout
        .expect_switch_to_cr3()
        .once()
        .in_sequence(&mut seq)
        .with(eq(Cr3(0x9000)))
        .return_const(Cr3(0x1000));
    layout
        .expect_virt_to_phys()
        .once()
        .in_sequence(&mut seq)
        .with(eq(0x7000))
        .return_const(Some(0x3_7000));
    layout
        .expect_virt_to_phys()
        .once()
        .in_sequence(&mut seq)
        .with(eq(0x8000))
        .return_const(None);
    layout
        .expect_virt_to_phys()
        .never()
        .in_sequence(&mut seq);
    layout
        .expect_restore()
        .once()
        .with(eq(Cr3(0x1000)))
        .return_const(());

    let err = validate_contiguous(&layout, Layout::Halted, 0x7800, 0xa000).unwrap_err();
    assert_eq!(Status::NotContiguous, err.status());
}

#[test]
fn matches_agree_with_naive_scan() {
    let mut rng = Pcg64Mcg::seed_from_u64(612);

    for _ in 0..16 {
        let mut contents = vec![0u8; 0x2000];
        for byte in contents.iter_mut() {
            *byte = rng.gen_range(0u8, 3u8);
        }
        let mut builder = Machine::builder();
        builder.process(PID, None).unwrap();
        builder.map(PID, 0x10_0000, 2).unwrap();
        builder.write_virtual(PID, 0x10_0000, &contents).unwrap();
        let machine = builder.build().unwrap();

        let width = [1usize, 4][rng.gen_range(0usize, 2usize)];
        let chunks = rng.gen_range(1usize, 3usize);
        let offset = rng.gen_range(0usize, 0x40usize);
        let length = rng.gen_range(0x100usize, 0x800usize);

        // a candidate position, so there is at least one match
        let source = offset + width * rng.gen_range(0usize, length / (2 * width));
        let needle = &contents[source..source + width * chunks];
        let pattern = needle
            .chunks(width)
            .map(|c| {
                let mut word = [0u8; 8];
                word[..width].copy_from_slice(c);
                u64::from_le_bytes(word)
            })
            .collect();

        let mut expected = vec![];
        let mut position = offset;
        while position + needle.len() <= offset + length {
            if &contents[position..position + needle.len()] == needle {
                expected.push(0x10_0000 + position as u64);
            }
            position += width;
        }

        let req = request(
            0x10_0000 + offset as u64,
            length as u64,
            width as u32,
            pattern,
        );
        let outcome = search(&machine, &req).unwrap();
        assert_eq!(expected, outcome.results);
    }
}
