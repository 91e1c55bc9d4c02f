use super::physical::PhysicalMemory;
use crate::{Error, ErrorKind, PhysicalAddr, Result, VirtualAddr};

// [12..52] bit of the entry
const ENTRY_POINTER_MASK: u64 = (!0u64) << 24 >> 12;
const PG_MASK: u64 = 1u64 << 7;
const RW_MASK: u64 = 1u64 << 1;
const P_MASK: u64 = 1;
const VA_MASK: u64 = 0xff8;
const CANON_MASK: u64 = 0xffff_8000_0000_0000;

pub const LARGE_PAGE_SIZE: u64 = 1 << 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PageSize {
    Small,
    Large,
}

impl PageSize {
    fn leaf_level(self) -> u32 {
        match self {
            PageSize::Small => 1,
            PageSize::Large => 2,
        }
    }
}

pub(super) fn is_canonical(v_addr: VirtualAddr) -> bool {
    matches!(v_addr & CANON_MASK, 0 | CANON_MASK)
}

/// Walks the 4-level tables rooted at `ptb`. Returns the physical address
/// and the level the walk stopped at.
pub(super) fn translate(
    memory: &PhysicalMemory,
    ptb: PhysicalAddr,
    v_addr: VirtualAddr,
) -> Option<(PhysicalAddr, u32)> {
    if !is_canonical(v_addr) {
        return None;
    }

    let mut base = ptb;
    let mut level: u32 = 4;
    loop {
        let offset = level * 9;
        // table lookup
        let v_addr_shift = (v_addr >> offset) & VA_MASK;
        let entry_addr = base | v_addr_shift;
        let entry = memory.read_u64(entry_addr).ok()?;

        // check entry
        let (paddr, pg, present) = read_entry(entry);
        if !present {
            return None;
        }

        // add offset in a page frame
        if pg || level == 1 {
            let mask = (!0) << (offset + 3);
            return Some(((paddr & mask) | (v_addr & !mask), level));
        }
        level -= 1;
        base = paddr;
    }
}

/// Installs a mapping, allocating intermediate tables on the way. Newly
/// allocated table frames are pushed to `tables`.
pub(super) fn map(
    memory: &mut PhysicalMemory,
    tables: &mut Vec<PhysicalAddr>,
    ptb: PhysicalAddr,
    v_addr: VirtualAddr,
    p_addr: PhysicalAddr,
    size: PageSize,
) -> Result<()> {
    if !is_canonical(v_addr) {
        return Err(Error::new(
            ErrorKind::Parameter,
            format!("non-canonical address 0x{:x}", v_addr),
        ));
    }

    let leaf = size.leaf_level();
    let mut base = ptb;
    let mut level: u32 = 4;
    while level > leaf {
        let entry_addr = base | ((v_addr >> (level * 9)) & VA_MASK);
        let entry = memory.read_u64(entry_addr)?;
        let (next, pg, present) = read_entry(entry);
        base = if !present {
            let table = memory.allocate_frame();
            tables.push(table);
            memory.write_u64(entry_addr, table | RW_MASK | P_MASK)?;
            table
        } else if pg {
            return Err(Error::new(
                ErrorKind::Parameter,
                format!("0x{:x} is already covered by a large page", v_addr),
            ));
        } else {
            next
        };
        level -= 1;
    }

    let entry_addr = base | ((v_addr >> (leaf * 9)) & VA_MASK);
    let mut entry = (p_addr & ENTRY_POINTER_MASK) | RW_MASK | P_MASK;
    if size == PageSize::Large {
        entry |= PG_MASK;
    }
    memory.write_u64(entry_addr, entry)
}

// Returns (gpa, PG, present)
fn read_entry(entry: u64) -> (PhysicalAddr, bool, bool) {
    let present = (entry & P_MASK) != 0;
    if present {
        let pg = (entry & PG_MASK) != 0;
        (entry & ENTRY_POINTER_MASK, pg, present)
    } else {
        (0, false, present)
    }
}
