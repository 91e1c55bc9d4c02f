#[cfg(test)]
mod tests;

use crate::memory::ChunkSize;
use crate::{Error, ExecutionContext, Result, Status};

use hvkd::{
    page_align, AddressSpaceSwitcher, Cr3, MemoryAccessor, MemoryKind, PoolManager, ProcessId,
    ProcessInspector, Translator, VirtualAddr, PAGE_SIZE,
};

use serde::{Deserialize, Serialize};

use std::convert::TryFrom;
use std::ops::{Deref, DerefMut};

use log::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMemoryRequest {
    pub pid: ProcessId,
    pub address: u64,
    pub length: u64,
    pub kind: MemoryKind,
    pub chunk_size: u32,
    pub count: u32,
    pub pattern: Vec<u64>,
    /// Zero stands for the system-wide maximum.
    #[serde(default)]
    pub max_results: u32,
}

/// How matches found while scanning virtual addresses are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSpace {
    Virtual,
    /// The scanned range is the virtual image of a physical one; matches are
    /// translated back.
    PhysicalFromVirtual,
}

/// Address space a scan runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Process(ProcessId),
    /// Whatever the debuggee was running when it halted.
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<u64>,
    /// A further match was found after the result buffer filled up. A
    /// buffer filled exactly by the last match is not truncated.
    pub truncated: bool,
}

impl SearchOutcome {
    pub fn matched(&self) -> usize {
        self.results.len()
    }

    pub fn status(&self) -> Status {
        if self.truncated {
            Status::ResultBufferFull
        } else {
            Status::Success
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveOutcome {
    pub matched: usize,
    pub truncated: bool,
}

impl InteractiveOutcome {
    pub fn status(&self) -> Status {
        if self.truncated {
            Status::ResultBufferFull
        } else {
            Status::Success
        }
    }
}

/// Switches to another address space and restores the previous one when
/// dropped.
pub struct AddressSpaceGuard<'a, S: AddressSpaceSwitcher + ?Sized> {
    switcher: &'a S,
    previous: Cr3,
}

impl<'a, S: AddressSpaceSwitcher + ?Sized> AddressSpaceGuard<'a, S> {
    pub fn enter(switcher: &'a S, layout: Layout) -> Result<Self> {
        let previous = match layout {
            Layout::Process(pid) => switcher.switch_to_process(pid)?,
            Layout::Halted => switcher.switch_to_cr3(switcher.target_process_cr3()),
        };
        debug!("entered {:?}, saved cr3 0x{:x}", layout, previous.0);
        Ok(Self { switcher, previous })
    }
}

impl<'a, S: AddressSpaceSwitcher + ?Sized> Drop for AddressSpaceGuard<'a, S> {
    fn drop(&mut self) {
        self.switcher.restore(self.previous);
    }
}

/// Every page overlapping `[start, end)` must be mapped in `layout`.
pub fn validate_contiguous<S>(switcher: &S, layout: Layout, start: u64, end: u64) -> Result<()>
where
    S: AddressSpaceSwitcher + Translator + ?Sized,
{
    let _guard = AddressSpaceGuard::enter(switcher, layout)?;

    let mut page = page_align(start);
    while page < end {
        if switcher.virt_to_phys(page).is_none() {
            debug!("page 0x{:x} of 0x{:x}..0x{:x} is not mapped", page, start, end);
            return Err(Error::NotContiguous);
        }
        page = match page.checked_add(PAGE_SIZE) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

/// Receives the addresses of full matches.
pub trait MatchSink {
    fn has_room(&self) -> bool;
    fn record(&mut self, address: u64);
}

struct BufferSink<'a> {
    slots: &'a mut [u64],
    filled: usize,
}

impl<'a> MatchSink for BufferSink<'a> {
    fn has_room(&self) -> bool {
        self.filled < self.slots.len()
    }

    fn record(&mut self, address: u64) {
        self.slots[self.filled] = address;
        self.filled += 1;
    }
}

struct CallbackSink<'a> {
    on_match: &'a mut dyn FnMut(u64),
    limit: usize,
    matched: usize,
}

impl<'a> MatchSink for CallbackSink<'a> {
    fn has_room(&self) -> bool {
        self.matched < self.limit
    }

    fn record(&mut self, address: u64) {
        info!("0x{:016x}", address);
        (self.on_match)(address);
        self.matched += 1;
    }
}

/// A checked request, ready to be scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub layout: Layout,
    pub space: SearchSpace,
    pub start: VirtualAddr,
    pub end: VirtualAddr,
    pub chunk: ChunkSize,
    pub pattern: Vec<u64>,
}

struct Shape {
    chunk: ChunkSize,
    end: u64,
}

fn check_shape(req: &SearchMemoryRequest) -> Result<Shape> {
    let chunk = ChunkSize::try_from(req.chunk_size)?;
    if req.count == 0 || req.pattern.len() != req.count as usize || req.length == 0 {
        return Err(Error::InvalidParameter);
    }
    let end = req
        .address
        .checked_add(req.length)
        .ok_or(Error::InvalidParameter)?;
    Ok(Shape { chunk, end })
}

/// Picks the address space, translates physical ranges and makes sure the
/// range is mapped.
pub fn locate<P>(platform: &P, ctx: ExecutionContext, req: &SearchMemoryRequest) -> Result<Scan>
where
    P: AddressSpaceSwitcher + Translator + ProcessInspector + ?Sized,
{
    let Shape { chunk, end } = check_shape(req)?;
    let current = platform.current_process_id();

    let layout = match ctx {
        ExecutionContext::Restricted => Layout::Halted,
        ExecutionContext::Normal => {
            if req.pid != current && !platform.process_exists(req.pid) {
                debug!("process {} does not exist", req.pid);
                return Err(Error::InvalidParameter);
            }
            Layout::Process(req.pid)
        }
    };

    let (start, end, space) = match req.kind {
        MemoryKind::Virtual => (req.address, end, SearchSpace::Virtual),
        MemoryKind::Physical => {
            let to_virtual = |p_addr| match ctx {
                ExecutionContext::Restricted => platform.phys_to_virt_on_target(p_addr),
                ExecutionContext::Normal if req.pid == current => platform.phys_to_virt(p_addr),
                ExecutionContext::Normal => platform.phys_to_virt_by_process(p_addr, req.pid),
            };
            let v_start = to_virtual(req.address).ok_or(Error::InvalidAddress)?;
            let v_last = to_virtual(end - 1).ok_or(Error::InvalidAddress)?;
            if v_last < v_start {
                return Err(Error::InvalidAddress);
            }
            let v_end = v_last.checked_add(1).ok_or(Error::InvalidAddress)?;
            (v_start, v_end, SearchSpace::PhysicalFromVirtual)
        }
    };

    validate_contiguous(platform, layout, start, end)?;

    Ok(Scan {
        layout,
        space,
        start,
        end,
        chunk,
        pattern: req.pattern.iter().map(|v| chunk.truncate(*v)).collect(),
    })
}

/// Scans candidates `start, start + chunk, ...` whose whole pattern lies
/// before `end`. Returns whether a match was dropped for lack of room.
pub fn perform_search<P>(
    platform: &P,
    ctx: ExecutionContext,
    scan: &Scan,
    sink: &mut dyn MatchSink,
) -> Result<bool>
where
    P: AddressSpaceSwitcher + Translator + MemoryAccessor + ?Sized,
{
    let _guard = AddressSpaceGuard::enter(platform, scan.layout)?;

    let width = scan.chunk.bytes();
    let span = (width * scan.pattern.len()) as u64;
    let read_chunk = |v_addr: VirtualAddr| -> Result<u64> {
        let mut buf = [0u8; 8];
        let buf = &mut buf[..width];
        match ctx {
            ExecutionContext::Normal => platform.copy_virtual(v_addr, buf)?,
            ExecutionContext::Restricted => platform.read_virtual_safe(v_addr, buf)?,
        }
        Ok(scan.chunk.decode(buf))
    };

    let mut position = scan.start;
    while position
        .checked_add(span)
        .map_or(false, |last| last <= scan.end)
    {
        let mut matched = true;
        for (i, expected) in scan.pattern.iter().enumerate() {
            if read_chunk(position + (i * width) as u64)? != *expected {
                matched = false;
                break;
            }
        }

        if matched {
            if !sink.has_room() {
                return Ok(true);
            }
            let found = match scan.space {
                SearchSpace::Virtual => position,
                SearchSpace::PhysicalFromVirtual => platform
                    .virt_to_phys(position)
                    .ok_or(Error::InvalidAddress)?,
            };
            sink.record(found);
        }
        position += width as u64;
    }
    Ok(false)
}

/// Zeroed scratch space borrowed from the pool, returned on drop.
struct Scratch<'a, M: PoolManager + ?Sized> {
    pool: &'a M,
    buf: Vec<u64>,
}

impl<'a, M: PoolManager + ?Sized> Scratch<'a, M> {
    fn borrow(pool: &'a M, len: usize) -> Result<Self> {
        let buf = pool.allocate_zeroed(len).ok_or(Error::AllocationFailure)?;
        Ok(Self { pool, buf })
    }
}

impl<'a, M: PoolManager + ?Sized> Deref for Scratch<'a, M> {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        &self.buf
    }
}

impl<'a, M: PoolManager + ?Sized> DerefMut for Scratch<'a, M> {
    fn deref_mut(&mut self) -> &mut [u64] {
        &mut self.buf
    }
}

impl<'a, M: PoolManager + ?Sized> Drop for Scratch<'a, M> {
    fn drop(&mut self) {
        self.pool.free(std::mem::take(&mut self.buf));
    }
}

fn result_limit(req: &SearchMemoryRequest, system_max: usize) -> usize {
    match req.max_results as usize {
        0 => system_max,
        requested => requested.min(system_max),
    }
}

/// Keeps the addresses within `[from, to]`, up to the first empty slot.
pub fn compact(slots: &[u64], from: u64, to: u64) -> Vec<u64> {
    slots
        .iter()
        .take_while(|address| **address != 0)
        .filter(|address| (from..=to).contains(*address))
        .copied()
        .collect()
}

pub fn search_memory<P>(
    platform: &P,
    system_max: usize,
    ctx: ExecutionContext,
    req: &SearchMemoryRequest,
) -> Result<SearchOutcome>
where
    P: AddressSpaceSwitcher
        + Translator
        + MemoryAccessor
        + ProcessInspector
        + PoolManager
        + ?Sized,
{
    let Shape { end, .. } = check_shape(req)?;
    let limit = result_limit(req, system_max);
    let mut scratch = Scratch::borrow(platform, system_max)?;

    let scan = locate(platform, ctx, req)?;
    let truncated = {
        let mut sink = BufferSink {
            slots: &mut scratch[..limit],
            filled: 0,
        };
        perform_search(platform, ctx, &scan, &mut sink)?
    };

    let results = compact(&scratch, req.address, end);
    debug!(
        "search of 0x{:x}..0x{:x} found {} matches",
        req.address,
        end,
        results.len()
    );
    Ok(SearchOutcome { results, truncated })
}

/// Search on behalf of a halted debuggee: matches are handed to `on_match`
/// and logged as they are found instead of being buffered.
pub fn search_memory_interactive<P>(
    platform: &P,
    system_max: usize,
    req: &SearchMemoryRequest,
    on_match: &mut dyn FnMut(u64),
) -> Result<InteractiveOutcome>
where
    P: AddressSpaceSwitcher + Translator + MemoryAccessor + ProcessInspector + ?Sized,
{
    let ctx = ExecutionContext::Restricted;
    let scan = locate(platform, ctx, req)?;
    let mut sink = CallbackSink {
        on_match,
        limit: result_limit(req, system_max),
        matched: 0,
    };
    let truncated = perform_search(platform, ctx, &scan, &mut sink)?;
    Ok(InteractiveOutcome {
        matched: sink.matched,
        truncated,
    })
}
