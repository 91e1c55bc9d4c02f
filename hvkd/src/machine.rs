//! A software model of a paged x86-64 host.
//!
//! Guest RAM is a set of 4 KiB frames; every process owns real 4-level page
//! tables living in that RAM, and all of RAM is additionally mapped at
//! [`PHYSMAP_BASE`] in every process. One process is "current" (the caller of
//! a debugger command) and one is the halted "target" (what the debuggee was
//! running when it stopped).


mod cores;
mod image;
mod paging;
mod physical;
mod pool;

pub use image::*;
pub use paging::LARGE_PAGE_SIZE;
pub use pool::PoolRequest;

use cores::Cores;
use paging::PageSize;
use physical::PhysicalMemory;
use pool::Pools;

use crate::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lru::LruCache;

use log::debug;

pub const PHYSMAP_BASE: VirtualAddr = 0xffff_8880_0000_0000;

const TLB_CAP: usize = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    ReadProcess,
    ReadPhysicalSafe,
    ReadVirtualSafe,
    ReadVirtualSafeOnTarget,
    CopyVirtual,
    WriteVirtualUnsafe,
    WriteVirtualSafeOnTarget,
    WritePhysicalNormal,
    WritePhysicalSafe,
}

/// One call into a memory-touching primitive, as recorded by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub primitive: Primitive,
    pub addr: u64,
    pub len: usize,
}

#[derive(Debug, Clone)]
struct Process {
    cr3: Cr3,
    wow64: Option<bool>,
}

pub struct Machine {
    memory: RwLock<PhysicalMemory>,
    tables: HashSet<PhysicalAddr>,
    tlb: Mutex<LruCache<(PhysicalAddr, u64), PhysicalAddr>>,
    processes: BTreeMap<ProcessId, Process>,
    current_pid: ProcessId,
    target_pid: ProcessId,
    loaded: Mutex<Cr3>,
    cores: Cores,
    pools: Mutex<Pools>,
    journal: Mutex<Vec<Access>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

impl Machine {
    pub fn builder() -> MachineBuilder {
        MachineBuilder::new()
    }

    pub fn loaded_cr3(&self) -> Cr3 {
        *lock(&self.loaded)
    }

    pub fn process_cr3(&self, pid: ProcessId) -> Option<Cr3> {
        self.processes.get(&pid).map(|p| p.cr3)
    }

    pub fn accesses(&self) -> Vec<Access> {
        lock(&self.journal).clone()
    }

    pub fn clear_accesses(&self) {
        lock(&self.journal).clear()
    }

    pub fn outstanding_scratch(&self) -> usize {
        lock(&self.pools).outstanding
    }

    pub fn pool_requests(&self) -> Vec<PoolRequest> {
        let pools = lock(&self.pools);
        pools.allocated.iter().chain(pools.pending.iter()).copied().collect()
    }

    pub fn pending_pool_requests(&self) -> usize {
        lock(&self.pools).pending.len()
    }

    pub fn hooking_pages(&self) -> u32 {
        lock(&self.pools).hooking_pages
    }

    pub fn ept_hook_pools(&self) -> u32 {
        lock(&self.pools).ept_hook_pools
    }

    pub fn exec_trap_initialized(&self) -> bool {
        lock(&self.pools).exec_trap
    }

    pub fn msr(&self, core: CoreIndex, msr: u32) -> Option<u64> {
        self.cores.msr(core, msr)
    }

    pub fn read_virtual(&self, pid: ProcessId, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()> {
        let cr3 = self.cr3_of(pid)?;
        self.read_in(cr3, v_addr, buf)
    }

    pub fn read_physical(&self, p_addr: PhysicalAddr, buf: &mut [u8]) -> Result<()> {
        read_lock(&self.memory).read(p_addr, buf)
    }

    fn cr3_of(&self, pid: ProcessId) -> Result<Cr3> {
        self.process_cr3(pid)
            .ok_or_else(|| Error::from(ErrorKind::NoSuchProcess))
    }

    fn target_cr3(&self) -> Cr3 {
        self.processes
            .get(&self.target_pid)
            .map(|p| p.cr3)
            .unwrap_or_else(|| self.loaded_cr3())
    }

    fn record(&self, primitive: Primitive, addr: u64, len: usize) {
        lock(&self.journal).push(Access {
            primitive,
            addr,
            len,
        });
    }

    fn translate(&self, cr3: Cr3, v_addr: VirtualAddr) -> Option<PhysicalAddr> {
        let key = (cr3.0, v_addr >> PAGE_SHIFT);
        if let Some(page) = lock(&self.tlb).get(&key) {
            return Some(page | page_offset(v_addr));
        }
        let memory = read_lock(&self.memory);
        let (p_addr, _level) = paging::translate(&memory, cr3.0, v_addr)?;
        lock(&self.tlb).put(key, page_align(p_addr));
        Some(p_addr)
    }

    fn range_mapped(&self, cr3: Cr3, v_addr: VirtualAddr, len: usize) -> bool {
        let end = match v_addr.checked_add(len.max(1) as u64) {
            Some(end) => end,
            None => return false,
        };
        let mut page = page_align(v_addr);
        while page < end {
            if self.translate(cr3, page).is_none() {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    // split by pages, as consecutive virtual pages need not be
    // physically adjacent
    fn read_in(&self, cr3: Cr3, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = v_addr
                .checked_add(done as u64)
                .ok_or_else(|| Error::fault(v_addr))?;
            let sz = (PAGE_SIZE - page_offset(addr)).min((buf.len() - done) as u64) as usize;
            let p_addr = self.translate(cr3, addr).ok_or_else(|| Error::fault(addr))?;
            self.read_physical(p_addr, &mut buf[done..done + sz])?;
            done += sz;
        }
        Ok(())
    }

    fn write_in(&self, cr3: Cr3, v_addr: VirtualAddr, data: &[u8]) -> Result<()> {
        if !self.range_mapped(cr3, v_addr, data.len()) {
            return Err(Error::fault(v_addr));
        }
        let mut done = 0;
        while done < data.len() {
            let addr = v_addr + done as u64;
            let sz = (PAGE_SIZE - page_offset(addr)).min((data.len() - done) as u64) as usize;
            let p_addr = self.translate(cr3, addr).ok_or_else(|| Error::fault(addr))?;
            self.write_physical(p_addr, &data[done..done + sz])?;
            done += sz;
        }
        Ok(())
    }

    fn write_physical(&self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        write_lock(&self.memory).write(p_addr, data)?;
        let end = p_addr + data.len() as u64;
        let mut page = page_align(p_addr);
        while page < end {
            if self.tables.contains(&page) {
                debug!("paging structure at 0x{:x} changed, flushing tlb", page);
                lock(&self.tlb).clear();
                break;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

impl AddressSpaceSwitcher for Machine {
    fn current_process_id(&self) -> ProcessId {
        self.current_pid
    }

    fn target_process_cr3(&self) -> Cr3 {
        self.target_cr3()
    }

    fn switch_to_process(&self, pid: ProcessId) -> Result<Cr3> {
        let cr3 = self.cr3_of(pid)?;
        Ok(self.switch_to_cr3(cr3))
    }

    fn switch_to_cr3(&self, cr3: Cr3) -> Cr3 {
        let mut loaded = lock(&self.loaded);
        let previous = *loaded;
        *loaded = cr3;
        previous
    }

    fn restore(&self, previous: Cr3) {
        *lock(&self.loaded) = previous;
    }
}

impl Translator for Machine {
    fn virt_to_phys(&self, v_addr: VirtualAddr) -> Option<PhysicalAddr> {
        self.translate(self.loaded_cr3(), v_addr)
    }

    fn virt_to_phys_by_process(
        &self,
        v_addr: VirtualAddr,
        pid: ProcessId,
    ) -> Option<PhysicalAddr> {
        let cr3 = self.process_cr3(pid)?;
        self.translate(cr3, v_addr)
    }

    fn phys_to_virt(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr> {
        if self.check_physical_address(p_addr) && !self.tables.contains(&page_align(p_addr)) {
            Some(PHYSMAP_BASE + p_addr)
        } else {
            None
        }
    }

    fn phys_to_virt_by_process(
        &self,
        p_addr: PhysicalAddr,
        pid: ProcessId,
    ) -> Option<VirtualAddr> {
        self.process_cr3(pid)?;
        self.phys_to_virt(p_addr)
    }

    fn phys_to_virt_on_target(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr> {
        self.phys_to_virt(p_addr)
    }
}

impl MemoryAccessor for Machine {
    fn check_physical_address(&self, p_addr: PhysicalAddr) -> bool {
        read_lock(&self.memory).is_present(p_addr)
    }

    fn check_access_validity_and_safety(&self, v_addr: VirtualAddr, len: usize) -> bool {
        self.range_mapped(self.target_cr3(), v_addr, len)
    }

    fn read_process_memory(
        &self,
        pid: ProcessId,
        addr: u64,
        kind: MemoryKind,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.record(Primitive::ReadProcess, addr, buf.len());
        match kind {
            MemoryKind::Virtual => self.read_in(self.cr3_of(pid)?, addr, buf)?,
            MemoryKind::Physical => self.read_physical(addr, buf)?,
        }
        Ok(buf.len())
    }

    fn read_physical_safe(&self, p_addr: PhysicalAddr, buf: &mut [u8]) -> Result<()> {
        self.record(Primitive::ReadPhysicalSafe, p_addr, buf.len());
        self.read_physical(p_addr, buf)
    }

    fn read_virtual_safe(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()> {
        self.record(Primitive::ReadVirtualSafe, v_addr, buf.len());
        self.read_in(self.loaded_cr3(), v_addr, buf)
    }

    fn read_virtual_safe_on_target(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()> {
        self.record(Primitive::ReadVirtualSafeOnTarget, v_addr, buf.len());
        self.read_in(self.target_cr3(), v_addr, buf)
    }

    fn copy_virtual(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()> {
        self.record(Primitive::CopyVirtual, v_addr, buf.len());
        self.read_in(self.loaded_cr3(), v_addr, buf)
    }

    fn write_virtual_unsafe(
        &self,
        v_addr: VirtualAddr,
        data: &[u8],
        pid: ProcessId,
    ) -> Result<()> {
        self.record(Primitive::WriteVirtualUnsafe, v_addr, data.len());
        self.write_in(self.cr3_of(pid)?, v_addr, data)
    }

    fn write_virtual_safe_on_target(&self, v_addr: VirtualAddr, data: &[u8]) -> Result<()> {
        self.record(Primitive::WriteVirtualSafeOnTarget, v_addr, data.len());
        self.write_in(self.target_cr3(), v_addr, data)
    }

    fn write_physical_normal(&self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        self.record(Primitive::WritePhysicalNormal, p_addr, data.len());
        self.write_physical(p_addr, data)
    }

    fn write_physical_safe(&self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        self.record(Primitive::WritePhysicalSafe, p_addr, data.len());
        self.write_physical(p_addr, data)
    }
}

impl ProcessInspector for Machine {
    fn process_exists(&self, pid: ProcessId) -> bool {
        self.processes.contains_key(&pid)
    }

    fn is_wow64(&self, pid: ProcessId) -> Result<bool> {
        let process = self
            .processes
            .get(&pid)
            .ok_or_else(|| Error::from(ErrorKind::NoSuchProcess))?;
        process
            .wow64
            .ok_or_else(|| Error::new(ErrorKind::Parameter, "process bitness is unknown"))
    }

    fn is_wow64_target(&self) -> Result<bool> {
        self.is_wow64(self.target_pid)
    }
}

impl ProcessorDispatcher for Machine {
    fn processor_count(&self) -> u32 {
        self.cores.count()
    }

    fn broadcast(&self, task: CoreTask) {
        self.cores.broadcast(task)
    }

    fn run_on_core(&self, core: CoreIndex, task: CoreTask) -> Result<()> {
        self.cores.run_on(core, task)
    }
}

impl PoolManager for Machine {
    fn request_allocation(&self, size: usize, count: u32, intent: PoolIntent) -> bool {
        lock(&self.pools).request(size, count, intent)
    }

    fn perform_allocations(&self) {
        lock(&self.pools).perform()
    }

    fn allocate_zeroed(&self, len: usize) -> Option<Vec<u64>> {
        lock(&self.pools).allocate(len)
    }

    fn free(&self, buf: Vec<u64>) {
        lock(&self.pools).free(buf)
    }
}

impl HookConfigurator for Machine {
    fn allocate_extra_hooking_pages(&self, count: u32) {
        lock(&self.pools).hooking_pages += count;
    }

    fn reserve_ept_hook_pools(&self, count: u32) {
        lock(&self.pools).ept_hook_pools += count;
    }

    fn initialize_exec_trap(&self) {
        lock(&self.pools).exec_trap = true;
    }
}

pub struct MachineBuilder {
    memory: PhysicalMemory,
    tables: Vec<PhysicalAddr>,
    processes: BTreeMap<ProcessId, Process>,
    current_pid: Option<ProcessId>,
    target_pid: Option<ProcessId>,
    msrs: Vec<HashMap<u32, u64>>,
    refusing: Vec<CoreIndex>,
    scratch_limit: Option<usize>,
    reserve_limit: Option<usize>,
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            memory: PhysicalMemory::new(),
            tables: vec![],
            processes: BTreeMap::new(),
            current_pid: None,
            target_pid: None,
            msrs: vec![HashMap::new()],
            refusing: vec![],
            scratch_limit: None,
            reserve_limit: None,
        }
    }

    pub fn cores(&mut self, n: u32) -> &mut Self {
        self.msrs.resize_with(n as usize, HashMap::new);
        self
    }

    /// Every later single-core dispatch to `core` fails.
    pub fn refusing_core(&mut self, core: CoreIndex) -> &mut Self {
        self.refusing.push(core);
        self
    }

    /// Largest scratch buffer, in 8-byte words, the pool hands out.
    pub fn scratch_limit(&mut self, words: usize) -> &mut Self {
        self.scratch_limit = Some(words);
        self
    }

    /// Total bytes of pool requests accepted before further ones are refused.
    pub fn reserve_limit(&mut self, bytes: usize) -> &mut Self {
        self.reserve_limit = Some(bytes);
        self
    }

    pub fn msr(&mut self, core: Option<CoreIndex>, msr: u32, value: u64) -> Result<&mut Self> {
        match core {
            None => self.msrs.iter_mut().for_each(|m| {
                m.insert(msr, value);
            }),
            Some(core) => {
                self.msrs
                    .get_mut(core as usize)
                    .ok_or_else(|| Error::from(ErrorKind::NoSuchCore))?
                    .insert(msr, value);
            }
        }
        Ok(self)
    }

    pub fn process(&mut self, pid: ProcessId, wow64: Option<bool>) -> Result<Cr3> {
        if self.processes.contains_key(&pid) {
            return Err(Error::new(
                ErrorKind::Parameter,
                format!("process {} declared twice", pid),
            ));
        }
        let pml4 = self.memory.allocate_frame();
        self.tables.push(pml4);
        let cr3 = Cr3(pml4);
        self.processes.insert(pid, Process { cr3, wow64 });
        Ok(cr3)
    }

    pub fn current_process(&mut self, pid: ProcessId) -> &mut Self {
        self.current_pid = Some(pid);
        self
    }

    pub fn target_process(&mut self, pid: ProcessId) -> &mut Self {
        self.target_pid = Some(pid);
        self
    }

    /// Maps `pages` fresh, physically contiguous frames at `v_addr` and
    /// returns the physical address of the first one.
    pub fn map(&mut self, pid: ProcessId, v_addr: VirtualAddr, pages: u64) -> Result<PhysicalAddr> {
        let p_addr = self.memory.allocate_frames(pages);
        self.map_at(pid, v_addr, p_addr, pages)?;
        Ok(p_addr)
    }

    pub fn map_at(
        &mut self,
        pid: ProcessId,
        v_addr: VirtualAddr,
        p_addr: PhysicalAddr,
        pages: u64,
    ) -> Result<()> {
        let ptb = self.ptb_of(pid)?;
        let v_base = page_align(v_addr);
        let p_base = page_align(p_addr);
        for i in 0..pages {
            let frame = p_base + i * PAGE_SIZE;
            self.memory.ensure_frame(frame);
            paging::map(
                &mut self.memory,
                &mut self.tables,
                ptb,
                v_base + i * PAGE_SIZE,
                frame,
                PageSize::Small,
            )?;
        }
        Ok(())
    }

    /// Maps one 2 MiB page; both addresses must be 2 MiB aligned.
    pub fn map_large_at(
        &mut self,
        pid: ProcessId,
        v_addr: VirtualAddr,
        p_addr: PhysicalAddr,
    ) -> Result<()> {
        if v_addr % LARGE_PAGE_SIZE != 0 || p_addr % LARGE_PAGE_SIZE != 0 {
            return Err(Error::new(
                ErrorKind::Parameter,
                "large pages need 2 MiB alignment",
            ));
        }
        let ptb = self.ptb_of(pid)?;
        let mut frame = p_addr;
        while frame < p_addr + LARGE_PAGE_SIZE {
            self.memory.ensure_frame(frame);
            frame += PAGE_SIZE;
        }
        paging::map(
            &mut self.memory,
            &mut self.tables,
            ptb,
            v_addr,
            p_addr,
            PageSize::Large,
        )
    }

    pub fn write_virtual(&mut self, pid: ProcessId, v_addr: VirtualAddr, data: &[u8]) -> Result<()> {
        let ptb = self.ptb_of(pid)?;
        for (i, byte) in data.iter().enumerate() {
            let addr = v_addr + i as u64;
            let (p_addr, _) =
                paging::translate(&self.memory, ptb, addr).ok_or_else(|| Error::fault(addr))?;
            self.memory.write(p_addr, &[*byte])?;
        }
        Ok(())
    }

    pub fn write_physical(&mut self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        self.memory.write(p_addr, data)
    }

    pub fn build(&mut self) -> Result<Machine> {
        let first = *self
            .processes
            .keys()
            .next()
            .ok_or_else(|| Error::new(ErrorKind::Parameter, "a machine needs a process"))?;
        let current_pid = self.current_pid.unwrap_or(first);
        let target_pid = self.target_pid.unwrap_or(current_pid);
        for pid in &[current_pid, target_pid] {
            if !self.processes.contains_key(pid) {
                return Err(Error::from(ErrorKind::NoSuchProcess));
            }
        }

        // direct map of RAM, skipping paging structures
        let tables: HashSet<PhysicalAddr> = self.tables.iter().copied().collect();
        let ram: Vec<PhysicalAddr> = self
            .memory
            .frames()
            .filter(|f| !tables.contains(f))
            .collect();
        let ptbs: Vec<PhysicalAddr> = self.processes.values().map(|p| p.cr3.0).collect();
        for ptb in ptbs {
            for frame in &ram {
                paging::map(
                    &mut self.memory,
                    &mut self.tables,
                    ptb,
                    PHYSMAP_BASE + frame,
                    *frame,
                    PageSize::Small,
                )?;
            }
        }

        let memory = std::mem::replace(&mut self.memory, PhysicalMemory::new());
        let loaded = self.processes[&current_pid].cr3;
        Ok(Machine {
            memory: RwLock::new(memory),
            tables: self.tables.drain(..).collect(),
            tlb: Mutex::new(LruCache::new(TLB_CAP)),
            processes: std::mem::replace(&mut self.processes, BTreeMap::new()),
            current_pid,
            target_pid,
            loaded: Mutex::new(loaded),
            cores: Cores::new(std::mem::replace(&mut self.msrs, vec![]), &self.refusing),
            pools: Mutex::new(Pools {
                scratch_limit: self.scratch_limit,
                reserve_limit: self.reserve_limit,
                ..Pools::default()
            }),
            journal: Mutex::new(vec![]),
        })
    }

    fn ptb_of(&self, pid: ProcessId) -> Result<PhysicalAddr> {
        self.processes
            .get(&pid)
            .map(|p| p.cr3.0)
            .ok_or_else(|| Error::from(ErrorKind::NoSuchProcess))
    }
}
