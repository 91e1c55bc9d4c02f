use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;

use serde::{Deserialize, Serialize};

pub mod machine;

pub type Result<T> = std::result::Result<T, Error>;

pub type PhysicalAddr = u64;
pub type VirtualAddr = u64;
pub type ProcessId = u32;
pub type CoreIndex = u32;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

pub fn page_align(addr: u64) -> u64 {
    addr & !PAGE_OFFSET_MASK
}

pub fn page_offset(addr: u64) -> u64 {
    addr & PAGE_OFFSET_MASK
}

/// Root paging structure of an address space. Switching hands back the
/// previous one, which must be given to `restore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cr3(pub PhysicalAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Virtual,
    Physical,
}

pub trait AddressSpaceSwitcher {
    fn current_process_id(&self) -> ProcessId;
    /// Root table of the process that was running when the debuggee halted.
    fn target_process_cr3(&self) -> Cr3;
    fn switch_to_process(&self, pid: ProcessId) -> Result<Cr3>;
    fn switch_to_cr3(&self, cr3: Cr3) -> Cr3;
    fn restore(&self, previous: Cr3);
}

pub trait Translator {
    /// Translation in the address space currently loaded.
    fn virt_to_phys(&self, v_addr: VirtualAddr) -> Option<PhysicalAddr>;
    fn virt_to_phys_by_process(&self, v_addr: VirtualAddr, pid: ProcessId)
        -> Option<PhysicalAddr>;
    fn phys_to_virt(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr>;
    fn phys_to_virt_by_process(&self, p_addr: PhysicalAddr, pid: ProcessId)
        -> Option<VirtualAddr>;
    fn phys_to_virt_on_target(&self, p_addr: PhysicalAddr) -> Option<VirtualAddr>;
}

pub trait MemoryAccessor {
    fn check_physical_address(&self, p_addr: PhysicalAddr) -> bool;
    /// Whether `[v_addr, v_addr + len)` is mapped and present in the halted
    /// target's address space.
    fn check_access_validity_and_safety(&self, v_addr: VirtualAddr, len: usize) -> bool;

    fn read_process_memory(
        &self,
        pid: ProcessId,
        addr: u64,
        kind: MemoryKind,
        buf: &mut [u8],
    ) -> Result<usize>;
    fn read_physical_safe(&self, p_addr: PhysicalAddr, buf: &mut [u8]) -> Result<()>;
    /// Fault-tolerant read in the address space currently loaded.
    fn read_virtual_safe(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()>;
    fn read_virtual_safe_on_target(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()>;
    /// Plain copy in the address space currently loaded.
    fn copy_virtual(&self, v_addr: VirtualAddr, buf: &mut [u8]) -> Result<()>;

    /// Writes through a temporary writable mapping, so read-only pages of
    /// process `pid` can be patched.
    fn write_virtual_unsafe(&self, v_addr: VirtualAddr, data: &[u8], pid: ProcessId)
        -> Result<()>;
    fn write_virtual_safe_on_target(&self, v_addr: VirtualAddr, data: &[u8]) -> Result<()>;
    fn write_physical_normal(&self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()>;
    fn write_physical_safe(&self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()>;
}

pub trait ProcessInspector {
    fn process_exists(&self, pid: ProcessId) -> bool;
    /// Whether `pid` runs in 32-bit compatibility mode.
    fn is_wow64(&self, pid: ProcessId) -> Result<bool>;
    /// Classifies the process that was running when the debuggee halted.
    fn is_wow64_target(&self) -> Result<bool>;
}

pub trait CoreContext {
    fn index(&self) -> CoreIndex;
    fn read_msr(&mut self, msr: u32) -> u64;
    fn write_msr(&mut self, msr: u32, value: u64);
}

pub type CoreTask<'a> = &'a (dyn Fn(&mut dyn CoreContext) + Sync);

pub trait ProcessorDispatcher {
    fn processor_count(&self) -> u32;
    /// Runs `task` once on every core and returns when all of them are done.
    fn broadcast(&self, task: CoreTask);
    fn run_on_core(&self, core: CoreIndex, task: CoreTask) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolIntent {
    ProcessThreadHolder,
    InstantRegularEventBuffer,
    InstantRegularEventActionBuffer,
    InstantBigEventBuffer,
    InstantBigEventActionBuffer,
    InstantRegularSafeBuffer,
    InstantBigSafeBuffer,
}

pub trait PoolManager {
    fn request_allocation(&self, size: usize, count: u32, intent: PoolIntent) -> bool;
    fn perform_allocations(&self);
    fn allocate_zeroed(&self, len: usize) -> Option<Vec<u64>>;
    fn free(&self, buf: Vec<u64>);
}

pub trait HookConfigurator {
    fn allocate_extra_hooking_pages(&self, count: u32);
    fn reserve_ept_hook_pools(&self, count: u32);
    fn initialize_exec_trap(&self);
}

pub trait Platform:
    AddressSpaceSwitcher
    + Translator
    + MemoryAccessor
    + ProcessInspector
    + ProcessorDispatcher
    + PoolManager
    + HookConfigurator
{
}

impl<T> Platform for T where
    T: AddressSpaceSwitcher
        + Translator
        + MemoryAccessor
        + ProcessInspector
        + ProcessorDispatcher
        + PoolManager
        + HookConfigurator
{
}

// Error handling
#[derive(Debug)]
pub struct Error {
    repr: Repr,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            Repr::Simple(kind) => *kind,
            Repr::IO(_) => ErrorKind::IO,
            Repr::Custom(w) => w.kind,
        }
    }

    pub fn fault(addr: u64) -> Self {
        Self::new(ErrorKind::Fault, format!("0x{:x}", addr))
    }

    fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self {
            repr: Repr::Custom(Wrapper {
                kind,
                error: error.into(),
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    IO,
    Fault,
    NoSuchProcess,
    NoSuchCore,
    CoreUnavailable,
    OutOfMemory,
    MalformedImage,
    Parameter,
}

#[derive(Debug)]
enum Repr {
    IO(io::Error),
    Simple(ErrorKind),
    Custom(Wrapper),
}

#[derive(Debug)]
struct Wrapper {
    kind: ErrorKind,
    error: Box<dyn error::Error + Send + Sync>,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Simple(ref kind) => match kind {
                ErrorKind::Fault => write!(f, "memory access fault"),
                ErrorKind::NoSuchProcess => write!(f, "no such process"),
                ErrorKind::NoSuchCore => write!(f, "no such logical processor"),
                ErrorKind::CoreUnavailable => write!(f, "logical processor unavailable"),
                ErrorKind::OutOfMemory => write!(f, "out of memory"),
                ErrorKind::Parameter => write!(f, "wrong parameter"),
                _ => write!(f, "{:?}", self),
            },
            Repr::IO(e) => write!(f, "failed to do io: {}", e),
            Repr::Custom(ref w) => match w.kind {
                ErrorKind::Fault => write!(f, "memory access fault at {}", w.error),
                ErrorKind::MalformedImage => write!(f, "malformed machine image: {}", w.error),
                ErrorKind::Parameter => write!(f, "wrong parameter: {}", w.error),
                _ => write!(f, "{:?}", self),
            },
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            repr: Repr::Simple(kind),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error { repr: Repr::IO(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::MalformedImage, e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e.kind() {
            ErrorKind::MalformedImage | ErrorKind::Parameter => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        match e.repr {
            Repr::IO(e) => e,
            repr => io::Error::new(kind, Error { repr }),
        }
    }
}
