
use crate::breakpoint::BreakpointShadowTable;
use crate::{Error, ExecutionContext, Result};

use hvkd::{
    AddressSpaceSwitcher, MemoryAccessor, MemoryKind, ProcessId, ProcessInspector, Translator,
    VirtualAddr,
};

use serde::{Deserialize, Serialize};

use std::convert::TryFrom;

use log::{debug, error};

const KERNEL_BASE: VirtualAddr = 0xffff_8000_0000_0000;

/// Width of one element of an edit or a search pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkSize {
    Byte = 1,
    Dword = 4,
    Qword = 8,
}

impl ChunkSize {
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// The low `bytes()` bytes of `value`.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            ChunkSize::Byte => value & 0xff,
            ChunkSize::Dword => value & 0xffff_ffff,
            ChunkSize::Qword => value,
        }
    }

    pub(crate) fn encode(self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.bytes()].to_vec()
    }

    pub(crate) fn decode(self, bytes: &[u8]) -> u64 {
        let mut word = [0u8; 8];
        word[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(word)
    }
}

impl TryFrom<u32> for ChunkSize {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(ChunkSize::Byte),
            4 => Ok(ChunkSize::Dword),
            8 => Ok(ChunkSize::Qword),
            _ => Err(Error::InvalidParameter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    Unknown,
    Bit32,
    Bit64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMemoryRequest {
    pub pid: ProcessId,
    pub address: u64,
    pub size: u32,
    pub kind: MemoryKind,
    #[serde(default)]
    pub get_address_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub address_mode: AddressMode,
}

/// `chunks` holds one 8-byte slot per element; only the low `chunk_size`
/// bytes of each are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMemoryRequest {
    pub pid: ProcessId,
    pub address: u64,
    pub chunk_size: u32,
    pub count: u32,
    pub kind: MemoryKind,
    pub chunks: Vec<u64>,
}

impl EditMemoryRequest {
    fn validate(&self) -> Result<(ChunkSize, &[u64])> {
        let chunk = ChunkSize::try_from(self.chunk_size)?;
        if self.chunks.len() != self.count as usize {
            return Err(Error::InvalidParameter);
        }
        Ok((chunk, &self.chunks[..]))
    }
}

pub fn read_memory<P>(
    platform: &P,
    breakpoints: &BreakpointShadowTable,
    ctx: ExecutionContext,
    req: &ReadMemoryRequest,
) -> Result<ReadOutcome>
where
    P: MemoryAccessor + ProcessInspector + ?Sized,
{
    if req.size == 0 || req.address == 0 {
        return Err(Error::ReadInvalidParameter);
    }

    let mut data = vec![0u8; req.size as usize];
    match ctx {
        ExecutionContext::Normal => {
            let copied = platform
                .read_process_memory(req.pid, req.address, req.kind, &mut data)
                .map_err(|e| {
                    debug!("read of 0x{:x} failed: {}", req.address, e);
                    Error::ReadInvalidParameter
                })?;
            data.truncate(copied);
        }
        ExecutionContext::Restricted => match req.kind {
            MemoryKind::Physical => {
                if !platform.check_physical_address(req.address) {
                    return Err(Error::InvalidPhysicalAddress);
                }
                platform.read_physical_safe(req.address, &mut data)?;
            }
            MemoryKind::Virtual => {
                if !platform.check_access_validity_and_safety(req.address, data.len()) {
                    return Err(Error::InvalidAddress);
                }
                platform.read_virtual_safe_on_target(req.address, &mut data)?;
                breakpoints.unshadow(req.address, &mut data);
            }
        },
    }

    let address_mode = if req.kind == MemoryKind::Virtual && req.get_address_mode {
        match ctx {
            ExecutionContext::Normal => {
                infer_address_mode(req.address, || platform.is_wow64(req.pid))
            }
            ExecutionContext::Restricted => {
                infer_address_mode(req.address, || platform.is_wow64_target())
            }
        }
    } else {
        AddressMode::Unknown
    };

    Ok(ReadOutcome { data, address_mode })
}

/// Kernel addresses are 64-bit; below that the owning process decides, and
/// an unanswered question means 64-bit.
pub fn infer_address_mode<F>(address: VirtualAddr, is_wow64: F) -> AddressMode
where
    F: FnOnce() -> hvkd::Result<bool>,
{
    if address >= KERNEL_BASE {
        return AddressMode::Bit64;
    }
    match is_wow64() {
        Ok(true) => AddressMode::Bit32,
        Ok(false) => AddressMode::Bit64,
        Err(e) => {
            debug!("cannot classify the process: {}", e);
            AddressMode::Bit64
        }
    }
}

/// Returns the number of bytes written.
pub fn edit_memory<P>(
    platform: &P,
    ctx: ExecutionContext,
    req: &EditMemoryRequest,
) -> Result<usize>
where
    P: AddressSpaceSwitcher + Translator + MemoryAccessor + ?Sized,
{
    let (chunk, chunks) = req.validate()?;
    let total = chunk.bytes() * chunks.len();
    let target = |i: usize| {
        req.address
            .checked_add((i * chunk.bytes()) as u64)
            .ok_or(Error::InvalidAddress)
    };

    match (ctx, req.kind) {
        (ExecutionContext::Normal, MemoryKind::Virtual) => {
            if req.pid == platform.current_process_id() {
                platform
                    .virt_to_phys(req.address)
                    .ok_or(Error::InvalidAddressBasedOnCurrentProcess)?;
            } else {
                platform
                    .virt_to_phys_by_process(req.address, req.pid)
                    .ok_or(Error::InvalidAddressBasedOnOtherProcess)?;
            }
            for (i, value) in chunks.iter().enumerate() {
                platform.write_virtual_unsafe(target(i)?, &chunk.encode(*value), req.pid)?;
            }
        }
        (ExecutionContext::Normal, MemoryKind::Physical) => {
            if !platform.check_physical_address(req.address) {
                return Err(Error::InvalidAddress);
            }
            for (i, value) in chunks.iter().enumerate() {
                let p_addr = target(i)?;
                platform
                    .write_physical_normal(p_addr, &chunk.encode(*value))
                    .map_err(|e| {
                        error!("edit aborted at 0x{:x}: {}", p_addr, e);
                        Error::InvalidAddress
                    })?;
            }
        }
        (ExecutionContext::Restricted, MemoryKind::Virtual) => {
            if !platform.check_access_validity_and_safety(req.address, total) {
                return Err(Error::InvalidAddress);
            }
            for (i, value) in chunks.iter().enumerate() {
                platform.write_virtual_safe_on_target(target(i)?, &chunk.encode(*value))?;
            }
        }
        (ExecutionContext::Restricted, MemoryKind::Physical) => {
            if !platform.check_physical_address(req.address) {
                return Err(Error::InvalidAddress);
            }
            for (i, value) in chunks.iter().enumerate() {
                platform.write_physical_safe(target(i)?, &chunk.encode(*value))?;
            }
        }
    }

    Ok(total)
}
