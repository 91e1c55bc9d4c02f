use crate::{page_offset, Error, PhysicalAddr, Result, PAGE_SHIFT, PAGE_SIZE};

use std::cmp;
use std::collections::BTreeMap;

/// Sparse guest RAM made of 4 KiB frames. Frame 0 is never handed out so a
/// zero physical address stays invalid.
#[derive(Debug)]
pub(super) struct PhysicalMemory {
    frames: BTreeMap<u64, Box<[u8]>>,
    next_frame: u64,
}

impl PhysicalMemory {
    pub(super) fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            next_frame: 1,
        }
    }

    pub(super) fn allocate_frame(&mut self) -> PhysicalAddr {
        while self.frames.contains_key(&self.next_frame) {
            self.next_frame += 1;
        }
        let frame = self.next_frame;
        self.next_frame += 1;
        self.frames.insert(frame, vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        frame << PAGE_SHIFT
    }

    /// Allocates `n` frames with consecutive physical addresses.
    pub(super) fn allocate_frames(&mut self, n: u64) -> PhysicalAddr {
        let mut first = self.next_frame;
        while (first..first + n).any(|f| self.frames.contains_key(&f)) {
            first += 1;
        }
        for frame in first..first + n {
            self.frames.insert(frame, vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        }
        self.next_frame = first + n;
        first << PAGE_SHIFT
    }

    pub(super) fn ensure_frame(&mut self, p_addr: PhysicalAddr) {
        let frame = p_addr >> PAGE_SHIFT;
        self.frames
            .entry(frame)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
    }

    pub(super) fn is_present(&self, p_addr: PhysicalAddr) -> bool {
        self.frames.contains_key(&(p_addr >> PAGE_SHIFT))
    }

    pub(super) fn frames(&self) -> impl Iterator<Item = PhysicalAddr> + '_ {
        self.frames.keys().map(|f| f << PAGE_SHIFT)
    }

    pub(super) fn read(&self, p_addr: PhysicalAddr, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = p_addr
                .checked_add(done as u64)
                .ok_or_else(|| Error::fault(p_addr))?;
            let offset = page_offset(addr) as usize;
            let sz = cmp::min(buf.len() - done, PAGE_SIZE as usize - offset);
            let frame = self
                .frames
                .get(&(addr >> PAGE_SHIFT))
                .ok_or_else(|| Error::fault(addr))?;
            buf[done..done + sz].copy_from_slice(&frame[offset..offset + sz]);
            done += sz;
        }
        Ok(())
    }

    pub(super) fn write(&mut self, p_addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        // refuse partial writes
        let mut addr = p_addr;
        let end = p_addr
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::fault(p_addr))?;
        while addr < end {
            if !self.is_present(addr) {
                return Err(Error::fault(addr));
            }
            addr = (addr | (PAGE_SIZE - 1)).saturating_add(1);
        }

        let mut done = 0;
        while done < data.len() {
            let addr = p_addr + done as u64;
            let offset = page_offset(addr) as usize;
            let sz = cmp::min(data.len() - done, PAGE_SIZE as usize - offset);
            if let Some(frame) = self.frames.get_mut(&(addr >> PAGE_SHIFT)) {
                frame[offset..offset + sz].copy_from_slice(&data[done..done + sz]);
            }
            done += sz;
        }
        Ok(())
    }

    pub(super) fn read_u64(&self, p_addr: PhysicalAddr) -> Result<u64> {
        let mut entry = [0u8; 8];
        self.read(p_addr, &mut entry)?;
        Ok(u64::from_le_bytes(entry))
    }

    pub(super) fn write_u64(&mut self, p_addr: PhysicalAddr, value: u64) -> Result<()> {
        self.write(p_addr, &value.to_le_bytes())
    }
}
