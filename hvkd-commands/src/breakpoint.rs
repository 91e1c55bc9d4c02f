//! Software breakpoints replace one byte of code with the trap opcode. The
//! shadow table remembers the replaced bytes so readers see the original
//! memory.

#[cfg(test)]
mod tests;

use log::debug;

pub const TRAP_OPCODE: u8 = 0xcc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointDescriptor {
    pub address: u64,
    pub previous_byte: u8,
}

/// Handle of a descriptor. Stays valid until the descriptor is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointId(usize);

#[derive(Debug, Default)]
pub struct BreakpointShadowTable {
    slots: Vec<Option<BreakpointDescriptor>>,
    vacant: Vec<usize>,
}

impl BreakpointShadowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when `address` is already shadowed.
    pub fn insert(&mut self, address: u64, previous_byte: u8) -> Option<BreakpointId> {
        if self.find(address).is_some() {
            return None;
        }
        let descriptor = Some(BreakpointDescriptor {
            address,
            previous_byte,
        });
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = descriptor;
                index
            }
            None => {
                self.slots.push(descriptor);
                self.slots.len() - 1
            }
        };
        Some(BreakpointId(index))
    }

    pub fn remove(&mut self, id: BreakpointId) -> Option<BreakpointDescriptor> {
        let removed = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        Some(removed)
    }

    pub fn get(&self, id: BreakpointId) -> Option<&BreakpointDescriptor> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn find(&self, address: u64) -> Option<BreakpointId> {
        self.slots
            .iter()
            .position(|d| matches!(d, Some(d) if d.address == address))
            .map(BreakpointId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreakpointDescriptor> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Puts the original bytes back into `buf`, which holds memory read from
    /// `address`. Only bytes still equal to the trap opcode are touched.
    pub fn unshadow(&self, address: u64, buf: &mut [u8]) -> usize {
        let mut restored = 0;
        for d in self.iter() {
            let offset = match d.address.checked_sub(address) {
                Some(offset) if offset < buf.len() as u64 => offset as usize,
                _ => continue,
            };
            if buf[offset] == TRAP_OPCODE {
                buf[offset] = d.previous_byte;
                restored += 1;
            }
        }
        if restored > 0 {
            debug!("unshadowed {} breakpoints at 0x{:x}", restored, address);
        }
        restored
    }
}
