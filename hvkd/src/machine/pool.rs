use crate::PoolIntent;

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRequest {
    pub size: usize,
    pub count: u32,
    pub intent: PoolIntent,
}

impl PoolRequest {
    pub fn bytes(&self) -> usize {
        self.size.saturating_mul(self.count as usize)
    }
}

/// Bookkeeping of the pool manager and the hook configurator.
#[derive(Debug, Default)]
pub(super) struct Pools {
    pub(super) scratch_limit: Option<usize>,
    /// Bytes that pending and allocated requests may add up to.
    pub(super) reserve_limit: Option<usize>,
    pub(super) outstanding: usize,
    pub(super) pending: Vec<PoolRequest>,
    pub(super) allocated: Vec<PoolRequest>,
    pub(super) hooking_pages: u32,
    pub(super) ept_hook_pools: u32,
    pub(super) exec_trap: bool,
}

impl Pools {
    fn reserved(&self) -> usize {
        self.allocated
            .iter()
            .chain(self.pending.iter())
            .fold(0, |total, r| total.saturating_add(r.bytes()))
    }

    pub(super) fn request(&mut self, size: usize, count: u32, intent: PoolIntent) -> bool {
        let bytes = size.saturating_mul(count as usize);
        if let Some(limit) = self.reserve_limit {
            if self.reserved().saturating_add(bytes) > limit {
                debug!("refusing 0x{:x} bytes for {:?}", bytes, intent);
                return false;
            }
        }
        self.pending.push(PoolRequest {
            size,
            count,
            intent,
        });
        true
    }

    pub(super) fn perform(&mut self) {
        debug!("performing {} pending pool requests", self.pending.len());
        self.allocated.append(&mut self.pending);
    }

    pub(super) fn allocate(&mut self, len: usize) -> Option<Vec<u64>> {
        match self.scratch_limit {
            Some(limit) if len > limit => None,
            _ => {
                self.outstanding += 1;
                Some(vec![0u64; len])
            }
        }
    }

    pub(super) fn free(&mut self, _buf: Vec<u64>) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}
