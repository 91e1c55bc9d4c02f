
use crate::breakpoint::{BreakpointDescriptor, BreakpointId, BreakpointShadowTable};
use crate::memory::{self, EditMemoryRequest, ReadMemoryRequest, ReadOutcome};
use crate::msr::{self, MsrBroadcastState, MsrOutcome, MsrRequest};
use crate::prealloc::{self, PreactivateRequest, PreallocRequest};
use crate::search::{self, InteractiveOutcome, SearchMemoryRequest, SearchOutcome};
use crate::{read_lock, write_lock, ExecutionContext, Result};

use hvkd::Platform;

use serde::{Deserialize, Serialize};

use std::io;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};

use log::error;

const DEFAULT_MAX_SEARCH_RESULTS: usize = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the search result buffer, in addresses.
    pub max_search_results: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_search_results: DEFAULT_MAX_SEARCH_RESULTS,
        }
    }
}

impl SessionConfig {
    pub fn from_json(s: &str) -> io::Result<Self> {
        let config = serde_json::from_str(s)?;
        Ok(config)
    }

    pub fn load<T: AsRef<Path>>(path: T) -> io::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json(&s)
    }
}

/// State shared by every command of one debugging session.
pub struct Session<P> {
    platform: P,
    config: SessionConfig,
    breakpoints: RwLock<BreakpointShadowTable>,
    msr_state: MsrBroadcastState,
}

fn logged<T>(op: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("{} aborted: {}", op, e);
    }
    result
}

impl<P: Platform> Session<P> {
    pub fn new(platform: P, config: SessionConfig) -> Self {
        let msr_state = MsrBroadcastState::new(platform.processor_count());
        Self {
            platform,
            config,
            breakpoints: RwLock::new(BreakpointShadowTable::new()),
            msr_state,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn breakpoints(&self) -> RwLockReadGuard<'_, BreakpointShadowTable> {
        read_lock(&self.breakpoints)
    }

    pub fn install_shadow(&self, address: u64, previous_byte: u8) -> Option<BreakpointId> {
        write_lock(&self.breakpoints).insert(address, previous_byte)
    }

    pub fn remove_shadow(&self, id: BreakpointId) -> Option<BreakpointDescriptor> {
        write_lock(&self.breakpoints).remove(id)
    }

    pub fn read_memory(
        &self,
        ctx: ExecutionContext,
        req: &ReadMemoryRequest,
    ) -> Result<ReadOutcome> {
        let breakpoints = read_lock(&self.breakpoints);
        logged(
            "read",
            memory::read_memory(&self.platform, &breakpoints, ctx, req),
        )
    }

    pub fn edit_memory(&self, ctx: ExecutionContext, req: &EditMemoryRequest) -> Result<usize> {
        logged("edit", memory::edit_memory(&self.platform, ctx, req))
    }

    pub fn search_memory(
        &self,
        ctx: ExecutionContext,
        req: &SearchMemoryRequest,
    ) -> Result<SearchOutcome> {
        logged(
            "search",
            search::search_memory(&self.platform, self.config.max_search_results, ctx, req),
        )
    }

    pub fn search_memory_interactive(
        &self,
        req: &SearchMemoryRequest,
        on_match: &mut dyn FnMut(u64),
    ) -> Result<InteractiveOutcome> {
        logged(
            "search",
            search::search_memory_interactive(
                &self.platform,
                self.config.max_search_results,
                req,
                on_match,
            ),
        )
    }

    pub fn read_or_write_msr(&self, req: &MsrRequest) -> Result<MsrOutcome> {
        logged(
            "msr",
            msr::read_or_write_msr(&self.platform, &self.msr_state, req),
        )
    }

    pub fn reserve_preallocated_pools(&self, req: &PreallocRequest) -> Result<()> {
        logged(
            "prealloc",
            prealloc::reserve_preallocated_pools(&self.platform, req),
        )
    }

    pub fn preactivate(&self, req: &PreactivateRequest) -> Result<()> {
        logged("preactivate", prealloc::preactivate(&self.platform, req))
    }
}
