use super::{Machine, MachineBuilder};
use crate::{CoreIndex, PhysicalAddr, ProcessId, Result, VirtualAddr};

use serde::{Deserialize, Serialize};

use log::debug;

/// Serialized description of a machine, as loaded by the replayer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineImage {
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default)]
    pub current_process: Option<ProcessId>,
    #[serde(default)]
    pub target_process: Option<ProcessId>,
    #[serde(default)]
    pub scratch_limit: Option<usize>,
    /// Bytes of pool reservations accepted, unlimited when absent.
    #[serde(default)]
    pub reserve_limit: Option<usize>,
    #[serde(default)]
    pub refusing_cores: Vec<CoreIndex>,
    #[serde(default)]
    pub msrs: Vec<MsrImage>,
    pub processes: Vec<ProcessImage>,
    #[serde(default)]
    pub physical: Vec<PhysicalBytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsrImage {
    /// Every core when absent.
    #[serde(default)]
    pub core: Option<CoreIndex>,
    pub msr: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessImage {
    pub pid: ProcessId,
    #[serde(default)]
    pub wow64: Option<bool>,
    #[serde(default)]
    pub regions: Vec<RegionImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionImage {
    pub v_addr: VirtualAddr,
    #[serde(default = "default_pages")]
    pub pages: u64,
    /// Fresh frames are allocated when absent.
    #[serde(default)]
    pub p_addr: Option<PhysicalAddr>,
    /// One 2 MiB page at `p_addr`; `pages` is ignored.
    #[serde(default)]
    pub large: bool,
    /// Initial contents, written from `v_addr` on.
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalBytes {
    pub p_addr: PhysicalAddr,
    pub data: Vec<u8>,
}

fn default_cores() -> u32 {
    1
}

fn default_pages() -> u64 {
    1
}

impl MachineImage {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn build(&self) -> Result<Machine> {
        let mut builder = MachineBuilder::new();
        builder.cores(self.cores);
        if let Some(limit) = self.scratch_limit {
            builder.scratch_limit(limit);
        }
        if let Some(limit) = self.reserve_limit {
            builder.reserve_limit(limit);
        }
        for core in &self.refusing_cores {
            builder.refusing_core(*core);
        }
        for m in &self.msrs {
            builder.msr(m.core, m.msr, m.value)?;
        }

        for process in &self.processes {
            builder.process(process.pid, process.wow64)?;
            for region in &process.regions {
                match (region.large, region.p_addr) {
                    (true, Some(p_addr)) => {
                        builder.map_large_at(process.pid, region.v_addr, p_addr)?
                    }
                    (false, Some(p_addr)) => {
                        builder.map_at(process.pid, region.v_addr, p_addr, region.pages)?
                    }
                    (_, None) => {
                        builder.map(process.pid, region.v_addr, region.pages)?;
                    }
                }
                if !region.data.is_empty() {
                    builder.write_virtual(process.pid, region.v_addr, &region.data)?;
                }
            }
            debug!(
                "process {} with {} regions",
                process.pid,
                process.regions.len()
            );
        }

        for bytes in &self.physical {
            builder.write_physical(bytes.p_addr, &bytes.data)?;
        }
        if let Some(pid) = self.current_process {
            builder.current_process(pid);
        }
        if let Some(pid) = self.target_process {
            builder.target_process(pid);
        }
        builder.build()
    }
}
