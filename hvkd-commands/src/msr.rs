#[cfg(test)]
mod tests;

use crate::{lock, Error, Result};

use hvkd::{CoreContext, CoreIndex, ProcessorDispatcher};

use serde::{Deserialize, Serialize};

use std::sync::Mutex;

use log::debug;

/// Core index addressing every logical processor.
pub const ALL_CORES: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsrAction {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsrRequest {
    pub action: MsrAction,
    pub msr: u32,
    /// A core index or [`ALL_CORES`].
    pub core: u32,
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSelector {
    All,
    Single(CoreIndex),
}

impl From<u32> for CoreSelector {
    fn from(raw: u32) -> Self {
        match raw {
            ALL_CORES => CoreSelector::All,
            core => CoreSelector::Single(core),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrSlot {
    pub msr: u32,
    pub value: u64,
}

/// One slot per logical processor. Slots are staged before a dispatch and
/// each core only touches its own.
#[derive(Debug, Default)]
pub struct MsrBroadcastState {
    slots: Vec<Mutex<MsrSlot>>,
}

impl MsrBroadcastState {
    pub fn new(cores: u32) -> Self {
        Self {
            slots: (0..cores).map(|_| Mutex::new(MsrSlot::default())).collect(),
        }
    }

    pub fn slot(&self, core: CoreIndex) -> Option<MsrSlot> {
        self.slots.get(core as usize).map(|s| *lock(s))
    }

    fn stage(&self, core: CoreIndex, staged: MsrSlot) -> Result<()> {
        let slot = self
            .slots
            .get(core as usize)
            .ok_or(Error::InvalidParameter)?;
        *lock(slot) = staged;
        Ok(())
    }

    fn run(&self, action: MsrAction, core: &mut dyn CoreContext) {
        let slot = match self.slots.get(core.index() as usize) {
            Some(slot) => slot,
            None => return,
        };
        let mut slot = lock(slot);
        let msr = slot.msr;
        match action {
            MsrAction::Read => slot.value = core.read_msr(msr),
            MsrAction::Write => core.write_msr(msr, slot.value),
        }
    }
}

/// Values read, in core order. Empty for writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsrOutcome {
    pub values: Vec<u64>,
}

impl MsrOutcome {
    /// Output payload as the client receives it.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
    }
}

pub fn read_or_write_msr<D>(
    dispatcher: &D,
    state: &MsrBroadcastState,
    req: &MsrRequest,
) -> Result<MsrOutcome>
where
    D: ProcessorDispatcher + ?Sized,
{
    let count = dispatcher.processor_count();
    let staged = MsrSlot {
        msr: req.msr,
        value: match req.action {
            MsrAction::Read => 0,
            MsrAction::Write => req.value,
        },
    };
    let action = req.action;
    let task = |core: &mut dyn CoreContext| state.run(action, core);

    let cores = match CoreSelector::from(req.core) {
        CoreSelector::All => {
            for core in 0..count {
                state.stage(core, staged)?;
            }
            dispatcher.broadcast(&task);
            0..count
        }
        CoreSelector::Single(core) => {
            if core >= count {
                debug!("core {} out of {}", core, count);
                return Err(Error::InvalidParameter);
            }
            state.stage(core, staged)?;
            dispatcher.run_on_core(core, &task)?;
            core..core + 1
        }
    };

    let values = match action {
        MsrAction::Read => cores
            .filter_map(|core| state.slot(core))
            .map(|slot| slot.value)
            .collect(),
        MsrAction::Write => vec![],
    };
    Ok(MsrOutcome { values })
}
