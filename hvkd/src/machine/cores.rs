use crate::{CoreContext, CoreIndex, CoreTask, Error, ErrorKind, Result};

use async_std::sync::Mutex;
use async_std::task;

use futures::future::join_all;

use std::collections::HashMap;

use log::debug;

pub(super) struct Core {
    msrs: Mutex<HashMap<u32, u64>>,
    // single-core dispatch to this core is refused
    refuses_dispatch: bool,
}

struct CoreView<'a> {
    index: CoreIndex,
    msrs: &'a mut HashMap<u32, u64>,
}

impl<'a> CoreContext for CoreView<'a> {
    fn index(&self) -> CoreIndex {
        self.index
    }

    fn read_msr(&mut self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }
}

pub(super) struct Cores {
    cores: Vec<Core>,
}

impl Cores {
    pub(super) fn new(msrs: Vec<HashMap<u32, u64>>, refusing: &[CoreIndex]) -> Self {
        let cores = msrs
            .into_iter()
            .enumerate()
            .map(|(i, msrs)| Core {
                msrs: Mutex::new(msrs),
                refuses_dispatch: refusing.contains(&(i as CoreIndex)),
            })
            .collect();
        Self { cores }
    }

    pub(super) fn count(&self) -> u32 {
        self.cores.len() as u32
    }

    pub(super) fn broadcast(&self, task: CoreTask) {
        let runs = self
            .cores
            .iter()
            .enumerate()
            .map(|(i, core)| Self::run(i as CoreIndex, core, task));
        task::block_on(join_all(runs));
    }

    pub(super) fn run_on(&self, index: CoreIndex, task: CoreTask) -> Result<()> {
        let core = self
            .cores
            .get(index as usize)
            .ok_or_else(|| Error::from(ErrorKind::NoSuchCore))?;
        if core.refuses_dispatch {
            debug!("core {} refused the dispatch", index);
            return Err(Error::from(ErrorKind::CoreUnavailable));
        }
        task::block_on(Self::run(index, core, task));
        Ok(())
    }

    pub(super) fn msr(&self, index: CoreIndex, msr: u32) -> Option<u64> {
        let core = self.cores.get(index as usize)?;
        let msrs = task::block_on(core.msrs.lock());
        msrs.get(&msr).copied()
    }

    async fn run(index: CoreIndex, core: &Core, task: CoreTask<'_>) {
        let mut msrs = core.msrs.lock().await;
        let mut view = CoreView {
            index,
            msrs: &mut *msrs,
        };
        task(&mut view);
    }
}
