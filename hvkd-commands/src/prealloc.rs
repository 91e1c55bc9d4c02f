//! Reserving pool capacity ahead of time, so that features used from the
//! restricted context never have to allocate there.


use crate::{Error, Result};

use hvkd::{HookConfigurator, PoolIntent, PoolManager, PAGE_SIZE};

use lazy_static::lazy_static;

use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::convert::TryFrom;

use log::{debug, error};

const THREAD_HOLDER_SIZE: usize = 0x400;
const REGULAR_EVENT_SIZE: usize = 0x400;
const REGULAR_EVENT_ACTION_SIZE: usize = 0x400;
const BIG_EVENT_SIZE: usize = 0x2000;
const BIG_EVENT_ACTION_SIZE: usize = 0x2000;
const REGULAR_SAFE_BUFFER_SIZE: usize = PAGE_SIZE as usize;
const BIG_SAFE_BUFFER_SIZE: usize = 4 * PAGE_SIZE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    ThreadInterception,
    Monitor,
    EptHook,
    EptHook2,
    RegularEvent,
    BigEvent,
    RegularSafeBuffer,
    BigSafeBuffer,
}

impl TryFrom<u32> for Mechanism {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        use Mechanism::*;
        Ok(match raw {
            0 => ThreadInterception,
            1 => Monitor,
            2 => EptHook,
            3 => EptHook2,
            4 => RegularEvent,
            5 => BigEvent,
            6 => RegularSafeBuffer,
            7 => BigSafeBuffer,
            _ => return Err(Error::UnknownMechanism(raw)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    Pool { size: usize, intent: PoolIntent },
    HookingPages,
    EptHookPools,
}

lazy_static! {
    static ref RESERVATIONS: HashMap<Mechanism, Vec<Reservation>> = {
        use Mechanism::*;
        use Reservation::*;

        let pool = |size, intent| Pool { size, intent };
        let mut m = HashMap::new();
        m.insert(
            ThreadInterception,
            vec![pool(THREAD_HOLDER_SIZE, PoolIntent::ProcessThreadHolder)],
        );
        m.insert(Monitor, vec![HookingPages]);
        m.insert(EptHook, vec![HookingPages]);
        m.insert(EptHook2, vec![EptHookPools]);
        m.insert(
            RegularEvent,
            vec![
                pool(REGULAR_EVENT_SIZE, PoolIntent::InstantRegularEventBuffer),
                pool(
                    REGULAR_EVENT_ACTION_SIZE,
                    PoolIntent::InstantRegularEventActionBuffer,
                ),
            ],
        );
        m.insert(
            BigEvent,
            vec![
                pool(BIG_EVENT_SIZE, PoolIntent::InstantBigEventBuffer),
                pool(BIG_EVENT_ACTION_SIZE, PoolIntent::InstantBigEventActionBuffer),
            ],
        );
        m.insert(
            RegularSafeBuffer,
            vec![pool(
                REGULAR_SAFE_BUFFER_SIZE,
                PoolIntent::InstantRegularSafeBuffer,
            )],
        );
        m.insert(
            BigSafeBuffer,
            vec![pool(BIG_SAFE_BUFFER_SIZE, PoolIntent::InstantBigSafeBuffer)],
        );
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreallocRequest {
    /// Raw mechanism number, see [`Mechanism`].
    pub mechanism: u32,
    pub count: u32,
}

/// Stops at the first refused pool request. Requests queued before it stay
/// pending and are carried out by the next successful reservation.
pub fn reserve_preallocated_pools<P>(platform: &P, req: &PreallocRequest) -> Result<()>
where
    P: PoolManager + HookConfigurator + ?Sized,
{
    let mechanism = Mechanism::try_from(req.mechanism)?;
    let reservations = RESERVATIONS
        .get(&mechanism)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for reservation in reservations {
        match *reservation {
            Reservation::Pool { size, intent } => {
                if !platform.request_allocation(size, req.count, intent) {
                    error!("pool refused {} x 0x{:x} for {:?}", req.count, size, intent);
                    return Err(Error::AllocationFailure);
                }
            }
            Reservation::HookingPages => platform.allocate_extra_hooking_pages(req.count),
            Reservation::EptHookPools => platform.reserve_ept_hook_pools(req.count),
        }
    }

    debug!("reserved {} for {:?}", req.count, mechanism);
    platform.perform_allocations();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preactivation {
    /// User/kernel mode transition tracking.
    Mode,
}

impl TryFrom<u32> for Preactivation {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Preactivation::Mode),
            _ => Err(Error::UnknownPreactivation(raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreactivateRequest {
    pub kind: u32,
}

pub fn preactivate<H>(hooks: &H, req: &PreactivateRequest) -> Result<()>
where
    H: HookConfigurator + ?Sized,
{
    match Preactivation::try_from(req.kind)? {
        Preactivation::Mode => hooks.initialize_exec_trap(),
    }
    Ok(())
}
