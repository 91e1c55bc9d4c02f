pub mod breakpoint;
pub mod memory;
pub mod msr;
pub mod prealloc;
pub mod search;
mod session;

pub use session::{Session, SessionConfig};

use serde::{Deserialize, Serialize};

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub type Result<T> = std::result::Result<T, Error>;

/// Where a command executes. `Restricted` is the hypervisor's root mode:
/// faults cannot be recovered from and accesses target the halted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    Normal,
    Restricted,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext::Normal
    }
}

/// Result field reported back to the client, independent of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    ResultBufferFull,
    InvalidParameter,
    ReadInvalidParameter,
    InvalidPhysicalAddress,
    InvalidAddress,
    InvalidAddressBasedOnCurrentProcess,
    InvalidAddressBasedOnOtherProcess,
    NotContiguous,
    AllocationFailure,
    UnknownMechanism,
    UnknownPreactivation,
    PlatformFailure,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

impl error::Error for Error {}

#[derive(Debug)]
pub enum Error {
    InvalidParameter,
    ReadInvalidParameter,
    InvalidPhysicalAddress,
    InvalidAddress,
    InvalidAddressBasedOnCurrentProcess,
    InvalidAddressBasedOnOtherProcess,
    NotContiguous,
    AllocationFailure,
    UnknownMechanism(u32),
    UnknownPreactivation(u32),
    Platform(hvkd::Error),
}

impl Error {
    pub fn status(&self) -> Status {
        use Error::*;
        match self {
            InvalidParameter => Status::InvalidParameter,
            ReadInvalidParameter => Status::ReadInvalidParameter,
            InvalidPhysicalAddress => Status::InvalidPhysicalAddress,
            InvalidAddress => Status::InvalidAddress,
            InvalidAddressBasedOnCurrentProcess => Status::InvalidAddressBasedOnCurrentProcess,
            InvalidAddressBasedOnOtherProcess => Status::InvalidAddressBasedOnOtherProcess,
            NotContiguous => Status::NotContiguous,
            AllocationFailure => Status::AllocationFailure,
            UnknownMechanism(_) => Status::UnknownMechanism,
            UnknownPreactivation(_) => Status::UnknownPreactivation,
            Platform(_) => Status::PlatformFailure,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            InvalidParameter => write!(f, "invalid parameter"),
            ReadInvalidParameter => write!(f, "invalid parameter for reading memory"),
            InvalidPhysicalAddress => write!(f, "invalid physical address"),
            InvalidAddress => write!(f, "invalid address"),
            InvalidAddressBasedOnCurrentProcess => {
                write!(f, "address is invalid in the current process")
            }
            InvalidAddressBasedOnOtherProcess => {
                write!(f, "address is invalid in the requested process")
            }
            NotContiguous => write!(f, "range is not contiguously mapped"),
            AllocationFailure => write!(f, "failed to allocate a scratch buffer"),
            UnknownMechanism(raw) => write!(f, "unknown preallocation type {}", raw),
            UnknownPreactivation(raw) => write!(f, "unknown preactivation type {}", raw),
            Platform(e) => write!(f, "{}", e),
        }
    }
}

impl From<hvkd::Error> for Error {
    fn from(e: hvkd::Error) -> Self {
        Error::Platform(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        use Error::*;
        match e {
            Platform(platform_err) => platform_err.into(),
            AllocationFailure => io::Error::new(io::ErrorKind::Other, e),
            _ => io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    }
}
