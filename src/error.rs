use core::{error::Error, fmt::Display};

use crate::{insn::DecodeError, SbiError, TeeError};

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr) => {
        if !$cond {
            Err($error)
        } else {
            Ok(())
        }
    };
}

#[macro_export]
macro_rules! ensure_not {
    ($cond:expr, $error:expr) => {
        if $cond {
            Err($error)
        } else {
            Ok(())
        }
    };
}

/// Errors that stop the host side run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    Tee(TeeError),
    Sbi(SbiError),
    Decode(DecodeError),
    /// The VCPU exited with a terminal result and cannot run again.
    VcpuTerminated,
    UnhandledFault { addr: u64, scause: u64 },
    UnhandledEcall { extension: u64 },
    UnhandledException { scause: u64 },
    /// A guest request the host refuses to honour, e.g. unsharing from the guest side.
    GuestProtocol(&'static str),
    OutOfHostPages,
    OutOfReservePages,
}

impl Display for HostError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Tee(err) => write!(f, "monitor call failed: {}", err),
            Self::Sbi(err) => write!(f, "sbi call failed: {}", err),
            Self::Decode(err) => write!(f, "cannot decode trapped instruction: {}", err),
            Self::VcpuTerminated => write!(f, "vcpu is not resumable"),
            Self::UnhandledFault { addr, scause } => {
                write!(f, "unhandled guest fault at {:#x} (scause {:#x})", addr, scause)
            }
            Self::UnhandledEcall { extension } => {
                write!(f, "unhandled guest ecall to extension {:#x}", extension)
            }
            Self::UnhandledException { scause } => {
                write!(f, "unhandled exception (scause {:#x})", scause)
            }
            Self::GuestProtocol(what) => write!(f, "guest protocol violation: {}", what),
            Self::OutOfHostPages => write!(f, "host page allocator exhausted"),
            Self::OutOfReservePages => write!(f, "no confidential reserve page left"),
        }
    }
}

impl Error for HostError {}

impl From<TeeError> for HostError {
    fn from(err: TeeError) -> Self {
        Self::Tee(err)
    }
}

impl From<SbiError> for HostError {
    fn from(err: SbiError) -> Self {
        Self::Sbi(err)
    }
}

impl From<DecodeError> for HostError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
