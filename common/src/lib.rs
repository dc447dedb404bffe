#![cfg_attr(not(test), no_std)]

pub mod sbi {
    use core::fmt::Display;

    pub const PAGE_SIZE: usize = 4096;

    // CoVH constants
    pub const SBI_COVH_EXT_ID: usize = 0x434F5648;

    pub const SBI_COVH_GET_TSM_INFO: usize = 0;
    pub const SBI_COVH_CONVERT_PAGES: usize = 1;
    pub const SBI_COVH_RECLAIM_PAGES: usize = 2;
    pub const SBI_COVH_GLOBAL_FENCE: usize = 3;
    pub const SBI_COVH_LOCAL_FENCE: usize = 4;
    pub const SBI_COVH_CREATE_TVM: usize = 5;
    pub const SBI_COVH_FINALIZE_TVM: usize = 6;
    pub const SBI_COVH_DESTROY_TVM: usize = 7;
    pub const SBI_COVH_ADD_TVM_MEMORY_REGION: usize = 8;
    pub const SBI_COVH_ADD_TVM_PAGE_TABLE_PAGES: usize = 9;
    pub const SBI_COVH_ADD_TVM_MEASURED_PAGES: usize = 10;
    pub const SBI_COVH_ADD_TVM_ZERO_PAGES: usize = 11;
    pub const SBI_COVH_ADD_TVM_SHARED_PAGES: usize = 12;
    pub const SBI_COVH_CREATE_TVM_VCPU: usize = 13;
    pub const SBI_COVH_RUN_TVM_VCPU: usize = 14;
    pub const SBI_COVH_TVM_FENCE: usize = 15;

    // CoVG constants
    pub const SBI_COVG_EXT_ID: usize = 0x434F5647;

    pub const SBI_COVG_ADD_MMIO_REGION: usize = 0;
    pub const SBI_COVG_REMOVE_MMIO_REGION: usize = 1;
    pub const SBI_COVG_SHARE_MEMORY_REGION: usize = 2;
    pub const SBI_COVG_UNSHARE_MEMORY_REGION: usize = 3;

    // NACL constants
    pub const SBI_NACL_EXT_ID: usize = 0x4E41434C;
    pub const SBI_NACL_SET_SHMEM: usize = 1;

    // MPXY constants
    pub const SBI_MPXY_EXT_ID: usize = 0x4D505859;

    pub const SBI_MPXY_SET_SHMEM: usize = 0;
    pub const SBI_MPXY_GET_CHANNEL_IDS: usize = 1;
    pub const SBI_MPXY_READ_ATTRS: usize = 2;
    pub const SBI_MPXY_WRITE_ATTRS: usize = 3;
    pub const SBI_MPXY_SEND_MSG_WITH_RESP: usize = 4;
    pub const SBI_MPXY_SEND_MSG_NO_RESP: usize = 5;
    pub const SBI_MPXY_GET_NOTIFICATION_EVENTS: usize = 6;

    /// Physical address value that disables a previously registered shared memory.
    pub const INVAL_PHYS_ADDR: usize = usize::MAX;

    // Debug console
    pub const SBI_DBCN_EXT_ID: usize = 0x4442434E;
    pub const SBI_DBCN_CONSOLE_WRITE: usize = 0;

    /// Legacy console putchar, still used by early guest firmware.
    pub const SBI_LEGACY_PUTCHAR_EXT_ID: usize = 0x1;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SbiRet {
        pub a0: isize,
        pub a1: isize,
    }

    impl SbiRet {
        pub const fn success(value: isize) -> Self {
            Self { a0: 0, a1: value }
        }

        pub const fn error(code: isize) -> Self {
            Self { a0: code, a1: 0 }
        }

        pub fn into_result(self) -> Result<usize, SbiError> {
            if self.a0 == 0 {
                Ok(self.a1 as usize)
            } else {
                Err(SbiError::from_code(self.a0).unwrap_or(SbiError::Failed))
            }
        }
    }

    impl From<Result<usize, SbiError>> for SbiRet {
        fn from(res: Result<usize, SbiError>) -> Self {
            match res {
                Ok(value) => Self::success(value as isize),
                Err(err) => Self::error(err.code()),
            }
        }
    }

    /// Standard SBI error codes.
    #[repr(isize)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum SbiError {
        Failed = -1,
        NotSupported = -2,
        InvalidParam = -3,
        Denied = -4,
        InvalidAddress = -5,
        AlreadyAvailable = -6,
        AlreadyStarted = -7,
        AlreadyStopped = -8,
        NoSharedMemory = -9,
        InvalidState = -10,
        BadRange = -11,
        NotImplemented = -12,
        Timeout = -13,
        Io = -14,
    }

    impl SbiError {
        pub const fn code(self) -> isize {
            self as isize
        }

        pub fn from_code(code: isize) -> Option<Self> {
            let err = match code {
                -1 => Self::Failed,
                -2 => Self::NotSupported,
                -3 => Self::InvalidParam,
                -4 => Self::Denied,
                -5 => Self::InvalidAddress,
                -6 => Self::AlreadyAvailable,
                -7 => Self::AlreadyStarted,
                -8 => Self::AlreadyStopped,
                -9 => Self::NoSharedMemory,
                -10 => Self::InvalidState,
                -11 => Self::BadRange,
                -12 => Self::NotImplemented,
                -13 => Self::Timeout,
                -14 => Self::Io,
                _ => return None,
            };
            Some(err)
        }
    }

    impl Display for SbiError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            let msg = match self {
                Self::Failed => "failed",
                Self::NotSupported => "not supported",
                Self::InvalidParam => "invalid parameter",
                Self::Denied => "denied",
                Self::InvalidAddress => "invalid address",
                Self::AlreadyAvailable => "already available",
                Self::AlreadyStarted => "already started",
                Self::AlreadyStopped => "already stopped",
                Self::NoSharedMemory => "no shared memory",
                Self::InvalidState => "invalid state",
                Self::BadRange => "bad range",
                Self::NotImplemented => "not implemented",
                Self::Timeout => "timeout",
                Self::Io => "i/o error",
            };
            write!(f, "sbi error {}: {}", self.code(), msg)
        }
    }

    impl core::error::Error for SbiError {}

    #[cfg(target_arch = "riscv64")]
    pub fn sbi_call(extid: usize, fid: usize, args: &[usize; 6]) -> SbiRet {
        let (a0, a1);
        unsafe {
            core::arch::asm!(
                "ecall",
                in("a7") extid,
                in("a6") fid,
                inlateout("a0") args[0] => a0,
                inlateout("a1") args[1] => a1,
                in("a2") args[2],
                in("a3") args[3],
                in("a4") args[4],
                in("a5") args[5],
            );
        }
        SbiRet { a0, a1 }
    }
}

pub mod tee {
    use core::fmt::Display;

    /// Status codes of the CoVE host interface. `0` is success and is not represented.
    #[repr(isize)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TeeError {
        InvalidAddress = 1,
        InvalidParam = 2,
        Failed = 3,
        AlreadyStarted = 4,
        OutOfPtPages = 5,
    }

    impl TeeError {
        pub const fn code(self) -> isize {
            self as isize
        }

        pub fn from_code(code: isize) -> Option<Self> {
            let err = match code {
                1 => Self::InvalidAddress,
                2 => Self::InvalidParam,
                3 => Self::Failed,
                4 => Self::AlreadyStarted,
                5 => Self::OutOfPtPages,
                _ => return None,
            };
            Some(err)
        }
    }

    impl Display for TeeError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            let msg = match self {
                Self::InvalidAddress => "invalid address",
                Self::InvalidParam => "invalid parameter",
                Self::Failed => "failed",
                Self::AlreadyStarted => "already started",
                Self::OutOfPtPages => "out of page table pages",
            };
            write!(f, "tee error {}: {}", self.code(), msg)
        }
    }

    impl core::error::Error for TeeError {}

    impl From<Result<usize, TeeError>> for super::sbi::SbiRet {
        fn from(res: Result<usize, TeeError>) -> Self {
            match res {
                Ok(value) => Self::success(value as isize),
                Err(err) => Self::error(err.code()),
            }
        }
    }

    /// Turns the raw answer of a CoVH call into a typed result. Unknown codes are `Failed`.
    pub fn tee_result(ret: super::sbi::SbiRet) -> Result<usize, TeeError> {
        if ret.a0 == 0 {
            Ok(ret.a1 as usize)
        } else {
            Err(TeeError::from_code(ret.a0).unwrap_or(TeeError::Failed))
        }
    }

    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TsmState {
        /* TSM has not been loaded on this platform. */
        NotLoaded = 0,
        /* TSM has been loaded, but has not yet been initialized. */
        Loaded = 1,
        /* TSM has been loaded & initialized, and is ready to accept ECALLs. */
        Ready = 2,
    }

    impl TsmState {
        pub fn from_u32(value: u32) -> Option<Self> {
            match value {
                0 => Some(Self::NotLoaded),
                1 => Some(Self::Loaded),
                2 => Some(Self::Ready),
                _ => None,
            }
        }
    }

    #[repr(usize)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TsmPageType {
        /* 4 KiB */
        Page4k = 0,
        /* 2 MiB */
        Page2mb = 1,
        /* 1 GiB */
        Page1gb = 2,
        /* 512 GiB */
        Page512gb = 3,
    }

    impl TsmPageType {
        pub fn from_usize(value: usize) -> Option<Self> {
            match value {
                0 => Some(Self::Page4k),
                1 => Some(Self::Page2mb),
                2 => Some(Self::Page1gb),
                3 => Some(Self::Page512gb),
                _ => None,
            }
        }

        pub const fn size(self) -> u64 {
            match self {
                Self::Page4k => 1 << 12,
                Self::Page2mb => 1 << 21,
                Self::Page1gb => 1 << 30,
                Self::Page512gb => 1 << 39,
            }
        }
    }

    /// Value returned by `run_tvm_vcpu()` when the vcpu exits to the host.
    #[repr(usize)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RunExit {
        /* The exit can be serviced and the vcpu run again. */
        Resumable = 0,
        /* The vcpu can no longer run. */
        Terminal = 1,
    }

    impl RunExit {
        pub fn from_usize(value: usize) -> Option<Self> {
            match value {
                0 => Some(Self::Resumable),
                1 => Some(Self::Terminal),
                _ => None,
            }
        }
    }

    #[repr(u64)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RegionKind {
        Confidential = 0,
        Shared = 1,
        EmulatedMmio = 2,
    }

    impl RegionKind {
        pub fn from_usize(value: usize) -> Option<Self> {
            match value {
                0 => Some(Self::Confidential),
                1 => Some(Self::Shared),
                2 => Some(Self::EmulatedMmio),
                _ => None,
            }
        }
    }
}
