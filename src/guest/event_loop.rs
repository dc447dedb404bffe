//! Delegated event loop of the MM partition.
//!
//! Every MM request the normal world raises is forwarded by the message proxy. The
//! partition retrieves it, dispatches the communication buffer it points into and
//! completes it with the dispatcher status, one request at a time.

use core::fmt::Display;

use crate::SbiError;

use super::{
    boot_info::{BootInfo, BootInfoError},
    transport::{SharedMemory, Transport},
};

pub const RPMI_SRVGRP_REQUEST_FORWARD: u16 = 0xC;
pub const RPMI_REQFWD_RETRIEVE_CURRENT_MESSAGE: u8 = 2;
pub const RPMI_REQFWD_COMPLETE_CURRENT_MESSAGE: u8 = 3;
pub const RPMI_MSG_NORMAL_REQUEST: u8 = 0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpmiHeader {
    pub service_group: u16,
    pub service_id: u8,
    pub flags: u8,
    pub data_len: u16,
    pub token: u16,
}

impl RpmiHeader {
    pub const SIZE: usize = 8;

    pub fn request_forward(service_id: u8, data_len: u16) -> Self {
        Self {
            service_group: RPMI_SRVGRP_REQUEST_FORWARD,
            service_id,
            flags: RPMI_MSG_NORMAL_REQUEST,
            data_len,
            token: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..2].copy_from_slice(&self.service_group.to_le_bytes());
        out[2] = self.service_id;
        out[3] = self.flags;
        out[4..6].copy_from_slice(&self.data_len.to_le_bytes());
        out[6..8].copy_from_slice(&self.token.to_le_bytes());
        out
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            service_group: u16::from_le_bytes([raw[0], raw[1]]),
            service_id: raw[2],
            flags: raw[3],
            data_len: u16::from_le_bytes([raw[4], raw[5]]),
            token: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }
}

/// Response to a RETRIEVE request. `arg1` is the offset of the request payload in
/// the normal-world communication buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrieveResponse {
    pub header: RpmiHeader,
    pub status: i32,
    pub remaining: u32,
    pub returned: u32,
    pub arg0: u64,
    pub arg1: u64,
}

impl RetrieveResponse {
    pub const SIZE: usize = 40;

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        let u32_at =
            |off: usize| u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        let u64_at = |off: usize| {
            let mut buf = [0; 8];
            buf.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(buf)
        };
        Some(Self {
            header: RpmiHeader::parse(raw)?,
            status: u32_at(8) as i32,
            remaining: u32_at(12),
            returned: u32_at(16),
            arg0: u64_at(24),
            arg1: u64_at(32),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..8].copy_from_slice(&self.header.to_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..16].copy_from_slice(&self.remaining.to_le_bytes());
        out[16..20].copy_from_slice(&self.returned.to_le_bytes());
        out[24..32].copy_from_slice(&self.arg0.to_le_bytes());
        out[32..40].copy_from_slice(&self.arg1.to_le_bytes());
        out
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompleteRequest {
    pub header: RpmiHeader,
    pub arg0: u64,
    pub arg1: u64,
}

impl CompleteRequest {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..8].copy_from_slice(&self.header.to_bytes());
        out[8..16].copy_from_slice(&self.arg0.to_le_bytes());
        out[16..24].copy_from_slice(&self.arg1.to_le_bytes());
        out
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        let mut arg0 = [0; 8];
        let mut arg1 = [0; 8];
        arg0.copy_from_slice(&raw[8..16]);
        arg1.copy_from_slice(&raw[16..24]);
        Some(Self {
            header: RpmiHeader::parse(raw)?,
            arg0: u64::from_le_bytes(arg0),
            arg1: u64::from_le_bytes(arg1),
        })
    }
}

/// Status reported back to the normal world in the completion.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmReturn {
    Success = 0,
    NotSupported = -1,
    InvalidParams = -2,
    Denied = -3,
    NoMemory = -4,
}

impl MmReturn {
    pub const fn code(self) -> i64 {
        self as i64
    }
}

/// Outcome of one MM dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Success,
    InvalidParameter,
    AccessDenied,
    OutOfResources,
    Unsupported,
    Other(u64),
}

impl From<DispatchStatus> for MmReturn {
    fn from(status: DispatchStatus) -> Self {
        match status {
            DispatchStatus::Success => Self::Success,
            DispatchStatus::InvalidParameter => Self::InvalidParams,
            DispatchStatus::AccessDenied => Self::Denied,
            DispatchStatus::OutOfResources => Self::NoMemory,
            DispatchStatus::Unsupported | DispatchStatus::Other(_) => Self::NotSupported,
        }
    }
}

/// The MM core servicing one request whose communication buffer starts at `buffer`.
pub trait MmDispatcher {
    fn dispatch(&mut self, cpu: u32, buffer: u64) -> DispatchStatus;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventError {
    Transport(SbiError),
    ShortResponse(usize),
    Retrieve(i32),
    BootInfo(BootInfoError),
}

impl Display for EventError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {}", err),
            Self::ShortResponse(len) => write!(f, "short retrieve response ({} bytes)", len),
            Self::Retrieve(status) => write!(f, "retrieve failed with status {}", status),
            Self::BootInfo(err) => write!(f, "{}", err),
        }
    }
}

impl core::error::Error for EventError {}

impl From<SbiError> for EventError {
    fn from(err: SbiError) -> Self {
        Self::Transport(err)
    }
}

impl From<BootInfoError> for EventError {
    fn from(err: BootInfoError) -> Self {
        Self::BootInfo(err)
    }
}

pub struct EventLoop<'t, T: Transport, D: MmDispatcher> {
    shmem: SharedMemory<'t, T>,
    dispatcher: D,
    channel: u32,
    cpu: u32,
    comm_base: u64,
    comm_size: u64,
}

impl<'t, T: Transport, D: MmDispatcher> EventLoop<'t, T, D> {
    /// Binds the loop to the channel and communication buffer described by `info`.
    /// The channel must already be open on `shmem`.
    pub fn new(shmem: SharedMemory<'t, T>, dispatcher: D, info: &BootInfo) -> Self {
        Self {
            shmem,
            dispatcher,
            channel: info.mpxy_channel_id,
            cpu: info.primary_cpu().map_or(0, |c| c.processor_id),
            comm_base: info.ns_comm_buf_base,
            comm_size: info.ns_comm_buf_size,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Tells the proxy the partition finished initialising.
    pub fn signal_ready(&mut self) -> Result<(), EventError> {
        self.complete(RpmiHeader::default(), MmReturn::Success)
    }

    fn retrieve(&mut self) -> Result<RetrieveResponse, EventError> {
        let request = RpmiHeader::request_forward(RPMI_REQFWD_RETRIEVE_CURRENT_MESSAGE, 0);
        let raw = self.shmem.send(
            self.channel,
            RPMI_REQFWD_RETRIEVE_CURRENT_MESSAGE as u32,
            &request.to_bytes(),
        )?;
        let resp = RetrieveResponse::parse(raw).ok_or(EventError::ShortResponse(raw.len()))?;
        log::trace!("retrieved {:x?}", resp);
        crate::ensure!(resp.status == 0, EventError::Retrieve(resp.status))?;
        Ok(resp)
    }

    fn complete(&mut self, header: RpmiHeader, status: MmReturn) -> Result<(), EventError> {
        let request = CompleteRequest {
            header,
            arg0: status.code() as u64,
            arg1: 0,
        };
        self.shmem.send(
            self.channel,
            RPMI_REQFWD_COMPLETE_CURRENT_MESSAGE as u32,
            &request.to_bytes(),
        )?;
        Ok(())
    }

    /// Retrieves, dispatches and completes one request.
    pub fn service_one(&mut self) -> Result<MmReturn, EventError> {
        let resp = self.retrieve()?;
        let status = if resp.arg1 < self.comm_size {
            self.dispatcher
                .dispatch(self.cpu, self.comm_base + resp.arg1)
                .into()
        } else {
            log::warn!(
                "payload offset {:#x} outside the {:#x} byte communication buffer",
                resp.arg1,
                self.comm_size
            );
            MmReturn::InvalidParams
        };
        log::debug!("mm request done: {:?}", status);

        let header = RpmiHeader::request_forward(
            RPMI_REQFWD_COMPLETE_CURRENT_MESSAGE,
            (CompleteRequest::SIZE - RpmiHeader::SIZE) as u16,
        );
        self.complete(header, status)?;
        Ok(status)
    }

    pub fn run(&mut self) -> ! {
        loop {
            if let Err(err) = self.service_one() {
                panic!("delegated event loop stopped: {}", err);
            }
        }
    }
}

/// Entry of the MM partition once its boot info is known.
pub struct MmEntry {
    info: BootInfo,
}

impl MmEntry {
    pub fn new(raw_boot_info: &[u8]) -> Result<Self, BootInfoError> {
        let info = BootInfo::parse(raw_boot_info)?;
        log::info!(
            "MM memory [{:#x}, {:#x}], communication buffer {:#x} (+{:#x}), channel {}",
            info.mem_base,
            info.mem_limit,
            info.ns_comm_buf_base,
            info.ns_comm_buf_size,
            info.mpxy_channel_id
        );
        Ok(Self { info })
    }

    pub fn info(&self) -> &BootInfo {
        &self.info
    }

    /// Acquires the shared window, opens the channel and signals readiness.
    pub fn prepare<'t, T: Transport, D: MmDispatcher>(
        &self,
        transport: &'t mut T,
        window: &'t mut [u8],
        dispatcher: D,
    ) -> Result<EventLoop<'t, T, D>, EventError> {
        let mut shmem = SharedMemory::acquire(transport, window)?;
        shmem.open_channel(self.info.mpxy_channel_id)?;
        let mut event_loop = EventLoop::new(shmem, dispatcher, &self.info);
        event_loop.signal_ready()?;
        Ok(event_loop)
    }

    /// Boots the event loop and never returns. Any failure on the way is fatal.
    pub fn start<T: Transport, D: MmDispatcher>(
        raw_boot_info: &[u8],
        transport: &mut T,
        window: &mut [u8],
        dispatcher: D,
    ) -> ! {
        let entry = match Self::new(raw_boot_info) {
            Ok(entry) => entry,
            Err(err) => panic!("invalid boot info: {}", err),
        };
        match entry.prepare(transport, window, dispatcher) {
            Ok(mut event_loop) => event_loop.run(),
            Err(err) => panic!("cannot start the MM event loop: {}", err),
        }
    }
}
