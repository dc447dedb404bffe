//! Message transport between the MM partition and the secure-world message proxy.
//!
//! The transport only works through a registered shared-memory window. [`SharedMemory`]
//! is the lease over that window: it borrows the transport for its whole lifetime,
//! it is the only way to reach a channel and dropping it unregisters the window.

use core::fmt;

use crate::SbiError;

/// Attribute ids of a message proxy channel, in wire order.
pub mod attr {
    pub const PROTOCOL_ID: u32 = 0;
    pub const PROTOCOL_VERSION: u32 = 1;
    pub const MSG_DATA_MAX_LEN: u32 = 2;
    pub const MSG_SEND_TIMEOUT: u32 = 3;
    pub const CAPABILITY: u32 = 4;
    pub const COUNT: u32 = 10;
}

const MAX_OPEN_CHANNELS: usize = 4;

/// Raw operations of a message proxy. Every call that moves data does so through
/// `shmem`, the window previously registered with [`Transport::set_shared_memory`].
pub trait Transport {
    fn set_shared_memory(&mut self, base: u64, size: usize) -> Result<(), SbiError>;
    fn disable_shared_memory(&mut self) -> Result<(), SbiError>;
    /// Reads `count` consecutive u32 attributes of `channel` into the start of `shmem`.
    fn read_attributes(
        &mut self,
        channel: u32,
        base: u32,
        count: u32,
        shmem: &mut [u8],
    ) -> Result<(), SbiError>;
    /// Sends the first `req_len` bytes of `shmem` and waits for the response, which
    /// replaces the request. Returns the response length.
    fn send_message(
        &mut self,
        channel: u32,
        msg_id: u32,
        shmem: &mut [u8],
        req_len: usize,
    ) -> Result<usize, SbiError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u32,
    pub protocol: u32,
    pub version: u32,
    pub max_data_len: u32,
}

/// A registered shared-memory window.
pub struct SharedMemory<'t, T: Transport> {
    transport: &'t mut T,
    buf: &'t mut [u8],
    open: heapless::Vec<u32, MAX_OPEN_CHANNELS>,
}

impl<T: Transport> fmt::Debug for SharedMemory<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("base", &self.buf.as_ptr())
            .field("size", &self.buf.len())
            .field("open", &self.open)
            .finish()
    }
}

impl<'t, T: Transport> SharedMemory<'t, T> {
    /// Registers `buf` as the shared window of `transport`.
    pub fn acquire(transport: &'t mut T, buf: &'t mut [u8]) -> Result<Self, SbiError> {
        crate::ensure!(!buf.is_empty(), SbiError::InvalidParam)?;
        transport.set_shared_memory(buf.as_ptr() as u64, buf.len())?;
        log::debug!(
            "shared memory at {:p} ({:#x} bytes) registered",
            buf.as_ptr(),
            buf.len()
        );
        Ok(Self {
            transport,
            buf,
            open: heapless::Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_open(&self, channel: u32) -> bool {
        self.open.contains(&channel)
    }

    /// Opens `channel`, failing when its messages cannot fit in this window.
    pub fn open_channel(&mut self, channel: u32) -> Result<ChannelInfo, SbiError> {
        let count = attr::COUNT as usize;
        crate::ensure!(self.buf.len() >= count * 4, SbiError::NoSharedMemory)?;
        self.transport
            .read_attributes(channel, 0, attr::COUNT, self.buf)?;
        let at = |id: u32| {
            let off = id as usize * 4;
            let mut raw = [0; 4];
            raw.copy_from_slice(&self.buf[off..off + 4]);
            u32::from_le_bytes(raw)
        };
        let info = ChannelInfo {
            id: channel,
            protocol: at(attr::PROTOCOL_ID),
            version: at(attr::PROTOCOL_VERSION),
            max_data_len: at(attr::MSG_DATA_MAX_LEN),
        };
        crate::ensure!(
            info.max_data_len as usize <= self.buf.len(),
            SbiError::NoSharedMemory
        )?;
        if !self.is_open(channel) {
            self.open.push(channel).map_err(|_| SbiError::Failed)?;
        }
        log::info!(
            "channel {} open: protocol {:#x} version {:#x}, {} bytes per message",
            channel,
            info.protocol,
            info.version,
            info.max_data_len
        );
        Ok(info)
    }

    pub fn close_channel(&mut self, channel: u32) -> Result<(), SbiError> {
        let pos = self
            .open
            .iter()
            .position(|&c| c == channel)
            .ok_or(SbiError::InvalidParam)?;
        self.open.swap_remove(pos);
        Ok(())
    }

    /// Sends `request` on an open channel and returns the response, borrowed from the
    /// window until the next call.
    pub fn send(&mut self, channel: u32, msg_id: u32, request: &[u8]) -> Result<&[u8], SbiError> {
        crate::ensure!(self.is_open(channel), SbiError::InvalidParam)?;
        crate::ensure!(request.len() <= self.buf.len(), SbiError::InvalidParam)?;
        self.buf[..request.len()].copy_from_slice(request);
        let len = self
            .transport
            .send_message(channel, msg_id, self.buf, request.len())?;
        crate::ensure!(len <= self.buf.len(), SbiError::BadRange)?;
        Ok(&self.buf[..len])
    }
}

impl<T: Transport> Drop for SharedMemory<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.transport.disable_shared_memory() {
            log::error!("cannot disable shared memory: {}", err);
        }
    }
}

#[cfg(target_arch = "riscv64")]
mod sbi {
    use common::sbi::{
        sbi_call, INVAL_PHYS_ADDR, SBI_MPXY_EXT_ID, SBI_MPXY_READ_ATTRS,
        SBI_MPXY_SEND_MSG_WITH_RESP, SBI_MPXY_SET_SHMEM,
    };

    use super::Transport;
    use crate::SbiError;

    /// Message proxy reached through the SBI MPXY extension. Memory is identity
    /// mapped in the MM partition, so window addresses are physical addresses.
    #[derive(Debug, Default)]
    pub struct SbiMpxy;

    fn mpxy(fid: usize, args: [usize; 6]) -> Result<usize, SbiError> {
        sbi_call(SBI_MPXY_EXT_ID, fid, &args).into_result()
    }

    impl Transport for SbiMpxy {
        fn set_shared_memory(&mut self, base: u64, size: usize) -> Result<(), SbiError> {
            let lo = (base & 0xffff_ffff) as usize;
            let hi = (base >> 32) as usize;
            mpxy(SBI_MPXY_SET_SHMEM, [size, lo, hi, 0, 0, 0]).map(|_| ())
        }

        fn disable_shared_memory(&mut self) -> Result<(), SbiError> {
            mpxy(
                SBI_MPXY_SET_SHMEM,
                [0, INVAL_PHYS_ADDR, INVAL_PHYS_ADDR, 0, 0, 0],
            )
            .map(|_| ())
        }

        fn read_attributes(
            &mut self,
            channel: u32,
            base: u32,
            count: u32,
            _shmem: &mut [u8],
        ) -> Result<(), SbiError> {
            mpxy(
                SBI_MPXY_READ_ATTRS,
                [channel as usize, base as usize, count as usize, 0, 0, 0],
            )
            .map(|_| ())
        }

        fn send_message(
            &mut self,
            channel: u32,
            msg_id: u32,
            _shmem: &mut [u8],
            req_len: usize,
        ) -> Result<usize, SbiError> {
            mpxy(
                SBI_MPXY_SEND_MSG_WITH_RESP,
                [channel as usize, msg_id as usize, req_len, 0, 0, 0],
            )
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use sbi::SbiMpxy;
