//! Normal-world entry into the MM partition.
//!
//! A caller hands in a communication buffer starting with the MM communicate header
//! (a 16-byte handler GUID and a little endian u64 message length). The buffer is
//! copied to the start of the shared buffer, the MM vcpu runs until it parks in
//! `wfi` and the response is copied back over the caller buffer.

use core::fmt::Display;

use crate::error::HostError;

use super::{monitor::Monitor, pages::HostPages, runner::MmioBus, runner::TvmRunner};

pub const COMM_HEADER_GUID_SIZE: usize = 16;
/// GUID plus message length.
pub const COMM_HEADER_SIZE: usize = COMM_HEADER_GUID_SIZE + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommError {
    /// The buffer or the declared size does not cover header and message.
    InvalidParameter,
    /// The message does not fit the shared buffer. The size hints were updated.
    BadBufferSize,
    /// The partition has not shared its communication buffer yet.
    NotReady,
    Host(HostError),
}

impl Display for CommError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid communication buffer"),
            Self::BadBufferSize => write!(f, "communication buffer too large"),
            Self::NotReady => write!(f, "no shared communication buffer"),
            Self::Host(err) => write!(f, "{}", err),
        }
    }
}

impl core::error::Error for CommError {}

impl From<HostError> for CommError {
    fn from(err: HostError) -> Self {
        Self::Host(err)
    }
}

fn message_len(buf: &[u8]) -> u64 {
    let mut raw = [0; 8];
    raw.copy_from_slice(&buf[COMM_HEADER_GUID_SIZE..COMM_HEADER_SIZE]);
    u64::from_le_bytes(raw)
}

fn set_message_len(buf: &mut [u8], len: u64) {
    buf[COMM_HEADER_GUID_SIZE..COMM_HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
}

pub struct MmCommunicator<Mo: Monitor, B: MmioBus, P: HostPages> {
    runner: TvmRunner<Mo, B, P>,
}

impl<Mo: Monitor, B: MmioBus, P: HostPages> MmCommunicator<Mo, B, P> {
    pub fn new(runner: TvmRunner<Mo, B, P>) -> Self {
        Self { runner }
    }

    pub fn runner(&mut self) -> &mut TvmRunner<Mo, B, P> {
        &mut self.runner
    }

    pub fn into_runner(self) -> TvmRunner<Mo, B, P> {
        self.runner
    }

    /// Host address and size of the populated shared buffer.
    fn shared(&self) -> Option<(u64, u64)> {
        let shared = self.runner.regions().shared()?;
        Some((shared.host_base?, shared.range.len))
    }

    /// Runs one MM request in place over `buf`.
    ///
    /// When `comm_size` is given it must cover the header and the message; zero or a
    /// size above the shared buffer asks for the shared buffer size, written back
    /// together with [`CommError::BadBufferSize`]. A zero or oversized message length
    /// gets the largest acceptable length written into the header. On success the
    /// response length is returned.
    pub fn communicate(
        &mut self,
        buf: &mut [u8],
        comm_size: Option<&mut usize>,
    ) -> Result<usize, CommError> {
        crate::ensure!(buf.len() >= COMM_HEADER_SIZE, CommError::InvalidParameter)?;
        let (host_base, shared_size) = self.shared().ok_or(CommError::NotReady)?;
        let shared_size = shared_size as usize;

        let msg_len = message_len(buf);
        let buffer_size = usize::try_from(msg_len)
            .ok()
            .and_then(|len| len.checked_add(COMM_HEADER_SIZE))
            .unwrap_or(usize::MAX);

        let mut status = Ok(());
        if let Some(size) = comm_size {
            if *size == 0 || *size > shared_size {
                *size = shared_size;
                status = Err(CommError::BadBufferSize);
            }
            if *size < buffer_size {
                status = Err(CommError::InvalidParameter);
            }
        }
        if msg_len == 0 || buffer_size > shared_size {
            set_message_len(buf, shared_size.saturating_sub(COMM_HEADER_SIZE) as u64);
            status = Err(CommError::BadBufferSize);
        }
        status?;
        crate::ensure!(buffer_size <= buf.len(), CommError::InvalidParameter)?;

        self.runner
            .pages_mut()
            .write(host_base, &buf[..buffer_size]);
        let exits = self.runner.run()?;
        log::debug!("mm request serviced after {} exits", exits);

        buf[..buffer_size].fill(0);
        let mut header = [0u8; COMM_HEADER_SIZE];
        self.runner.pages_mut().read(host_base, &mut header);
        let resp_size = usize::try_from(message_len(&header))
            .ok()
            .and_then(|len| len.checked_add(COMM_HEADER_SIZE))
            .unwrap_or(usize::MAX)
            .min(shared_size);
        if resp_size > buf.len() {
            log::warn!(
                "mm response of {} bytes truncated to {}",
                resp_size,
                buf.len()
            );
        }
        let copied = resp_size.min(buf.len());
        self.runner.pages_mut().read(host_base, &mut buf[..copied]);
        Ok(copied)
    }
}
