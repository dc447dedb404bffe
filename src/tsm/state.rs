use crate::TsmState;

pub const TSM_IMPL_ID: u32 = 0x45;
pub const TSM_VERSION: u32 = 0x10000;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TsmInfo {
    /*
     * The current state of the TSM. If the state is not `Ready`, the remaining
     * fields are invalid and are zero.
     */
    pub tsm_state: TsmState,
    pub tsm_impl_id: u32,
    pub tsm_version: u32,
    pub _padding: u32,
    pub tsm_capabilities: u64,
    /*
     * The number of 4KB pages which must be donated to the TSM for storing TVM
     * state in create_tvm().
     */
    pub tvm_state_pages: u64,
    /*
     * The maximum number of vCPUs a TVM can support.
     */
    pub tvm_max_vcpus: u64,
    /*
     * The number of 4KB pages which must be donated to the TSM when creating
     * a new vCPU.
     */
    pub tvm_vcpu_state_pages: u64,
}

impl TsmInfo {
    pub const SIZE: usize = 48;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..4].copy_from_slice(&(self.tsm_state as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.tsm_impl_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.tsm_version.to_le_bytes());
        out[16..24].copy_from_slice(&self.tsm_capabilities.to_le_bytes());
        out[24..32].copy_from_slice(&self.tvm_state_pages.to_le_bytes());
        out[32..40].copy_from_slice(&self.tvm_max_vcpus.to_le_bytes());
        out[40..48].copy_from_slice(&self.tvm_vcpu_state_pages.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        let u32_at = |off: usize| {
            let mut buf = [0; 4];
            buf.copy_from_slice(&raw[off..off + 4]);
            u32::from_le_bytes(buf)
        };
        let u64_at = |off: usize| {
            let mut buf = [0; 8];
            buf.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(buf)
        };
        Some(Self {
            tsm_state: TsmState::from_u32(u32_at(0))?,
            tsm_impl_id: u32_at(4),
            tsm_version: u32_at(8),
            _padding: 0,
            tsm_capabilities: u64_at(16),
            tvm_state_pages: u64_at(24),
            tvm_max_vcpus: u64_at(32),
            tvm_vcpu_state_pages: u64_at(40),
        })
    }
}

/// Parameters of `create_tvm()`, passed by address.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TvmCreateParams {
    /// 16KiB-aligned root of the G-stage page table.
    pub tvm_page_directory_addr: u64,
    pub tvm_state_addr: u64,
}

impl TvmCreateParams {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[0..8].copy_from_slice(&self.tvm_page_directory_addr.to_le_bytes());
        out[8..16].copy_from_slice(&self.tvm_state_addr.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let mut pd = [0; 8];
        let mut state = [0; 8];
        pd.copy_from_slice(&raw[0..8]);
        state.copy_from_slice(&raw[8..16]);
        Self {
            tvm_page_directory_addr: u64::from_le_bytes(pd),
            tvm_state_addr: u64::from_le_bytes(state),
        }
    }
}
