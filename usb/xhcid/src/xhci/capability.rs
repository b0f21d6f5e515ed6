use common::io::{Mmio, ReadOnly};

/// The Capability Registers at the base of the controller's register window.
///
/// These are read-only and describe the limits of the implementation: how many slots, ports and
/// scratchpad buffers it has, the size of its contexts, and where the other register sets live.
///
/// See XHCI Section 5.3. Table 5-9 describes the offsets of the registers in memory.
#[repr(C, packed)]
pub struct CapabilityRegs {
    /// CAPLENGTH: the offset of the Operational Registers from the base.
    pub len: ReadOnly<Mmio<u8>>,
    _rsvd: ReadOnly<Mmio<u8>>,
    /// HCIVERSION, binary-coded decimal.
    pub hci_ver: ReadOnly<Mmio<u16>>,
    /// HCSPARAMS1.
    ///
    /// - Bits 0-7: MaxSlots
    /// - Bits 8-18: MaxIntrs
    /// - Bits 24-31: MaxPorts
    pub hcs_params1: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS2.
    ///
    /// - Bits 4-7: ERST Max, the event ring segment table holds at most 2^ERSTMax entries
    /// - Bits 21-25: high five bits of Max Scratchpad Buffers
    /// - Bit 26: Scratchpad Restore (SPR)
    /// - Bits 27-31: low five bits of Max Scratchpad Buffers
    pub hcs_params2: ReadOnly<Mmio<u32>>,
    /// HCSPARAMS3, the U1 and U2 exit latencies.
    pub hcs_params3: ReadOnly<Mmio<u32>>,
    /// HCCPARAMS1.
    ///
    /// - Bit 0: 64-bit addressing (AC64)
    /// - Bit 2: Context Size (CSZ), set for 64-byte contexts
    /// - Bit 3: Port Power Control (PPC)
    /// - Bits 16-31: xHCI Extended Capabilities Pointer, in dwords
    pub hcc_params1: ReadOnly<Mmio<u32>>,
    /// DBOFF: the offset of the doorbell array. Bits 0-1 are reserved.
    pub db_offset: ReadOnly<Mmio<u32>>,
    /// RTSOFF: the offset of the Runtime Registers. Bits 0-4 are reserved.
    pub rts_offset: ReadOnly<Mmio<u32>>,
    /// HCCPARAMS2.
    pub hcc_params2: ReadOnly<Mmio<u32>>,
}

pub const HCC_PARAMS1_AC64_BIT: u32 = 1 << 0;
pub const HCC_PARAMS1_CSZ_BIT: u32 = 1 << 2;
pub const HCC_PARAMS1_PPC_BIT: u32 = 1 << 3;
pub const HCC_PARAMS1_XECP_MASK: u32 = 0xFFFF_0000;
pub const HCC_PARAMS1_XECP_SHIFT: u8 = 16;

pub const HCS_PARAMS1_MAX_PORTS_MASK: u32 = 0xFF00_0000;
pub const HCS_PARAMS1_MAX_PORTS_SHIFT: u8 = 24;
pub const HCS_PARAMS1_MAX_INTRS_MASK: u32 = 0x0007_FF00;
pub const HCS_PARAMS1_MAX_INTRS_SHIFT: u8 = 8;
pub const HCS_PARAMS1_MAX_SLOTS_MASK: u32 = 0x0000_00FF;

pub const HCS_PARAMS2_ERST_MAX_MASK: u32 = 0x0000_00F0;
pub const HCS_PARAMS2_ERST_MAX_SHIFT: u8 = 4;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK: u32 = 0xF800_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT: u8 = 27;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK: u32 = 0x03E0_0000;
pub const HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT: u8 = 21;

pub const DB_OFFSET_MASK: u32 = !0b11;
pub const RTS_OFFSET_MASK: u32 = !0b1_1111;

impl CapabilityRegs {
    pub fn ac64(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_AC64_BIT)
    }

    /// Whether device contexts are 64 bytes instead of 32.
    pub fn csz(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_CSZ_BIT)
    }

    pub fn ppc(&self) -> bool {
        self.hcc_params1.readf(HCC_PARAMS1_PPC_BIT)
    }

    pub fn ext_caps_ptr_in_dwords(&self) -> u16 {
        ((self.hcc_params1.read() & HCC_PARAMS1_XECP_MASK) >> HCC_PARAMS1_XECP_SHIFT) as u16
    }

    pub fn max_ports(&self) -> u8 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_PORTS_MASK) >> HCS_PARAMS1_MAX_PORTS_SHIFT)
            as u8
    }

    pub fn max_interrupters(&self) -> u16 {
        ((self.hcs_params1.read() & HCS_PARAMS1_MAX_INTRS_MASK) >> HCS_PARAMS1_MAX_INTRS_SHIFT)
            as u16
    }

    pub fn max_slots(&self) -> u8 {
        (self.hcs_params1.read() & HCS_PARAMS1_MAX_SLOTS_MASK) as u8
    }

    /// The number of event ring segment table entries the controller accepts.
    pub fn max_erst_entries(&self) -> u32 {
        1 << ((self.hcs_params2.read() & HCS_PARAMS2_ERST_MAX_MASK) >> HCS_PARAMS2_ERST_MAX_SHIFT)
    }

    /// The number of scratchpad pages the controller wants software to provide.
    pub fn max_scratchpad_bufs(&self) -> u16 {
        let params = self.hcs_params2.read();
        let lo = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_LO_SHIFT;
        let hi = (params & HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_MASK)
            >> HCS_PARAMS2_MAX_SCRATCHPAD_BUFS_HI_SHIFT;
        (lo | (hi << 5)) as u16
    }

    pub fn db_offset(&self) -> usize {
        (self.db_offset.read() & DB_OFFSET_MASK) as usize
    }

    pub fn rts_offset(&self) -> usize {
        (self.rts_offset.read() & RTS_OFFSET_MASK) as usize
    }
}
