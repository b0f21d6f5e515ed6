use common::io::Mmio;

pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

/// Event Handler Busy, write one to clear, in the low dword of ERDP.
pub const ERDP_EHB: u64 = 1 << 3;

#[repr(C, packed)]
pub struct Interrupter {
    pub iman: Mmio<u32>,
    pub imod: Mmio<u32>,
    pub erstsz: Mmio<u32>,
    _rsvd: Mmio<u32>,
    pub erstba_low: Mmio<u32>,
    pub erstba_high: Mmio<u32>,
    pub erdp_low: Mmio<u32>,
    pub erdp_high: Mmio<u32>,
}

/// The Runtime Registers. Only the primary interrupter is used, but the register set is sized
/// for the architectural maximum a controller may report in HCSPARAMS1.
#[repr(C, packed)]
pub struct RuntimeRegs {
    pub mfindex: Mmio<u32>,
    _rsvd: [Mmio<u32>; 7],
    pub ints: [Interrupter; 128],
}
