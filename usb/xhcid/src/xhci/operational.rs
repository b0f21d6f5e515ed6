use common::io::{Io, Mmio};

/// The Operational Registers, CAPLENGTH bytes past the register base. The port register sets
/// follow at offset 0x400.
#[repr(C, packed)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub page_size: Mmio<u32>,
    _rsvd: [Mmio<u32>; 2],
    pub dn_ctrl: Mmio<u32>,
    pub crcr_low: Mmio<u32>,
    pub crcr_high: Mmio<u32>,
    _rsvd2: [Mmio<u32>; 4],
    pub dcbaap_low: Mmio<u32>,
    pub dcbaap_high: Mmio<u32>,
    pub config: Mmio<u32>,
}

pub const OP_PORTS_OFFSET: usize = 0x400;

/// Run/Stop.
pub const USB_CMD_RS: u32 = 1 << 0;
/// Host Controller Reset.
pub const USB_CMD_HCRST: u32 = 1 << 1;
/// Interrupter Enable.
pub const USB_CMD_INTE: u32 = 1 << 2;

/// HC Halted.
pub const USB_STS_HCH: u32 = 1 << 0;
/// Host System Error.
pub const USB_STS_HSE: u32 = 1 << 2;
/// Event Interrupt, write one to clear.
pub const USB_STS_EINT: u32 = 1 << 3;
/// Controller Not Ready.
pub const USB_STS_CNR: u32 = 1 << 11;

pub const OP_CONFIG_MAX_SLOTS_EN_MASK: u32 = 0xFF;

impl OperationalRegs {
    pub fn set_crcr(&mut self, value: u64) {
        self.crcr_low.write(value as u32);
        self.crcr_high.write((value >> 32) as u32);
    }

    pub fn set_dcbaap(&mut self, value: u64) {
        self.dcbaap_low.write(value as u32);
        self.dcbaap_high.write((value >> 32) as u32);
    }

    pub fn dcbaap(&self) -> u64 {
        u64::from(self.dcbaap_low.read()) | (u64::from(self.dcbaap_high.read()) << 32)
    }

    pub fn max_slots_enabled(&self) -> u8 {
        (self.config.read() & OP_CONFIG_MAX_SLOTS_EN_MASK) as u8
    }

    pub fn set_max_slots_enabled(&mut self, slots: u8) {
        let config = self.config.read() & !OP_CONFIG_MAX_SLOTS_EN_MASK;
        self.config.write(config | u32::from(slots));
    }

    /// Acknowledges a pending Event Interrupt without touching the other status bits, which are
    /// either read-only or write-one-to-clear.
    pub fn clear_eint(&mut self) {
        self.usb_sts.write(USB_STS_EINT);
    }
}
