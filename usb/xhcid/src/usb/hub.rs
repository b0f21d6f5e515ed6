use plain::Plain;

/// The SuperSpeed hub descriptor (USB32 10.15.2.1).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptorV3 {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    pub power_on_good: u8,
    pub current: u8,
    pub decode_latency: u8,
    pub delay: u16,
    /// Bit N is set when the device on port N is not removable.
    pub device_removable: u16,
}

unsafe impl Plain for HubDescriptorV3 {}

impl HubDescriptorV3 {
    pub const DESCRIPTOR_KIND: u8 = 0x2A;
}

/// Hub class feature selectors (USB32 Table 10-9). This only includes the ones USB 2.0 and 3.0
/// agree on, plus PORT_ENABLE and C_PORT_ENABLE, which only exist for USB 2 ports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortOverCurrent = 3,
    PortReset = 4,
    PortLinkState = 5,
    PortPower = 8,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortOverCurrent = 19,
    CPortReset = 20,
    CPortLinkState = 25,
    CPortConfigError = 26,
    CBhPortReset = 29,
}

impl HubPortFeature {
    pub fn from_raw(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::PortConnection,
            1 => Self::PortEnable,
            3 => Self::PortOverCurrent,
            4 => Self::PortReset,
            5 => Self::PortLinkState,
            8 => Self::PortPower,
            16 => Self::CPortConnection,
            17 => Self::CPortEnable,
            19 => Self::CPortOverCurrent,
            20 => Self::CPortReset,
            25 => Self::CPortLinkState,
            26 => Self::CPortConfigError,
            29 => Self::CBhPortReset,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// wPortStatus in the low half, wPortChange in the high half, as GET_STATUS returns them
    /// for a SuperSpeed hub port.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatusV3: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        // bit 2 reserved
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const LINK_STATE_0 = 1 << 5;
        const LINK_STATE_1 = 1 << 6;
        const LINK_STATE_2 = 1 << 7;
        const LINK_STATE_3 = 1 << 8;
        const POWER = 1 << 9;
        const SPEED_0 = 1 << 10;
        const SPEED_1 = 1 << 11;
        const SPEED_2 = 1 << 12;
        // bits 13 - 15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        // bit 18 reserved
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        const BH_RESET_CHANGED = 1 << 21;
        const LINK_STATE_CHANGED = 1 << 22;
        const CONFIG_ERROR = 1 << 23;
        // bits 24 - 31 reserved
    }
}

unsafe impl Plain for HubPortStatusV3 {}

impl HubPortStatusV3 {
    pub fn is_powered(&self) -> bool {
        self.contains(Self::POWER)
    }
    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }
    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<HubDescriptorV3>(), 12);
        assert_eq!(mem::size_of::<HubPortStatusV3>(), 4);
    }

    #[test]
    fn features() {
        assert_eq!(HubPortFeature::from_raw(8), Some(HubPortFeature::PortPower));
        assert_eq!(HubPortFeature::from_raw(20), Some(HubPortFeature::CPortReset));
        assert_eq!(HubPortFeature::from_raw(2), None);
    }
}
