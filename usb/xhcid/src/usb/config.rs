/// The header of a configuration. The interface, endpoint and class descriptors of the
/// configuration follow it, `total_length` bytes in all.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

/// Bit 7 of bmAttributes is reserved and always set.
pub const CONFIG_ATTR_RESERVED: u8 = 1 << 7;
pub const CONFIG_ATTR_SELF_POWERED: u8 = 1 << 6;

/// One alternate setting of an interface within a configuration. `endpoints` endpoint
/// descriptors follow it, not counting endpoint 0. (See USB32 Section 9.6.5)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl plain::Plain for InterfaceDescriptor {}

/// bDeviceClass and bInterfaceClass of a hub.
pub const CLASS_HUB: u8 = 9;
