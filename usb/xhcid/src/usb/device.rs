//! The "Device" USB Descriptor, described in USB32 section 9.6.1

/// A USB Device Descriptor. Every device has exactly one. USB32 Table 9-11 lists the offsets.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    /// bcdUSB: the USB release in binary-coded decimal, so 2.1 is 210H.
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// bMaxPacketSize0. For SuperSpeed devices this is an exponent of two.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
}

/// The first eight bytes of a [DeviceDescriptor].
///
/// Before the default control pipe is configured, a device can only be trusted to deliver this
/// much, and it is all that is needed to learn bMaxPacketSize0.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}

impl DeviceDescriptor8Byte {
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }

    /// The max packet size of endpoint 0 in bytes. USB 3 devices report it as a power of two.
    pub fn ep0_max_packet_size(&self) -> u16 {
        if self.major_usb_vers() >= 3 {
            1u16.checked_shl(u32::from(self.packet_size)).unwrap_or(0)
        } else {
            u16::from(self.packet_size)
        }
    }
}
