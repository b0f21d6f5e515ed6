use super::DescriptorKind;

/// The 8-byte SETUP packet that opens every control transfer (USB32 9.3).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReqType {
    /// Standard device requests, such as SET_ADDRESS and SET_CONFIGURATION.
    Standard = 0,
    Class = 1,
    Vendor = 2,

    /// Reserved
    Reserved = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    // 4..=30 are reserved
    VendorSpecific = 31,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

impl Setup {
    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }
    pub fn is_standard(&self) -> bool {
        self.req_ty() == ReqType::Standard as u8
    }

    /// The packet exactly as it travels on the wire.
    pub fn to_bytes(&self) -> [u8; 8] {
        let (value, index, length) = (self.value, self.index, self.length);
        let mut bytes = [0; 8];
        bytes[0] = self.kind;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&value.to_le_bytes());
        bytes[4..6].copy_from_slice(&index.to_le_bytes());
        bytes[6..8].copy_from_slice(&length.to_le_bytes());
        bytes
    }

    /// Parses a packet off the wire. Returns `None` if `bytes` is shorter than a packet.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..8)?;
        Some(Self {
            kind: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// A request to the device as a whole. `kind` holds the direction and request type bits.
    const fn device_request(
        kind: u8,
        request: SetupReq,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            kind,
            request: request as u8,
            value,
            index,
            length,
        }
    }

    pub const fn set_address(address: u16) -> Self {
        Self::device_request(0, SetupReq::SetAddress, address, 0, 0)
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self::device_request(
            USB_SETUP_DIR_BIT,
            SetupReq::GetDescriptor,
            ((kind as u16) << 8) | (index as u16),
            language,
            length,
        )
    }

    pub const fn get_configuration() -> Self {
        Self::device_request(USB_SETUP_DIR_BIT, SetupReq::GetConfiguration, 0, 0, 1)
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self::device_request(0, SetupReq::SetConfiguration, value as u16, 0, 0)
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: ReqRecipient::Interface as u8,
            request: SetupReq::SetInterface as u8,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format() {
        let setup = Setup::get_descriptor(DescriptorKind::Configuration, 1, 0x0409, 0x00FF);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0x80, 0x06, 0x01, 0x02, 0x09, 0x04, 0xFF, 0x00]);

        let parsed = Setup::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.direction(), ReqDirection::DeviceToHost);
        assert!(parsed.is_standard());

        assert!(Setup::from_bytes(&bytes[..7]).is_none());
    }

    #[test]
    fn request_type_fields() {
        let setup = Setup {
            kind: 0b0010_0011,
            request: SetupReq::SetFeature as u8,
            value: 4,
            index: 1,
            length: 0,
        };
        assert_eq!(setup.direction(), ReqDirection::HostToDevice);
        assert_eq!(setup.req_ty(), ReqType::Class as u8);
        assert_eq!(setup.req_recipient(), ReqRecipient::Other as u8);
    }
}
