use plain::Plain;
use serde::{Deserialize, Serialize};

/// The descriptor for a USB Endpoint.
///
/// This is returned as part of a configuration and cannot be requested individually.
///
/// See USB32 9.6.6. The offsets of the fields are described in USB32 Table 9-26
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    /// bEndpointAddress: the endpoint number in bits 0-3, and the direction in bit 7 (set for
    /// IN).
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointTy {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
}

impl EndpointDescriptor {
    pub fn ty(&self) -> EndpointTy {
        EndpointTy::from_attributes(self.attributes)
    }
}

unsafe impl Plain for EndpointDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperSpeedCompanionDescriptor {
    pub length: u8,
    pub kind: u8,
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}
unsafe impl Plain for SuperSpeedCompanionDescriptor {}
