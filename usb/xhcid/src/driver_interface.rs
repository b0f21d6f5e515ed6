//! The types the driver exchanges with the platform layer below it and the USB core above it.
pub extern crate serde;
pub extern crate smallvec;

use serde::{Deserialize, Serialize};

use crate::error::{Result, XhciError};
use crate::usb;
pub use crate::usb::{EndpointTy, ENDP_ATTR_TY_MASK};
use crate::xhci::context::{
    EP_TYPE_BULK_IN, EP_TYPE_BULK_OUT, EP_TYPE_CONTROL, EP_TYPE_INTR_IN, EP_TYPE_INTR_OUT,
    EP_TYPE_ISOCH_IN, EP_TYPE_ISOCH_OUT,
};

/// The controller's register window, as mapped by the bus layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterWindow {
    /// Virtual address of the capability registers.
    pub base: usize,
    /// Length of the mapping in bytes.
    pub size: usize,
    /// The interrupt line, if one was wired up.
    pub irq: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// Decodes the Port Speed field of PORTSC, using the default Protocol Speed ID mapping.
    pub fn from_port_speed(speed: u8) -> Option<Self> {
        match speed {
            1 => Some(Self::Full),
            2 => Some(Self::Low),
            3 => Some(Self::High),
            // SuperSpeedPlus links are addressed like SuperSpeed ones.
            4 | 5 => Some(Self::Super),
            _ => None,
        }
    }

    /// The value the slot context speed field takes.
    pub fn port_speed(self) -> u8 {
        match self {
            Self::Full => 1,
            Self::Low => 2,
            Self::High => 3,
            Self::Super => 4,
        }
    }

    /// The max packet size of endpoint 0 to use before the device descriptor has been read.
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            Self::Low | Self::Full => 8,
            Self::High => 64,
            Self::Super => 512,
        }
    }
}

/// An addressed device, as handed to the USB core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub slot_id: u8,
    pub address: u8,
    pub port: u8,
    pub speed: UsbSpeed,
}

/// What happened on a root hub port while handling an interrupt.
#[derive(Debug)]
pub enum PortEvent {
    Attached(DeviceHandle),
    AttachFailed { port: u8, error: XhciError },
    Detached { port: u8, slot_id: u8 },
}

/// An endpoint to configure beyond the default control pipe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// bEndpointAddress: number in bits 0-3, IN when bit 7 is set.
    pub address: u8,
    pub kind: EndpointTy,
    pub max_packet_size: u16,
    /// The xHCI interval exponent: the endpoint is serviced every 2^interval microframes.
    pub interval: u8,
    pub max_burst: u8,
}

impl EndpointConfig {
    pub fn from_descriptors(
        endpoint: &usb::EndpointDescriptor,
        companion: Option<&usb::SuperSpeedCompanionDescriptor>,
    ) -> Self {
        let max_packet_size = endpoint.max_packet_size;
        Self {
            address: endpoint.address,
            kind: endpoint.ty(),
            max_packet_size: max_packet_size & 0x7FF,
            interval: endpoint.interval.saturating_sub(1),
            max_burst: companion.map_or(0, |companion| companion.max_burst),
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0xF
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    /// The Device Context Index of the endpoint. Control endpoints are bidirectional and take
    /// the odd index.
    pub fn dci(&self) -> u8 {
        match self.kind {
            EndpointTy::Ctrl => self.number() * 2 + 1,
            _ => self.number() * 2 + u8::from(self.is_in()),
        }
    }

    /// The Endpoint Type field of the endpoint context.
    pub fn xhci_ep_type(&self) -> u8 {
        match (self.kind, self.is_in()) {
            (EndpointTy::Ctrl, _) => EP_TYPE_CONTROL,
            (EndpointTy::Isoch, false) => EP_TYPE_ISOCH_OUT,
            (EndpointTy::Bulk, false) => EP_TYPE_BULK_OUT,
            (EndpointTy::Interrupt, false) => EP_TYPE_INTR_OUT,
            (EndpointTy::Isoch, true) => EP_TYPE_ISOCH_IN,
            (EndpointTy::Bulk, true) => EP_TYPE_BULK_IN,
            (EndpointTy::Interrupt, true) => EP_TYPE_INTR_IN,
        }
    }
}

/// The endpoint a transaction batch targets, as the USB core describes it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub number: u8,
    pub kind: EndpointTy,
    pub max_packet_size: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransactionKind {
    Setup,
    In,
    Out,
}

/// One stage of a transfer. For control endpoints, transaction 0 is the setup packet and the
/// optional transaction 1 is the data stage.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub kind: TransactionKind,
    pub buffer: &'a mut [u8],
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PortTransferStatus {
    pub kind: PortTransferStatusKind,
    pub bytes_transferred: u32,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum PortTransferStatusKind {
    Success,
    ShortPacket,
    Stalled,
    Unknown,
}
impl Default for PortTransferStatusKind {
    fn default() -> Self {
        Self::Success
    }
}

/// Completion callback of [UsbHost::schedule_transaction], called with the token the batch was
/// scheduled with.
pub type TransactionCallback<'a> = &'a mut dyn FnMut(usize, PortTransferStatus);

/// The host adapter the generic USB core drives.
pub trait UsbHost {
    /// Runs `transactions` against `endpoint` of the device at `device_address`, returning the
    /// number of data bytes transferred.
    ///
    /// Address 0 is the emulated root hub. `hub_address` and `hub_port` locate devices behind
    /// external hubs.
    #[allow(clippy::too_many_arguments)]
    fn schedule_transaction(
        &mut self,
        device_address: u8,
        hub_address: Option<u8>,
        hub_port: u8,
        speed: UsbSpeed,
        endpoint: &Endpoint,
        transactions: &mut [Transaction<'_>],
        callback: Option<TransactionCallback<'_>>,
        token: usize,
    ) -> Result<usize>;

    /// Processes whatever the controller reported since the last call.
    fn handle_interrupt(&mut self) -> Result<Vec<PortEvent>>;
}
