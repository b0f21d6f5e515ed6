//! The Universal Serial Bus (USB) Module
//!
//! Wire formats shared by every USB host controller: the setup packet and the standard and hub
//! class descriptors. The [xhci](crate::xhci) module builds control transfers and the emulated
//! root hub on top of them.
//!
//! See the crate-level documentation for the acronyms used to refer to specific documents.
pub use self::config::{
    ConfigDescriptor, InterfaceDescriptor, CLASS_HUB, CONFIG_ATTR_RESERVED,
    CONFIG_ATTR_SELF_POWERED,
};
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{
    EndpointDescriptor, EndpointTy, SuperSpeedCompanionDescriptor, ENDP_ATTR_TY_MASK,
};
pub use self::hub::*;
pub use self::setup::{ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};

/// Enumerates the list of descriptor kinds that can be reported by a USB device to report its
/// attributes to the system. (See USB32 Sections 9.5 and 9.6)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    /// A Configuration Descriptor. See [ConfigDescriptor]
    Configuration = 2,
    /// A String Descriptor. See (USB32 Section 9.6.9).
    String = 3,
    /// An Interface Descriptor. See [InterfaceDescriptor]
    Interface = 4,
    /// An Endpoint Descriptor. See [EndpointDescriptor]
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    OnTheGo = 9,
    BinaryObjectStorage = 15,
    Hid = 33,
    /// A USB 2 Hub Descriptor.
    Hub = 41,
    /// A SuperSpeed Hub Descriptor. See [HubDescriptorV3]
    SuperSpeedHub = 42,
    /// A Super Speed Endpoint Companion Descriptor. See [SuperSpeedCompanionDescriptor]
    SuperSpeedCompanion = 48,
}

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod setup;
