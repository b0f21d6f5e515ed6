//! The eXtensible Host Controller Interface (XHCI) driver core
//!
//! This crate drives a USB3 XHCI controller on behalf of a user-level USB stack: it programs the
//! command, event and transfer rings, manages the per-device contexts, enumerates devices that
//! appear on the root hub ports, and carries control transfers to them. The bus layer that maps
//! the controller and the DMA allocator behind it are supplied by the embedding daemon, which
//! then drives the controller through the [UsbHost] trait.
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! The Host Controller owns the root hub. Devices connected to its ports are reported through
//! port status change events, after which software asks the controller for a device slot,
//! has the controller assign the device an address, and finally configures its endpoints.
//!
//! This documentation will refer directly to the relevant standards, which are as follows:
//!
//! - XHCI  - [eXtensible Host Controller Interface for Universal Serial Bus (xHCI) Requirements Specification](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf)
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)
//!
#[macro_use]
extern crate bitflags;
pub extern crate plain;

mod config;
pub mod driver_interface;
pub mod error;
pub mod usb;
pub mod xhci;

pub use crate::config::XhciConfig;
pub use crate::driver_interface::*;
pub use crate::error::{CompletionError, Result, XhciError};
pub use crate::xhci::{InterruptMethod, Xhci};
