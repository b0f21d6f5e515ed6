//! The root hub, emulated in software.
//!
//! The USB core talks to the root hub like to any other SuperSpeed hub, at the reserved address
//! [ROOT_HUB_ADDRESS]. Requests are answered from fixed descriptor tables and the port registers,
//! and never reach a ring.
use log::{debug, trace, warn};
use smallvec::SmallVec;

use super::port::{Port, PortFlags};
use crate::error::{Result, XhciError};
use crate::usb::{
    DescriptorKind, HubDescriptorV3, HubPortFeature, HubPortStatusV3, ReqDirection, ReqRecipient,
    ReqType, Setup, SetupReq, CLASS_HUB, CONFIG_ATTR_RESERVED, CONFIG_ATTR_SELF_POWERED,
};

pub const ROOT_HUB_ADDRESS: u8 = 0;

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18,
    DescriptorKind::Device as u8,
    0x00,
    0x03, // USB 3.0
    CLASS_HUB,
    0,
    3,
    9, // 512 byte max packet
    0,
    0,
    0,
    0,
    0x00,
    0x01, // release 1.0
    1,
    2,
    0,
    1,
];

const CONFIG_DESCRIPTOR: [u8; 31] = [
    // configuration
    9,
    DescriptorKind::Configuration as u8,
    31,
    0,
    1,
    1,
    0,
    CONFIG_ATTR_RESERVED | CONFIG_ATTR_SELF_POWERED,
    0,
    // hub interface
    9,
    DescriptorKind::Interface as u8,
    0,
    0,
    1,
    CLASS_HUB,
    0,
    0,
    0,
    // status change endpoint, interrupt IN 1
    7,
    DescriptorKind::Endpoint as u8,
    0x81,
    3,
    2,
    0,
    12,
    // endpoint companion
    6,
    DescriptorKind::SuperSpeedCompanion as u8,
    0,
    0,
    2,
    0,
];

/// en-US only.
const LANGUAGES: [u8; 4] = [4, DescriptorKind::String as u8, 0x09, 0x04];
const MANUFACTURER: &str = "xhcid";
const PRODUCT: &str = "XHCI Host Controller";

const STANDARD: u8 = ReqType::Standard as u8;
const CLASS: u8 = ReqType::Class as u8;
const DEVICE: u8 = ReqRecipient::Device as u8;
const OTHER: u8 = ReqRecipient::Other as u8;

const GET_STATUS: u8 = SetupReq::GetStatus as u8;
const CLEAR_FEATURE: u8 = SetupReq::ClearFeature as u8;
const SET_FEATURE: u8 = SetupReq::SetFeature as u8;
const SET_ADDRESS: u8 = SetupReq::SetAddress as u8;
const GET_DESCRIPTOR: u8 = SetupReq::GetDescriptor as u8;
const GET_CONFIGURATION: u8 = SetupReq::GetConfiguration as u8;
const SET_CONFIGURATION: u8 = SetupReq::SetConfiguration as u8;

const HUB_CHARACTERISTICS_PER_PORT_POWER: u16 = 0x0001;
const HUB_CHARACTERISTICS_NO_POWER_SWITCHING: u16 = 0x0002;
const HUB_CHARACTERISTICS_PER_PORT_OVER_CURRENT: u16 = 0x0008;
/// In units of 2 ms.
const POWER_ON_GOOD: u8 = 10;

type Reply = SmallVec<[u8; 64]>;

pub struct RootHub {
    ports: u8,
    power_switching: bool,
    configuration: u8,
}

impl RootHub {
    pub fn new(ports: u8, power_switching: bool) -> Self {
        Self {
            ports,
            power_switching,
            configuration: 0,
        }
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// Answers one control request. IN replies are copied to `buffer`, truncated to wLength
    /// and the buffer length; the number of bytes copied is returned.
    ///
    /// Requests a hub would not understand fail with a stall.
    pub fn handle(
        &mut self,
        setup: &Setup,
        ports: &mut [Port],
        buffer: Option<&mut [u8]>,
    ) -> Result<usize> {
        let reply = match self.reply(setup, ports) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("root hub stalls request {:X?}", setup);
                return Err(err);
            }
        };

        let len = reply.len().min(usize::from(setup.length));
        let copied = match buffer {
            Some(buffer) => {
                let n = len.min(buffer.len());
                buffer[..n].copy_from_slice(&reply[..n]);
                n
            }
            None => 0,
        };
        trace!("root hub {:X?}: {} bytes", setup, copied);
        Ok(copied)
    }

    fn reply(&mut self, setup: &Setup, ports: &mut [Port]) -> Result<Reply> {
        let (request, value, index) = (setup.request, setup.value, setup.index);
        let input = setup.direction() == ReqDirection::DeviceToHost;
        let mut reply = Reply::new();

        match (setup.req_ty(), setup.req_recipient(), request) {
            (STANDARD, DEVICE, GET_DESCRIPTOR) if input => {
                let (kind, descriptor_index) = ((value >> 8) as u8, value as u8);
                match (kind, descriptor_index) {
                    (kind, 0) if kind == DescriptorKind::Device as u8 => {
                        reply.extend_from_slice(&DEVICE_DESCRIPTOR)
                    }
                    (kind, 0) if kind == DescriptorKind::Configuration as u8 => {
                        reply.extend_from_slice(&CONFIG_DESCRIPTOR)
                    }
                    (kind, 0) if kind == DescriptorKind::String as u8 => {
                        reply.extend_from_slice(&LANGUAGES)
                    }
                    (kind, 1) if kind == DescriptorKind::String as u8 => {
                        reply = string_descriptor(MANUFACTURER)
                    }
                    (kind, 2) if kind == DescriptorKind::String as u8 => {
                        reply = string_descriptor(PRODUCT)
                    }
                    _ => return Err(XhciError::stall()),
                }
            }
            (STANDARD, DEVICE, GET_STATUS) if input => {
                // Self powered.
                reply.extend_from_slice(&[1, 0]);
            }
            (STANDARD, DEVICE, GET_CONFIGURATION) if input => reply.push(self.configuration),
            (STANDARD, DEVICE, SET_ADDRESS) if !input => {
                debug!("root hub ignores SET_ADDRESS {}", value);
            }
            (STANDARD, DEVICE, SET_CONFIGURATION) if !input => match value {
                0 | 1 => self.configuration = value as u8,
                _ => return Err(XhciError::stall()),
            },
            (CLASS, DEVICE, GET_DESCRIPTOR) if input => {
                let kind = (value >> 8) as u8;
                if kind != DescriptorKind::Hub as u8 && kind != DescriptorKind::SuperSpeedHub as u8
                {
                    return Err(XhciError::stall());
                }
                reply.extend_from_slice(&self.hub_descriptor());
            }
            (CLASS, DEVICE, GET_STATUS) if input => {
                // No local power or over-current conditions to report.
                reply.extend_from_slice(&[0; 4]);
            }
            (CLASS, OTHER, GET_STATUS) if input => {
                let port = port_mut(ports, index)?;
                reply.extend_from_slice(&port_status(port).bits().to_le_bytes());
            }
            (CLASS, OTHER, SET_FEATURE) if !input => {
                let port = port_mut(ports, index)?;
                match HubPortFeature::from_raw(value) {
                    Some(HubPortFeature::PortPower) => port.set_pp(true),
                    Some(HubPortFeature::PortReset) => port.set_pr(),
                    _ => return Err(XhciError::stall()),
                }
            }
            (CLASS, OTHER, CLEAR_FEATURE) if !input => {
                let port = port_mut(ports, index)?;
                match HubPortFeature::from_raw(value) {
                    Some(HubPortFeature::PortEnable) => port.disable(),
                    Some(HubPortFeature::PortPower) => port.set_pp(false),
                    Some(HubPortFeature::CPortConnection) => port.clear_csc(),
                    Some(HubPortFeature::CPortEnable) => port.clear_pec(),
                    Some(HubPortFeature::CPortReset) => port.clear_prc(),
                    Some(HubPortFeature::CPortOverCurrent) => port.clear_occ(),
                    Some(HubPortFeature::CPortLinkState) => port.clear_changes(PortFlags::PLC),
                    Some(HubPortFeature::CPortConfigError) => port.clear_changes(PortFlags::CEC),
                    Some(HubPortFeature::CBhPortReset) => port.clear_changes(PortFlags::WRC),
                    _ => return Err(XhciError::stall()),
                }
            }
            _ => return Err(XhciError::stall()),
        }

        Ok(reply)
    }

    fn hub_descriptor(&self) -> [u8; 12] {
        let power = if self.power_switching {
            HUB_CHARACTERISTICS_PER_PORT_POWER
        } else {
            HUB_CHARACTERISTICS_NO_POWER_SWITCHING
        };
        let characteristics = (power | HUB_CHARACTERISTICS_PER_PORT_OVER_CURRENT).to_le_bytes();
        [
            12,
            HubDescriptorV3::DESCRIPTOR_KIND,
            self.ports,
            characteristics[0],
            characteristics[1],
            POWER_ON_GOOD,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }
}

/// Ports are numbered from 1 in the low byte of wIndex.
fn port_mut(ports: &mut [Port], index: u16) -> Result<&mut Port> {
    let number = usize::from(index & 0xFF);
    if number == 0 {
        return Err(XhciError::stall());
    }
    ports.get_mut(number - 1).ok_or_else(XhciError::stall)
}

fn port_status(port: &Port) -> HubPortStatusV3 {
    let flags = port.flags();
    let map = [
        (PortFlags::CCS, HubPortStatusV3::CONNECTION),
        (PortFlags::PED, HubPortStatusV3::ENABLE),
        (PortFlags::OCA, HubPortStatusV3::OVER_CURRENT),
        (PortFlags::PR, HubPortStatusV3::RESET),
        (PortFlags::PP, HubPortStatusV3::POWER),
        (PortFlags::CSC, HubPortStatusV3::CONNECTION_CHANGED),
        (PortFlags::PEC, HubPortStatusV3::ENABLE_CHANGED),
        (PortFlags::OCC, HubPortStatusV3::OVER_CURRENT_CHANGED),
        (PortFlags::PRC, HubPortStatusV3::RESET_CHANGED),
        (PortFlags::WRC, HubPortStatusV3::BH_RESET_CHANGED),
        (PortFlags::PLC, HubPortStatusV3::LINK_STATE_CHANGED),
        (PortFlags::CEC, HubPortStatusV3::CONFIG_ERROR),
    ];

    let mut status = HubPortStatusV3::empty();
    for (from, to) in map {
        status.set(to, flags.contains(from));
    }
    // PLS sits at the same bit offset in both.
    status | HubPortStatusV3::from_bits_truncate(u32::from(port.state()) << 5)
}

fn string_descriptor(text: &str) -> Reply {
    let mut reply = Reply::new();
    reply.push(0);
    reply.push(DescriptorKind::String as u8);
    for unit in text.encode_utf16() {
        reply.extend_from_slice(&unit.to_le_bytes());
    }
    reply[0] = reply.len() as u8;
    reply
}
