//! Per-port device enumeration.
//!
//! Port Status Change events only queue a [DeviceEnumerationRequest]; the requests are worked
//! off after the event ring has been drained, so that the commands enumeration issues never run
//! inside event dispatch.
use std::sync::Arc;

use log::{debug, info, warn};

use super::context::{VirtualDevice, INPUT_CONTEXT_A0};
use super::port::PortFlags;
use super::ring::Ring;
use super::{Xhci, TRANSFER_RING_TRBS};
use crate::driver_interface::{DeviceHandle, EndpointConfig, EndpointTy, PortEvent, UsbSpeed};
use crate::error::{Result, XhciError};
use crate::usb::{self, DescriptorKind};

pub struct DeviceEnumerationRequest {
    pub port: u8,
}

/// Where a root hub port is in bringing up the device attached to it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumerationState {
    /// No device.
    Empty,
    SlotRequested,
    SlotEnabled(u8),
    AddressRequested(u8),
    Addressed(u8),
    ConfigureRequested(u8),
    Configured(u8),
}

impl EnumerationState {
    pub fn slot(self) -> Option<u8> {
        match self {
            Self::Empty | Self::SlotRequested => None,
            Self::SlotEnabled(slot)
            | Self::AddressRequested(slot)
            | Self::Addressed(slot)
            | Self::ConfigureRequested(slot)
            | Self::Configured(slot) => Some(slot),
        }
    }

    /// Whether `next` may follow this state. Any state may fall back to `Empty`, and a failed
    /// configuration falls back to `Addressed`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use EnumerationState::*;

        match (self, next) {
            (_, Empty) => true,
            (Empty, SlotRequested) => true,
            (SlotRequested, SlotEnabled(_)) => true,
            (SlotEnabled(a), AddressRequested(b))
            | (AddressRequested(a), Addressed(b))
            | (Addressed(a), ConfigureRequested(b))
            | (ConfigureRequested(a), Configured(b))
            | (ConfigureRequested(a), Addressed(b))
            | (Configured(a), ConfigureRequested(b)) => a == b,
            _ => false,
        }
    }
}

/// The Average TRB Length to start an endpoint context with.
fn average_trb_length(kind: EndpointTy) -> u16 {
    match kind {
        EndpointTy::Ctrl => 8,
        EndpointTy::Interrupt => 1024,
        EndpointTy::Bulk | EndpointTy::Isoch => 3072,
    }
}

impl<const N: usize> Xhci<N> {
    fn port_index(&self, port: u8) -> Result<usize> {
        match usize::from(port).checked_sub(1) {
            Some(index) if index < self.ports.len() => Ok(index),
            _ => Err(XhciError::InvalidState("port out of range")),
        }
    }

    fn set_port_state(&mut self, port: u8, next: EnumerationState) -> Result<()> {
        let current = self.port_state(port);
        if !current.can_transition_to(next) {
            warn!(
                "Port {}: refusing enumeration transition {:?} -> {:?}",
                port, current, next
            );
            return Err(XhciError::InvalidState("illegal enumeration transition"));
        }

        debug!("Port {}: {:?} -> {:?}", port, current, next);
        if next == EnumerationState::Empty {
            self.port_states.remove(&port);
        } else {
            self.port_states.insert(port, next);
        }
        Ok(())
    }

    /// Works off every queued port change.
    pub(crate) fn run_enumerations(&mut self) -> Vec<PortEvent> {
        let mut events = Vec::new();
        while let Ok(request) = self.device_enumerator_receiver.try_recv() {
            debug!("Device Enumerator request for port {}", request.port);
            if let Some(event) = self.handle_port_change(request.port) {
                events.push(event);
            }
        }
        events
    }

    /// Brings the port in line with its connect status: enumerates a new device, or tears down
    /// the one that left.
    pub fn handle_port_change(&mut self, port: u8) -> Option<PortEvent> {
        let index = match self.port_index(port) {
            Ok(index) => index,
            Err(_) => {
                warn!("Received out of bounds Device Enumeration request for port {}", port);
                return None;
            }
        };

        let (data, state, speed, flags) = {
            let port = &self.ports[index];
            (port.read(), port.state(), port.speed(), port.flags())
        };
        info!(
            "XHCI Port {}: {:X}, State {}, Speed {}, Flags {:?}",
            port, data, state, speed, flags
        );
        // Acknowledge the changes so the next one raises a new event.
        self.ports[index].clear_changes(flags);

        if flags.contains(PortFlags::CCS) {
            if self.port_state(port) != EnumerationState::Empty {
                debug!("Received a device connect notification for an already connected device. Ignoring...");
                return None;
            }
            match self.attach_device(port, flags) {
                Ok(handle) => {
                    info!("Device on port {} was attached as {:?}", port, handle);
                    Some(PortEvent::Attached(handle))
                }
                Err(error) => {
                    warn!("processing of device attach request failed! Error: {}", error);
                    Some(PortEvent::AttachFailed { port, error })
                }
            }
        } else {
            let slot_id = match self.port_state(port) {
                EnumerationState::Empty => {
                    debug!("Port {} disconnected without a device attached", port);
                    return None;
                }
                state => state.slot().unwrap_or(0),
            };
            self.detach_device(port);
            info!("Device on port {} was detached", port);
            Some(PortEvent::Detached { port, slot_id })
        }
    }

    /// Resets the port and waits for it to come back enabled.
    pub fn reset_port(&mut self, port: u8) -> Result<()> {
        let index = self.port_index(port)?;
        debug!("XHCI Port {} reset", port);

        self.ports[index].set_pr();
        let timeout = self.config.port_reset_timeout();
        let prc = PortFlags::PRC.bits();
        self.handshake(
            "port reset",
            timeout,
            |hci| hci.ports[index].read(),
            prc,
            prc,
        )?;
        // The status the reset completed with.
        let flags = self.ports[index].flags();
        self.ports[index].clear_prc();

        let enabled_state = flags.contains(PortFlags::PP)
            && flags.contains(PortFlags::CCS)
            && flags.contains(PortFlags::PED)
            && !flags.contains(PortFlags::PR);
        if !enabled_state {
            warn!(
                "Port {} isn't in the enabled state! Current flags: {:?}",
                port, flags
            );
            return Err(XhciError::InvalidState("port did not enable after reset"));
        }
        debug!("Port {} is in the enabled state. Proceeding with enumeration", port);
        Ok(())
    }

    /// `flags` is PORTSC as it was before the change bits were acknowledged.
    fn attach_device(&mut self, port: u8, flags: PortFlags) -> Result<DeviceHandle> {
        let index = self.port_index(port)?;

        // USB3 ports only report a connect once they are enabled; USB2 ports have to be reset
        // first.
        if !flags.contains(PortFlags::PED) {
            info!(
                "Received a device connect on port {}, but it's not enabled. Resetting the port.",
                port
            );
            self.reset_port(port)?;
        }

        let speed = UsbSpeed::from_port_speed(self.ports[index].speed())
            .ok_or(XhciError::Unsupported)?;

        self.set_port_state(port, EnumerationState::SlotRequested)?;
        let slot = match self.enable_slot() {
            Ok(slot) => slot,
            Err(err) => {
                self.set_port_state(port, EnumerationState::Empty)?;
                return Err(err);
            }
        };
        debug!("Enabled port {}, which the xHC mapped to {}", port, slot);

        match self.address_new_device(port, slot, speed) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.abandon_slot(port, slot);
                Err(err)
            }
        }
    }

    fn address_new_device(&mut self, port: u8, slot: u8, speed: UsbSpeed) -> Result<DeviceHandle> {
        self.set_port_state(port, EnumerationState::SlotEnabled(slot))?;

        let mut device = VirtualDevice::new(
            &self.dma,
            slot,
            port,
            speed,
            self.config.transfer_ring_segments,
        )?;
        device.prepare_address();
        let input = device.input.physical() as u64;
        self.dev_ctx.attach(device)?;

        info!("Attempting to address the device");
        self.set_port_state(port, EnumerationState::AddressRequested(slot))?;
        self.address_device(slot, input, false)?;
        self.set_port_state(port, EnumerationState::Addressed(slot))?;

        if self.config.fetch_max_packet_size {
            self.update_max_packet_size(slot)?;
        }

        self.device(slot).ok_or(XhciError::NoSuchDevice(slot))
    }

    /// Reads bMaxPacketSize0 and makes the default control pipe use it.
    fn update_max_packet_size(&mut self, slot: u8) -> Result<()> {
        let mut buffer = [0u8; 8];
        let setup = usb::Setup::get_descriptor(DescriptorKind::Device, 0, 0, buffer.len() as u16);
        let len = self.control_transfer(slot, setup, Some(&mut buffer))?;
        if len < buffer.len() {
            return Err(XhciError::InvalidState("short device descriptor"));
        }

        let descriptor: usb::DeviceDescriptor8Byte = *plain::from_bytes(&buffer)
            .map_err(|_| XhciError::InvalidState("malformed device descriptor"))?;
        debug!("Got the 8 byte dev descriptor: {:X?}", descriptor);

        let max_packet_size = descriptor.ep0_max_packet_size();
        if max_packet_size == 0 {
            return Err(XhciError::InvalidState("device reports no EP0 packet size"));
        }
        if self.ep0_max_packet_size(slot) == Some(max_packet_size) {
            return Ok(());
        }

        debug!("Slot {}: EP0 max packet size is {}", slot, max_packet_size);
        let device = self
            .dev_ctx
            .get_mut(slot)
            .ok_or(XhciError::NoSuchDevice(slot))?;
        device.prepare_ep0_max_packet_size(max_packet_size);
        let input = device.input.physical() as u64;
        self.evaluate_context(slot, input)
    }

    /// Gives the slot back after a failed enumeration and forgets the device.
    fn abandon_slot(&mut self, port: u8, slot: u8) {
        let owned = self
            .dev_ctx
            .get(slot)
            .map_or(true, |device| device.port == port);
        if !owned {
            warn!("slot {} belongs to another port, not releasing it for port {}", slot, port);
        } else {
            if let Err(err) = self.disable_slot(slot) {
                warn!("failed to disable slot {} of port {}: {}", slot, port, err);
            }
            self.dev_ctx.detach(slot);
        }
        self.port_states.remove(&port);
    }

    fn detach_device(&mut self, port: u8) {
        if let Some(slot) = self.port_state(port).slot() {
            debug!("disabling port slot {} for port {}", slot, port);
            let result = self.disable_slot(slot);
            debug!(
                "disabled port slot {} for port {} with result: {:?}",
                slot, port, result
            );
            self.dev_ctx.detach(slot);
        }
        self.port_states.remove(&port);
    }

    /// Adds `endpoints` to the addressed device in `slot_id`, with one transfer ring each.
    pub fn configure_endpoints(&mut self, slot_id: u8, endpoints: &[EndpointConfig]) -> Result<()> {
        let port = self
            .dev_ctx
            .get(slot_id)
            .ok_or(XhciError::NoSuchDevice(slot_id))?
            .port;
        if endpoints.iter().any(|endpoint| endpoint.dci() < 2 || endpoint.dci() > 31) {
            return Err(XhciError::InvalidState("endpoint index out of range"));
        }

        let previous = self.port_state(port);
        self.set_port_state(port, EnumerationState::ConfigureRequested(slot_id))?;

        // Rings of endpoints being reconfigured, kept until the controller accepts the new ones.
        let mut replaced = Vec::new();
        if let Some(device) = self.dev_ctx.get_mut(slot_id) {
            for endpoint in endpoints {
                if let Some(ring) = device.rings.remove(&endpoint.dci()) {
                    replaced.push((endpoint.dci(), ring));
                }
            }
        }

        match self.add_endpoints(slot_id, endpoints) {
            Ok(()) => {
                self.set_port_state(port, EnumerationState::Configured(slot_id))?;
                Ok(())
            }
            Err(err) => {
                if let Some(device) = self.dev_ctx.get_mut(slot_id) {
                    for endpoint in endpoints {
                        device.rings.remove(&endpoint.dci());
                    }
                    device.rings.extend(replaced);
                }
                warn!(
                    "Slot {}: configuring endpoints failed, staying {:?}: {}",
                    slot_id, previous, err
                );
                self.set_port_state(port, previous)?;
                Err(err)
            }
        }
    }

    fn add_endpoints(&mut self, slot_id: u8, endpoints: &[EndpointConfig]) -> Result<()> {
        let dma = Arc::clone(&self.dma);
        let segments = self.config.transfer_ring_segments;
        let device = self
            .dev_ctx
            .get_mut(slot_id)
            .ok_or(XhciError::NoSuchDevice(slot_id))?;

        device.sync_slot_from_output();
        let mut add = INPUT_CONTEXT_A0;
        let mut entries = device.input.device.slot.context_entries();

        for endpoint in endpoints {
            let dci = endpoint.dci();
            let ring = Ring::new(&dma, segments, TRANSFER_RING_TRBS, true)?;
            let context = device
                .input
                .device
                .endpoint_context_mut(usize::from(dci - 1))
                .ok_or(XhciError::InvalidState("endpoint index out of range"))?;
            context.configure(
                endpoint.xhci_ep_type(),
                endpoint.max_packet_size,
                endpoint.max_burst,
                endpoint.interval,
                ring.register(),
                average_trb_length(endpoint.kind),
            );
            debug!(
                "Slot {}: endpoint {:#x} at DCI {}",
                slot_id, endpoint.address, dci
            );
            device.rings.insert(dci, ring);
            add |= 1 << dci;
            entries = entries.max(dci);
        }

        device.input.set_flags(add, 0);
        device.input.device.slot.set_context_entries(entries);
        device.input.dump_control();
        device.input.flush();
        let input = device.input.physical() as u64;

        self.configure_endpoint(slot_id, input)
    }
}

#[cfg(test)]
mod test {
    use super::EnumerationState::*;
    use super::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Empty,
            SlotRequested,
            SlotEnabled(3),
            AddressRequested(3),
            Addressed(3),
            ConfigureRequested(3),
            Configured(3),
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn skipping_or_switching_slots_is_refused() {
        assert!(!Empty.can_transition_to(SlotEnabled(1)));
        assert!(!SlotRequested.can_transition_to(AddressRequested(1)));
        assert!(!SlotEnabled(1).can_transition_to(AddressRequested(2)));
        assert!(!Addressed(1).can_transition_to(Configured(1)));
        assert!(!Configured(1).can_transition_to(Addressed(1)));
    }

    #[test]
    fn failures_fall_back() {
        for state in [SlotRequested, AddressRequested(4), Configured(4)] {
            assert!(state.can_transition_to(Empty));
        }
        assert!(ConfigureRequested(4).can_transition_to(Addressed(4)));
    }

    #[test]
    fn slots() {
        assert_eq!(Empty.slot(), None);
        assert_eq!(SlotRequested.slot(), None);
        assert_eq!(AddressRequested(9).slot(), Some(9));
        assert_eq!(Configured(9).slot(), Some(9));
    }

    #[test]
    fn trb_length_hints() {
        assert_eq!(average_trb_length(EndpointTy::Ctrl), 8);
        assert_eq!(average_trb_length(EndpointTy::Interrupt), 1024);
        assert_eq!(average_trb_length(EndpointTy::Bulk), 3072);
    }
}
