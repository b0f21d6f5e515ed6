//! Control transfers on the default control pipe, and the host adapter entry points.
use log::{debug, trace, warn};
use smallvec::SmallVec;

use super::doorbell::Doorbell;
use super::root_hub::ROOT_HUB_ADDRESS;
use super::trb::{TransferKind, Trb, TrbCompletionCode, TrbType};
use super::Xhci;
use crate::driver_interface::{
    Endpoint, EndpointTy, PortEvent, PortTransferStatus, PortTransferStatusKind, Transaction,
    TransactionCallback, TransactionKind, UsbHost, UsbSpeed,
};
use crate::error::{CompletionError, Result, XhciError};
use crate::usb::{ReqDirection, Setup, SetupReq};

/// The Device Context Index of the default control endpoint.
const EP0_DCI: u8 = 1;

/// A caller's data stage buffer while the controller owns it.
struct PinnedBuffer {
    virt: *mut u8,
    phys: usize,
    len: usize,
}

impl<const N: usize> Xhci<N> {
    /// Runs a control transfer against the device at USB address `address`, returning the
    /// number of data stage bytes transferred.
    ///
    /// Address 0 is the emulated root hub, which never touches a ring.
    pub fn submit_control(
        &mut self,
        address: u8,
        setup: Setup,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize> {
        if address == ROOT_HUB_ADDRESS {
            return self.root_hub.handle(&setup, &mut *self.ports, buffer);
        }

        // AddressDevice already gave the device its address.
        if setup.is_standard() && setup.request == SetupReq::SetAddress as u8 {
            debug!("Absorbing SET_ADDRESS {} for device {}", { setup.value }, address);
            return Ok(0);
        }

        let slot = self
            .slot_for_address(address)
            .ok_or(XhciError::NoSuchDevice(address))?;
        self.control_transfer(slot, setup, buffer)
    }

    /// Runs a control transfer on the default control pipe of `slot`.
    pub fn control_transfer(
        &mut self,
        slot: u8,
        setup: Setup,
        buffer: Option<&mut [u8]>,
    ) -> Result<usize> {
        let input = setup.direction() == ReqDirection::DeviceToHost;
        let len = buffer
            .as_ref()
            .map_or(0, |buffer| buffer.len())
            .min(usize::from(setup.length));

        let data = match buffer {
            Some(buffer) if len > 0 => {
                let phys = self.dma.pin(buffer.as_ptr(), len)?;
                if !input {
                    self.dma.flush(buffer.as_ptr(), len);
                }
                Some(PinnedBuffer {
                    virt: buffer.as_mut_ptr(),
                    phys,
                    len,
                })
            }
            _ => None,
        };

        let result = self.run_control_transfer(slot, setup, data.as_ref(), input);

        if let Some(data) = &data {
            if input {
                self.dma.invalidate(data.virt, data.len);
            }
            self.dma.unpin(data.phys, data.len);
        }
        result
    }

    fn run_control_transfer(
        &mut self,
        slot: u8,
        setup: Setup,
        data: Option<&PinnedBuffer>,
        input: bool,
    ) -> Result<usize> {
        let transfer_kind = match data {
            None => TransferKind::NoData,
            Some(_) if input => TransferKind::In,
            Some(_) => TransferKind::Out,
        };

        // Setup, optional Data and Status TRB addresses.
        let mut trbs: SmallVec<[u64; 3]> = SmallVec::new();
        let data_trb;
        let status_trb;
        {
            let ring = self
                .dev_ctx
                .get_mut(slot)
                .and_then(|device| device.ring_mut(EP0_DCI))
                .ok_or(XhciError::NoSuchDevice(slot))?;
            let needed = if data.is_some() { 3 } else { 2 };
            if ring.free_slots() < needed {
                return Err(XhciError::RingFull);
            }

            trbs.push(ring.enqueue_phys());
            {
                let (trb, cycle) = ring.next();
                trb.setup(setup, transfer_kind, cycle);
                trace!("Slot {} SETUP {}", slot, trb);
            }

            data_trb = match data {
                Some(data) => {
                    let phys = ring.enqueue_phys();
                    trbs.push(phys);
                    let (trb, cycle) = ring.next();
                    trb.data(data.phys as u64, data.len as u32, input, true, cycle);
                    trace!("Slot {} DATA {}", slot, trb);
                    Some(phys)
                }
                None => None,
            };

            // The status stage runs opposite to the data stage, and IN without one.
            status_trb = ring.enqueue_phys();
            trbs.push(status_trb);
            {
                let (trb, cycle) = ring.next();
                trb.status(!(input && data.is_some()), true, cycle);
                trace!("Slot {} STATUS {}", slot, trb);
            }
            ring.flush();
        }

        trace!("Ringing doorbell {} for EP0", slot);
        self.dbs[usize::from(slot)].write(Doorbell::target(EP0_DCI - 1, 0));

        let timeout = self.config.transfer_timeout();
        let mut residual = 0;
        loop {
            let event = self.wait_for_event_matching("control transfer", timeout, |trb| {
                is_transfer_event_for(trb, slot, &trbs)
            })?;
            let pointer = event.transfer_event_trb_pointer().unwrap_or(0);
            if let Some(ring) = self
                .dev_ctx
                .get_mut(slot)
                .and_then(|device| device.ring_mut(EP0_DCI))
            {
                ring.consumed(pointer);
            }

            let code = event.completion_code();
            if Some(pointer) == data_trb {
                residual = event.transfer_length() as usize;
            }

            if let Err(err) = XhciError::check_completion(code) {
                warn!("Slot {} control transfer failed: {}", slot, err);
                if matches!(
                    err.completion_kind(),
                    Some(CompletionError::Stall) | Some(CompletionError::Transaction)
                ) {
                    if let Err(recovery) = self.recover_halted_endpoint(slot, EP0_DCI) {
                        warn!("Slot {} EP0 recovery failed: {}", slot, recovery);
                    }
                }
                return Err(err);
            }
            if pointer == status_trb {
                break;
            }
            // A short data stage still runs the status stage.
            if code == TrbCompletionCode::ShortPacket as u8 {
                trace!("Slot {} short data stage, {} bytes missing", slot, residual);
            }
        }

        let requested = data.map_or(0, |data| data.len);
        Ok(requested.saturating_sub(residual))
    }

    /// Clears a halt and moves the endpoint past the TRBs of the failed transfer.
    fn recover_halted_endpoint(&mut self, slot: u8, dci: u8) -> Result<()> {
        self.reset_endpoint(slot, dci - 1)?;

        let dequeue = self
            .dev_ctx
            .get(slot)
            .and_then(|device| device.rings.get(&dci))
            .map(|ring| ring.register())
            .ok_or(XhciError::NoSuchDevice(slot))?;
        self.set_tr_dequeue_pointer(slot, dci - 1, dequeue)?;

        if let Some(ring) = self
            .dev_ctx
            .get_mut(slot)
            .and_then(|device| device.ring_mut(dci))
        {
            ring.skip_to_enqueue();
        }
        debug!("Slot {} DCI {} recovered", slot, dci);
        Ok(())
    }
}

fn is_transfer_event_for(trb: &Trb, slot: u8, trbs: &[u64]) -> bool {
    trb.trb_type() == TrbType::Transfer as u8
        && trb.event_slot() == slot
        && trb.endpoint_id() == EP0_DCI
        && trb
            .transfer_event_trb_pointer()
            .map_or(false, |pointer| trbs.contains(&pointer))
}

impl<const N: usize> UsbHost for Xhci<N> {
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
    ) -> Result<usize> {
        if endpoint.kind != EndpointTy::Ctrl || endpoint.number != 0 {
            return Err(XhciError::Unsupported);
        }
        trace!(
            "Transaction for device {} (hub {:?} port {}, {:?})",
            device_address,
            hub_address,
            hub_port,
            speed
        );

        let count = transactions.len();
        let (setup_transaction, rest) = transactions
            .split_first_mut()
            .ok_or(XhciError::InvalidState("no setup transaction"))?;
        if setup_transaction.kind != TransactionKind::Setup {
            return Err(XhciError::InvalidState("first transaction is not a setup"));
        }
        let setup = Setup::from_bytes(setup_transaction.buffer).ok_or_else(XhciError::stall)?;
        let requested = usize::from(setup.length);
        let data = rest.first_mut().map(|transaction| &mut *transaction.buffer);

        let result = self.submit_control(device_address, setup, data);

        if let Some(callback) = callback {
            let kind = match &result {
                Ok(bytes) if *bytes < requested && count > 1 => PortTransferStatusKind::ShortPacket,
                Ok(_) => PortTransferStatusKind::Success,
                Err(err) if err.is_stall() => PortTransferStatusKind::Stalled,
                Err(_) => PortTransferStatusKind::Unknown,
            };
            let (setup_bytes, data_bytes) = match &result {
                Ok(bytes) => (8, *bytes as u32),
                Err(_) => (0, 0),
            };
            for index in 0..count {
                let bytes_transferred = if index == 0 { setup_bytes } else { data_bytes };
                callback(
                    token + index,
                    PortTransferStatus {
                        kind,
                        bytes_transferred,
                    },
                );
            }
        }
        result
    }

    fn handle_interrupt(&mut self) -> Result<Vec<PortEvent>> {
        if !self.received_irq()? {
            return Ok(Vec::new());
        }
        let handled = self.process_events();
        trace!("Handled {} events", handled);
        Ok(self.run_enumerations())
    }
}
