//! The command ring and the correlation of Command Completion events.
//!
//! Only one command is ever outstanding. Its TRB address is remembered until the completion that
//! points back at it has been consumed, and queueing another command before then fails with
//! [XhciError::CommandPending].
use std::sync::Arc;
use std::time::Duration;

use common::io::Io;
use common::timeout::{poll_until, TimedOut};
use log::{debug, error, trace, warn};

use super::device_enumerator::DeviceEnumerationRequest;
use super::runtime::ERDP_EHB;
use super::trb::{Trb, TrbCompletionCode, TrbType};
use super::Xhci;
use crate::error::{Result, XhciError};

impl<const N: usize> Xhci<N> {
    fn push_command<F>(&mut self, ty: TrbType, build: F) -> Result<u64>
    where
        F: FnOnce(&mut Trb, bool),
    {
        if let Some(pending) = self.pending_command {
            warn!(
                "{:?} command refused, the command at {:#x} is still outstanding",
                ty, pending
            );
            return Err(XhciError::CommandPending);
        }
        if self.cmd.free_slots() == 0 {
            return Err(XhciError::RingFull);
        }

        let phys = self.cmd.enqueue_phys();
        {
            let (trb, cycle) = self.cmd.next();
            build(trb, cycle);
            trace!("CMD {:?} at {:#x}: {}", ty, phys, trb);
        }
        self.cmd.flush();
        self.pending_command = Some(phys);

        // Doorbell 0 belongs to the command ring, and its target is always 0.
        self.dbs[0].write(0);

        Ok(phys)
    }

    /// Places a command on the command ring and rings the command doorbell. Returns the address
    /// of the command TRB, which its completion event will point back at.
    pub fn queue_command(
        &mut self,
        parameter: u64,
        slot_id: u8,
        endpoint_index: u8,
        ty: TrbType,
    ) -> Result<u64> {
        self.push_command(ty, |trb, cycle| {
            trb.command(parameter, slot_id, endpoint_index, ty, cycle)
        })
    }

    /// The address of the command the controller has not completed yet.
    pub fn pending_command(&self) -> Option<u64> {
        self.pending_command
    }

    /// Waits for the next event of type `expected`. Other events that show up meanwhile are
    /// dispatched as usual.
    pub fn wait_for_event(&mut self, expected: TrbType, timeout: Duration) -> Result<Trb> {
        self.wait_for_event_matching("event", timeout, |trb| {
            trb.trb_type() == expected as u8
        })
    }

    /// Consumes events until one satisfies `matches`, or fails once `timeout` has elapsed.
    ///
    /// Every consumed event is acknowledged. The ones that do not match are dispatched.
    pub(crate) fn wait_for_event_matching<F>(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut matches: F,
    ) -> Result<Trb>
    where
        F: FnMut(&Trb) -> bool,
    {
        let clock = Arc::clone(&self.clock);
        let interval = self.config.poll_interval();

        let outcome = poll_until(&*clock, interval, timeout, || {
            while let Some(trb) = self.primary_event_ring.next() {
                self.acknowledge_event(&trb);
                if matches(&trb) {
                    return Some(trb);
                }
                self.dispatch_event(trb);
            }
            None
        });

        outcome.map_err(|TimedOut(after)| {
            error!("timeout after {:?} waiting for {}", after, what);
            XhciError::Timeout(what)
        })
    }

    /// Hands a consumed event's slot back to the controller.
    ///
    /// A Command Completion that points at the outstanding command also retires that command,
    /// so the next one may be queued.
    pub fn acknowledge_event(&mut self, trb: &Trb) {
        if trb.trb_type() == TrbType::CommandCompletion as u8 {
            if let Some(phys) = trb.completion_trb_pointer() {
                if self.pending_command == Some(phys) {
                    self.pending_command = None;
                }
                if !self.cmd.consumed(phys) {
                    warn!(
                        "The xHC supplied a pointer to a command TRB that was outside the known command ring bounds: {:#x}",
                        phys
                    );
                }
            }
        }

        let dequeue_pointer = self.primary_event_ring.erdp();
        trace!("Updated ERDP to {:#0x}", dequeue_pointer);

        // EHB is write-one-to-clear.
        let int = &mut self.run.ints[0];
        int.erdp_low.write((dequeue_pointer | ERDP_EHB) as u32);
        int.erdp_high.write((dequeue_pointer >> 32) as u32);
    }

    /// Routes an event nobody was waiting for.
    pub(crate) fn dispatch_event(&mut self, trb: Trb) {
        let ty = trb.trb_type();

        if ty == TrbType::PortStatusChange as u8 {
            let port = trb.port_status_change_port_id();
            if port == 0 || usize::from(port) > self.ports.len() {
                warn!(
                    "Received out of bounds port status change for port {} [port len was: {}]",
                    port,
                    self.ports.len()
                );
                return;
            }
            trace!("Received Port Status Change Request on port {}", port);
            // The receiver lives as long as the sender, both are owned by this controller.
            let _ = self
                .device_enumerator_sender
                .send(DeviceEnumerationRequest { port });
        } else if ty == TrbType::CommandCompletion as u8 {
            warn!(
                "Lost command completion, completion code: {}: {:X?}",
                trb.completion_code(),
                trb
            );
        } else if ty == TrbType::Transfer as u8 {
            warn!(
                "Transfer event for slot {} endpoint {} with nobody waiting, completion code: {}",
                trb.event_slot(),
                trb.endpoint_id(),
                trb.completion_code()
            );
        } else if ty == TrbType::HostController as u8 {
            if trb.completion_code() == TrbCompletionCode::EventRingFull as u8 {
                error!("event ring full, events were lost");
            } else {
                warn!(
                    "Host controller event, completion code: {}",
                    trb.completion_code()
                );
            }
        } else {
            debug!("Ignoring event TRB type {}: {}", ty, trb);
        }
    }

    /// Queues a command and waits for its completion.
    fn run_command<F>(&mut self, ty: TrbType, build: F) -> Result<Trb>
    where
        F: FnOnce(&mut Trb, bool),
    {
        let phys = self.push_command(ty, build)?;
        let timeout = self.config.command_timeout();

        let event = match self.wait_for_event_matching("command completion", timeout, |trb| {
            trb.trb_type() == TrbType::CommandCompletion as u8
                && trb.completion_trb_pointer() == Some(phys)
        }) {
            Ok(event) => event,
            Err(err) => {
                // Nothing will retire the command any more; let the next one through.
                self.pending_command = None;
                error!("{:?} command at {:#x} failed: {}", ty, phys, err);
                return Err(err);
            }
        };

        if let Err(err) = XhciError::check_completion(event.completion_code()) {
            error!("{:?} command failed: {}", ty, err);
            return Err(err);
        }
        trace!("{:?} command completed: {}", ty, event);
        Ok(event)
    }

    /// Queues a command, waits for its completion and checks the completion code.
    pub fn execute_command(
        &mut self,
        parameter: u64,
        slot_id: u8,
        endpoint_index: u8,
        ty: TrbType,
    ) -> Result<Trb> {
        self.run_command(ty, |trb, cycle| {
            trb.command(parameter, slot_id, endpoint_index, ty, cycle)
        })
    }

    /// Returns the slot the controller assigned.
    pub fn enable_slot(&mut self) -> Result<u8> {
        let event = self.execute_command(0, 0, 0, TrbType::EnableSlot)?;
        match event.event_slot() {
            0 => Err(XhciError::InvalidState("enable slot completed without a slot")),
            slot => {
                debug!("Slot {} is enabled", slot);
                Ok(slot)
            }
        }
    }

    pub fn disable_slot(&mut self, slot_id: u8) -> Result<()> {
        trace!("Disable slot {}", slot_id);
        self.execute_command(0, slot_id, 0, TrbType::DisableSlot)?;
        Ok(())
    }

    pub fn address_device(&mut self, slot_id: u8, input_context: u64, bsr: bool) -> Result<()> {
        self.run_command(TrbType::AddressDevice, |trb, cycle| {
            trb.address_device(input_context, slot_id, bsr, cycle)
        })?;
        Ok(())
    }

    pub fn evaluate_context(&mut self, slot_id: u8, input_context: u64) -> Result<()> {
        self.execute_command(input_context, slot_id, 0, TrbType::EvaluateContext)?;
        Ok(())
    }

    pub fn configure_endpoint(&mut self, slot_id: u8, input_context: u64) -> Result<()> {
        self.execute_command(input_context, slot_id, 0, TrbType::ConfigureEndpoint)?;
        Ok(())
    }

    /// `endpoint_index` is the DCI minus one.
    pub fn reset_endpoint(&mut self, slot_id: u8, endpoint_index: u8) -> Result<()> {
        self.execute_command(0, slot_id, endpoint_index, TrbType::ResetEndpoint)?;
        Ok(())
    }

    /// `dequeue` carries the dequeue cycle state in bit 0.
    pub fn set_tr_dequeue_pointer(
        &mut self,
        slot_id: u8,
        endpoint_index: u8,
        dequeue: u64,
    ) -> Result<()> {
        self.execute_command(dequeue, slot_id, endpoint_index, TrbType::SetTrDequeuePointer)?;
        Ok(())
    }

    pub fn noop(&mut self) -> Result<()> {
        self.execute_command(0, 0, 0, TrbType::NoOpCmd)?;
        Ok(())
    }
}
