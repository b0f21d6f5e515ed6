//! Interrupt acknowledgement and event ring draining.
//!
//! The event ring is the only channel the controller reports through, and the cycle bit of the
//! TRB at the dequeue pointer the only sign that there is something new on it.
use common::io::Io;
use log::{error, trace};

use super::operational::USB_STS_HSE;
use super::runtime::IMAN_IP;
use super::{InterruptMethod, Xhci};
use crate::error::{Result, XhciError};

impl<const N: usize> Xhci<N> {
    fn uses_msi_interrupts(&self) -> bool {
        self.interrupt_method == InterruptMethod::Msi
    }

    /// Whether an event is waiting on the primary event ring.
    pub fn poll_ready(&self) -> bool {
        self.primary_event_ring.is_ready()
    }

    /// Checks whether the interrupt was raised by this controller, and acknowledges it.
    pub fn received_irq(&mut self) -> Result<bool> {
        let status = self.op.usb_sts.read();
        if status == u32::MAX {
            return Err(XhciError::NoDevice);
        }
        if status & USB_STS_HSE != 0 {
            error!("xHC reported a host system error, USBSTS {:#x}", status);
            return Err(XhciError::InvalidState("host system error"));
        }

        if self.interrupt_method == InterruptMethod::Polling {
            return Ok(true);
        }
        if self.uses_msi_interrupts() {
            // Since using MSI and MSI-X implies having no IRQ sharing whatsoever, the IP bit
            // doesn't have to be touched.
            trace!("Successfully received MSI/MSI-X interrupt, IP is cleared by the xHC");
            self.op.clear_eint();
            return Ok(true);
        }

        let iman = &mut self.run.ints[0].iman;
        if iman.readf(IMAN_IP) {
            trace!("Successfully received INTx# interrupt, IP={:#x}", iman.read());
            // IP is write-one-to-clear.
            iman.writef(IMAN_IP, true);
            self.op.clear_eint();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consumes and dispatches every ready event. Returns how many there were.
    pub fn process_events(&mut self) -> usize {
        let mut count = 0;
        while let Some(trb) = self.primary_event_ring.next() {
            trace!("EVENT {}", trb);
            self.acknowledge_event(&trb);
            self.dispatch_event(trb);
            count += 1;
        }
        count
    }
}
