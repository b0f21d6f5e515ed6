//! The eXtensible Host Controller Interface (XHCI) Module
//!
//! XHCI is a standard for the USB Host Controller interface specified by Intel that provides a
//! common register interface for systems to use to interact with the Universal Serial Bus (USB)
//! subsystem.
//!
//! [Xhci] owns the controller's registers, its command and primary event rings, and the device
//! context array. Its operations are spread over the submodules by concern: [command] issues
//! commands and waits for their completions, [irq_reactor] drains the event ring,
//! [device_enumerator] runs the per-port enumeration state machine, and [transfer] carries
//! control transfers, forwarding those addressed to the root hub to [root_hub].
//!
//! The standard can be found [here](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/extensible-host-controler-interface-usb-xhci.pdf).
//! The acronyms used for specific documents are specified in the crate-level documentation.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::{mem, slice};

use common::dma::DmaAllocator;
use common::io::Io;
use common::timeout::{poll_until, Clock, TimedOut};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::config::XhciConfig;
use crate::driver_interface::{DeviceHandle, RegisterWindow};
use crate::error::{Result, XhciError};

pub mod capability;
pub mod command;
pub mod context;
pub mod device_enumerator;
pub mod doorbell;
pub mod event;
pub mod irq_reactor;
pub mod operational;
pub mod port;
pub mod ring;
pub mod root_hub;
pub mod runtime;
pub mod transfer;
pub mod trb;

use self::capability::CapabilityRegs;
use self::context::{DeviceContextList, ScratchpadBufferArray, SlotState, CONTEXT_64};
use self::device_enumerator::DeviceEnumerationRequest;
use self::doorbell::Doorbell;
use self::event::EventRing;
use self::operational::*;
use self::port::Port;
use self::ring::Ring;
use self::root_hub::RootHub;
use self::runtime::{RuntimeRegs, ERDP_EHB, IMAN_IE, IMAN_IP};

pub use self::context::{CONTEXT_32, CONTEXT_64 as CONTEXT_64_BYTES};
pub use self::device_enumerator::EnumerationState;
pub use self::trb::{Trb, TrbCompletionCode, TrbType};

/// TRBs per command ring segment, including the link.
pub const COMMAND_RING_TRBS: usize = 64;
/// TRBs per transfer ring segment, including the link.
pub const TRANSFER_RING_TRBS: usize = 64;

/// The smallest register window that can hold the capability and operational registers.
const MIN_WINDOW_SIZE: usize = 0x1000;

/// Specifies the configurable interrupt mechanism used by the xhci subsystem for registering
/// device state change notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptMethod {
    /// No interrupts whatsoever; the driver will instead rely on polling event rings.
    Polling,

    /// Legacy PCI INTx# interrupt pin.
    Intx,

    /// (Extended) Message signaled interrupts.
    Msi,
}

/// One XHCI controller. `N` selects the context size the controller reports through CSZ, see
/// [CONTEXT_32] and [CONTEXT_64_BYTES].
pub struct Xhci<const N: usize> {
    /// The Host Controller Interface Capability Registers. These read-only registers specify the
    /// limits and capabilities of the host controller implementation (See XHCI section 5.3)
    cap: &'static CapabilityRegs,
    /// The Host Controller Interface Operational Registers (See XHCI section 5.4)
    op: &'static mut OperationalRegs,
    ports: &'static mut [Port],
    /// One doorbell per device slot; doorbell 0 belongs to the command ring. (See XHCI sections
    /// 4.7 and 5.6)
    dbs: &'static mut [Doorbell],
    /// The Host Controller Interface Runtime Registers. (See XHCI section 5.5)
    run: &'static mut RuntimeRegs,
    cmd: Ring,
    primary_event_ring: EventRing,

    dev_ctx: DeviceContextList<N>,
    scratchpad_buf_arr: Option<ScratchpadBufferArray>,
    root_hub: RootHub,

    port_states: BTreeMap<u8, EnumerationState>,
    /// The command ring address of the one command the controller has not completed yet.
    pending_command: Option<u64>,

    device_enumerator_sender: Sender<DeviceEnumerationRequest>,
    device_enumerator_receiver: Receiver<DeviceEnumerationRequest>,

    dma: Arc<dyn DmaAllocator>,
    clock: Arc<dyn Clock>,
    config: XhciConfig,
    interrupt_method: InterruptMethod,
    irq: Option<u32>,
}

impl<const N: usize> Xhci<N> {
    /// Takes over the controller behind `window`, resets it and starts it.
    ///
    /// # Safety
    /// `window` must describe the controller's mapped register block, which must stay mapped for
    /// as long as the returned value lives and must not be accessed by anything else.
    pub unsafe fn new(
        window: RegisterWindow,
        dma: Arc<dyn DmaAllocator>,
        clock: Arc<dyn Clock>,
        config: XhciConfig,
        interrupt_method: InterruptMethod,
    ) -> Result<Self> {
        if window.base == 0 || window.size < MIN_WINDOW_SIZE {
            return Err(XhciError::Init("register window too small"));
        }
        let address = window.base;
        let end = address + window.size;

        //Locate the capability registers from the mapped window
        let cap = &*(address as *const CapabilityRegs);
        debug!("CAP REGS BASE {:X}", address);

        if cap.hcs_params1.read() == u32::MAX {
            return Err(XhciError::NoDevice);
        }
        if cap.csz() != (N == CONTEXT_64) {
            error!(
                "xHC uses {}-byte contexts",
                if cap.csz() { 64 } else { 32 }
            );
            return Err(XhciError::Init("context size mismatch"));
        }

        let max_slots = cap.max_slots();
        let max_ports = cap.max_ports();
        info!(
            "xHC version {:X}, max slots: {}, max ports: {}",
            cap.hci_ver.read(),
            max_slots,
            max_ports
        );

        //The operational registers appear immediately after the capability registers.
        let op_base = address + usize::from(cap.len.read());
        let port_base = op_base + OP_PORTS_OFFSET;
        let db_base = address + cap.db_offset();
        let run_base = address + cap.rts_offset();
        debug!(
            "OP REGS BASE {:X}, PORT BASE {:X}, DOORBELL REGS BASE {:X}, RUNTIME REGS BASE {:X}",
            op_base, port_base, db_base, run_base
        );

        let blocks = [
            (op_base, mem::size_of::<OperationalRegs>()),
            (port_base, usize::from(max_ports) * mem::size_of::<Port>()),
            (db_base, 256 * mem::size_of::<Doorbell>()),
            (run_base, mem::size_of::<RuntimeRegs>()),
        ];
        if blocks
            .iter()
            .any(|&(base, len)| base < address || base + len > end)
        {
            return Err(XhciError::Init(
                "register window does not cover the register blocks",
            ));
        }

        if config.event_ring_segments as u64 > u64::from(cap.max_erst_entries()) {
            return Err(XhciError::Init(
                "more event ring segments than the controller supports",
            ));
        }

        let op = &mut *(op_base as *mut OperationalRegs);
        let ports = slice::from_raw_parts_mut(port_base as *mut Port, usize::from(max_ports));
        let dbs = slice::from_raw_parts_mut(db_base as *mut Doorbell, 256);
        let run = &mut *(run_base as *mut RuntimeRegs);

        let cmd = Ring::new(
            &dma,
            config.command_ring_segments,
            COMMAND_RING_TRBS,
            true,
        )?;
        let primary_event_ring = EventRing::new(&dma, config.event_ring_segments)?;
        let dev_ctx = DeviceContextList::new(&dma, max_slots)?;

        let (device_enumerator_sender, device_enumerator_receiver) = crossbeam_channel::unbounded();

        let mut xhci = Self {
            cap,
            op,
            ports,
            dbs,
            run,
            cmd,
            primary_event_ring,

            dev_ctx,
            scratchpad_buf_arr: None, // initialized in init()
            root_hub: RootHub::new(max_ports, cap.ppc()),

            port_states: BTreeMap::new(),
            pending_command: None,

            device_enumerator_sender,
            device_enumerator_receiver,

            dma,
            clock,
            config,
            interrupt_method,
            irq: window.irq,
        };

        xhci.reset()?;
        xhci.init(max_slots)?;

        Ok(xhci)
    }

    /// Polls `read` until the bits under `mask` equal `expected`.
    ///
    /// A register that reads as all ones means the controller is gone.
    fn handshake<F>(
        &self,
        what: &'static str,
        timeout: Duration,
        read: F,
        mask: u32,
        expected: u32,
    ) -> Result<()>
    where
        F: Fn(&Self) -> u32,
    {
        let outcome = poll_until(&*self.clock, self.config.poll_interval(), timeout, || {
            let value = read(self);
            if value == u32::MAX {
                Some(Err(XhciError::NoDevice))
            } else if value & mask == expected {
                Some(Ok(()))
            } else {
                None
            }
        });
        match outcome {
            Ok(result) => result,
            Err(TimedOut(after)) => {
                error!("timeout after {:?} waiting for {}", after, what);
                Err(XhciError::Timeout(what))
            }
        }
    }

    /// Stops and resets the controller.
    pub fn reset(&mut self) -> Result<()> {
        let reset_timeout = self.config.reset_timeout();
        let halt_timeout = self.config.halt_timeout();

        debug!("Waiting for xHC becoming ready.");
        self.handshake(
            "controller ready",
            reset_timeout,
            |hci| hci.op.usb_sts.read(),
            USB_STS_CNR,
            0,
        )?;

        debug!("Stopping the xHC");
        self.op.usb_cmd.writef(USB_CMD_RS, false);
        self.handshake(
            "controller halt",
            halt_timeout,
            |hci| hci.op.usb_sts.read(),
            USB_STS_HCH,
            USB_STS_HCH,
        )?;

        debug!("Resetting the xHC.");
        self.op.usb_cmd.writef(USB_CMD_HCRST, true);
        self.handshake(
            "controller reset",
            reset_timeout,
            |hci| hci.op.usb_cmd.read(),
            USB_CMD_HCRST,
            0,
        )?;
        self.handshake(
            "controller ready after reset",
            reset_timeout,
            |hci| hci.op.usb_sts.read(),
            USB_STS_CNR,
            0,
        )?;

        Ok(())
    }

    fn init(&mut self, max_slots: u8) -> Result<()> {
        // Set enabled slots
        debug!("Setting enabled slots to {}.", max_slots);
        self.op.set_max_slots_enabled(max_slots);
        debug!("Enabled Slots: {}", self.op.max_slots_enabled());

        // Set device context address array pointer
        let dcbaap = self.dev_ctx.dcbaap();
        debug!("Writing DCBAAP: {:X}", dcbaap);
        self.op.set_dcbaap(dcbaap);

        // Set command ring control register
        let crcr = self.cmd.register();
        if crcr & 0x3E != 0 {
            return Err(XhciError::Init("command ring is not 64-byte aligned"));
        }
        debug!("Writing CRCR: {:X}", crcr);
        self.op.set_crcr(crcr);

        // Set event ring segment table registers
        {
            let erstsz = self.primary_event_ring.erstsz();
            let erdp = self.primary_event_ring.erdp();
            let erstba = self.primary_event_ring.erstba();
            let moderation = self.config.interrupt_moderation;
            let int = &mut self.run.ints[0];

            debug!("Writing ERSTZ: {}", erstsz);
            int.erstsz.write(u32::from(erstsz));

            debug!("Writing ERDP: {:X}", erdp);
            int.erdp_low.write((erdp | ERDP_EHB) as u32);
            int.erdp_high.write((erdp >> 32) as u32);

            debug!("Writing ERSTBA: {:X}", erstba);
            int.erstba_low.write(erstba as u32);
            int.erstba_high.write((erstba >> 32) as u32);

            debug!("Writing IMOD: {:#x}", moderation);
            int.imod.write(moderation);

            debug!("Enabling Primary Interrupter.");
            int.iman.write(IMAN_IE | IMAN_IP);
        }
        self.op.usb_cmd.writef(USB_CMD_INTE, true);

        // Setup the scratchpad buffers that are required for the xHC to function.
        self.setup_scratchpads()?;

        // Set run/stop to 1
        debug!("Starting xHC.");
        self.op.usb_cmd.writef(USB_CMD_RS, true);
        let halt_timeout = self.config.halt_timeout();
        self.handshake(
            "controller start",
            halt_timeout,
            |hci| hci.op.usb_sts.read(),
            USB_STS_HCH,
            0,
        )?;

        info!(
            "XHCI initialized with {} ports, using {:?} interrupts (irq {:?}).",
            self.ports.len(),
            self.interrupt_method,
            self.irq
        );

        Ok(())
    }

    fn setup_scratchpads(&mut self) -> Result<()> {
        let buf_count = self.cap.max_scratchpad_bufs();

        if buf_count == 0 {
            return Ok(());
        }
        let scratchpad_buf_arr = ScratchpadBufferArray::new(&self.dma, buf_count)?;
        self.dev_ctx.set_scratchpad(scratchpad_buf_arr.register());
        debug!(
            "Setting up {} scratchpads, at {:#0x}",
            buf_count,
            scratchpad_buf_arr.register()
        );
        self.scratchpad_buf_arr = Some(scratchpad_buf_arr);

        Ok(())
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    pub fn port_count(&self) -> u8 {
        self.ports.len() as u8
    }

    pub fn max_slots(&self) -> u8 {
        self.cap.max_slots()
    }

    /// Whether the controller is running.
    pub fn is_running(&self) -> bool {
        !self.op.usb_sts.readf(USB_STS_HCH)
    }

    /// The enumeration state of root hub port `port`, numbered from 1.
    pub fn port_state(&self, port: u8) -> EnumerationState {
        self.port_states
            .get(&port)
            .copied()
            .unwrap_or(EnumerationState::Empty)
    }

    /// The device in `slot_id`, if it has been addressed.
    pub fn device(&self, slot_id: u8) -> Option<DeviceHandle> {
        let device = self.dev_ctx.get(slot_id)?;
        let address = device.address();
        if address == 0 {
            return None;
        }
        Some(DeviceHandle {
            slot_id,
            address,
            port: device.port,
            speed: device.speed,
        })
    }

    /// The slot state the controller reports in the output context of `slot_id`.
    pub fn slot_state(&self, slot_id: u8) -> Option<SlotState> {
        self.dev_ctx.get(slot_id).map(|device| device.slot_state())
    }

    /// The max packet size of the default control pipe of `slot_id`, as the controller uses it.
    pub fn ep0_max_packet_size(&self, slot_id: u8) -> Option<u16> {
        let device = self.dev_ctx.get(slot_id)?;
        device.output.invalidate();
        device
            .output
            .endpoint_context(0)
            .map(|ep0| ep0.max_packet_size())
    }

    fn slot_for_address(&self, address: u8) -> Option<u8> {
        (1..=self.cap.max_slots()).find(|&slot_id| {
            self.dev_ctx
                .get(slot_id)
                .map_or(false, |device| device.address() == address)
        })
    }
}

impl<const N: usize> Drop for Xhci<N> {
    fn drop(&mut self) {
        debug!("Stopping xHC.");
        self.op.usb_cmd.writef(USB_CMD_RS, false);
        let halt_timeout = self.config.halt_timeout();
        if let Err(err) = self.handshake(
            "controller halt",
            halt_timeout,
            |hci| hci.op.usb_sts.read(),
            USB_STS_HCH,
            USB_STS_HCH,
        ) {
            warn!("xHC did not halt before its memory was released: {}", err);
        }
    }
}
