//! A software xHC behind a heap register window.
//!
//! The simulated controller only runs while the driver sleeps: its [Clock] implementation
//! advances simulated time and then lets the controller react to whatever the driver wrote.
//! Memory the driver hands over through the heap DMA allocator is identity mapped, so TRB and
//! context pointers are plain addresses here.
#![allow(dead_code)]

use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::dma::HeapAllocator;
use common::timeout::Clock;
use xhcid::xhci::{TrbCompletionCode, TrbType, CONTEXT_32};
use xhcid::{InterruptMethod, RegisterWindow, Xhci, XhciConfig};

pub const WINDOW_SIZE: usize = 0x4000;
pub const MAX_SLOTS: u8 = 8;
pub const MAX_PORTS: u8 = 4;
pub const SCRATCHPADS: u32 = 2;

const CAPLENGTH: usize = 0x20;
const OP: usize = CAPLENGTH;
const PORTS: usize = OP + 0x400;
const DOORBELLS: usize = 0x800;
const RUNTIME: usize = 0x1000;
const INTERRUPTER0: usize = RUNTIME + 0x20;

pub const USBCMD: usize = 0x00;
pub const USBSTS: usize = 0x04;
pub const CRCR: usize = 0x18;
pub const DCBAAP: usize = 0x30;
pub const CONFIG: usize = 0x38;

pub const IMAN: usize = 0x00;
pub const IMOD: usize = 0x04;
pub const ERSTSZ: usize = 0x08;
pub const ERSTBA: usize = 0x10;
pub const ERDP: usize = 0x18;

pub const CMD_RS: u32 = 1 << 0;
pub const CMD_HCRST: u32 = 1 << 1;
pub const CMD_INTE: u32 = 1 << 2;
const STS_HCH: u32 = 1 << 0;
const STS_HSE: u32 = 1 << 2;
pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;

pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PED: u32 = 1 << 1;
pub const PORT_PR: u32 = 1 << 4;
const PORT_PLS_MASK: u32 = 0xF << 5;
pub const PORT_PP: u32 = 1 << 9;
pub const PORT_CSC: u32 = 1 << 17;
pub const PORT_PEC: u32 = 1 << 18;
pub const PORT_PRC: u32 = 1 << 21;
const PORT_CHANGES: u32 = 0x7F << 17;
/// RsvdZ. Published set, so any write by the driver, which never preserves it, shows.
const PORT_WRITTEN_MARKER: u32 = 1 << 28;

/// Context entries are 32 bytes, CSZ is clear.
const CTX: usize = 32;

pub const SPEED_FULL: u8 = 1;
pub const SPEED_HIGH: u8 = 3;
pub const SPEED_SUPER: u8 = 4;

fn read32(addr: usize) -> u32 {
    unsafe { ptr::read_volatile(addr as *const u32) }
}

fn write32(addr: usize, value: u32) {
    unsafe { ptr::write_volatile(addr as *mut u32, value) }
}

fn read64(addr: usize) -> u64 {
    u64::from(read32(addr)) | (u64::from(read32(addr + 4)) << 32)
}

fn write64(addr: usize, value: u64) {
    write32(addr, value as u32);
    write32(addr + 4, (value >> 32) as u32);
}

#[derive(Clone, Copy, Debug)]
struct RawTrb {
    param: u64,
    status: u32,
    control: u32,
}

impl RawTrb {
    fn read(addr: usize) -> Self {
        Self {
            param: read64(addr),
            status: read32(addr + 8),
            control: read32(addr + 12),
        }
    }
    fn cycle(&self) -> bool {
        self.control & 1 != 0
    }
    fn ty(&self) -> u8 {
        ((self.control >> 10) & 0x3F) as u8
    }
    fn slot(&self) -> u8 {
        (self.control >> 24) as u8
    }
    fn endpoint(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }
}

#[derive(Clone, Copy, Debug)]
struct Cursor {
    dequeue: usize,
    cycle: bool,
}

impl Cursor {
    fn from_pointer(pointer: u64) -> Self {
        Self {
            dequeue: (pointer & !0xF) as usize,
            cycle: pointer & 1 != 0,
        }
    }
}

struct EventProducer {
    segments: Vec<(usize, usize)>,
    segment: usize,
    index: usize,
    cycle: bool,
}

#[derive(Default)]
struct SimSlot {
    port: u8,
    address: u8,
    ep0: Option<Cursor>,
    ep0_halted: bool,
}

/// A function on a root hub port.
#[derive(Clone, Debug)]
pub struct SimDevice {
    pub speed: u8,
    pub descriptor: [u8; 18],
    pub configuration: Vec<u8>,
    /// bRequest values the device stalls.
    pub stalls: Vec<u8>,
}

impl SimDevice {
    fn with_speed(speed: u8, usb: u16, packet_size: u8) -> Self {
        let usb = usb.to_le_bytes();
        Self {
            speed,
            descriptor: [
                18, 1, usb[0], usb[1], 0, 0, 0, packet_size, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01,
                1, 2, 0, 1,
            ],
            configuration: vec![
                9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
                9, 4, 0, 0, 2, 8, 6, 80, 0, // mass storage interface
                7, 5, 0x81, 2, 0x00, 0x02, 0, // bulk IN
                7, 5, 0x02, 2, 0x00, 0x02, 0, // bulk OUT
            ],
            stalls: Vec::new(),
        }
    }

    pub fn full_speed(max_packet_size: u8) -> Self {
        Self::with_speed(SPEED_FULL, 0x0200, max_packet_size)
    }

    pub fn high_speed() -> Self {
        Self::with_speed(SPEED_HIGH, 0x0200, 64)
    }

    pub fn super_speed() -> Self {
        Self::with_speed(SPEED_SUPER, 0x0300, 9)
    }

    pub fn stalling(mut self, request: u8) -> Self {
        self.stalls.push(request);
        self
    }

    fn respond(&self, setup: [u8; 8]) -> Result<Vec<u8>, ()> {
        let (kind, request) = (setup[0], setup[1]);
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        if self.stalls.contains(&request) {
            return Err(());
        }
        match (kind, request, (value >> 8) as u8) {
            (0x80, 0x06, 1) => Ok(self.descriptor.to_vec()),
            (0x80, 0x06, 2) => Ok(self.configuration.clone()),
            (0x80, 0x00, _) => Ok(vec![0, 0]),
            (0x00, 0x09, _) => Ok(Vec::new()),
            _ => Err(()),
        }
    }
}

struct SimPort {
    status: u32,
    device: Option<SimDevice>,
}

struct Control {
    response: Result<Vec<u8>, ()>,
    data_stage: bool,
}

struct State {
    base: usize,
    now: Duration,
    running: bool,
    host_system_error: bool,
    stuck_in_reset: bool,
    hold_commands: bool,
    address_device_error: Option<u8>,
    configure_endpoint_error: Option<u8>,

    cmd_ring: Option<Cursor>,
    events: Option<EventProducer>,
    ports: Vec<SimPort>,
    slots: BTreeMap<u8, SimSlot>,
    next_address: u8,
    control: Option<Control>,

    commands: Vec<u8>,
    disabled_slots: Vec<(u8, u8)>,
    doorbells: Vec<(u8, u32)>,
    setups: Vec<(u8, [u8; 8])>,
    resets: usize,
}

pub struct Sim {
    state: Mutex<State>,
    layout: Layout,
}

impl Sim {
    pub fn new() -> Arc<Self> {
        let layout = Layout::from_size_align(WINDOW_SIZE, 0x1000).unwrap();
        let base = unsafe { alloc::alloc_zeroed(layout) } as usize;
        assert_ne!(base, 0);

        // CAPLENGTH and HCIVERSION 1.1.
        write32(base, CAPLENGTH as u32 | (0x0110 << 16));
        // HCSPARAMS1: slots, one interrupter, ports.
        write32(base + 0x04, u32::from(MAX_SLOTS) | (1 << 8) | (u32::from(MAX_PORTS) << 24));
        // HCSPARAMS2: ERST Max 1, scratchpads in the low five bits of the count.
        write32(base + 0x08, (1 << 4) | (SCRATCHPADS << 27));
        // HCCPARAMS1: AC64 and PPC.
        write32(base + 0x10, (1 << 0) | (1 << 3));
        write32(base + 0x14, DOORBELLS as u32);
        write32(base + 0x18, RUNTIME as u32);
        // PAGESIZE: 4K.
        write32(base + OP + 0x08, 1);

        let mut state = State {
            base,
            now: Duration::ZERO,
            running: false,
            host_system_error: false,
            stuck_in_reset: false,
            hold_commands: false,
            address_device_error: None,
            configure_endpoint_error: None,
            cmd_ring: None,
            events: None,
            ports: (0..MAX_PORTS)
                .map(|_| SimPort {
                    status: PORT_PP,
                    device: None,
                })
                .collect(),
            slots: BTreeMap::new(),
            next_address: 1,
            control: None,
            commands: Vec::new(),
            disabled_slots: Vec::new(),
            doorbells: Vec::new(),
            setups: Vec::new(),
            resets: 0,
        };
        state.publish();

        Arc::new(Self {
            state: Mutex::new(state),
            layout,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn window(&self) -> RegisterWindow {
        RegisterWindow {
            base: self.state().base,
            size: WINDOW_SIZE,
            irq: Some(11),
        }
    }

    pub fn clock(self: &Arc<Self>) -> Arc<dyn Clock> {
        Arc::clone(self) as Arc<dyn Clock>
    }

    /// Plugs `device` into root hub port `port` and reports the connect.
    pub fn connect(&self, port: u8, device: SimDevice) {
        let mut state = self.state();
        let index = usize::from(port - 1);
        let mut status = PORT_CCS | PORT_CSC | PORT_PP | (u32::from(device.speed) << 10);
        // USB3 links train on their own, USB2 ports wait for a reset.
        if device.speed >= SPEED_SUPER {
            status |= PORT_PED;
        }
        state.ports[index].status = status;
        state.ports[index].device = Some(device);
        state.publish();
        state.post_port_change(port);
    }

    pub fn disconnect(&self, port: u8) {
        let mut state = self.state();
        let index = usize::from(port - 1);
        let port_state = &mut state.ports[index];
        port_state.status &= !(PORT_CCS | PORT_PED | (0xF << 10));
        port_state.status |= PORT_CSC;
        port_state.device = None;
        state.publish();
        state.post_port_change(port);
    }

    /// Reports a change on `port` without changing anything.
    pub fn post_port_change(&self, port: u8) {
        self.state().post_port_change(port);
    }

    pub fn post_command_completion(&self, pointer: u64, code: TrbCompletionCode) {
        self.state().post(
            pointer,
            (code as u32) << 24,
            (TrbType::CommandCompletion as u32) << 10,
        );
    }

    /// Makes every register read as all ones, like a controller that fell off the bus.
    pub fn unplug(&self) {
        let base = self.state().base;
        unsafe { ptr::write_bytes(base as *mut u8, 0xFF, WINDOW_SIZE) };
    }

    pub fn set_hold_commands(&self, hold: bool) {
        self.state().hold_commands = hold;
    }

    pub fn set_address_device_error(&self, code: Option<TrbCompletionCode>) {
        self.state().address_device_error = code.map(|code| code as u8);
    }

    pub fn set_configure_endpoint_error(&self, code: Option<TrbCompletionCode>) {
        self.state().configure_endpoint_error = code.map(|code| code as u8);
    }

    pub fn set_stuck_in_reset(&self, stuck: bool) {
        self.state().stuck_in_reset = stuck;
    }

    pub fn raise_host_system_error(&self) {
        let mut state = self.state();
        state.host_system_error = true;
        state.publish();
    }

    pub fn op_read(&self, offset: usize) -> u32 {
        read32(self.state().base + OP + offset)
    }

    pub fn op_read64(&self, offset: usize) -> u64 {
        read64(self.state().base + OP + offset)
    }

    pub fn interrupter_read(&self, offset: usize) -> u32 {
        read32(self.state().base + INTERRUPTER0 + offset)
    }

    pub fn interrupter_read64(&self, offset: usize) -> u64 {
        read64(self.state().base + INTERRUPTER0 + offset)
    }

    /// PORTSC as the simulated controller sees it.
    pub fn port_status(&self, port: u8) -> u32 {
        self.state().ports[usize::from(port - 1)].status
    }

    /// Entry `index` of the Device Context Base Address Array.
    pub fn dcbaa_entry(&self, index: u8) -> u64 {
        let state = self.state();
        read64(state.dcbaap() + 8 * usize::from(index))
    }

    /// The command TRB types seen, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.state().commands.clone()
    }

    /// Slot id and slot state of every disabled slot, as its output context read at the time.
    pub fn disabled_slots(&self) -> Vec<(u8, u8)> {
        self.state().disabled_slots.clone()
    }

    /// Device doorbell writes as slot id and value.
    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.state().doorbells.clone()
    }

    /// Setup packets seen on the default control pipes, with the slot they went to.
    pub fn setups(&self) -> Vec<(u8, [u8; 8])> {
        self.state().setups.clone()
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }

    pub fn is_enabled(&self, slot: u8) -> bool {
        self.state().slots.contains_key(&slot)
    }

    pub fn is_ep0_halted(&self, slot: u8) -> bool {
        self.state()
            .slots
            .get(&slot)
            .map_or(false, |slot| slot.ep0_halted)
    }

    /// Where the controller will fetch the next EP0 TRB of `slot`, and with which cycle.
    pub fn ep0_dequeue(&self, slot: u8) -> Option<(usize, bool)> {
        self.state()
            .slots
            .get(&slot)
            .and_then(|slot| slot.ep0.as_ref())
            .map(|cursor| (cursor.dequeue, cursor.cycle))
    }

    /// Runs the controller once without advancing time.
    pub fn step(&self) {
        self.state().step();
    }
}

impl Clock for Sim {
    fn now(&self) -> Duration {
        self.state().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.now += duration.max(Duration::from_micros(1));
        state.step();
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        let base = self.state.get_mut().map(|state| state.base).unwrap_or(0);
        if base != 0 {
            unsafe { alloc::dealloc(base as *mut u8, self.layout) };
        }
    }
}

impl State {
    fn op(&self, offset: usize) -> usize {
        self.base + OP + offset
    }

    fn port(&self, index: usize) -> usize {
        self.base + PORTS + 0x10 * index
    }

    fn interrupter(&self, offset: usize) -> usize {
        self.base + INTERRUPTER0 + offset
    }

    fn dcbaap(&self) -> usize {
        (read64(self.op(DCBAAP)) & !0x3F) as usize
    }

    fn output_context(&self, slot: u8) -> usize {
        read64(self.dcbaap() + 8 * usize::from(slot)) as usize
    }

    fn publish(&mut self) {
        let mut status = if self.running { 0 } else { STS_HCH };
        if self.host_system_error {
            status |= STS_HSE;
        }
        write32(self.op(USBSTS), status);
        for index in 0..self.ports.len() {
            write32(self.port(index), self.ports[index].status | PORT_WRITTEN_MARKER);
        }
    }

    fn step(&mut self) {
        self.operational();
        self.port_writes();
        if self.running {
            self.commands();
            self.doorbells();
        }
        self.publish();
    }

    fn operational(&mut self) {
        let command = read32(self.op(USBCMD));
        if command & CMD_HCRST != 0 {
            if self.stuck_in_reset {
                return;
            }
            self.resets += 1;
            write32(self.op(USBCMD), 0);
            self.running = false;
            self.cmd_ring = None;
            self.events = None;
            self.slots.clear();
            self.control = None;
        } else if command & CMD_RS != 0 && !self.running {
            self.running = true;
            self.cmd_ring = Some(Cursor::from_pointer(read64(self.op(CRCR))));

            let erstba = read64(self.interrupter(ERSTBA)) as usize;
            let erstsz = read32(self.interrupter(ERSTSZ)) as usize;
            let segments = (0..erstsz)
                .map(|entry| {
                    let entry = erstba + 16 * entry;
                    (read64(entry) as usize, (read32(entry + 8) & 0xFFFF) as usize)
                })
                .collect();
            self.events = Some(EventProducer {
                segments,
                segment: 0,
                index: 0,
                cycle: true,
            });
        } else if command & CMD_RS == 0 && self.running {
            self.running = false;
        }
    }

    fn post(&mut self, param: u64, status: u32, control: u32) {
        let events = match self.events.as_mut() {
            Some(events) => events,
            None => return,
        };
        let (base, size) = events.segments[events.segment];
        let addr = base + 16 * events.index;
        write64(addr, param);
        write32(addr + 8, status);
        write32(addr + 12, control | u32::from(events.cycle));

        events.index += 1;
        if events.index == size {
            events.index = 0;
            events.segment += 1;
            if events.segment == events.segments.len() {
                events.segment = 0;
                events.cycle = !events.cycle;
            }
        }

        let iman = self.interrupter(IMAN);
        write32(iman, read32(iman) | IMAN_IP);
    }

    fn post_port_change(&mut self, port: u8) {
        self.post(
            u64::from(port) << 24,
            (TrbCompletionCode::Success as u32) << 24,
            (TrbType::PortStatusChange as u32) << 10,
        );
    }

    fn port_writes(&mut self) {
        for index in 0..self.ports.len() {
            let written = read32(self.port(index));
            if written & PORT_WRITTEN_MARKER != 0 {
                continue;
            }

            let before = self.ports[index].status;
            let mut status = before & !(written & PORT_CHANGES);
            if written & PORT_PED != 0 {
                status &= !PORT_PED;
            }
            status = (status & !PORT_PP) | (written & PORT_PP);
            if written & PORT_PR != 0 && status & PORT_CCS != 0 {
                status = (status & !PORT_PLS_MASK) | PORT_PED | PORT_PRC;
            }
            self.ports[index].status = status;

            if before & PORT_PRC == 0 && status & PORT_PRC != 0 {
                self.post_port_change(index as u8 + 1);
            }
        }
    }

    fn commands(&mut self) {
        while !self.hold_commands {
            let mut cursor = match self.cmd_ring {
                Some(cursor) => cursor,
                None => return,
            };
            let trb = RawTrb::read(cursor.dequeue);
            if trb.cycle() != cursor.cycle {
                return;
            }
            if trb.ty() == TrbType::Link as u8 {
                cursor.dequeue = (trb.param & !0xF) as usize;
                if trb.control & 0b10 != 0 {
                    cursor.cycle = !cursor.cycle;
                }
                self.cmd_ring = Some(cursor);
                continue;
            }

            let pointer = cursor.dequeue as u64;
            cursor.dequeue += 16;
            self.cmd_ring = Some(cursor);

            self.commands.push(trb.ty());
            let (code, slot) = self.command(&trb);
            self.post(
                pointer,
                u32::from(code) << 24,
                (u32::from(slot) << 24) | ((TrbType::CommandCompletion as u32) << 10),
            );
        }
    }

    fn command(&mut self, trb: &RawTrb) -> (u8, u8) {
        const SUCCESS: u8 = TrbCompletionCode::Success as u8;
        const SLOT_NOT_ENABLED: u8 = TrbCompletionCode::SlotNotEnabled as u8;
        const CONTEXT_STATE: u8 = TrbCompletionCode::ContextState as u8;

        let slot = trb.slot();
        let ty = trb.ty();
        if ty == TrbType::NoOpCmd as u8 {
            return (SUCCESS, 0);
        }
        if ty == TrbType::EnableSlot as u8 {
            return match (1..=MAX_SLOTS).find(|slot| !self.slots.contains_key(slot)) {
                Some(slot) => {
                    self.slots.insert(slot, SimSlot::default());
                    (SUCCESS, slot)
                }
                None => (TrbCompletionCode::NoSlotsAvailable as u8, 0),
            };
        }
        if !self.slots.contains_key(&slot) {
            return (SLOT_NOT_ENABLED, slot);
        }

        let output = self.output_context(slot);
        if ty == TrbType::DisableSlot as u8 {
            let state = if output == 0 {
                0
            } else {
                (read32(output + 12) >> 27) as u8
            };
            self.disabled_slots.push((slot, state));
            self.slots.remove(&slot);
            return (SUCCESS, slot);
        }
        if output == 0 {
            return (CONTEXT_STATE, slot);
        }

        // Only the context commands carry an input context pointer. The others use the
        // parameter for ring pointers, whose low bits hold flags.
        let input = trb.param as usize & !0xF;
        let add = |ty: u8| {
            let takes_input = ty == TrbType::EvaluateContext as u8
                || ty == TrbType::ConfigureEndpoint as u8;
            if takes_input && input != 0 {
                read32(input + 4)
            } else {
                0
            }
        };
        if ty == TrbType::AddressDevice as u8 {
            if let Some(code) = self.address_device_error {
                return (code, slot);
            }
            for dword in 0..4 {
                write32(output + 4 * dword, read32(input + CTX + 4 * dword));
            }
            let address = self.next_address;
            self.next_address += 1;
            let d = read32(output + 12) & !0xF800_00FF;
            write32(output + 12, d | u32::from(address) | (2 << 27));

            for dword in 0..5 {
                write32(output + CTX + 4 * dword, read32(input + 2 * CTX + 4 * dword));
            }
            write32(output + CTX, (read32(output + CTX) & !0x7) | 1);

            let port = ((read32(input + CTX + 4) >> 16) & 0xFF) as u8;
            let dequeue = read64(input + 2 * CTX + 8);
            let state = self.slots.entry(slot).or_default();
            state.port = port;
            state.address = address;
            state.ep0 = Some(Cursor::from_pointer(dequeue));
            (SUCCESS, slot)
        } else if ty == TrbType::EvaluateContext as u8 {
            if add(ty) & 0b10 != 0 {
                let max_packet_size = read32(input + 2 * CTX + 4) & 0xFFFF_0000;
                let b = read32(output + CTX + 4) & 0xFFFF;
                write32(output + CTX + 4, b | max_packet_size);
            }
            (SUCCESS, slot)
        } else if ty == TrbType::ConfigureEndpoint as u8 {
            if let Some(code) = self.configure_endpoint_error {
                return (code, slot);
            }
            let add = add(ty);
            for dci in 2..32 {
                if add & (1 << dci) == 0 {
                    continue;
                }
                for dword in 0..5 {
                    write32(
                        output + dci * CTX + 4 * dword,
                        read32(input + (dci + 1) * CTX + 4 * dword),
                    );
                }
                let a = read32(output + dci * CTX);
                write32(output + dci * CTX, (a & !0x7) | 1);
            }
            write32(output, read32(input + CTX));
            let d = read32(output + 12) & !0xF800_0000;
            write32(output + 12, d | (3 << 27));
            (SUCCESS, slot)
        } else if ty == TrbType::ResetEndpoint as u8 {
            let state = self.slots.entry(slot).or_default();
            if trb.endpoint() != 1 || !state.ep0_halted {
                return (CONTEXT_STATE, slot);
            }
            state.ep0_halted = false;
            write32(output + CTX, (read32(output + CTX) & !0x7) | 3);
            (SUCCESS, slot)
        } else if ty == TrbType::SetTrDequeuePointer as u8 {
            let state = self.slots.entry(slot).or_default();
            if trb.endpoint() != 1 || state.ep0_halted {
                return (CONTEXT_STATE, slot);
            }
            state.ep0 = Some(Cursor::from_pointer(trb.param));
            write64(output + CTX + 8, trb.param);
            (SUCCESS, slot)
        } else {
            (TrbCompletionCode::Trb as u8, slot)
        }
    }

    fn doorbells(&mut self) {
        for slot in 1..=MAX_SLOTS {
            let doorbell = self.base + DOORBELLS + 4 * usize::from(slot);
            let value = read32(doorbell);
            if value == 0 {
                continue;
            }
            write32(doorbell, 0);
            self.doorbells.push((slot, value));
            if value & 0xFF == 1 {
                self.run_ep0(slot);
            }
        }
    }

    fn transfer_event(&mut self, slot: u8, pointer: usize, code: TrbCompletionCode, residual: u32) {
        self.post(
            pointer as u64,
            ((code as u32) << 24) | (residual & 0x00FF_FFFF),
            (u32::from(slot) << 24) | (1 << 16) | ((TrbType::Transfer as u32) << 10),
        );
    }

    fn halt_ep0(&mut self, slot: u8) {
        if let Some(state) = self.slots.get_mut(&slot) {
            state.ep0_halted = true;
        }
        let output = self.output_context(slot);
        if output != 0 {
            write32(output + CTX, (read32(output + CTX) & !0x7) | 2);
        }
        self.control = None;
    }

    fn run_ep0(&mut self, slot: u8) {
        loop {
            let (mut cursor, port) = match self.slots.get(&slot) {
                Some(SimSlot {
                    ep0: Some(cursor),
                    ep0_halted: false,
                    port,
                    ..
                }) => (*cursor, *port),
                _ => return,
            };
            let trb = RawTrb::read(cursor.dequeue);
            if trb.cycle() != cursor.cycle {
                return;
            }
            let pointer = cursor.dequeue;
            if trb.ty() == TrbType::Link as u8 {
                cursor.dequeue = (trb.param & !0xF) as usize;
                if trb.control & 0b10 != 0 {
                    cursor.cycle = !cursor.cycle;
                }
            } else {
                cursor.dequeue += 16;
            }
            if let Some(state) = self.slots.get_mut(&slot) {
                state.ep0 = Some(cursor);
            }

            let ioc = trb.control & (1 << 5) != 0;
            let ty = trb.ty();
            if ty == TrbType::SetupStage as u8 {
                let setup = trb.param.to_le_bytes();
                self.setups.push((slot, setup));
                let response = match self.ports.get(usize::from(port).wrapping_sub(1)) {
                    Some(SimPort {
                        device: Some(device),
                        ..
                    }) => device.respond(setup),
                    _ => Err(()),
                };
                self.control = Some(Control {
                    response,
                    data_stage: false,
                });
            } else if ty == TrbType::DataStage as u8 {
                let length = trb.status & 0x1_FFFF;
                let input = trb.control & (1 << 16) != 0;
                let isp = trb.control & (1 << 2) != 0;
                let response = match self.control.as_mut() {
                    Some(control) => {
                        control.data_stage = true;
                        control.response.clone()
                    }
                    None => Err(()),
                };
                match response {
                    Err(()) => {
                        self.transfer_event(slot, pointer, TrbCompletionCode::Stall, length);
                        self.halt_ep0(slot);
                        return;
                    }
                    Ok(bytes) if input => {
                        let n = bytes.len().min(length as usize);
                        unsafe {
                            ptr::copy_nonoverlapping(bytes.as_ptr(), trb.param as *mut u8, n)
                        };
                        let residual = length - n as u32;
                        if residual > 0 && isp {
                            self.transfer_event(
                                slot,
                                pointer,
                                TrbCompletionCode::ShortPacket,
                                residual,
                            );
                        } else if ioc {
                            self.transfer_event(slot, pointer, TrbCompletionCode::Success, 0);
                        }
                    }
                    Ok(_) => {
                        if ioc {
                            self.transfer_event(slot, pointer, TrbCompletionCode::Success, 0);
                        }
                    }
                }
            } else if ty == TrbType::StatusStage as u8 {
                let control = self.control.take();
                let stalled = control.map_or(true, |control| {
                    !control.data_stage && control.response.is_err()
                });
                if stalled {
                    self.transfer_event(slot, pointer, TrbCompletionCode::Stall, 0);
                    self.halt_ep0(slot);
                    return;
                }
                if ioc {
                    self.transfer_event(slot, pointer, TrbCompletionCode::Success, 0);
                }
            } else {
                self.transfer_event(slot, pointer, TrbCompletionCode::Trb, 0);
            }
        }
    }
}

pub fn bring_up() -> (Arc<Sim>, Xhci<CONTEXT_32>) {
    bring_up_with(XhciConfig::default())
}

pub fn bring_up_with(config: XhciConfig) -> (Arc<Sim>, Xhci<CONTEXT_32>) {
    let sim = Sim::new();
    let xhci = start(&sim, config).unwrap();
    (sim, xhci)
}

/// Brings up a driver on an existing simulated controller.
pub fn start(sim: &Arc<Sim>, config: XhciConfig) -> xhcid::Result<Xhci<CONTEXT_32>> {
    unsafe {
        Xhci::new(
            sim.window(),
            Arc::new(HeapAllocator),
            sim.clock(),
            config,
            InterruptMethod::Polling,
        )
    }
}
