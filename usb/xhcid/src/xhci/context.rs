use std::collections::BTreeMap;
use std::sync::Arc;

use common::dma::{Dma, DmaAllocator, PAGE_SIZE};
use common::io::{Io, Mmio};
use log::{debug, trace};

use super::ring::Ring;
use crate::driver_interface::UsbSpeed;
use crate::error::{Result, XhciError};

pub const CONTEXT_32: usize = 0;
pub const CONTEXT_64: usize = 1;

/// Trailing padding of a 64-byte context entry.
#[repr(C)]
struct Rsvd64<const N: usize>([[Mmio<u32>; 8]; N]);

#[repr(C)]
pub struct SlotContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub c: Mmio<u32>,
    pub d: Mmio<u32>,
    _rsvd: [Mmio<u32>; 4],
    _rsvd64: Rsvd64<N>,
}

pub const SLOT_CONTEXT_ROUTE_MASK: u32 = 0x000F_FFFF;
pub const SLOT_CONTEXT_SPEED_SHIFT: u8 = 20;
pub const SLOT_CONTEXT_SPEED_MASK: u32 = 0x00F0_0000;
pub const SLOT_CONTEXT_ENTRIES_SHIFT: u8 = 27;
pub const SLOT_CONTEXT_ENTRIES_MASK: u32 = 0xF800_0000;
pub const SLOT_CONTEXT_ROOT_PORT_SHIFT: u8 = 16;
pub const SLOT_CONTEXT_ROOT_PORT_MASK: u32 = 0x00FF_0000;
pub const SLOT_CONTEXT_ADDRESS_MASK: u32 = 0xFF;
pub const SLOT_CONTEXT_STATE_MASK: u32 = 0xF800_0000;
pub const SLOT_CONTEXT_STATE_SHIFT: u8 = 27;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SlotState {
    EnabledOrDisabled = 0,
    Default = 1,
    Addressed = 2,
    Configured = 3,
    Reserved,
}

impl<const N: usize> SlotContext<N> {
    /// Fills the fields the controller needs to address a device attached straight to a root
    /// port: route string, speed, context entries and root hub port.
    pub fn init(&mut self, route: u32, speed: u8, entries: u8, root_port: u8) {
        assert_eq!(route & SLOT_CONTEXT_ROUTE_MASK, route);
        self.a.write(
            route
                | (u32::from(speed & 0xF) << SLOT_CONTEXT_SPEED_SHIFT)
                | (u32::from(entries & 0x1F) << SLOT_CONTEXT_ENTRIES_SHIFT),
        );
        self.b
            .write(u32::from(root_port) << SLOT_CONTEXT_ROOT_PORT_SHIFT);
        self.c.write(0);
        self.d.write(0);
    }

    pub fn speed(&self) -> u8 {
        ((self.a.read() & SLOT_CONTEXT_SPEED_MASK) >> SLOT_CONTEXT_SPEED_SHIFT) as u8
    }
    /// The index of the last valid endpoint context.
    pub fn context_entries(&self) -> u8 {
        ((self.a.read() & SLOT_CONTEXT_ENTRIES_MASK) >> SLOT_CONTEXT_ENTRIES_SHIFT) as u8
    }
    pub fn set_context_entries(&mut self, entries: u8) {
        let a = self.a.read() & !SLOT_CONTEXT_ENTRIES_MASK;
        self.a
            .write(a | (u32::from(entries & 0x1F) << SLOT_CONTEXT_ENTRIES_SHIFT));
    }
    pub fn root_hub_port(&self) -> u8 {
        ((self.b.read() & SLOT_CONTEXT_ROOT_PORT_MASK) >> SLOT_CONTEXT_ROOT_PORT_SHIFT) as u8
    }
    /// The USB address the controller assigned. Only meaningful in an output context.
    pub fn device_address(&self) -> u8 {
        (self.d.read() & SLOT_CONTEXT_ADDRESS_MASK) as u8
    }
    pub fn state(&self) -> SlotState {
        match (self.d.read() & SLOT_CONTEXT_STATE_MASK) >> SLOT_CONTEXT_STATE_SHIFT {
            0 => SlotState::EnabledOrDisabled,
            1 => SlotState::Default,
            2 => SlotState::Addressed,
            3 => SlotState::Configured,
            _ => SlotState::Reserved,
        }
    }
}

#[repr(C)]
pub struct EndpointContext<const N: usize> {
    pub a: Mmio<u32>,
    pub b: Mmio<u32>,
    pub trl: Mmio<u32>,
    pub trh: Mmio<u32>,
    pub c: Mmio<u32>,
    _rsvd: [Mmio<u32>; 3],
    _rsvd64: Rsvd64<N>,
}

pub const ENDPOINT_CONTEXT_STATUS_MASK: u32 = 0x7;
pub const ENDPOINT_CONTEXT_INTERVAL_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_CERR_SHIFT: u8 = 1;
pub const ENDPOINT_CONTEXT_TYPE_SHIFT: u8 = 3;
pub const ENDPOINT_CONTEXT_TYPE_MASK: u32 = 0x38;
pub const ENDPOINT_CONTEXT_MAX_BURST_SHIFT: u8 = 8;
pub const ENDPOINT_CONTEXT_MAX_PACKET_SHIFT: u8 = 16;
pub const ENDPOINT_CONTEXT_DCS_BIT: u32 = 1;

/// Transactions are retried this many times before the endpoint halts.
pub const ENDPOINT_CERR_MAX: u8 = 3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum EndpointState {
    Disabled = 0,
    Running = 1,
    Halted = 2,
    Stopped = 3,
    Error = 4,
    Reserved,
}

/// The Endpoint Type field of an endpoint context.
pub const EP_TYPE_ISOCH_OUT: u8 = 1;
pub const EP_TYPE_BULK_OUT: u8 = 2;
pub const EP_TYPE_INTR_OUT: u8 = 3;
pub const EP_TYPE_CONTROL: u8 = 4;
pub const EP_TYPE_ISOCH_IN: u8 = 5;
pub const EP_TYPE_BULK_IN: u8 = 6;
pub const EP_TYPE_INTR_IN: u8 = 7;

impl<const N: usize> EndpointContext<N> {
    /// Programs every field software owns. `dequeue` is the transfer ring pointer with the
    /// cycle state in bit 0.
    pub fn configure(
        &mut self,
        ep_type: u8,
        max_packet_size: u16,
        max_burst: u8,
        interval: u8,
        dequeue: u64,
        average_trb_length: u16,
    ) {
        self.a
            .write(u32::from(interval) << ENDPOINT_CONTEXT_INTERVAL_SHIFT);
        self.b.write(
            (u32::from(ENDPOINT_CERR_MAX) << ENDPOINT_CONTEXT_CERR_SHIFT)
                | (u32::from(ep_type & 0x7) << ENDPOINT_CONTEXT_TYPE_SHIFT)
                | (u32::from(max_burst) << ENDPOINT_CONTEXT_MAX_BURST_SHIFT)
                | (u32::from(max_packet_size) << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT),
        );
        self.set_dequeue_pointer(dequeue);
        self.c.write(u32::from(average_trb_length));
    }

    pub fn state(&self) -> EndpointState {
        match self.a.read() & ENDPOINT_CONTEXT_STATUS_MASK {
            0 => EndpointState::Disabled,
            1 => EndpointState::Running,
            2 => EndpointState::Halted,
            3 => EndpointState::Stopped,
            4 => EndpointState::Error,
            _ => EndpointState::Reserved,
        }
    }
    pub fn ep_type(&self) -> u8 {
        ((self.b.read() & ENDPOINT_CONTEXT_TYPE_MASK) >> ENDPOINT_CONTEXT_TYPE_SHIFT) as u8
    }
    pub fn max_packet_size(&self) -> u16 {
        (self.b.read() >> ENDPOINT_CONTEXT_MAX_PACKET_SHIFT) as u16
    }
    pub fn set_max_packet_size(&mut self, max_packet_size: u16) {
        let b = self.b.read() & 0xFFFF;
        self.b
            .write(b | (u32::from(max_packet_size) << ENDPOINT_CONTEXT_MAX_PACKET_SHIFT));
    }
    pub fn dequeue_pointer(&self) -> u64 {
        u64::from(self.trl.read()) | (u64::from(self.trh.read()) << 32)
    }
    pub fn set_dequeue_pointer(&mut self, dequeue: u64) {
        self.trl.write(dequeue as u32);
        self.trh.write((dequeue >> 32) as u32);
    }
}

#[repr(C)]
pub struct DeviceContext<const N: usize> {
    pub slot: SlotContext<N>,
    pub endpoints: [EndpointContext<N>; 31],
}

impl<const N: usize> DeviceContext<N> {
    pub fn slot_context(&self) -> &SlotContext<N> {
        &self.slot
    }
    /// The context of the endpoint with zero-based `index`, which is the DCI minus one.
    pub fn endpoint_context(&self, index: usize) -> Option<&EndpointContext<N>> {
        self.endpoints.get(index)
    }
    pub fn endpoint_context_mut(&mut self, index: usize) -> Option<&mut EndpointContext<N>> {
        self.endpoints.get_mut(index)
    }
}

/// Copies the slot context dword by dword.
pub fn copy_slot<const N: usize>(from: &DeviceContext<N>, to: &mut DeviceContext<N>) {
    to.slot.a.write(from.slot.a.read());
    to.slot.b.write(from.slot.b.read());
    to.slot.c.write(from.slot.c.read());
    to.slot.d.write(from.slot.d.read());
}

/// Copies one endpoint context dword by dword. Out of range indices are ignored.
pub fn copy_endpoint<const N: usize>(
    from: &DeviceContext<N>,
    to: &mut DeviceContext<N>,
    index: usize,
) {
    if let (Some(from), Some(to)) = (from.endpoints.get(index), to.endpoints.get_mut(index)) {
        to.a.write(from.a.read());
        to.b.write(from.b.read());
        to.trl.write(from.trl.read());
        to.trh.write(from.trh.read());
        to.c.write(from.c.read());
    }
}

#[repr(C)]
pub struct InputContext<const N: usize> {
    pub drop_context: Mmio<u32>,
    pub add_context: Mmio<u32>,
    _rsvd: [Mmio<u32>; 5],
    pub control: Mmio<u32>,
    _rsvd64: Rsvd64<N>,
    pub device: DeviceContext<N>,
}

/// Add Context flag of the slot context.
pub const INPUT_CONTEXT_A0: u32 = 1 << 0;
/// Add Context flag of endpoint 0.
pub const INPUT_CONTEXT_A1: u32 = 1 << 1;

impl<const N: usize> InputContext<N> {
    /// Selects which contexts the next command reads. Bit `i` stands for DCI `i`, bit 0 for the
    /// slot context.
    pub fn set_flags(&mut self, add: u32, drop: u32) {
        // The slot and EP0 contexts can never be dropped.
        assert_eq!(drop & 0b11, 0);
        self.drop_context.write(drop);
        self.add_context.write(add);
        self.control.write(0);
    }

    pub fn dump_control(&self) {
        debug!(
            "INPUT CONTEXT: drop {:#x} add {:#x} control {:#x}",
            self.drop_context.read(),
            self.add_context.read(),
            self.control.read()
        );
    }
}

/// A device as the driver knows it: its slot, the contexts the controller reads and writes,
/// and one transfer ring per enabled endpoint, keyed by DCI.
pub struct VirtualDevice<const N: usize> {
    pub slot_id: u8,
    pub port: u8,
    pub speed: UsbSpeed,
    pub input: Dma<InputContext<N>>,
    pub output: Dma<DeviceContext<N>>,
    pub rings: BTreeMap<u8, Ring>,
}

impl<const N: usize> VirtualDevice<N> {
    pub fn new(
        dma: &Arc<dyn DmaAllocator>,
        slot_id: u8,
        port: u8,
        speed: UsbSpeed,
        ring_segments: usize,
    ) -> Result<Self> {
        let input = unsafe { Dma::<InputContext<N>>::zeroed(dma)?.assume_init() };
        let output = unsafe { Dma::<DeviceContext<N>>::zeroed(dma)?.assume_init() };

        let mut rings = BTreeMap::new();
        rings.insert(1, Ring::new(dma, ring_segments, super::TRANSFER_RING_TRBS, true)?);

        Ok(Self {
            slot_id,
            port,
            speed,
            input,
            output,
            rings,
        })
    }

    /// Stages the input context of an Address Device command: the slot context and the default
    /// control endpoint.
    pub fn prepare_address(&mut self) {
        let speed = self.speed;
        let port = self.port;
        let dequeue = self.rings[&1].register();
        let input = &mut *self.input;

        input.set_flags(INPUT_CONTEXT_A0 | INPUT_CONTEXT_A1, 0);
        input.device.slot.init(0, speed.port_speed(), 1, port);
        input.device.endpoints[0].configure(
            EP_TYPE_CONTROL,
            speed.default_max_packet_size(),
            0,
            0,
            dequeue,
            8,
        );
        input.dump_control();
        self.input.flush();
    }

    /// Stages an Evaluate Context command that changes the max packet size of endpoint 0.
    pub fn prepare_ep0_max_packet_size(&mut self, max_packet_size: u16) {
        self.output.invalidate();
        let input = &mut *self.input;
        input.set_flags(INPUT_CONTEXT_A1, 0);
        copy_endpoint(&*self.output, &mut input.device, 0);
        input.device.endpoints[0].set_max_packet_size(max_packet_size);
        self.input.flush();
    }

    /// Refreshes the staged slot context from what the controller last reported, so that later
    /// commands do not undo changes the controller made.
    pub fn sync_slot_from_output(&mut self) {
        self.output.invalidate();
        copy_slot(&*self.output, &mut self.input.device);
    }

    pub fn address(&self) -> u8 {
        self.output.invalidate();
        self.output.slot.device_address()
    }

    pub fn slot_state(&self) -> SlotState {
        self.output.invalidate();
        self.output.slot.state()
    }

    pub fn ring_mut(&mut self, dci: u8) -> Option<&mut Ring> {
        self.rings.get_mut(&dci)
    }
}

/// The Device Context Base Address Array and the devices it points at, keyed by slot id.
pub struct DeviceContextList<const N: usize> {
    pub dcbaa: Dma<[u64; 256]>,
    slots: Vec<Option<VirtualDevice<N>>>,
}

impl<const N: usize> DeviceContextList<N> {
    pub fn new(dma: &Arc<dyn DmaAllocator>, max_slots: u8) -> Result<Self> {
        let dcbaa = unsafe { Dma::<[u64; 256]>::zeroed(dma)?.assume_init() };
        let slots = (0..=max_slots).map(|_| None).collect();
        Ok(Self { dcbaa, slots })
    }

    pub fn dcbaap(&self) -> u64 {
        self.dcbaa.physical() as u64
    }

    pub fn set_scratchpad(&mut self, array: u64) {
        self.dcbaa[0] = array;
        self.dcbaa.flush();
    }

    /// Takes ownership of `device` and publishes its output context to the controller.
    pub fn attach(&mut self, device: VirtualDevice<N>) -> Result<()> {
        let slot_id = device.slot_id;
        let entry = self
            .slots
            .get_mut(usize::from(slot_id))
            .filter(|_| slot_id != 0)
            .ok_or(XhciError::NoSuchDevice(slot_id))?;
        if entry.is_some() {
            return Err(XhciError::SlotInUse(slot_id));
        }

        self.dcbaa[usize::from(slot_id)] = device.output.physical() as u64;
        self.dcbaa.flush();
        trace!("slot {} output context at {:#x}", slot_id, device.output.physical());
        *entry = Some(device);
        Ok(())
    }

    /// Removes the device in `slot_id`. The controller must be done with the slot.
    pub fn detach(&mut self, slot_id: u8) -> Option<VirtualDevice<N>> {
        if slot_id == 0 {
            return None;
        }
        let device = self.slots.get_mut(usize::from(slot_id))?.take()?;
        self.dcbaa[usize::from(slot_id)] = 0;
        self.dcbaa.flush();
        Some(device)
    }

    pub fn get(&self, slot_id: u8) -> Option<&VirtualDevice<N>> {
        self.slots.get(usize::from(slot_id))?.as_ref()
    }

    pub fn get_mut(&mut self, slot_id: u8) -> Option<&mut VirtualDevice<N>> {
        self.slots.get_mut(usize::from(slot_id))?.as_mut()
    }
}

#[repr(C, packed)]
pub struct ScratchpadBufferEntry {
    pub value_low: Mmio<u32>,
    pub value_high: Mmio<u32>,
}
impl ScratchpadBufferEntry {
    pub fn set_addr(&mut self, addr: u64) {
        self.value_low.write(addr as u32);
        self.value_high.write((addr >> 32) as u32);
    }
}

/// Pages the controller keeps private state in, handed over through DCBAA entry 0.
pub struct ScratchpadBufferArray {
    pub entries: Dma<[ScratchpadBufferEntry]>,
    pub pages: Vec<Dma<[u8; PAGE_SIZE]>>,
}
impl ScratchpadBufferArray {
    pub fn new(dma: &Arc<dyn DmaAllocator>, entries: u16) -> Result<Self> {
        let mut entries = unsafe {
            Dma::<[ScratchpadBufferEntry]>::zeroed_slice(dma, usize::from(entries))?.assume_init()
        };

        let pages = entries
            .iter_mut()
            .map(|entry: &mut ScratchpadBufferEntry| -> Result<_> {
                let page = unsafe { Dma::<[u8; PAGE_SIZE]>::zeroed(dma)?.assume_init() };
                entry.set_addr(page.physical() as u64);
                Ok(page)
            })
            .collect::<Result<Vec<_>>>()?;
        entries.flush();

        Ok(Self { entries, pages })
    }
    pub fn register(&self) -> u64 {
        self.entries.physical() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use common::dma::HeapAllocator;
    use core::mem;

    fn heap() -> Arc<dyn DmaAllocator> {
        Arc::new(HeapAllocator)
    }

    #[test]
    fn context_size() {
        assert_eq!(mem::size_of::<SlotContext<CONTEXT_32>>(), 32);
        assert_eq!(mem::size_of::<SlotContext<CONTEXT_64>>(), 64);
        assert_eq!(mem::size_of::<EndpointContext<CONTEXT_32>>(), 32);
        assert_eq!(mem::size_of::<EndpointContext<CONTEXT_64>>(), 64);
        assert_eq!(mem::size_of::<DeviceContext<CONTEXT_32>>(), 32 * 32);
        assert_eq!(mem::size_of::<InputContext<CONTEXT_64>>(), 33 * 64);
    }

    #[test]
    fn address_staging() {
        let mut device =
            VirtualDevice::<CONTEXT_32>::new(&heap(), 3, 2, UsbSpeed::High, 1).unwrap();
        device.prepare_address();

        let ring = device.rings[&1].register();
        let input = &device.input;
        assert_eq!(input.add_context.read(), 0b11);
        assert_eq!(input.drop_context.read(), 0);

        let slot = input.device.slot_context();
        assert_eq!(slot.a.read(), (3 << 20) | (1 << 27));
        assert_eq!(slot.b.read(), 2 << 16);
        assert_eq!(slot.speed(), 3);
        assert_eq!(slot.root_hub_port(), 2);
        assert_eq!(slot.context_entries(), 1);

        let ep0 = input.device.endpoint_context(0).unwrap();
        assert_eq!(ep0.b.read(), (3 << 1) | (4 << 3) | (64 << 16));
        assert_eq!(ep0.dequeue_pointer(), ring);
        assert_eq!(ep0.dequeue_pointer() & 1, 1);
        assert_eq!(ep0.c.read(), 8);
        assert_eq!(ep0.ep_type(), EP_TYPE_CONTROL);

        assert!(input.device.endpoint_context(31).is_none());
    }

    #[test]
    fn copies_are_field_level() {
        let dma = heap();
        let mut from = unsafe { Dma::<DeviceContext<CONTEXT_64>>::zeroed(&dma).unwrap().assume_init() };
        let mut to = unsafe { Dma::<DeviceContext<CONTEXT_64>>::zeroed(&dma).unwrap().assume_init() };

        from.slot.d.write((2 << 27) | 5);
        from.endpoints[0].configure(EP_TYPE_CONTROL, 8, 0, 0, 0x1001, 8);
        from.endpoints[1].configure(EP_TYPE_BULK_IN, 512, 0, 0, 0x2001, 0);

        copy_slot(&from, &mut to);
        copy_endpoint(&from, &mut to, 0);
        assert_eq!(to.slot.device_address(), 5);
        assert_eq!(to.slot.state(), SlotState::Addressed);
        assert_eq!(to.endpoints[0].max_packet_size(), 8);
        assert_eq!(to.endpoints[0].dequeue_pointer(), 0x1001);
        assert_eq!(to.endpoints[1].max_packet_size(), 0);

        copy_endpoint(&from, &mut to, 40);
    }

    #[test]
    fn slots_are_unique_while_held() {
        let dma = heap();
        let mut list = DeviceContextList::<CONTEXT_32>::new(&dma, 8).unwrap();

        let device = VirtualDevice::new(&dma, 4, 1, UsbSpeed::Full, 1).unwrap();
        let output = device.output.physical() as u64;
        list.attach(device).unwrap();
        assert_eq!(list.dcbaa[4], output);

        let again = VirtualDevice::new(&dma, 4, 2, UsbSpeed::Full, 1).unwrap();
        assert!(matches!(list.attach(again), Err(XhciError::SlotInUse(4))));

        let zero = VirtualDevice::new(&dma, 0, 2, UsbSpeed::Full, 1).unwrap();
        assert!(matches!(list.attach(zero), Err(XhciError::NoSuchDevice(0))));
        let beyond = VirtualDevice::new(&dma, 9, 2, UsbSpeed::Full, 1).unwrap();
        assert!(matches!(list.attach(beyond), Err(XhciError::NoSuchDevice(9))));

        assert_eq!(list.detach(4).map(|device| device.port), Some(1));
        assert_eq!(list.dcbaa[4], 0);
        assert!(list.detach(4).is_none());

        let reused = VirtualDevice::new(&dma, 4, 3, UsbSpeed::Full, 1).unwrap();
        list.attach(reused).unwrap();
        assert_eq!(list.get(4).map(|device| device.port), Some(3));
    }

    #[test]
    fn scratchpads_point_at_pages() {
        let array = ScratchpadBufferArray::new(&heap(), 3).unwrap();
        assert_eq!(array.pages.len(), 3);
        for (entry, page) in array.entries.iter().zip(&array.pages) {
            let addr = u64::from(entry.value_low.read()) | (u64::from(entry.value_high.read()) << 32);
            assert_eq!(addr, page.physical() as u64);
            assert_eq!(addr % PAGE_SIZE as u64, 0);
        }
    }
}
