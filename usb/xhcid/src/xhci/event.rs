use std::sync::Arc;

use common::dma::{Dma, DmaAllocator};
use common::io::{Io, Mmio};

use super::ring::Ring;
use super::trb::Trb;
use crate::error::Result;

/// TRBs in one event ring segment: exactly one page.
pub const EVENT_RING_SEGMENT_TRBS: usize = 256;

#[repr(C, packed)]
pub struct EventRingSte {
    pub address_low: Mmio<u32>,
    pub address_high: Mmio<u32>,
    pub size: Mmio<u16>,
    _rsvd: Mmio<u16>,
    _rsvd2: Mmio<u32>,
}

/// The ring the controller reports through, and the segment table that describes it.
///
/// Ownership of each slot is decided solely by its cycle bit: an event is ready when the TRB at
/// the dequeue pointer carries the consumer cycle state.
pub struct EventRing {
    pub ste: Dma<[EventRingSte]>,
    pub ring: Ring,
}

impl EventRing {
    pub fn new(dma: &Arc<dyn DmaAllocator>, segments: usize) -> Result<EventRing> {
        let mut ring = EventRing {
            ste: unsafe { Dma::<[EventRingSte]>::zeroed_slice(dma, segments)?.assume_init() },
            ring: Ring::new(dma, segments, EVENT_RING_SEGMENT_TRBS, false)?,
        };

        for (entry, segment) in ring.ste.iter_mut().zip(ring.ring.segments()) {
            let address = segment.physical() as u64;
            entry.address_low.write(address as u32);
            entry.address_high.write((address >> 32) as u32);
            entry.size.write(segment.len() as u16);
        }
        ring.ste.flush();

        Ok(ring)
    }

    /// Whether the controller has posted an event that has not been consumed.
    pub fn is_ready(&self) -> bool {
        self.ring.invalidate();
        self.ring.peek().cycle() == self.ring.cycle
    }

    /// Takes a copy of the next event, if there is one, and consumes its slot.
    ///
    /// The controller may only reuse the slot once the new dequeue pointer has been written to
    /// ERDP.
    pub fn next(&mut self) -> Option<Trb> {
        if !self.is_ready() {
            return None;
        }
        let trb = self.ring.peek().clone();
        self.advance();
        Some(trb)
    }

    pub fn advance(&mut self) {
        self.ring.advance_dequeue();
    }

    /// The dequeue pointer, as ERDP expects it (without flags).
    pub fn erdp(&self) -> u64 {
        self.ring.dequeue_phys() & 0xFFFF_FFFF_FFFF_FFF0
    }
    pub fn erstba(&self) -> u64 {
        self.ste.physical() as u64
    }
    pub fn erstsz(&self) -> u16 {
        self.ste.len() as u16
    }
}
