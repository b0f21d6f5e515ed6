use std::mem;
use std::sync::Arc;

use common::dma::{Dma, DmaAllocator};

use super::trb::Trb;
use crate::error::Result;

/// A ring of TRBs spread over one or more physically contiguous segments.
///
/// Rings the driver produces into (command and transfer rings) are closed by a Link TRB at the
/// end of every segment, pointing at the next segment; the last one points back at the first and
/// carries the Toggle Cycle flag. Rings the controller produces into (event rings) have no links
/// and are chained by the Event Ring Segment Table instead.
///
/// `cycle` is the producer cycle state for link rings and the consumer cycle state otherwise.
pub struct Ring {
    pub link: bool,
    segments: Vec<Dma<[Trb]>>,
    trbs_per_segment: usize,
    enqueue: (usize, usize),
    dequeue: (usize, usize),
    pub cycle: bool,
}

impl Ring {
    /// Allocates `segments` segments of `trbs_per_segment` TRBs each. On link rings the last TRB
    /// of every segment is the link, so each segment holds one TRB less of payload.
    pub fn new(
        dma: &Arc<dyn DmaAllocator>,
        segments: usize,
        trbs_per_segment: usize,
        link: bool,
    ) -> Result<Ring> {
        assert!(segments > 0, "a ring needs at least one segment");
        assert!(
            trbs_per_segment > usize::from(link),
            "a segment needs room for at least one TRB"
        );

        let mut ring = Ring {
            link,
            segments: Vec::with_capacity(segments),
            trbs_per_segment,
            enqueue: (0, 0),
            dequeue: (0, 0),
            cycle: true,
        };
        for _ in 0..segments {
            let trbs = unsafe { Dma::<[Trb]>::zeroed_slice(dma, trbs_per_segment)?.assume_init() };
            ring.segments.push(trbs);
        }

        if link {
            // The links are pre-wired with a cycle bit the controller does not own yet; the
            // producer hands each one over as it crosses it.
            for segment in 0..segments {
                let target = ring.segments[(segment + 1) % segments].physical() as u64;
                let toggle = segment == segments - 1;
                ring.segments[segment][trbs_per_segment - 1].link(target, toggle, false);
            }
        }
        ring.flush();

        Ok(ring)
    }

    /// The TRBs per segment that can carry something other than a link.
    fn usable(&self) -> usize {
        self.trbs_per_segment - usize::from(self.link)
    }

    /// The number of TRBs the ring can hold.
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.usable()
    }

    pub fn segments(&self) -> &[Dma<[Trb]>] {
        &self.segments
    }

    pub fn trbs_per_segment(&self) -> usize {
        self.trbs_per_segment
    }

    fn step(&self, (segment, index): (usize, usize)) -> (usize, usize) {
        if index + 1 < self.usable() {
            (segment, index + 1)
        } else {
            ((segment + 1) % self.segments.len(), 0)
        }
    }

    fn position(&self, (segment, index): (usize, usize)) -> usize {
        segment * self.usable() + index
    }

    /// Claims the TRB at the enqueue pointer, returning it with the cycle bit it must be
    /// written with.
    ///
    /// The enqueue pointer moves on before returning. When that crosses a link, the link is
    /// handed to the controller with the current cycle, and the cycle flips if the link toggles.
    pub fn next(&mut self) -> (&mut Trb, bool) {
        let (segment, index) = self.enqueue;
        let cycle = self.cycle;

        let next = self.step(self.enqueue);
        if next.1 == 0 {
            let wraps = segment == self.segments.len() - 1;
            if self.link {
                let link_index = self.trbs_per_segment - 1;
                let target = self.segments[next.0].physical() as u64;
                self.segments[segment][link_index].link(target, wraps, self.cycle);
            }
            if wraps {
                self.cycle = !self.cycle;
            }
        }
        self.enqueue = next;

        (&mut self.segments[segment][index], cycle)
    }

    pub fn phys_addr(&self, segment: usize, index: usize) -> u64 {
        (self.segments[segment].physical() + index * mem::size_of::<Trb>()) as u64
    }

    /// Maps a TRB address reported by the controller back to its segment and index.
    pub fn phys_addr_to_entry(&self, phys: u64) -> Option<(usize, usize)> {
        let size = mem::size_of::<Trb>() as u64;
        if phys % size != 0 {
            return None;
        }
        self.segments.iter().enumerate().find_map(|(segment, trbs)| {
            let base = trbs.physical() as u64;
            let index = phys.checked_sub(base)? / size;
            if index < self.trbs_per_segment as u64 {
                Some((segment, index as usize))
            } else {
                None
            }
        })
    }

    pub fn enqueue_phys(&self) -> u64 {
        self.phys_addr(self.enqueue.0, self.enqueue.1)
    }

    pub fn dequeue_phys(&self) -> u64 {
        self.phys_addr(self.dequeue.0, self.dequeue.1)
    }

    /// The enqueue pointer with the cycle state in bit 0, as CRCR and Set TR Dequeue Pointer
    /// expect it.
    pub fn register(&self) -> u64 {
        self.enqueue_phys() | u64::from(self.cycle)
    }

    /// Records that the controller has finished with the TRB at `phys`, releasing it and every
    /// TRB before it. Returns false if `phys` is not on this ring.
    pub fn consumed(&mut self, phys: u64) -> bool {
        match self.phys_addr_to_entry(phys) {
            Some(entry) => {
                self.dequeue = self.step(entry);
                true
            }
            None => false,
        }
    }

    /// The TRBs that can still be claimed without overwriting ones the controller has not
    /// consumed. One slot always stays empty so a full ring is distinguishable from an empty one.
    pub fn free_slots(&self) -> usize {
        let total = self.capacity();
        let enqueue = self.position(self.enqueue);
        let dequeue = self.position(self.dequeue);
        (dequeue + total - enqueue - 1) % total
    }

    /// Abandons everything between the dequeue and enqueue pointers, after the controller has
    /// been told to resume at the enqueue pointer.
    pub fn skip_to_enqueue(&mut self) {
        self.dequeue = self.enqueue;
    }

    /// The TRB at the dequeue pointer.
    pub fn peek(&self) -> &Trb {
        &self.segments[self.dequeue.0][self.dequeue.1]
    }

    /// Moves the dequeue pointer past one TRB. The consumer cycle flips when it wraps.
    pub fn advance_dequeue(&mut self) {
        let next = self.step(self.dequeue);
        if next == (0, 0) {
            self.cycle = !self.cycle;
        }
        self.dequeue = next;
    }

    pub fn flush(&self) {
        for segment in &self.segments {
            segment.flush();
        }
    }

    pub fn invalidate(&self) {
        for segment in &self.segments {
            segment.invalidate();
        }
    }
}
