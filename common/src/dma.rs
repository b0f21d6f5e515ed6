use std::alloc::{self, Layout};
use std::mem::{self, ManuallyDrop, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Arc;

use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum DmaError {
    #[error("out of DMA memory ({0} bytes requested)")]
    OutOfMemory(usize),
    #[error("buffer at {0:#x} cannot be mapped for DMA")]
    Unmappable(usize),
}

/// The platform service that hands out device-visible memory.
///
/// Allocations are physically contiguous, page-aligned and zeroed. Pinning translates an existing
/// buffer so a device can access it in place. The cache hooks are called around every exchange
/// of ownership with the device, and are no-ops on coherent platforms.
pub trait DmaAllocator {
    /// Allocates `size` bytes, returning the virtual and physical address of the block.
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize), DmaError>;

    /// # Safety
    /// `virt` and `size` must describe a block returned by [DmaAllocator::allocate] on this
    /// allocator, which must not be used afterwards.
    unsafe fn free(&self, virt: NonNull<u8>, size: usize);

    /// Returns the physical address of `len` bytes at `virt`, keeping them resident until
    /// [DmaAllocator::unpin].
    fn pin(&self, virt: *const u8, len: usize) -> Result<usize, DmaError>;

    fn unpin(&self, _phys: usize, _len: usize) {}

    /// Writes CPU caches back so the device observes `len` bytes at `virt`.
    fn flush(&self, _virt: *const u8, _len: usize) {}

    /// Discards CPU caches so the CPU observes what the device wrote.
    fn invalidate(&self, _virt: *const u8, _len: usize) {}
}

/// An RAII guard of a physical memory allocation. All allocations are page-aligned and take up
/// at least one page.
pub struct PhysBox {
    allocator: Arc<dyn DmaAllocator>,
    virt: NonNull<u8>,
    address: usize,
    size: usize,
}

impl PhysBox {
    pub fn new(allocator: &Arc<dyn DmaAllocator>, size: usize) -> Result<Self, DmaError> {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);
        let (virt, address) = allocator.allocate(size)?;
        assert_eq!(address % PAGE_SIZE, 0, "DMA allocation is not page aligned");

        // Allocators promise zeroed memory, but a block that held device data must never leak
        // into a new owner.
        unsafe { ptr::write_bytes(virt.as_ptr(), 0, size) };

        Ok(Self {
            allocator: Arc::clone(allocator),
            virt,
            address,
            size,
        })
    }

    /// Retrieve the byte address in physical memory, of this allocation.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Retrieve the size in bytes of the alloc.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.allocator
    }
}

impl Drop for PhysBox {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.virt, self.size) }
    }
}

impl std::fmt::Debug for PhysBox {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PhysBox")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

pub struct Dma<T: ?Sized> {
    phys: PhysBox,
    virt: *mut T,
}

impl<T> Dma<T> {
    pub fn zeroed(allocator: &Arc<dyn DmaAllocator>) -> Result<Dma<MaybeUninit<T>>, DmaError> {
        assert!(mem::align_of::<T>() <= PAGE_SIZE);
        let phys = PhysBox::new(allocator, mem::size_of::<T>())?;
        Ok(Dma {
            virt: phys.virt.as_ptr() as *mut MaybeUninit<T>,
            phys,
        })
    }

    pub fn new(allocator: &Arc<dyn DmaAllocator>, value: T) -> Result<Self, DmaError> {
        let this = Self::zeroed(allocator)?;
        Ok(unsafe {
            ptr::write(this.virt, MaybeUninit::new(value));
            this.assume_init()
        })
    }
}

impl<T> Dma<MaybeUninit<T>> {
    /// # Safety
    /// The contents must be a valid `T`, which for a zeroed allocation means `T` is valid as all
    /// zeroes.
    pub unsafe fn assume_init(self) -> Dma<T> {
        let this = ManuallyDrop::new(self);
        Dma {
            phys: ptr::read(&this.phys),
            virt: this.virt as *mut T,
        }
    }
}

impl<T> Dma<[T]> {
    /// Creates a new DMA buffer with a size only known at runtime.
    ///
    /// # Safety
    /// * `T` must not require an alignment beyond a page.
    /// * `T` must be valid as zeroed (i.e. no NonNull pointers).
    pub unsafe fn zeroed_slice(
        allocator: &Arc<dyn DmaAllocator>,
        count: usize,
    ) -> Result<Dma<[MaybeUninit<T>]>, DmaError> {
        assert!(mem::align_of::<T>() <= PAGE_SIZE);
        let phys = PhysBox::new(allocator, mem::size_of::<T>() * count)?;
        Ok(Dma {
            virt: slice::from_raw_parts_mut(phys.virt.as_ptr() as *mut MaybeUninit<T>, count)
                as *mut [MaybeUninit<T>],
            phys,
        })
    }
}

impl<T> Dma<[MaybeUninit<T>]> {
    /// # Safety
    /// Every element must be a valid `T`.
    pub unsafe fn assume_init(self) -> Dma<[T]> {
        let this = ManuallyDrop::new(self);
        Dma {
            phys: ptr::read(&this.phys),
            virt: this.virt as *mut [T],
        }
    }
}

impl<T: ?Sized> Dma<T> {
    pub fn physical(&self) -> usize {
        self.phys.address()
    }
    pub fn size(&self) -> usize {
        self.phys.size()
    }
    pub fn phys(&self) -> &PhysBox {
        &self.phys
    }

    /// Hands the whole allocation to the device.
    pub fn flush(&self) {
        self.phys
            .allocator
            .flush(self.phys.virt.as_ptr(), self.phys.size);
    }

    /// Takes the whole allocation back from the device.
    pub fn invalidate(&self) {
        self.phys
            .allocator
            .invalidate(self.phys.virt.as_ptr(), self.phys.size);
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe { ptr::drop_in_place(self.virt) }
    }
}

/// Hosted allocator backed by the global heap, with physical addresses equal to virtual ones.
///
/// This is what unit tests and device simulators run on. It is only correct for hardware that
/// sits behind an identity-mapped IOMMU.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl HeapAllocator {
    fn layout(size: usize) -> Result<Layout, DmaError> {
        if size == 0 {
            return Err(DmaError::OutOfMemory(0));
        }
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| DmaError::OutOfMemory(size))
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize), DmaError> {
        let layout = Self::layout(size)?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(DmaError::OutOfMemory(size))?;
        log::trace!("heap DMA alloc {:#x} ({} bytes)", virt.as_ptr() as usize, size);
        Ok((virt, virt.as_ptr() as usize))
    }

    unsafe fn free(&self, virt: NonNull<u8>, size: usize) {
        if let Ok(layout) = Self::layout(size) {
            alloc::dealloc(virt.as_ptr(), layout);
        }
    }

    fn pin(&self, virt: *const u8, _len: usize) -> Result<usize, DmaError> {
        if virt.is_null() {
            return Err(DmaError::Unmappable(0));
        }
        Ok(virt as usize)
    }
}
