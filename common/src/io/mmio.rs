use core::mem::MaybeUninit;
use core::ptr;

use super::Io;

/// A memory-mapped register, or a field of a DMA structure shared with a device.
///
/// Every access is volatile and little-endian, so values are never cached across accesses and
/// the layout matches what the device sees regardless of host byte order.
#[repr(packed)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    /// Creates an in-memory register holding `value`, for software-built images such as TRBs
    /// copied off a ring.
    pub const fn new(value: T) -> Self {
        Mmio {
            value: MaybeUninit::new(value),
        }
    }
}

macro_rules! mmio_le {
    ($($ty:ty),*) => {
        $(
            impl Io for Mmio<$ty> {
                type Value = $ty;

                #[inline(always)]
                fn read(&self) -> $ty {
                    <$ty>::from_le(unsafe { ptr::read_volatile(ptr::addr_of!(self.value).cast::<$ty>()) })
                }

                #[inline(always)]
                fn write(&mut self, value: $ty) {
                    unsafe { ptr::write_volatile(ptr::addr_of_mut!(self.value).cast::<$ty>(), value.to_le()) }
                }
            }
        )*
    };
}

mmio_le!(u8, u16, u32, u64);
