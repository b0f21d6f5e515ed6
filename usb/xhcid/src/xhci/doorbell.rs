use common::io::{Mmio, WriteOnly};

/// One entry of the doorbell array. Doorbell 0 belongs to the command ring, doorbell N to the
/// device in slot N.
#[repr(C, packed)]
pub struct Doorbell(WriteOnly<Mmio<u32>>);

impl Doorbell {
    pub fn write(&mut self, data: u32) {
        self.0.write(data);
    }

    /// The value that rings the endpoint with zero-based `endpoint_index`. Its DB Target is the
    /// Device Context Index, one past the index.
    pub const fn target(endpoint_index: u8, stream_id: u16) -> u32 {
        (endpoint_index as u32 + 1) | ((stream_id as u32) << 16)
    }
}
