//! Helpers shared by the host controller drivers: typed register access, DMA-visible memory and
//! bounded polling.

pub mod dma;
pub mod io;
pub mod timeout;
