#![no_std]

#[macro_use]
extern crate log;

#[cfg(any(test, feature = "testing"))]
extern crate std;

mod frame_alloc;
mod space;
mod tables;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use frame_alloc::{RegionAllocator, MAX_REGIONS};
pub use space::{AddressSpace, SpaceRef, KERNEL_VIRT_START, KERNEL_WINDOW_SIZE};
pub use tables::{PageAttributes, PageTables, Translation};
