#![no_std]

#[cfg(test)]
extern crate std;

mod slab;

pub use slab::Slab;
