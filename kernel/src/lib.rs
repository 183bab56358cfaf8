//! The kernel proper: boot bring-up, protection tables, trap and syscall
//! dispatch, and the boot-module launcher. The binary target wires
//! [`kmain`](crate) to the boot stub; everything here also builds on the
//! host so the launcher and dispatch logic stay testable.

#![no_std]

#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

pub mod boot;
pub mod init;
pub mod irq;
pub mod loader;
pub mod mem;
pub mod syscall;
pub mod task;
pub mod trap;
