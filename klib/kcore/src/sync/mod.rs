#![allow(clippy::module_name_repetitions)]

mod global;
mod mutex;

pub use global::{Global, GlobalGuard};
pub use mutex::{SpinMutex, SpinMutexGuard};
