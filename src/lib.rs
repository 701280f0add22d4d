//! drspin samples a running process: it repeatedly stops the target,
//! walks every thread's frame-pointer chain, and prints one aggregated
//! call tree per thread, with addresses resolved against the target's
//! loaded ELF images.

#[macro_use]
extern crate log;

pub mod core;
pub mod sampler;
pub mod symbolicate;
pub mod ui;
