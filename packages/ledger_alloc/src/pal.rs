// Platform abstraction layer for the raw allocation primitive.
//
// The manager never calls the system allocator directly. It goes through the `Memory` trait so
// tests can substitute a fake arena that hands out physically adjacent blocks, injects
// allocation failures and counts outstanding allocations.

mod abstractions;
mod facade;
#[cfg(test)]
mod fake;
mod real;

pub(crate) use abstractions::*;
pub(crate) use facade::*;
#[cfg(test)]
pub(crate) use fake::*;
pub(crate) use real::*;
