//! Runtime memory manager for Sprout programs compiled to a linear-memory target
//!
//! The Sprout compiler emits code against a small allocation ABI: it calls
//! [`memory::ManagedMemory`] to allocate heap objects and to adjust their
//! reference counts as values are bound, captured and discarded. Everything
//! here operates on 32-bit tagged words ([`value::Value`]) and byte offsets
//! into a single growable linear buffer, matching the layout the code
//! generator emits bit-for-bit.

pub mod alloc;
pub mod display;
pub mod equal;
pub mod error;
pub mod memory;
pub mod registry;
pub mod value;
