//! Error conditions surfaced by the managed heap
//!
//! Only collection-correctness conditions are represented here. Unknown heap
//! kinds degrade to a logged warning and missing module registry entries
//! degrade to placeholder rendering; neither is an error.

use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The allocator could not satisfy a request under the configured limit
    ///
    /// Recoverable by the caller; typically surfaced to the running program
    /// as a language-level exception.
    #[error("out of memory")]
    OutOfMemory,

    /// A decrement found a reference count that was already zero
    ///
    /// Indicates a code-generation or manual memory management bug. Not
    /// recoverable.
    #[error("reference count underflow at 0x{user_ptr:08x}")]
    RefcountUnderflow { user_ptr: u32 },

    /// An increment would exceed the header's counter capacity
    #[error("reference count capacity exhausted at 0x{user_ptr:08x}")]
    RefcountOverflow { user_ptr: u32 },

    /// The same address was released twice
    #[error("double release of 0x{user_ptr:08x}")]
    DoubleRelease { user_ptr: u32 },
}
