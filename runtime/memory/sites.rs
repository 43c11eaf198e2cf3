//! Call-site categories for reference count attribution
//!
//! Generated code performs every increment and decrement through one of the
//! fixed entry points below. The site tag carries no semantics; it only
//! labels the operation so the leak report can attribute refcount
//! discipline bugs to the construct that caused them.

use std::fmt;

use crate::error::MemoryError;
use crate::memory::ManagedMemory;
use crate::value::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SiteTag {
    Malloc,
    Int64,
    Adt,
    Array,
    Tuple,
    Box,
    Backpatch,
    SwapBind,
    ArgBind,
    LocalBind,
    GlobalBind,
    ClosureBind,
    CleanupLocals,
    CleanupGlobals,
    Drop,
    Recolor,
    Free,
    Unknown,
}

impl SiteTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteTag::Malloc => "MALLOC",
            SiteTag::Int64 => "64",
            SiteTag::Adt => "ADT",
            SiteTag::Array => "ARRAY",
            SiteTag::Tuple => "TUPLE",
            SiteTag::Box => "BOX",
            SiteTag::Backpatch => "BACKPATCH",
            SiteTag::SwapBind => "SWAP",
            SiteTag::ArgBind => "ARG",
            SiteTag::LocalBind => "LOCAL",
            SiteTag::GlobalBind => "GLOBAL",
            SiteTag::ClosureBind => "CLOSURE",
            SiteTag::CleanupLocals => "CLEANUP_LOCALS",
            SiteTag::CleanupGlobals => "CLEANUP_GLOBALS",
            SiteTag::Drop => "DROP",
            SiteTag::Recolor => "RECOLOR",
            SiteTag::Free => "FREE",
            SiteTag::Unknown => "UNK",
        }
    }
}

impl fmt::Display for SiteTag {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        formatter.write_str(self.as_str())
    }
}

/// Per-site entry points consumed by generated code
///
/// Each forwards to the generic operation with a fixed tag. The cleanup and
/// drop decrements are idempotent drop sites, so they pass the ignore-zero
/// flag.
impl ManagedMemory {
    pub fn incref_64(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Int64)
    }

    pub fn decref_64(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::Int64, false)
    }

    pub fn incref_adt(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Adt)
    }

    pub fn incref_array(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Array)
    }

    pub fn decref_array(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::Array, false)
    }

    pub fn incref_tuple(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Tuple)
    }

    pub fn decref_tuple(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::Tuple, false)
    }

    pub fn incref_box(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Box)
    }

    pub fn decref_box(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::Box, false)
    }

    pub fn incref_backpatch(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::Backpatch)
    }

    pub fn incref_swap_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::SwapBind)
    }

    pub fn decref_swap_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::SwapBind, false)
    }

    pub fn incref_arg_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::ArgBind)
    }

    pub fn decref_arg_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::ArgBind, false)
    }

    pub fn incref_local_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::LocalBind)
    }

    pub fn decref_local_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::LocalBind, false)
    }

    pub fn incref_global_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::GlobalBind)
    }

    pub fn decref_global_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::GlobalBind, false)
    }

    pub fn incref_closure_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::ClosureBind)
    }

    pub fn decref_closure_bind(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::ClosureBind, false)
    }

    pub fn incref_cleanup_locals(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.incref(value, SiteTag::CleanupLocals)
    }

    pub fn decref_cleanup_locals(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::CleanupLocals, true)
    }

    pub fn decref_cleanup_globals(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::CleanupGlobals, true)
    }

    pub fn decref_drop(&mut self, value: Value) -> Result<Value, MemoryError> {
        self.decref(value, SiteTag::Drop, true)
    }
}
