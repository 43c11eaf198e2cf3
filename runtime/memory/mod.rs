//! Reference-counted managed heap
//!
//! `ManagedMemory` is the point of communication between generated code and
//! the raw allocator. Every pointer visible to generated code has an 8-byte
//! header in front of it carrying a reference count and a copy of the value
//! tag; generated code is responsible for calling the increment/decrement
//! entry points at every ownership transfer. When a count reaches zero the
//! object's owned children are decremented recursively and the storage is
//! returned to the allocator.
//!
//! Cycles are not collected. Specific compiler-recognised cyclic patterns
//! (mutually capturing closures) are tolerated through [`recolor`]: a
//! non-GREEN object's outgoing edges are owned by its cycle and carry no
//! counts, and it is only actually released after being recolored back to
//! GREEN. Cycles outside those patterns leak; the tracker in [`trace`]
//! exists to surface them.
//!
//! Naming follows the allocator boundary: `raw_ptr` is the address returned
//! by the allocator, `user_ptr` is `raw_ptr + HEADER_SIZE` and is what
//! tagged pointer words encode.
//!
//! [`recolor`]: ManagedMemory::recolor

mod header;
mod sites;
pub mod trace;

use std::cmp;
use std::collections::{HashMap, HashSet};

use log::{trace, warn};

use crate::alloc::{Allocator, LinearHeap, PAGE_SIZE};
use crate::error::MemoryError;
use crate::memory::trace::{HeapTracker, LeakReport};
use crate::value::{HeapKind, PtrTag, Value};

pub use self::header::{RawHeader, HEADER_SIZE, MAX_REF_COUNT, REF_COUNT_BITS};
pub use self::sites::SiteTag;

/// Transient traversal guard on tuple length, closure free-var count and
/// ADT arity words; must always be restored before a traversal returns
pub const GUARD_BIT: u32 = 0x8000_0000;

/// Ownership color used for cycle mitigation
///
/// GREEN objects are counted normally. A non-GREEN object's outgoing edges
/// are owned by its cycle rather than by external references.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Color {
    Green,
    Red,
}

/// Configuration fixed before the first allocation
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Total heap byte limit; `None` is unlimited
    pub memory_limit: Option<u32>,
    /// Initial size of the backing buffer
    pub initial_size: u32,
    /// Enables the allocation tracker and leak report
    pub trace: bool,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            memory_limit: None,
            initial_size: PAGE_SIZE,
            trace: false,
        }
    }
}

impl MemoryConfig {
    /// Applies the external limit convention where a negative value means
    /// unlimited
    pub fn with_raw_limit(mut self, raw_limit: i64) -> MemoryConfig {
        self.memory_limit = if raw_limit < 0 {
            None
        } else {
            Some(cmp::min(raw_limit, i64::from(u32::max_value())) as u32)
        };
        self
    }
}

/// Reference-counted heap over a first-fit allocator
pub struct ManagedMemory {
    alloc: Allocator,
    /// User pointers with live storage. This check backs double-release
    /// detection and is present in every build; the tracker only adds
    /// attribution on top of it.
    live: HashSet<u32>,
    colors: HashMap<u32, Color>,
    tracker: Option<HeapTracker>,
}

impl ManagedMemory {
    pub fn new(config: MemoryConfig) -> ManagedMemory {
        let initial = match config.memory_limit {
            Some(limit) => cmp::min(limit, config.initial_size),
            None => config.initial_size,
        };

        let mut heap = LinearHeap::with_capacity(initial);
        heap.set_limit(config.memory_limit);

        ManagedMemory {
            alloc: Allocator::new(heap),
            live: HashSet::new(),
            colors: HashMap::new(),
            tracker: if config.trace {
                Some(HeapTracker::new())
            } else {
                None
            },
        }
    }

    pub fn heap(&self) -> &LinearHeap {
        self.alloc.heap()
    }

    pub fn heap_mut(&mut self) -> &mut LinearHeap {
        self.alloc.heap_mut()
    }

    /// Number of objects with live storage
    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    /// Bytes currently on the allocator's free list
    pub fn free_bytes(&self) -> u32 {
        self.alloc.free_bytes()
    }

    pub fn tracker(&self) -> Option<&HeapTracker> {
        self.tracker.as_ref()
    }

    /// Allocates `size` payload bytes and returns a user pointer with a
    /// reference count of one, owned by the creation site
    pub fn malloc(&mut self, size: u32, tag: PtrTag) -> Result<u32, MemoryError> {
        trace!("malloc({:#x})", size);

        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(MemoryError::OutOfMemory)?;
        let raw_ptr = self.alloc.allocate(total)?;

        RawHeader::init(self.alloc.heap_mut(), raw_ptr, tag);
        let user_ptr = raw_ptr + HEADER_SIZE;

        self.live.insert(user_ptr);
        if let Some(tracker) = &mut self.tracker {
            tracker.record_alloc(user_ptr, raw_ptr, raw_ptr + total);
            tracker.note_tag(user_ptr, tag);
            tracker.mark_incref(user_ptr, SiteTag::Malloc);
        }

        Ok(user_ptr)
    }

    /// Current reference count of the object at `user_ptr`
    pub fn ref_count(&self, user_ptr: u32) -> u32 {
        RawHeader::read(self.heap(), user_ptr).ref_count
    }

    fn color_of(&self, user_ptr: u32) -> Color {
        self.colors.get(&user_ptr).copied().unwrap_or(Color::Green)
    }

    /// Increments the object's reference count
    ///
    /// Returns the input value unchanged so call sites can chain through it.
    /// Immediates and the constant sentinels are identity no-ops.
    pub fn incref(&mut self, value: Value, site: SiteTag) -> Result<Value, MemoryError> {
        let tag = value.tag();
        if !tag.is_ref_counted() {
            trace!("incref({:#010x}): {} is not counted, bailing", value.0, tag);
            return Ok(value);
        }

        let user_ptr = value.untagged();
        trace!("incref({:#010x}) from {}", value.0, site);

        if let Some(tracker) = &mut self.tracker {
            tracker.note_tag(user_ptr, tag);
            tracker.mark_incref(user_ptr, site);
        }

        let header = RawHeader::read(self.heap(), user_ptr);
        if header.ref_count >= MAX_REF_COUNT {
            return Err(MemoryError::RefcountOverflow { user_ptr });
        }

        RawHeader {
            ref_count: header.ref_count + 1,
            ..header
        }
        .write(self.alloc.heap_mut(), user_ptr);

        Ok(value)
    }

    /// Decrements the object's reference count, releasing it and every
    /// transitively owned child when the count reaches zero
    ///
    /// `ignore_zeros` makes a decrement on an already-zero count a silent
    /// no-op; idempotent drop sites (cleanup, drop) rely on it. Without it
    /// an already-zero count is a fatal `RefcountUnderflow`.
    pub fn decref(
        &mut self,
        value: Value,
        site: SiteTag,
        ignore_zeros: bool,
    ) -> Result<Value, MemoryError> {
        let tag = value.tag();
        if !tag.is_ref_counted() {
            trace!("decref({:#010x}): {} is not counted, bailing", value.0, tag);
            return Ok(value);
        }

        let user_ptr = value.untagged();
        trace!("decref({:#010x}) from {}", value.0, site);

        if let Some(tracker) = &mut self.tracker {
            tracker.note_tag(user_ptr, tag);
            tracker.mark_decref(user_ptr, site);
        }

        let header = RawHeader::read(self.heap(), user_ptr);
        if header.ref_count == 0 {
            if ignore_zeros {
                trace!("ignoring zero reference count at {:#010x}", user_ptr);
                return Ok(value);
            }
            return Err(MemoryError::RefcountUnderflow { user_ptr });
        }

        let new_count = header.ref_count - 1;
        if new_count > 0 {
            RawHeader {
                ref_count: new_count,
                ..header
            }
            .write(self.alloc.heap_mut(), user_ptr);
            return Ok(value);
        }

        if self.color_of(user_ptr) != Color::Green {
            // The cycle owns this object's edges. Park it at zero; it can
            // only be released after a recolor back to GREEN.
            RawHeader {
                ref_count: 0,
                ..header
            }
            .write(self.alloc.heap_mut(), user_ptr);
            return Ok(value);
        }

        // Release every owned child before the storage itself. The guard
        // stays set for the duration so this freeing pass never re-enters
        // the same object.
        let completed = self.visit_children(user_ptr, tag, |mem, child| {
            mem.decref(child, SiteTag::Free, false).map(|_| ())
        })?;

        if !completed {
            // A freeing pass further up the stack already owns this object
            return Ok(value);
        }

        RawHeader {
            ref_count: 0,
            ..header
        }
        .write(self.alloc.heap_mut(), user_ptr);
        self.release(user_ptr)?;

        Ok(value)
    }

    /// Returns the object's storage to the allocator
    ///
    /// Releasing the same address twice is a fatal consistency violation.
    pub fn release(&mut self, user_ptr: u32) -> Result<(), MemoryError> {
        trace!("free {:#010x}", user_ptr);

        if !self.live.remove(&user_ptr) {
            return Err(MemoryError::DoubleRelease { user_ptr });
        }

        if let Some(tracker) = &mut self.tracker {
            tracker.record_free(user_ptr);
        }

        self.colors.remove(&user_ptr);
        self.alloc.release(user_ptr - HEADER_SIZE);
        Ok(())
    }

    /// Read-only enumeration of the object's owned children
    ///
    /// Dispatches exactly as the freeing traversal does. Returns an empty
    /// sequence when the traversal guard is already set, which means a
    /// cyclic structure was reached mid-traversal.
    pub fn children(&mut self, value: Value) -> Vec<Value> {
        let tag = value.tag();
        if !tag.is_ref_counted() {
            return vec![];
        }

        let mut children = vec![];
        // Collecting cannot fail
        let _ = self.visit_children(value.untagged(), tag, |_, child| {
            children.push(child);
            Ok(())
        });
        children
    }

    /// Reclassifies ownership of the object's outgoing edges
    ///
    /// Transitioning GREEN to non-GREEN decrements every child: the cycle
    /// now owns those edges and the external counts are released.
    /// Transitioning back re-establishes them with increments. A no-op when
    /// the object already has the requested color.
    ///
    /// This is a targeted mitigation, not a cycle collector. Only the cyclic
    /// patterns the compiler recognises and explicitly recolors are
    /// tolerated; any other cycle leaks.
    pub fn recolor(
        &mut self,
        value: Value,
        color: Color,
        ignore_zeros: bool,
    ) -> Result<(), MemoryError> {
        let tag = value.tag();
        if !tag.is_ref_counted() {
            return Ok(());
        }

        let user_ptr = value.untagged();
        let current = self.color_of(user_ptr);
        if current == color {
            return Ok(());
        }

        self.visit_children(user_ptr, tag, |mem, child| {
            if current == Color::Green {
                mem.decref(child, SiteTag::Recolor, ignore_zeros).map(|_| ())
            } else {
                mem.incref(child, SiteTag::Recolor).map(|_| ())
            }
        })?;

        self.colors.insert(user_ptr, color);
        Ok(())
    }

    /// Applies `visit` to every child value the object owns
    ///
    /// Sets the object's traversal guard for the duration of the visits,
    /// restoring it before returning. Returns `Ok(false)` without visiting
    /// anything when the guard is already set.
    fn visit_children<F>(
        &mut self,
        user_ptr: u32,
        tag: PtrTag,
        mut visit: F,
    ) -> Result<bool, MemoryError>
    where
        F: FnMut(&mut ManagedMemory, Value) -> Result<(), MemoryError>,
    {
        match tag {
            PtrTag::Tuple => {
                let count = self.heap().word(user_ptr);
                if count & GUARD_BIT != 0 {
                    return Ok(false);
                }

                self.heap_mut().set_word(user_ptr, count | GUARD_BIT);
                let result = self.visit_slots(user_ptr + 4, count, &mut visit);
                self.heap_mut().set_word(user_ptr, count);
                result?;
                Ok(true)
            }
            PtrTag::Closure => {
                let free_vars = self.heap().word(user_ptr + 8);
                if free_vars & GUARD_BIT != 0 {
                    return Ok(false);
                }

                self.heap_mut().set_word(user_ptr + 8, free_vars | GUARD_BIT);
                let result = self.visit_slots(user_ptr + 12, free_vars, &mut visit);
                self.heap_mut().set_word(user_ptr + 8, free_vars);
                result?;
                Ok(true)
            }
            PtrTag::GenericHeap => match HeapKind::from_word(self.heap().word(user_ptr)) {
                HeapKind::Adt => {
                    let arity = self.heap().word(user_ptr + 16);
                    if arity & GUARD_BIT != 0 {
                        return Ok(false);
                    }

                    self.heap_mut().set_word(user_ptr + 16, arity | GUARD_BIT);
                    let result = self.visit_slots(user_ptr + 20, arity, &mut visit);
                    self.heap_mut().set_word(user_ptr + 16, arity);
                    result?;
                    Ok(true)
                }
                // Strings, external handles and records own no traversable
                // children; record field counts live in the module registry,
                // which collection must not depend on
                HeapKind::String | HeapKind::ExternalHandle | HeapKind::Record => Ok(true),
                HeapKind::Unknown(word) => {
                    warn!(
                        "unknown heap kind {:#x} at {:#010x}; treating as leaf",
                        word, user_ptr
                    );
                    Ok(true)
                }
            },
            PtrTag::Number | PtrTag::Const => Ok(true),
        }
    }

    fn visit_slots<F>(&mut self, base: u32, count: u32, visit: &mut F) -> Result<(), MemoryError>
    where
        F: FnMut(&mut ManagedMemory, Value) -> Result<(), MemoryError>,
    {
        for i in 0..count {
            let child = Value(self.heap().word(base + i * 4));
            visit(self, child)?;
        }
        Ok(())
    }

    /// Allocates a tuple containing `elements`
    ///
    /// Elements are stored as given; ownership transfers are the caller's
    /// responsibility, matching the generated-code contract.
    pub fn alloc_tuple(&mut self, elements: &[Value]) -> Result<Value, MemoryError> {
        let count = elements.len() as u32;
        let user_ptr = self.malloc((1 + count) * 4, PtrTag::Tuple)?;

        self.heap_mut().set_word(user_ptr, count);
        for (i, element) in elements.iter().enumerate() {
            self.heap_mut()
                .set_word(user_ptr + 4 + i as u32 * 4, element.0);
        }

        Ok(Value::tuple_ptr(user_ptr))
    }

    /// Allocates a closure with the given arity, code-table index and
    /// captured free variables
    pub fn alloc_closure(
        &mut self,
        arity: u32,
        code_index: u32,
        free_vars: &[Value],
    ) -> Result<Value, MemoryError> {
        let count = free_vars.len() as u32;
        let user_ptr = self.malloc((3 + count) * 4, PtrTag::Closure)?;

        self.heap_mut().set_word(user_ptr, arity);
        self.heap_mut().set_word(user_ptr + 4, code_index);
        self.heap_mut().set_word(user_ptr + 8, count);
        for (i, var) in free_vars.iter().enumerate() {
            self.heap_mut()
                .set_word(user_ptr + 12 + i as u32 * 4, var.0);
        }

        Ok(Value::closure_ptr(user_ptr))
    }

    /// Allocates an ADT instance
    ///
    /// The ids are stored as tagged immediates, matching what the code
    /// generator emits. Arity is stored inline so traversal never needs the
    /// module registry.
    pub fn alloc_adt(
        &mut self,
        module_id: u32,
        type_id: u32,
        variant_id: u32,
        fields: &[Value],
    ) -> Result<Value, MemoryError> {
        let arity = fields.len() as u32;
        let user_ptr = self.malloc((5 + arity) * 4, PtrTag::GenericHeap)?;

        self.heap_mut()
            .set_word(user_ptr, crate::value::ADT_HEAP_KIND);
        self.heap_mut().set_word(user_ptr + 4, module_id << 1);
        self.heap_mut().set_word(user_ptr + 8, type_id << 1);
        self.heap_mut().set_word(user_ptr + 12, variant_id << 1);
        self.heap_mut().set_word(user_ptr + 16, arity);
        for (i, field) in fields.iter().enumerate() {
            self.heap_mut()
                .set_word(user_ptr + 20 + i as u32 * 4, field.0);
        }

        Ok(Value::generic_ptr(user_ptr))
    }

    /// Allocates a record instance; field names resolve through the module
    /// registry
    pub fn alloc_record(
        &mut self,
        module_id: u32,
        type_id: u32,
        fields: &[Value],
    ) -> Result<Value, MemoryError> {
        let count = fields.len() as u32;
        let user_ptr = self.malloc((3 + count) * 4, PtrTag::GenericHeap)?;

        self.heap_mut()
            .set_word(user_ptr, crate::value::RECORD_HEAP_KIND);
        self.heap_mut().set_word(user_ptr + 4, module_id << 1);
        self.heap_mut().set_word(user_ptr + 8, type_id << 1);
        for (i, field) in fields.iter().enumerate() {
            self.heap_mut()
                .set_word(user_ptr + 12 + i as u32 * 4, field.0);
        }

        Ok(Value::generic_ptr(user_ptr))
    }

    /// Allocates a string from UTF-8 text
    pub fn alloc_string(&mut self, text: &str) -> Result<Value, MemoryError> {
        let byte_length = text.len() as u32;
        let user_ptr = self.malloc(8 + byte_length, PtrTag::GenericHeap)?;

        self.heap_mut()
            .set_word(user_ptr, crate::value::STRING_HEAP_KIND);
        self.heap_mut().set_word(user_ptr + 4, byte_length);
        self.heap_mut()
            .slice_mut(user_ptr + 8, byte_length)
            .copy_from_slice(text.as_bytes());

        Ok(Value::generic_ptr(user_ptr))
    }

    /// Allocates a handle referencing a slot in a host-side table
    pub fn alloc_external_handle(&mut self, handle_index: u32) -> Result<Value, MemoryError> {
        let user_ptr = self.malloc(8, PtrTag::GenericHeap)?;

        self.heap_mut()
            .set_word(user_ptr, crate::value::EXTERNAL_HANDLE_HEAP_KIND);
        self.heap_mut().set_word(user_ptr + 4, handle_index);

        Ok(Value::generic_ptr(user_ptr))
    }

    /// The leak report, when tracking is enabled
    pub fn leak_report(&self) -> Option<LeakReport> {
        self.tracker.as_ref().map(|tracker| tracker.leak_report(self))
    }

    /// Logs the leak report before the embedding program exits
    pub fn prepare_exit(&self) {
        if let Some(report) = self.leak_report() {
            for line in report.to_string().lines() {
                warn!("{}", line);
            }
        }
    }
}
