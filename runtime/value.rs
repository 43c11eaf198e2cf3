//! Tagged word encoding for Sprout values
//!
//! Every value visible to generated code is a single 32-bit machine word.
//! The low three bits classify it:
//!
//! ```text
//! xxxx xxx0  immediate signed integer, payload = word >> 1
//! xxxx x001  tuple pointer
//! xxxx x011  generic heap pointer (string / ADT / record / external handle)
//! xxxx x101  closure pointer
//! xxxx x111  constant sentinel (the two booleans)
//! ```
//!
//! Pointer words recover their object address by masking the tag bits off,
//! which relies on every user pointer being 8-byte aligned. Classification
//! is total over all 32-bit inputs; immediates and the constant sentinels
//! are never reference counted.

use std::fmt;

/// Low-bit tag of a tuple pointer
pub const TUPLE_TAG: u32 = 0b001;
/// Low-bit tag of a generic heap pointer
pub const GENERIC_HEAP_TAG: u32 = 0b011;
/// Low-bit tag of a closure pointer
pub const CLOSURE_TAG: u32 = 0b101;
/// Low-bit tag of the constant sentinels
pub const CONST_TAG: u32 = 0b111;

/// Mask recovering a user pointer from a tagged pointer word
pub const PTR_MASK: u32 = !0b111;

/// A 32-bit tagged machine word
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(pub u32);

impl Value {
    pub const TRUE: Value = Value(0xFFFF_FFFF);
    pub const FALSE: Value = Value(0x7FFF_FFFF);

    pub fn from_int(n: i32) -> Value {
        Value((n as u32) << 1)
    }

    pub fn from_bool(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Interprets this word as an immediate signed integer
    pub fn as_int(self) -> i32 {
        (self.0 as i32) >> 1
    }

    /// Tags a user pointer as a tuple reference
    pub fn tuple_ptr(user_ptr: u32) -> Value {
        debug_assert_eq!(user_ptr & !PTR_MASK, 0);
        Value(user_ptr | TUPLE_TAG)
    }

    /// Tags a user pointer as a closure reference
    pub fn closure_ptr(user_ptr: u32) -> Value {
        debug_assert_eq!(user_ptr & !PTR_MASK, 0);
        Value(user_ptr | CLOSURE_TAG)
    }

    /// Tags a user pointer as a generic heap reference
    pub fn generic_ptr(user_ptr: u32) -> Value {
        debug_assert_eq!(user_ptr & !PTR_MASK, 0);
        Value(user_ptr | GENERIC_HEAP_TAG)
    }

    /// Classifies this word; total over all inputs
    pub fn tag(self) -> PtrTag {
        if self.0 & 1 == 0 {
            return PtrTag::Number;
        }

        match self.0 & 0b111 {
            TUPLE_TAG => PtrTag::Tuple,
            GENERIC_HEAP_TAG => PtrTag::GenericHeap,
            CLOSURE_TAG => PtrTag::Closure,
            _ => PtrTag::Const,
        }
    }

    /// Canonical object address of a pointer word
    pub fn untagged(self) -> u32 {
        self.0 & PTR_MASK
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.tag() {
            PtrTag::Number => write!(formatter, "Value({})", self.as_int()),
            PtrTag::Const => write!(formatter, "Value({:#010x})", self.0),
            tag => write!(formatter, "Value({}@{:#010x})", tag.to_str(), self.untagged()),
        }
    }
}

/// Outer classification of a tagged word
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PtrTag {
    Number,
    Const,
    Tuple,
    Closure,
    GenericHeap,
}

impl PtrTag {
    /// Returns true for the pointer kinds that participate in reference
    /// counting
    pub fn is_ref_counted(self) -> bool {
        match self {
            PtrTag::Tuple | PtrTag::Closure | PtrTag::GenericHeap => true,
            PtrTag::Number | PtrTag::Const => false,
        }
    }

    /// The 4-bit tag duplicated into object headers
    pub fn header_bits(self) -> u8 {
        match self {
            PtrTag::Number => 0,
            PtrTag::Tuple => TUPLE_TAG as u8,
            PtrTag::GenericHeap => GENERIC_HEAP_TAG as u8,
            PtrTag::Closure => CLOSURE_TAG as u8,
            PtrTag::Const => CONST_TAG as u8,
        }
    }

    pub fn from_header_bits(bits: u8) -> PtrTag {
        match u32::from(bits & 0b111) {
            TUPLE_TAG => PtrTag::Tuple,
            GENERIC_HEAP_TAG => PtrTag::GenericHeap,
            CLOSURE_TAG => PtrTag::Closure,
            CONST_TAG => PtrTag::Const,
            _ => PtrTag::Number,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            PtrTag::Number => "number",
            PtrTag::Const => "const",
            PtrTag::Tuple => "tuple",
            PtrTag::Closure => "closure",
            PtrTag::GenericHeap => "generic heap",
        }
    }
}

impl fmt::Display for PtrTag {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        formatter.write_str(self.to_str())
    }
}

/// Discriminant word at the start of every generic heap object
pub const STRING_HEAP_KIND: u32 = 1;
pub const EXTERNAL_HANDLE_HEAP_KIND: u32 = 2;
pub const ADT_HEAP_KIND: u32 = 3;
pub const RECORD_HEAP_KIND: u32 = 4;

/// Inner classification of a generic heap object
///
/// Unrecognised discriminants classify as `Unknown` rather than failing so
/// that traversal stays forward-compatible with heap kinds added by newer
/// code generators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapKind {
    String,
    ExternalHandle,
    Adt,
    Record,
    Unknown(u32),
}

impl HeapKind {
    pub fn from_word(word: u32) -> HeapKind {
        match word {
            STRING_HEAP_KIND => HeapKind::String,
            EXTERNAL_HANDLE_HEAP_KIND => HeapKind::ExternalHandle,
            ADT_HEAP_KIND => HeapKind::Adt,
            RECORD_HEAP_KIND => HeapKind::Record,
            other => HeapKind::Unknown(other),
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            HeapKind::String => "string",
            HeapKind::ExternalHandle => "external handle",
            HeapKind::Adt => "adt",
            HeapKind::Record => "record",
            HeapKind::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_round_trip() {
        for &n in &[0, 1, -1, 42, -42, i32::max_value() >> 1, i32::min_value() >> 1] {
            assert_eq!(n, Value::from_int(n).as_int());
        }
    }

    #[test]
    fn classification_is_total() {
        // Every low-bit pattern classifies without panicking
        for word in 0..16u32 {
            let _ = Value(word).tag();
        }

        assert_eq!(PtrTag::Number, Value(0).tag());
        assert_eq!(PtrTag::Number, Value::from_int(21).tag());
        assert_eq!(PtrTag::Tuple, Value(0x10 | TUPLE_TAG).tag());
        assert_eq!(PtrTag::GenericHeap, Value(0x10 | GENERIC_HEAP_TAG).tag());
        assert_eq!(PtrTag::Closure, Value(0x10 | CLOSURE_TAG).tag());
        assert_eq!(PtrTag::Const, Value::TRUE.tag());
        assert_eq!(PtrTag::Const, Value::FALSE.tag());
    }

    #[test]
    fn booleans_are_not_ref_counted() {
        assert_eq!(false, Value::TRUE.tag().is_ref_counted());
        assert_eq!(false, Value::FALSE.tag().is_ref_counted());
        assert_eq!(false, Value::from_int(7).tag().is_ref_counted());
    }

    #[test]
    fn untagging_recovers_alignment() {
        let value = Value::tuple_ptr(0x48);
        assert_eq!(0x48, value.untagged());
        assert_eq!(0x48, Value::closure_ptr(0x48).untagged());
    }

    #[test]
    fn header_bits_round_trip() {
        for &tag in &[PtrTag::Tuple, PtrTag::Closure, PtrTag::GenericHeap] {
            assert_eq!(tag, PtrTag::from_header_bits(tag.header_bits()));
        }
    }

    #[test]
    fn heap_kind_classification() {
        assert_eq!(HeapKind::String, HeapKind::from_word(STRING_HEAP_KIND));
        assert_eq!(HeapKind::Adt, HeapKind::from_word(ADT_HEAP_KIND));
        assert_eq!(HeapKind::Record, HeapKind::from_word(RECORD_HEAP_KIND));
        assert_eq!(
            HeapKind::ExternalHandle,
            HeapKind::from_word(EXTERNAL_HANDLE_HEAP_KIND)
        );
        assert_eq!(HeapKind::Unknown(99), HeapKind::from_word(99));
    }
}
