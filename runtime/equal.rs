//! Deep structural equality over tagged values
//!
//! Tuples and ADT instances compare structurally; everything else compares
//! by word value, which for other heap kinds means pointer identity.
//!
//! Cyclic data terminates through the same transient guard bit the freeing
//! traversal uses: both sides mark their size word in-progress before
//! recursing and restore it after. Revisiting an in-progress node
//! short-circuits to `true` for that subtree. That makes any two structures
//! equal once a shared cycle point is reached, which is a deliberate
//! simplification rather than a full isomorphism check; downstream code
//! depends on it.

use crate::memory::{ManagedMemory, GUARD_BIT};
use crate::value::{HeapKind, PtrTag, Value};

/// ABI wrapper returning the boolean sentinel words
pub fn equal_values(mem: &mut ManagedMemory, x: Value, y: Value) -> Value {
    Value::from_bool(equal(mem, x, y))
}

pub fn equal(mem: &mut ManagedMemory, x: Value, y: Value) -> bool {
    match (x.tag(), y.tag()) {
        (PtrTag::Tuple, PtrTag::Tuple) => tuple_equal(mem, x.untagged(), y.untagged()),
        (PtrTag::GenericHeap, PtrTag::GenericHeap) => {
            heap_equal(mem, x.untagged(), y.untagged())
        }
        _ => x == y,
    }
}

fn tuple_equal(mem: &mut ManagedMemory, x_ptr: u32, y_ptr: u32) -> bool {
    let x_count = mem.heap().word(x_ptr);
    if x_count != mem.heap().word(y_ptr) {
        return false;
    }
    if x_count & GUARD_BIT != 0 {
        // Both sides are in progress; treat the shared cycle point as equal
        return true;
    }

    mem.heap_mut().set_word(x_ptr, x_count | GUARD_BIT);
    mem.heap_mut().set_word(y_ptr, x_count | GUARD_BIT);

    let mut result = true;
    for i in 0..x_count {
        let x_element = Value(mem.heap().word(x_ptr + 4 + i * 4));
        let y_element = Value(mem.heap().word(y_ptr + 4 + i * 4));
        if !equal(mem, x_element, y_element) {
            result = false;
            break;
        }
    }

    mem.heap_mut().set_word(x_ptr, x_count);
    mem.heap_mut().set_word(y_ptr, x_count);
    result
}

fn heap_equal(mem: &mut ManagedMemory, x_ptr: u32, y_ptr: u32) -> bool {
    let x_kind = mem.heap().word(x_ptr);
    if x_kind != mem.heap().word(y_ptr) {
        return false;
    }

    match HeapKind::from_word(x_kind) {
        HeapKind::Adt => adt_equal(mem, x_ptr, y_ptr),
        // Strings, records and external handles compare by identity here;
        // string content comparison is a stdlib concern
        _ => x_ptr == y_ptr,
    }
}

fn adt_equal(mem: &mut ManagedMemory, x_ptr: u32, y_ptr: u32) -> bool {
    // Same owning module, type and constructor variant
    for &offset in &[4u32, 8, 12] {
        if mem.heap().word(x_ptr + offset) != mem.heap().word(y_ptr + offset) {
            return false;
        }
    }

    let x_arity = mem.heap().word(x_ptr + 16);
    if x_arity != mem.heap().word(y_ptr + 16) {
        return false;
    }
    if x_arity & GUARD_BIT != 0 {
        return true;
    }

    mem.heap_mut().set_word(x_ptr + 16, x_arity | GUARD_BIT);
    mem.heap_mut().set_word(y_ptr + 16, x_arity | GUARD_BIT);

    let mut result = true;
    for i in 0..x_arity {
        let x_field = Value(mem.heap().word(x_ptr + 20 + i * 4));
        let y_field = Value(mem.heap().word(y_ptr + 20 + i * 4));
        if !equal(mem, x_field, y_field) {
            result = false;
            break;
        }
    }

    mem.heap_mut().set_word(x_ptr + 16, x_arity);
    mem.heap_mut().set_word(y_ptr + 16, x_arity);
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemoryConfig;

    fn memory() -> ManagedMemory {
        ManagedMemory::new(MemoryConfig::default())
    }

    #[test]
    fn immediates_compare_by_value() {
        let mut mem = memory();

        assert!(equal(&mut mem, Value::from_int(3), Value::from_int(3)));
        assert!(!equal(&mut mem, Value::from_int(3), Value::from_int(4)));
        assert!(equal(&mut mem, Value::TRUE, Value::TRUE));
        assert!(!equal(&mut mem, Value::TRUE, Value::FALSE));
        assert!(!equal(&mut mem, Value::from_int(1), Value::TRUE));
    }

    #[test]
    fn tuples_compare_structurally() {
        let mut mem = memory();

        let a = mem
            .alloc_tuple(&[Value::from_int(1), Value::from_int(2)])
            .unwrap();
        let b = mem
            .alloc_tuple(&[Value::from_int(1), Value::from_int(2)])
            .unwrap();
        let c = mem
            .alloc_tuple(&[Value::from_int(1), Value::from_int(3)])
            .unwrap();
        let shorter = mem.alloc_tuple(&[Value::from_int(1)]).unwrap();

        assert!(equal(&mut mem, a, b));
        assert!(!equal(&mut mem, a, c));
        assert!(!equal(&mut mem, a, shorter));
        assert_eq!(Value::TRUE, equal_values(&mut mem, a, b));
        assert_eq!(Value::FALSE, equal_values(&mut mem, a, c));
    }

    #[test]
    fn nested_tuples_compare_structurally() {
        let mut mem = memory();

        let a_inner = mem.alloc_tuple(&[Value::from_int(7)]).unwrap();
        let a = mem.alloc_tuple(&[a_inner, Value::from_int(1)]).unwrap();
        let b_inner = mem.alloc_tuple(&[Value::from_int(7)]).unwrap();
        let b = mem.alloc_tuple(&[b_inner, Value::from_int(1)]).unwrap();

        assert!(equal(&mut mem, a, b));
    }

    #[test]
    fn self_referential_tuple_equals_itself() {
        let mut mem = memory();

        let tuple = mem.alloc_tuple(&[Value::from_int(0)]).unwrap();
        mem.heap_mut().set_word(tuple.untagged() + 4, tuple.0);

        // Must terminate rather than recurse forever
        assert!(equal(&mut mem, tuple, tuple));

        // Guards must have been restored
        assert_eq!(1, mem.heap().word(tuple.untagged()));
    }

    #[test]
    fn mutually_cyclic_tuples_compare_equal() {
        let mut mem = memory();

        let a = mem.alloc_tuple(&[Value::from_int(0)]).unwrap();
        let b = mem.alloc_tuple(&[Value::from_int(0)]).unwrap();
        mem.heap_mut().set_word(a.untagged() + 4, b.0);
        mem.heap_mut().set_word(b.untagged() + 4, a.0);

        // Equality short-circuits at the shared cycle point
        assert!(equal(&mut mem, a, b));
    }

    #[test]
    fn adts_compare_by_ids_then_fields() {
        let mut mem = memory();

        let a = mem.alloc_adt(1, 2, 0, &[Value::from_int(5)]).unwrap();
        let b = mem.alloc_adt(1, 2, 0, &[Value::from_int(5)]).unwrap();
        let other_variant = mem.alloc_adt(1, 2, 1, &[Value::from_int(5)]).unwrap();
        let other_module = mem.alloc_adt(9, 2, 0, &[Value::from_int(5)]).unwrap();
        let other_field = mem.alloc_adt(1, 2, 0, &[Value::from_int(6)]).unwrap();

        assert!(equal(&mut mem, a, b));
        assert!(!equal(&mut mem, a, other_variant));
        assert!(!equal(&mut mem, a, other_module));
        assert!(!equal(&mut mem, a, other_field));
    }

    #[test]
    fn strings_compare_by_identity() {
        let mut mem = memory();

        let a = mem.alloc_string("same").unwrap();
        let b = mem.alloc_string("same").unwrap();

        assert!(equal(&mut mem, a, a));
        assert!(!equal(&mut mem, a, b));
    }

    #[test]
    fn mismatched_tags_are_unequal() {
        let mut mem = memory();

        let tuple = mem.alloc_tuple(&[Value::from_int(1)]).unwrap();
        let adt = mem.alloc_adt(1, 1, 1, &[Value::from_int(1)]).unwrap();

        assert!(!equal(&mut mem, tuple, adt));
        assert!(!equal(&mut mem, tuple, Value::from_int(1)));
    }
}
