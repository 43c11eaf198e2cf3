//! Host-visible string rendering of managed values
//!
//! This is a consumer of the tag scheme, never a collection dependency.
//! ADT and record rendering resolve names through the module registry;
//! without one (for example under low-level tests) they degrade to opaque
//! placeholders instead of failing.

use crate::memory::{ManagedMemory, GUARD_BIT};
use crate::registry::ModuleRegistry;
use crate::value::{HeapKind, PtrTag, Value};

pub fn render(
    mem: &mut ManagedMemory,
    registry: Option<&dyn ModuleRegistry>,
    value: Value,
) -> String {
    match value.tag() {
        PtrTag::Number => value.as_int().to_string(),
        PtrTag::Const => {
            if value == Value::TRUE {
                "true".to_string()
            } else if value == Value::FALSE {
                "false".to_string()
            } else {
                format!("<const {:#010x}>", value.0)
            }
        }
        PtrTag::Tuple => render_tuple(mem, registry, value.untagged()),
        PtrTag::Closure => "<lambda>".to_string(),
        PtrTag::GenericHeap => render_heap_value(mem, registry, value.untagged()),
    }
}

fn render_tuple(
    mem: &mut ManagedMemory,
    registry: Option<&dyn ModuleRegistry>,
    user_ptr: u32,
) -> String {
    let count = mem.heap().word(user_ptr);
    if count & GUARD_BIT != 0 {
        return format!("<cyclic tuple {:#010x}>", user_ptr);
    }

    mem.heap_mut().set_word(user_ptr, count | GUARD_BIT);
    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let element = Value(mem.heap().word(user_ptr + 4 + i * 4));
        parts.push(render(mem, registry, element));
    }
    mem.heap_mut().set_word(user_ptr, count);

    format!("({})", parts.join(", "))
}

fn render_heap_value(
    mem: &mut ManagedMemory,
    registry: Option<&dyn ModuleRegistry>,
    user_ptr: u32,
) -> String {
    match HeapKind::from_word(mem.heap().word(user_ptr)) {
        HeapKind::String => {
            let byte_length = mem.heap().word(user_ptr + 4);
            let bytes = mem.heap().slice(user_ptr + 8, byte_length);
            format!("\"{}\"", String::from_utf8_lossy(bytes))
        }
        HeapKind::ExternalHandle => {
            format!("<external handle {}>", mem.heap().word(user_ptr + 4))
        }
        HeapKind::Adt => render_adt(mem, registry, user_ptr),
        HeapKind::Record => render_record(mem, registry, user_ptr),
        HeapKind::Unknown(word) => format!("<unknown heap type: {}>", word),
    }
}

fn render_adt(
    mem: &mut ManagedMemory,
    registry: Option<&dyn ModuleRegistry>,
    user_ptr: u32,
) -> String {
    let registry = match registry {
        Some(registry) => registry,
        None => return "<adt value>".to_string(),
    };

    // Stored ids are tagged immediates
    let module_id = mem.heap().word(user_ptr + 4) >> 1;
    let type_id = mem.heap().word(user_ptr + 8) >> 1;
    let variant_id = mem.heap().word(user_ptr + 12) >> 1;

    let info = match registry.variant_info(module_id, type_id, variant_id) {
        Some(info) => info,
        None => return "<adt value>".to_string(),
    };

    let arity = mem.heap().word(user_ptr + 16) & !GUARD_BIT;
    if arity == 0 {
        return info.name;
    }

    let mut fields = Vec::with_capacity(arity as usize);
    for i in 0..arity {
        let field = Value(mem.heap().word(user_ptr + 20 + i * 4));
        fields.push(render(mem, Some(registry), field));
    }

    format!("{}({})", info.name, fields.join(", "))
}

fn render_record(
    mem: &mut ManagedMemory,
    registry: Option<&dyn ModuleRegistry>,
    user_ptr: u32,
) -> String {
    let registry = match registry {
        Some(registry) => registry,
        None => return "<record value>".to_string(),
    };

    let module_id = mem.heap().word(user_ptr + 4) >> 1;
    let type_id = mem.heap().word(user_ptr + 8) >> 1;

    let fields = match registry.record_fields(module_id, type_id) {
        Some(fields) if !fields.is_empty() => fields,
        _ => return "<record value>".to_string(),
    };

    let mut parts = Vec::with_capacity(fields.len());
    for (name, slot) in fields {
        let field = Value(mem.heap().word(user_ptr + 12 + slot * 4));
        let rendered = render(mem, Some(registry), field).replace('\n', "\n  ");
        parts.push(format!("{}: {}", name, rendered));
    }

    format!("{{\n  {}\n}}", parts.join(",\n  "))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemoryConfig;
    use crate::registry::StaticRegistry;

    fn memory() -> ManagedMemory {
        ManagedMemory::new(MemoryConfig::default())
    }

    #[test]
    fn immediates_and_booleans() {
        let mut mem = memory();

        assert_eq!("42", render(&mut mem, None, Value::from_int(42)));
        assert_eq!("-7", render(&mut mem, None, Value::from_int(-7)));
        assert_eq!("true", render(&mut mem, None, Value::TRUE));
        assert_eq!("false", render(&mut mem, None, Value::FALSE));
    }

    #[test]
    fn tuples_and_strings() {
        let mut mem = memory();

        let text = mem.alloc_string("hi").unwrap();
        let tuple = mem.alloc_tuple(&[Value::from_int(1), text]).unwrap();

        assert_eq!("(1, \"hi\")", render(&mut mem, None, tuple));
    }

    #[test]
    fn cyclic_tuple_renders_a_marker() {
        let mut mem = memory();

        let tuple = mem.alloc_tuple(&[Value::from_int(0)]).unwrap();
        mem.heap_mut().set_word(tuple.untagged() + 4, tuple.0);

        let rendered = render(&mut mem, None, tuple);
        assert!(rendered.contains("cyclic tuple"));

        // Guard restored
        assert_eq!(1, mem.heap().word(tuple.untagged()));
    }

    #[test]
    fn closures_are_opaque() {
        let mut mem = memory();

        let closure = mem.alloc_closure(1, 0, &[]).unwrap();
        assert_eq!("<lambda>", render(&mut mem, None, closure));
    }

    #[test]
    fn adt_rendering_uses_the_registry() {
        let mut mem = memory();
        let mut registry = StaticRegistry::new();
        registry.register_variant(1, 0, 0, "Nil", 0);
        registry.register_variant(1, 0, 1, "Cons", 2);

        let nil = mem.alloc_adt(1, 0, 0, &[]).unwrap();
        let cons = mem
            .alloc_adt(1, 0, 1, &[Value::from_int(1), nil])
            .unwrap();

        assert_eq!("Nil", render(&mut mem, Some(&registry), nil));
        assert_eq!("Cons(1, Nil)", render(&mut mem, Some(&registry), cons));

        // Without a registry rendering degrades instead of failing
        assert_eq!("<adt value>", render(&mut mem, None, cons));
    }

    #[test]
    fn record_rendering_uses_the_registry() {
        let mut mem = memory();
        let mut registry = StaticRegistry::new();
        registry.register_record(
            2,
            0,
            vec![("x".to_string(), 0), ("y".to_string(), 1)],
        );

        let record = mem
            .alloc_record(2, 0, &[Value::from_int(3), Value::from_int(4)])
            .unwrap();

        assert_eq!(
            "{\n  x: 3,\n  y: 4\n}",
            render(&mut mem, Some(&registry), record)
        );
        assert_eq!("<record value>", render(&mut mem, None, record));
    }

    #[test]
    fn unknown_heap_kinds_render_a_placeholder() {
        let mut mem = memory();

        let user_ptr = mem.malloc(8, PtrTag::GenericHeap).unwrap();
        mem.heap_mut().set_word(user_ptr, 77);

        assert_eq!(
            "<unknown heap type: 77>",
            render(&mut mem, None, Value::generic_ptr(user_ptr))
        );
    }
}
