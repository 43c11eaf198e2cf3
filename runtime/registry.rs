//! Module registry consumed for rendering and host coercion
//!
//! The registry maps the module/type/variant ids stored in ADT and record
//! instances back to names and field layouts. Collection never depends on
//! it: ADT arity is inherent in the object layout, so a missing registry
//! only degrades rendering to placeholder output.

use std::collections::HashMap;

/// Resolved constructor variant
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantInfo {
    pub name: String,
    pub arity: u32,
}

pub trait ModuleRegistry {
    fn module_name(&self, module_id: u32) -> Option<&str>;

    fn variant_info(&self, module_id: u32, type_id: u32, variant_id: u32) -> Option<VariantInfo>;

    /// Field name to slot index mapping for a record type, in slot order
    fn record_fields(&self, module_id: u32, type_id: u32) -> Option<Vec<(String, u32)>>;
}

/// Map-backed registry populated by the module loader
#[derive(Default)]
pub struct StaticRegistry {
    modules: HashMap<u32, String>,
    variants: HashMap<(u32, u32, u32), VariantInfo>,
    records: HashMap<(u32, u32), Vec<(String, u32)>>,
}

impl StaticRegistry {
    pub fn new() -> StaticRegistry {
        StaticRegistry::default()
    }

    pub fn register_module(&mut self, module_id: u32, name: impl Into<String>) {
        self.modules.insert(module_id, name.into());
    }

    pub fn register_variant(
        &mut self,
        module_id: u32,
        type_id: u32,
        variant_id: u32,
        name: impl Into<String>,
        arity: u32,
    ) {
        self.variants.insert(
            (module_id, type_id, variant_id),
            VariantInfo {
                name: name.into(),
                arity,
            },
        );
    }

    pub fn register_record(
        &mut self,
        module_id: u32,
        type_id: u32,
        fields: Vec<(String, u32)>,
    ) {
        self.records.insert((module_id, type_id), fields);
    }
}

impl ModuleRegistry for StaticRegistry {
    fn module_name(&self, module_id: u32) -> Option<&str> {
        self.modules.get(&module_id).map(String::as_str)
    }

    fn variant_info(&self, module_id: u32, type_id: u32, variant_id: u32) -> Option<VariantInfo> {
        self.variants.get(&(module_id, type_id, variant_id)).cloned()
    }

    fn record_fields(&self, module_id: u32, type_id: u32) -> Option<Vec<(String, u32)>> {
        self.records.get(&(module_id, type_id)).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookups_resolve_registered_entries() {
        let mut registry = StaticRegistry::new();
        registry.register_module(1, "list");
        registry.register_variant(1, 0, 0, "Nil", 0);
        registry.register_variant(1, 0, 1, "Cons", 2);
        registry.register_record(1, 1, vec![("head".to_string(), 0), ("rest".to_string(), 1)]);

        assert_eq!(Some("list"), registry.module_name(1));
        assert_eq!(
            Some(VariantInfo {
                name: "Cons".to_string(),
                arity: 2
            }),
            registry.variant_info(1, 0, 1)
        );
        assert_eq!(2, registry.record_fields(1, 1).unwrap().len());

        assert_eq!(None, registry.module_name(9));
        assert_eq!(None, registry.variant_info(1, 0, 7));
    }
}
