//! Per-simulation object namespace
//!
//! Objects are interned under `(name, type)`: two objects may share a name
//! as long as their Rust types differ. Lookups are typed, so a caller gets
//! back the concrete `Arc<T>` it registered.

use crate::core::error::SimError;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub(crate) struct NameTable {
    objects: Mutex<HashMap<(TypeId, String), Entry>>,
    counters: Mutex<HashMap<String, u64>>,
}

/// Last path segment of a type name, e.g. `FifoTaskQueue`
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&self, name: &str, object: Arc<T>) -> Result<(), SimError> {
        let mut objects = self.objects.lock();
        let key = (TypeId::of::<T>(), name.to_string());
        if objects.contains_key(&key) {
            return Err(SimError::IllegalName {
                name: name.to_string(),
                kind: short_type_name::<T>().to_string(),
            });
        }
        objects.insert(key, object);
        Ok(())
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let entry = self
            .objects
            .lock()
            .get(&(TypeId::of::<T>(), name.to_string()))
            .cloned()?;
        entry.downcast::<T>().ok()
    }

    pub fn contains<T: Any + Send + Sync>(&self, name: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(TypeId::of::<T>(), name.to_string()))
    }

    pub fn unregister<T: Any + Send + Sync>(&self, name: &str) -> bool {
        let removed = self
            .objects
            .lock()
            .remove(&(TypeId::of::<T>(), name.to_string()));
        removed.is_some()
    }

    /// Sorted names of every interned object of type `T`
    pub fn names<T: Any + Send + Sync>(&self) -> Vec<String> {
        let type_id = TypeId::of::<T>();
        let mut names: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(id, _)| *id == type_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Generated name `"{kind}{n}"`, numbered per kind starting at 1
    pub fn generate_name(&self, kind: &str) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        format!("{}{}", kind, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget(u32);
    struct Gadget;

    #[test]
    fn test_same_name_different_types() {
        let table = NameTable::new();
        table.register("a", Arc::new(Widget(1))).unwrap();
        table.register("a", Arc::new(Gadget)).unwrap();

        assert_eq!(table.get::<Widget>("a").unwrap().0, 1);
        assert!(table.contains::<Gadget>("a"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let table = NameTable::new();
        table.register("a", Arc::new(Widget(1))).unwrap();
        let err = table.register("a", Arc::new(Widget(2))).unwrap_err();
        assert!(matches!(err, SimError::IllegalName { ref kind, .. } if kind == "Widget"));
        // the first registration survives
        assert_eq!(table.get::<Widget>("a").unwrap().0, 1);
    }

    #[test]
    fn test_generated_names() {
        let table = NameTable::new();
        assert_eq!(table.generate_name("queue"), "queue1");
        assert_eq!(table.generate_name("queue"), "queue2");
        assert_eq!(table.generate_name("server"), "server1");
    }

    #[test]
    fn test_unregister_and_list() {
        let table = NameTable::new();
        table.register("b", Arc::new(Widget(2))).unwrap();
        table.register("a", Arc::new(Widget(1))).unwrap();
        assert_eq!(table.names::<Widget>(), vec!["a".to_string(), "b".to_string()]);
        assert!(table.unregister::<Widget>("a"));
        assert!(!table.unregister::<Widget>("a"));
        assert!(table.get::<Widget>("a").is_none());
    }
}
