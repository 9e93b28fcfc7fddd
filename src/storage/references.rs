//! Named registry of shared components.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reference name under which a shared connection is registered.
pub const CONNECTION: &str = "connection";

/// Named registry of shared components.
///
/// Components are stored as `Arc<T>` and looked up by name and type, so
/// several persistences can borrow one connection.
#[derive(Clone, Default)]
pub struct References {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl References {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component under `name`, replacing any previous one.
    pub fn put<T: Any + Send + Sync>(&mut self, name: impl Into<String>, component: Arc<T>) {
        self.entries.insert(name.into(), component);
    }

    /// Registers a component and returns the registry.
    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, component: Arc<T>) -> Self {
        self.put(name, component);
        self
    }

    /// Returns the component under `name` if it has type `T`.
    #[must_use]
    pub fn get_one_optional<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .get(name)
            .and_then(|c| Arc::clone(c).downcast::<T>().ok())
    }

    /// Removes a component.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Returns the number of registered components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for References {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("References").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_type() {
        let refs = References::new().with("answer", Arc::new(42_u32));
        assert_eq!(refs.get_one_optional::<u32>("answer").as_deref(), Some(&42));
        assert!(refs.get_one_optional::<String>("answer").is_none());
        assert!(refs.get_one_optional::<u32>("missing").is_none());
    }

    #[test]
    fn test_shared_instance() {
        let shared = Arc::new(String::from("conn"));
        let refs = References::new().with(CONNECTION, Arc::clone(&shared));
        let found = refs.get_one_optional::<String>(CONNECTION).unwrap();
        assert!(Arc::ptr_eq(&shared, &found));
    }

    #[test]
    fn test_remove() {
        let mut refs = References::new().with("a", Arc::new(1_i32));
        assert!(refs.remove("a"));
        assert!(refs.is_empty());
    }
}
