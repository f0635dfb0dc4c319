//! Class registry for mapping ClassId to class names.
//!
//! Every kind of object registers its class once and gets a `ClassId`. Ids are
//! handed out upward from [`ClassId::SMALLEST`], which lets the validity
//! checks reject headers whose class id is outside the registered range.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

// =============================================================================
// Class Id
// =============================================================================

/// Identifier of an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ClassId(pub i32);

impl ClassId {
    /// Class id of a destroyed header.
    pub const FREED: ClassId = ClassId(-1);

    /// Smallest id handed out by the registry.
    pub const SMALLEST: i32 = 1_211_211;

    /// Get raw value.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether this is the destroyed-header sentinel.
    #[inline]
    pub const fn is_freed(self) -> bool {
        self.0 == Self::FREED.0
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of object classes.
///
/// Append-only; ids are never reused.
pub struct ClassRegistry {
    /// Class names, indexed by `id - ClassId::SMALLEST`.
    names: RwLock<Vec<Arc<str>>>,
    /// Next id to hand out.
    next_id: AtomicI32,
}

impl ClassRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            names: RwLock::new(Vec::new()),
            next_id: AtomicI32::new(ClassId::SMALLEST),
        }
    }

    /// Register a class and allocate its id.
    pub fn register(&self, name: &str) -> ClassId {
        let mut names = self.names.write();
        let id = ClassId(self.next_id.fetch_add(1, Ordering::Relaxed));
        names.push(Arc::from(name));
        tracing::trace!(class = name, id = id.raw(), "registered class");
        id
    }

    /// Largest id handed out so far, if any.
    #[inline]
    pub fn largest(&self) -> Option<ClassId> {
        let next = self.next_id.load(Ordering::Relaxed);
        (next > ClassId::SMALLEST).then(|| ClassId(next - 1))
    }

    /// Check if an id was handed out by this registry.
    #[inline]
    pub fn contains(&self, id: ClassId) -> bool {
        self.largest()
            .is_some_and(|largest| id.0 >= ClassId::SMALLEST && id <= largest)
    }

    /// Look up the name of a class.
    pub fn name_of(&self, id: ClassId) -> Option<Arc<str>> {
        let index = usize::try_from(id.0.checked_sub(ClassId::SMALLEST)?).ok()?;
        self.names.read().get(index).cloned()
    }

    /// Find the first class registered under `name`.
    pub fn find(&self, name: &str) -> Option<ClassId> {
        let names = self.names.read();
        names
            .iter()
            .position(|n| &**n == name)
            .map(|index| ClassId(ClassId::SMALLEST + index as i32))
    }

    /// Get the number of registered classes.
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Global Registry Access
// =============================================================================

static CLASS_REGISTRY: OnceLock<ClassRegistry> = OnceLock::new();
static BASE_CLASS: OnceLock<ClassId> = OnceLock::new();

/// Get the process-wide class registry.
#[inline]
pub fn class_registry() -> &'static ClassRegistry {
    CLASS_REGISTRY.get_or_init(ClassRegistry::new)
}

/// Class id of the generic base object, registered on first use.
pub fn base_class_id() -> ClassId {
    *BASE_CLASS.get_or_init(|| class_registry().register("KeelObject"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_allocates_from_smallest() {
        let registry = ClassRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.largest(), None);

        let vec = registry.register("Vec");
        let mat = registry.register("Mat");
        assert_eq!(vec, ClassId(ClassId::SMALLEST));
        assert_eq!(mat, ClassId(ClassId::SMALLEST + 1));
        assert_eq!(registry.largest(), Some(mat));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_contains_and_names() {
        let registry = ClassRegistry::new();
        let vec = registry.register("Vec");
        assert!(registry.contains(vec));
        assert!(!registry.contains(ClassId(vec.0 + 1)));
        assert!(!registry.contains(ClassId::FREED));
        assert_eq!(registry.name_of(vec).as_deref(), Some("Vec"));
        assert_eq!(registry.name_of(ClassId(7)), None);
        assert_eq!(registry.find("Vec"), Some(vec));
        assert_eq!(registry.find("KSP"), None);
    }

    #[test]
    fn test_base_class_is_stable() {
        let a = base_class_id();
        let b = base_class_id();
        assert_eq!(a, b);
        assert_eq!(class_registry().name_of(a).as_deref(), Some("KeelObject"));
    }

    #[test]
    fn test_freed_sentinel() {
        assert!(ClassId::FREED.is_freed());
        assert!(!ClassId(ClassId::SMALLEST).is_freed());
    }
}
