//! Per-instance callback slots allocated through a global registry.
//!
//! A package that stores user callbacks on objects registers a named
//! category of slots for a class once and receives a contiguous block of ids
//! starting at [`SMALLEST_CALLBACK_ID`]. Every instance of the class then
//! carries a flat slot table sized by [`CallbackRegistry::get_sizes`].
//!
//! ```text
//!   class categories     1000 ──── A ──── 1003 ── B ── 1005
//!   subtype categories   1000 ─ X ─ 1002
//!                        1000 ──── Y ──── 1004      (one subtype at a time)
//! ```

use crate::object::ObjectHeader;
use crate::object::compose::ErasedFn;
use crate::object::registry::ClassId;
use dashmap::DashMap;
use keel_core::{KeelError, KeelResult};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::any::Any;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// First id of every callback block.
pub const SMALLEST_CALLBACK_ID: usize = 1000;

/// Whether a category belongs to the class or to its current subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackType {
    /// Shared by every instance of the class.
    Class,
    /// Specific to the implementation an instance currently has.
    Subtype,
}

/// A block of callback ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRange {
    /// First id of the block.
    pub first: usize,
    /// Number of ids in the block.
    pub count: usize,
}

impl CallbackRange {
    /// The ids of the block.
    #[inline]
    pub fn ids(self) -> Range<usize> {
        self.first..self.first + self.count
    }

    /// Check if `id` belongs to the block.
    #[inline]
    pub fn contains(self, id: usize) -> bool {
        self.ids().contains(&id)
    }

    /// Check if two blocks share an id.
    #[inline]
    pub fn overlaps(self, other: CallbackRange) -> bool {
        self.first < other.first + other.count && other.first < self.first + self.count
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct ClassCallbacks {
    class_count: usize,
    subtype_count: usize,
    categories: FxHashMap<(CallbackType, String), CallbackRange>,
}

/// Process-wide allocator of callback id blocks.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    classes: DashMap<ClassId, ClassCallbacks>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` ids for `category` of `class`.
    ///
    /// Idempotent per (class, type, category); asking again with another
    /// count is a usage error.
    pub fn register(
        &self,
        class: ClassId,
        ty: CallbackType,
        category: &str,
        count: usize,
    ) -> KeelResult<CallbackRange> {
        let mut entry = self.classes.entry(class).or_default();
        let key = (ty, category.to_string());
        if let Some(range) = entry.categories.get(&key) {
            if range.count != count {
                return Err(KeelError::usage(format!(
                    "callback category {} of class {} registered with {} slots, now {}",
                    category,
                    class.raw(),
                    range.count,
                    count
                )));
            }
            return Ok(*range);
        }

        let range = match ty {
            CallbackType::Class => {
                let range = CallbackRange {
                    first: SMALLEST_CALLBACK_ID + entry.class_count,
                    count,
                };
                entry.class_count += count;
                range
            }
            CallbackType::Subtype => {
                entry.subtype_count = entry.subtype_count.max(count);
                CallbackRange {
                    first: SMALLEST_CALLBACK_ID,
                    count,
                }
            }
        };
        entry.categories.insert(key, range);
        debug!(class = class.raw(), ?ty, category, first = range.first, count, "registered callbacks");
        Ok(range)
    }

    /// Slot counts (class, subtype) an instance of `class` needs.
    pub fn get_sizes(&self, class: ClassId) -> (usize, usize) {
        self.classes
            .get(&class)
            .map(|entry| (entry.class_count, entry.subtype_count))
            .unwrap_or((0, 0))
    }
}

static CALLBACK_REGISTRY: OnceLock<CallbackRegistry> = OnceLock::new();

/// Get the process-wide callback registry.
#[inline]
pub fn callback_registry() -> &'static CallbackRegistry {
    CALLBACK_REGISTRY.get_or_init(CallbackRegistry::new)
}

// =============================================================================
// Per-Instance Table
// =============================================================================

type Slots = SmallVec<[Option<ErasedFn>; 4]>;

/// Fixed callback slots of one object.
#[derive(Clone, Default)]
pub struct CallbackTable {
    class: Slots,
    subtype: Slots,
}

impl CallbackTable {
    /// Table with the given slot counts.
    pub fn with_sizes(class: usize, subtype: usize) -> Self {
        Self {
            class: SmallVec::from_elem(None, class),
            subtype: SmallVec::from_elem(None, subtype),
        }
    }

    /// Slot count (class, subtype).
    pub fn sizes(&self) -> (usize, usize) {
        (self.class.len(), self.subtype.len())
    }

    fn slots(&self, ty: CallbackType) -> &Slots {
        match ty {
            CallbackType::Class => &self.class,
            CallbackType::Subtype => &self.subtype,
        }
    }

    fn slots_mut(&mut self, ty: CallbackType) -> &mut Slots {
        match ty {
            CallbackType::Class => &mut self.class,
            CallbackType::Subtype => &mut self.subtype,
        }
    }

    /// Empty every slot of `ty`.
    pub fn clear_type(&mut self, ty: CallbackType) {
        self.slots_mut(ty).iter_mut().for_each(|slot| *slot = None);
    }

    /// Drop every slot.
    pub fn clear(&mut self) {
        self.class.clear();
        self.subtype.clear();
    }
}

fn slot_index(header: &ObjectHeader, ty: CallbackType, id: usize) -> KeelResult<(usize, usize)> {
    let (class_slots, subtype_slots) = callback_registry().get_sizes(header.class_id());
    let limit = match ty {
        CallbackType::Class => class_slots,
        CallbackType::Subtype => subtype_slots,
    };
    match id.checked_sub(SMALLEST_CALLBACK_ID) {
        Some(index) if index < limit => Ok((index, limit)),
        _ => Err(KeelError::out_of_range(format!(
            "callback id {} is not registered for class {}",
            id,
            header.class_name()
        ))),
    }
}

impl ObjectHeader {
    /// Store `func` in callback slot `id`, or clear it with `None`.
    pub fn set_callback<F>(&self, ty: CallbackType, id: usize, func: Option<F>) -> KeelResult<()>
    where
        F: Any + Send + Sync,
    {
        let (index, limit) = slot_index(self, ty, id)?;
        let mut table = self.callbacks.write();
        let slots = table.slots_mut(ty);
        if slots.len() < limit {
            slots.resize(limit, None);
        }
        slots[index] = func.map(|f| Arc::new(f) as ErasedFn);
        Ok(())
    }

    /// Callback in slot `id`.
    ///
    /// An empty slot is `Ok(None)`; a callback of another type is a
    /// WrongType error.
    pub fn get_callback<F>(&self, ty: CallbackType, id: usize) -> KeelResult<Option<F>>
    where
        F: Any + Clone,
    {
        let (index, _) = slot_index(self, ty, id)?;
        let erased = self.callbacks.read().slots(ty).get(index).cloned().flatten();
        match erased {
            None => Ok(None),
            Some(erased) => erased.downcast_ref::<F>().cloned().map(Some).ok_or_else(|| {
                KeelError::wrong_type(format!("callback {} has a different signature", id))
            }),
        }
    }

    /// Copy every callback slot to `dest`, which must be of the same class.
    pub fn copy_callbacks_to(&self, dest: &ObjectHeader) -> KeelResult<()> {
        if std::ptr::eq(self, dest) {
            return Ok(());
        }
        if self.class_id() != dest.class_id() {
            return Err(KeelError::wrong_type(format!(
                "cannot copy callbacks from {} to {}",
                self.class_name(),
                dest.class_name()
            )));
        }
        let table = self.callbacks.read().clone();
        *dest.callbacks.write() = table;
        Ok(())
    }

    /// Clear the subtype slots, for a change of implementation.
    pub fn clear_subtype_callbacks(&self) {
        self.callbacks.write().clear_type(CallbackType::Subtype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::registry::class_registry;
    use crate::object::tests::{probe, probe_class};
    use crate::object::KeelObject;

    #[test]
    fn test_register_is_idempotent() {
        let registry = CallbackRegistry::new();
        let class = ClassId(ClassId::SMALLEST);
        let a = registry.register(class, CallbackType::Class, "monitor", 3).unwrap();
        let b = registry.register(class, CallbackType::Class, "monitor", 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.first, SMALLEST_CALLBACK_ID);
    }

    #[test]
    fn test_class_categories_are_disjoint() {
        let registry = CallbackRegistry::new();
        let class = ClassId(ClassId::SMALLEST);
        let x = registry.register(class, CallbackType::Class, "x", 3).unwrap();
        let y = registry.register(class, CallbackType::Class, "y", 2).unwrap();
        assert!(!x.overlaps(y));
        assert_eq!(y.first, SMALLEST_CALLBACK_ID + 3);
        assert_eq!(registry.get_sizes(class), (5, 0));
    }

    #[test]
    fn test_subtype_categories_share_offset() {
        let registry = CallbackRegistry::new();
        let class = ClassId(ClassId::SMALLEST);
        let x = registry.register(class, CallbackType::Subtype, "x", 2).unwrap();
        let y = registry.register(class, CallbackType::Subtype, "y", 4).unwrap();
        assert_eq!(x.first, SMALLEST_CALLBACK_ID);
        assert_eq!(y.first, SMALLEST_CALLBACK_ID);
        assert_eq!(registry.get_sizes(class), (0, 4));
    }

    #[test]
    fn test_count_change_is_usage_error() {
        let registry = CallbackRegistry::new();
        let class = ClassId(ClassId::SMALLEST);
        registry.register(class, CallbackType::Class, "x", 1).unwrap();
        let err = registry.register(class, CallbackType::Class, "x", 2).unwrap_err();
        assert!(matches!(err, KeelError::Usage(_)));
    }

    #[test]
    fn test_unknown_class_has_no_slots() {
        let registry = CallbackRegistry::new();
        assert_eq!(registry.get_sizes(ClassId(42)), (0, 0));
    }

    #[test]
    fn test_instance_slots() {
        let class = class_registry().register("CallbackHolder");
        let range = callback_registry()
            .register(class, CallbackType::Class, "converged", 2)
            .unwrap();
        let comm = keel_comm::LocalComm::solo();
        let header = crate::object::ObjectHeader::create(class, "CallbackHolder", "", "", &comm, None, None)
            .unwrap();
        assert_eq!(header.callbacks.read().sizes(), (2, 0));

        type Hook = fn(u32) -> u32;
        fn bump(x: u32) -> u32 {
            x + 1
        }

        header
            .set_callback::<Hook>(CallbackType::Class, range.first + 1, Some(bump))
            .unwrap();
        let hook = header
            .get_callback::<Hook>(CallbackType::Class, range.first + 1)
            .unwrap()
            .unwrap();
        assert_eq!(hook(1), 2);
        assert!(header.get_callback::<Hook>(CallbackType::Class, range.first).unwrap().is_none());
        assert!(matches!(
            header.get_callback::<fn() -> u8>(CallbackType::Class, range.first + 1),
            Err(KeelError::WrongType(_))
        ));
        assert!(matches!(
            header.set_callback::<Hook>(CallbackType::Class, range.first + 2, Some(bump)),
            Err(KeelError::OutOfRange(_))
        ));
        assert!(matches!(
            header.set_callback::<Hook>(CallbackType::Subtype, range.first, Some(bump)),
            Err(KeelError::OutOfRange(_))
        ));

        let other = crate::object::ObjectHeader::create(class, "CallbackHolder", "", "", &comm, None, None)
            .unwrap();
        header.copy_callbacks_to(&other).unwrap();
        assert!(other.get_callback::<Hook>(CallbackType::Class, range.first + 1).unwrap().is_some());
    }

    #[test]
    fn test_copy_requires_same_class() {
        let a = probe();
        let class = class_registry().register("Other");
        let comm = keel_comm::LocalComm::solo();
        let b = crate::object::ObjectHeader::create(class, "Other", "", "", &comm, None, None).unwrap();
        assert_ne!(b.class_id(), probe_class());
        assert!(matches!(a.header().copy_callbacks_to(&b), Err(KeelError::WrongType(_))));
    }
}
