//! Composed data: per-object scratch values stamped with the object version.
//!
//! Derived quantities (norms, flags, cached arrays) are stored against a
//! globally registered [`ComposedId`]. Each slot remembers the version of the
//! object when it was written; a read only succeeds while the object is
//! still at that version, so any mutation that calls
//! [`ObjectHeader::increment_version`] invalidates every cached value at
//! once.
//!
//! Six kinds of value exist: integer, integer array, real, real array,
//! scalar, scalar array. Ids are shared by all kinds and never reused.

use crate::object::ObjectHeader;
use keel_core::{Int, KeelError, KeelResult, Real, Scalar};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_COMPOSED_ID: AtomicUsize = AtomicUsize::new(0);

/// Identifier of a composed-data slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ComposedId(usize);

impl ComposedId {
    /// Get raw value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Allocate a fresh composed-data id.
pub fn register_composed_id() -> ComposedId {
    ComposedId(NEXT_COMPOSED_ID.fetch_add(1, Ordering::Relaxed))
}

/// Number of ids handed out so far.
#[inline]
pub fn registered_composed_ids() -> usize {
    NEXT_COMPOSED_ID.load(Ordering::Relaxed)
}

// =============================================================================
// Slot Tables
// =============================================================================

/// Parallel (value, stamp) arrays for one kind of value.
#[derive(Debug)]
pub struct ComposedTable<T> {
    data: Vec<Option<T>>,
    stamps: Vec<u64>,
}

impl<T> Default for ComposedTable<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            stamps: Vec::new(),
        }
    }
}

impl<T: Clone> ComposedTable<T> {
    fn set(&mut self, id: ComposedId, value: T, version: u64) -> KeelResult<()> {
        let limit = registered_composed_ids();
        if id.0 >= limit {
            return Err(KeelError::out_of_range(format!(
                "composed data id {} was never registered",
                id.0
            )));
        }
        if self.data.len() <= id.0 {
            self.data.resize_with(limit, || None);
            self.stamps.resize(limit, 0);
        }
        self.data[id.0] = Some(value);
        self.stamps[id.0] = version;
        Ok(())
    }

    #[inline]
    fn get(&self, id: ComposedId, version: u64) -> Option<T> {
        match (self.data.get(id.0), self.stamps.get(id.0)) {
            (Some(Some(value)), Some(&stamp)) if stamp == version => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of allocated slots.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// All composed-data tables of one object.
#[derive(Debug, Default)]
pub struct ComposedData {
    int: ComposedTable<Int>,
    int_array: ComposedTable<Arc<[Int]>>,
    real: ComposedTable<Real>,
    real_array: ComposedTable<Arc<[Real]>>,
    scalar: ComposedTable<Scalar>,
    scalar_array: ComposedTable<Arc<[Scalar]>>,
}

// =============================================================================
// Header Accessors
// =============================================================================

macro_rules! composed_accessors {
    ($($set:ident, $get:ident, $field:ident, $ty:ty, $what:literal;)*) => {
        impl ObjectHeader {
            $(
                #[doc = concat!("Cache ", $what, " under `id`, stamped with the current version.")]
                pub fn $set(&self, id: ComposedId, value: $ty) -> KeelResult<()> {
                    let version = self.version();
                    self.composed.write().$field.set(id, value, version)
                }

                #[doc = concat!("Cached ", $what, " under `id`, if stamped at the current version.")]
                #[inline]
                pub fn $get(&self, id: ComposedId) -> Option<$ty> {
                    let version = self.version();
                    self.composed.read().$field.get(id, version)
                }
            )*
        }
    };
}

composed_accessors! {
    set_composed_int, get_composed_int, int, Int, "an integer";
    set_composed_int_array, get_composed_int_array, int_array, Arc<[Int]>, "an integer array";
    set_composed_real, get_composed_real, real, Real, "a real";
    set_composed_real_array, get_composed_real_array, real_array, Arc<[Real]>, "a real array";
    set_composed_scalar, get_composed_scalar, scalar, Scalar, "a scalar";
    set_composed_scalar_array, get_composed_scalar_array, scalar_array, Arc<[Scalar]>, "a scalar array";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::probe;
    use crate::object::KeelObject;

    #[test]
    fn test_ids_are_unique() {
        let a = register_composed_id();
        let b = register_composed_id();
        assert!(b > a);
        assert!(registered_composed_ids() > b.raw());
    }

    #[test]
    fn test_unset_slot_not_found() {
        let obj = probe();
        let id = register_composed_id();
        assert_eq!(obj.header().get_composed_real(id), None);
    }

    #[test]
    fn test_set_then_get() {
        let obj = probe();
        let id = register_composed_id();
        obj.header().set_composed_real(id, 2.5).unwrap();
        assert_eq!(obj.header().get_composed_real(id), Some(2.5));
    }

    #[test]
    fn test_version_bump_invalidates() {
        let obj = probe();
        let id = register_composed_id();
        obj.header().set_composed_int(id, 7).unwrap();
        obj.header().increment_version();
        assert_eq!(obj.header().get_composed_int(id), None);

        obj.header().set_composed_int(id, 8).unwrap();
        assert_eq!(obj.header().get_composed_int(id), Some(8));
    }

    #[test]
    fn test_ids_and_kinds_are_independent() {
        let obj = probe();
        let id1 = register_composed_id();
        let id2 = register_composed_id();
        obj.header().set_composed_scalar(id1, 1.0).unwrap();
        assert_eq!(obj.header().get_composed_scalar(id2), None);
        assert_eq!(obj.header().get_composed_real(id1), None);
        obj.header().set_composed_scalar(id2, 2.0).unwrap();
        assert_eq!(obj.header().get_composed_scalar(id1), Some(1.0));
    }

    #[test]
    fn test_arrays() {
        let obj = probe();
        let id = register_composed_id();
        obj.header()
            .set_composed_int_array(id, Arc::from(vec![1, 2, 3]))
            .unwrap();
        obj.header()
            .set_composed_real_array(id, Arc::from([0.5, 1.5]))
            .unwrap();
        assert_eq!(obj.header().get_composed_int_array(id).as_deref(), Some(&[1, 2, 3][..]));
        assert_eq!(obj.header().get_composed_real_array(id).as_deref(), Some(&[0.5, 1.5][..]));
        assert!(obj.header().get_composed_scalar_array(id).is_none());
    }

    #[test]
    fn test_unregistered_id_out_of_range() {
        let obj = probe();
        let bogus = ComposedId(usize::MAX);
        let err = obj.header().set_composed_real(bogus, 1.0).unwrap_err();
        assert!(matches!(err, KeelError::OutOfRange(_)));
        assert_eq!(obj.header().get_composed_real(bogus), None);
    }

    #[test]
    fn test_tables_grow_to_registered_limit() {
        let mut table = ComposedTable::<Int>::default();
        let id = register_composed_id();
        table.set(id, 1, 0).unwrap();
        assert!(table.capacity() >= id.raw() + 1);
        assert_eq!(table.get(id, 0), Some(1));
        assert_eq!(table.get(id, 1), None);
    }
}
