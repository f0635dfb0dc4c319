//! The communication-context abstraction consumed by the object substrate.
//!
//! A communicator denotes a group of cooperating participants together with a
//! private message namespace. Each participant holds its own endpoint; the
//! endpoints of one context share a [`ContextId`].
//!
//! Collective operations (duplication, reductions) must be called by every
//! participant in the same relative order.

use crate::reduce::{ReduceData, ReduceOps};
use keel_core::KeelResult;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shared handle to a communicator endpoint.
pub type CommRef = Arc<dyn Communicator>;

/// Value stored in a communicator attribute slot.
pub type AttrValue = Arc<dyn Any + Send + Sync>;

/// Message tag.
pub type Tag = i32;

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of a communication context, equal on every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Get raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identity of a process group; duplicates of a context share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GroupId(pub u64);

/// Attribute key.
///
/// The low keys are reserved for the communicator registry and the split
/// reduction; other users allocate keys with [`Keyval::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Keyval(pub u32);

impl Keyval {
    /// Registry entry attached to a duplicated context.
    pub const COUNTER: Self = Self(1);
    /// Link from an outer context to its duplicate.
    pub const INNER_COMM: Self = Self(2);
    /// Split-reduction state of a context.
    pub const SPLIT_REDUCTION: Self = Self(3);

    /// First key handed out by [`Keyval::create`].
    pub const FIRST_USER_KEY: u32 = 16;

    /// Allocate a fresh attribute key.
    pub fn create() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(Keyval::FIRST_USER_KEY);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Result of comparing two communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommCompare {
    /// Same context.
    Ident,
    /// Same group of participants, different context.
    Congruent,
    /// Different groups.
    Unequal,
}

impl CommCompare {
    /// Whether objects on the two communicators may inter-operate.
    #[inline]
    pub fn is_compatible(self) -> bool {
        matches!(self, CommCompare::Ident | CommCompare::Congruent)
    }
}

// =============================================================================
// Communicator Trait
// =============================================================================

/// Pending non-blocking reduction.
pub trait ReduceRequest: Send {
    /// Block until the reduction completes and return the reduced values.
    fn wait(self: Box<Self>) -> KeelResult<ReduceData>;

    /// Whether the reduction has completed.
    fn test(&self) -> bool;
}

/// One participant's endpoint of a communication context.
pub trait Communicator: Send + Sync + fmt::Debug {
    /// Index of this participant in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn size(&self) -> usize;

    /// Identity of the context.
    fn context_id(&self) -> ContextId;

    /// Identity of the participant group.
    fn group_id(&self) -> GroupId;

    /// Largest usable tag value.
    fn tag_upper_bound(&self) -> Tag;

    /// Create a new context over the same group (collective).
    fn duplicate(&self) -> KeelResult<CommRef>;

    /// Release the endpoint; attributes are dropped.
    fn free(&self) -> KeelResult<()>;

    /// Whether [`Communicator::free`] has been called.
    fn is_freed(&self) -> bool;

    /// Read an attribute.
    fn attr_get(&self, key: Keyval) -> Option<AttrValue>;

    /// Store an attribute, replacing any previous value.
    fn attr_set(&self, key: Keyval, value: AttrValue) -> KeelResult<()>;

    /// Remove an attribute and return it.
    fn attr_delete(&self, key: Keyval) -> Option<AttrValue>;

    /// Start a reduction over every participant's `data` (collective).
    fn iall_reduce(&self, data: ReduceData, ops: ReduceOps) -> KeelResult<Box<dyn ReduceRequest>>;

    /// Reduce over every participant's `data` and wait for the result
    /// (collective).
    fn all_reduce(&self, data: ReduceData, ops: ReduceOps) -> KeelResult<ReduceData> {
        self.iall_reduce(data, ops)?.wait()
    }

    /// Whether [`Communicator::iall_reduce`] progresses without the caller.
    fn supports_async(&self) -> bool {
        true
    }
}

/// Compare two communicator endpoints.
pub fn compare(a: &dyn Communicator, b: &dyn Communicator) -> CommCompare {
    if a.context_id() == b.context_id() {
        CommCompare::Ident
    } else if a.group_id() == b.group_id() {
        CommCompare::Congruent
    } else {
        CommCompare::Unequal
    }
}

/// Read an attribute and downcast it to `T`.
pub fn attr_get_as<T: Any + Send + Sync>(comm: &dyn Communicator, key: Keyval) -> Option<Arc<T>> {
    comm.attr_get(key).and_then(|value| value.downcast::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyval_create_is_above_reserved() {
        let a = Keyval::create();
        let b = Keyval::create();
        assert!(a.0 >= Keyval::FIRST_USER_KEY);
        assert_ne!(a, b);
    }

    #[test]
    fn test_compare_compatibility() {
        assert!(CommCompare::Ident.is_compatible());
        assert!(CommCompare::Congruent.is_compatible());
        assert!(!CommCompare::Unequal.is_compatible());
    }
}
