//! Registry of duplicated communication contexts.
//!
//! Objects never communicate on the context handed to them. The first object
//! created on an outer context duplicates it; every later object on the same
//! outer context shares that duplicate. The duplicate carries a
//! [`CommEntry`] attribute with the refcount, the next tag and the
//! name-generation counter; the outer context carries a link to the duplicate.
//!
//! ```text
//!   outer ──INNER_COMM──► inner ──COUNTER──► CommEntry { tag, refcount, .. }
//! ```
//!
//! When the last user releases the duplicate it is either freed or parked on a
//! free list keyed by the outer context, to be handed out again by the next
//! [`CommRegistry::get_or_duplicate`] of that outer context.

use crate::comm::{CommRef, Communicator, ContextId, Keyval, Tag, attr_get_as};
use keel_core::{KeelError, KeelResult, Spinlock};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info};

/// First tag issued on a fresh duplicate; lower tags are reserved.
pub const FIRST_TAG: Tag = 128;

// =============================================================================
// Entry
// =============================================================================

/// Mutable state of one registered duplicate.
#[derive(Debug)]
struct CommCounter {
    tag: Tag,
    refcount: usize,
    namecount: u64,
    /// Contexts lent out through [`CommRegistry::lend_comm`] and returned.
    stash: Vec<CommRef>,
    outer: Weak<dyn Communicator>,
    outer_key: (ContextId, usize),
}

/// Registry entry attached to a duplicate under [`Keyval::COUNTER`].
#[derive(Debug)]
pub struct CommEntry {
    counter: Mutex<CommCounter>,
}

/// Link attached to an outer context under [`Keyval::INNER_COMM`].
#[derive(Debug)]
struct InnerLink(CommRef);

/// A released duplicate waiting for reuse.
#[derive(Debug)]
struct Parked {
    comm: CommRef,
    next_tag: Tag,
}

#[inline]
fn entry_of(comm: &dyn Communicator) -> Option<Arc<CommEntry>> {
    attr_get_as::<CommEntry>(comm, Keyval::COUNTER)
}

fn registered_entry(comm: &dyn Communicator) -> KeelResult<Arc<CommEntry>> {
    entry_of(comm).ok_or_else(|| {
        KeelError::invalid(format!(
            "communicator {} was not obtained from get_or_duplicate",
            comm.context_id().raw()
        ))
    })
}

// =============================================================================
// Registry
// =============================================================================

/// Process-wide bookkeeping of duplicated contexts.
pub struct CommRegistry {
    reuse: bool,
    /// Held while an entry or link is looked up and attached, and while a
    /// refcount drops to zero and the entry is detached.
    entries: Spinlock<()>,
    free_lists: Spinlock<FxHashMap<(ContextId, usize), Vec<Parked>>>,
}

impl CommRegistry {
    /// Create a registry; `reuse` parks released duplicates for later use.
    pub fn new(reuse: bool) -> Self {
        Self {
            reuse,
            entries: Spinlock::new(()),
            free_lists: Spinlock::new(FxHashMap::default()),
        }
    }

    /// Whether released duplicates are kept for reuse.
    #[inline]
    pub fn reuses_communicators(&self) -> bool {
        self.reuse
    }

    /// Get the private duplicate of `comm` and a fresh tag on it (collective).
    ///
    /// - `comm` already a registered duplicate: its refcount is bumped.
    /// - `comm` has a registered duplicate: that duplicate's refcount is bumped.
    /// - otherwise a parked duplicate of `comm` is reused, or `comm` is
    ///   duplicated, and a fresh entry is attached.
    ///
    /// Concurrent callers on one context are serialized and share a single
    /// duplicate.
    pub fn get_or_duplicate(&self, comm: &CommRef) -> KeelResult<(CommRef, Tag)> {
        let _entries = self.entries.lock();
        let inner = if let Some(entry) = entry_of(&**comm) {
            entry.counter.lock().refcount += 1;
            Arc::clone(comm)
        } else if let Some(link) = attr_get_as::<InnerLink>(&**comm, Keyval::INNER_COMM) {
            let inner = Arc::clone(&link.0);
            let entry = entry_of(&*inner)
                .ok_or_else(|| KeelError::invalid("inner communicator lost its registry entry"))?;
            entry.counter.lock().refcount += 1;
            inner
        } else {
            self.attach(comm)?
        };

        let tag = self.get_new_tag(&inner)?;
        Ok((inner, tag))
    }

    fn attach(&self, outer: &CommRef) -> KeelResult<CommRef> {
        let key = (outer.context_id(), outer.rank());
        let parked = if self.reuse {
            self.free_lists.lock().get_mut(&key).and_then(Vec::pop)
        } else {
            None
        };

        let (inner, first_tag) = match parked {
            Some(parked) => {
                debug!(
                    outer = key.0.raw(),
                    inner = parked.comm.context_id().raw(),
                    rank = key.1,
                    "reusing parked communicator"
                );
                (parked.comm, parked.next_tag)
            }
            None => {
                let inner = outer.duplicate().inspect_err(|err| {
                    error!(outer = key.0.raw(), rank = key.1, %err, "communicator duplication failed");
                })?;
                debug!(
                    outer = key.0.raw(),
                    inner = inner.context_id().raw(),
                    rank = key.1,
                    "duplicated communicator"
                );
                (inner, FIRST_TAG)
            }
        };

        let entry = CommEntry {
            counter: Mutex::new(CommCounter {
                tag: first_tag,
                refcount: 1,
                namecount: 0,
                stash: Vec::new(),
                outer: Arc::downgrade(outer),
                outer_key: key,
            }),
        };
        inner.attr_set(Keyval::COUNTER, Arc::new(entry))?;
        outer.attr_set(Keyval::INNER_COMM, Arc::new(InnerLink(Arc::clone(&inner))))?;
        Ok(inner)
    }

    /// Issue the next tag on a registered duplicate.
    ///
    /// Tags increase up to the context's tag upper bound, then start over at
    /// [`FIRST_TAG`].
    pub fn get_new_tag(&self, comm: &CommRef) -> KeelResult<Tag> {
        let entry = registered_entry(&**comm)?;
        let mut counter = entry.counter.lock();
        let tag = counter.tag;
        counter.tag = if tag >= comm.tag_upper_bound() {
            info!(
                context = comm.context_id().raw(),
                upper_bound = comm.tag_upper_bound(),
                "out of tags for object, starting to recycle"
            );
            FIRST_TAG
        } else {
            tag + 1
        };
        Ok(tag)
    }

    /// Drop one reference to a registered duplicate.
    ///
    /// At zero the entry is removed; the duplicate is parked for reuse or
    /// freed, and contexts lent out from it are freed. Every lent context is
    /// freed even when one fails; the first failure is returned.
    pub fn release(&self, comm: &CommRef) -> KeelResult<()> {
        let _entries = self.entries.lock();
        let entry = registered_entry(&**comm)?;
        let (outer, outer_key, next_tag, stash) = {
            let mut counter = entry.counter.lock();
            if counter.refcount == 0 {
                return Err(KeelError::invalid("communicator released more often than obtained"));
            }
            counter.refcount -= 1;
            if counter.refcount > 0 {
                return Ok(());
            }
            (
                counter.outer.upgrade(),
                counter.outer_key,
                counter.tag,
                std::mem::take(&mut counter.stash),
            )
        };

        comm.attr_delete(Keyval::COUNTER);
        if let Some(outer) = &outer {
            outer.attr_delete(Keyval::INNER_COMM);
        }
        let lent_result = stash
            .into_iter()
            .map(|lent| lent.free())
            .fold(Ok(()), |acc, r| acc.and(r));

        let own_result = if self.reuse && outer.is_some() {
            debug!(
                outer = outer_key.0.raw(),
                inner = comm.context_id().raw(),
                rank = outer_key.1,
                "parking released communicator"
            );
            self.free_lists
                .lock()
                .entry(outer_key)
                .or_default()
                .push(Parked {
                    comm: Arc::clone(comm),
                    next_tag,
                });
            Ok(())
        } else {
            debug!(inner = comm.context_id().raw(), "freeing released communicator");
            comm.free()
        };
        lent_result.and(own_result)
    }

    /// Current refcount of a registered duplicate.
    pub fn refcount(&self, comm: &dyn Communicator) -> Option<usize> {
        entry_of(comm).map(|entry| entry.counter.lock().refcount)
    }

    /// Whether `comm` is a registered duplicate.
    pub fn is_registered(&self, comm: &dyn Communicator) -> bool {
        entry_of(comm).is_some()
    }

    /// Next value of the name-generation counter of a registered duplicate.
    pub fn next_name_index(&self, comm: &dyn Communicator) -> KeelResult<u64> {
        let entry = registered_entry(comm)?;
        let mut counter = entry.counter.lock();
        let index = counter.namecount;
        counter.namecount += 1;
        Ok(index)
    }

    /// Hand out a context for exclusive use by another package (collective
    /// when nothing is stashed).
    pub fn lend_comm(&self, comm: &CommRef) -> KeelResult<CommRef> {
        let entry = registered_entry(&**comm)?;
        let stashed = entry.counter.lock().stash.pop();
        match stashed {
            Some(lent) => Ok(lent),
            None => comm.duplicate(),
        }
    }

    /// Give back a context obtained from [`CommRegistry::lend_comm`].
    pub fn return_comm(&self, comm: &CommRef, lent: CommRef) -> KeelResult<()> {
        let entry = registered_entry(&**comm)?;
        entry.counter.lock().stash.push(lent);
        Ok(())
    }

    /// Number of parked duplicates.
    pub fn parked_count(&self) -> usize {
        self.free_lists.lock().values().map(Vec::len).sum()
    }

    /// Free every parked duplicate and return how many were freed.
    pub fn free_parked(&self) -> KeelResult<usize> {
        let parked: Vec<Parked> = {
            let mut lists = self.free_lists.lock();
            lists.drain().flat_map(|(_, list)| list).collect()
        };
        let count = parked.len();
        for entry in parked {
            entry.comm.free()?;
        }
        if count > 0 {
            debug!(count, "freed parked communicators");
        }
        Ok(count)
    }
}

impl Default for CommRegistry {
    fn default() -> Self {
        Self::new(keel_core::config().reuse_communicators)
    }
}

// =============================================================================
// Global Registry Access
// =============================================================================

static COMM_REGISTRY: OnceLock<CommRegistry> = OnceLock::new();

/// Get the process-wide communicator registry.
#[inline]
pub fn comm_registry() -> &'static CommRegistry {
    COMM_REGISTRY.get_or_init(CommRegistry::default)
}

// =============================================================================
// Tests
// =============================================================================
