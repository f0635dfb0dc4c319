//! In-process communicator.
//!
//! Participants are threads of one process. Each holds a [`LocalComm`]
//! endpoint; endpoints of one context share a rendezvous table where
//! reductions meet.
//!
//! # Collective Matching
//!
//! Every endpoint numbers its collectives. The n-th reduction of each
//! participant on a context lands in round n of the shared table, so
//! participants that call collectives in the same relative order meet
//! without further coordination. Duplication follows the same rule: the
//! n-th `duplicate` of each participant yields an endpoint of the same child
//! context.
//!
//! ```text
//!   rank 0 ──iall_reduce(seq 4)──┐
//!   rank 1 ──iall_reduce(seq 4)──┼──► rounds[4] ── complete ──► wait()
//!   rank 2 ──iall_reduce(seq 4)──┘
//! ```

use crate::comm::{
    AttrValue, CommRef, Communicator, ContextId, GroupId, Keyval, ReduceRequest, Tag,
};
use crate::reduce::{ReduceData, ReduceOps};
use keel_core::{KeelError, KeelResult};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Tag upper bound of new worlds.
pub const DEFAULT_TAG_UPPER_BOUND: Tag = i32::MAX;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Shared Context State
// =============================================================================

/// One in-flight reduction.
struct Round {
    arrived: usize,
    collected: usize,
    ops: ReduceOps,
    accum: Option<ReduceData>,
    error: Option<KeelError>,
}

/// State shared by every endpoint of one context.
struct ContextShared {
    id: ContextId,
    group: GroupId,
    size: usize,
    tag_upper_bound: Tag,
    rounds: Mutex<FxHashMap<u64, Round>>,
    ready: Condvar,
    children: Mutex<Vec<Arc<ContextShared>>>,
}

impl ContextShared {
    fn new(group: GroupId, size: usize, tag_upper_bound: Tag) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            group,
            size,
            tag_upper_bound,
            rounds: Mutex::new(FxHashMap::default()),
            ready: Condvar::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Child context for the `index`-th duplication.
    fn child(&self, index: usize) -> Arc<ContextShared> {
        let mut children = self.children.lock();
        while children.len() <= index {
            children.push(ContextShared::new(
                self.group,
                self.size,
                self.tag_upper_bound,
            ));
        }
        Arc::clone(&children[index])
    }

    /// Fold one participant's buffer into round `seq`.
    fn contribute(&self, seq: u64, data: ReduceData, ops: ReduceOps) {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(seq).or_insert_with(|| Round {
            arrived: 0,
            collected: 0,
            ops: ops.clone(),
            accum: None,
            error: None,
        });

        if round.error.is_none() {
            if round.ops != ops {
                round.error = Some(KeelError::comm(format!(
                    "collective {} called with different operators",
                    seq
                )));
            } else {
                match round.accum.as_mut() {
                    None => round.accum = Some(data),
                    Some(acc) => {
                        if let Err(err) = acc.combine(&data, &ops) {
                            round.error = Some(err);
                        }
                    }
                }
            }
        }

        round.arrived += 1;
        if round.arrived == self.size {
            self.ready.notify_all();
        }
    }

    /// Block until round `seq` is complete and take this participant's copy.
    fn wait(&self, seq: u64) -> KeelResult<ReduceData> {
        let mut rounds = self.rounds.lock();
        loop {
            let round = rounds
                .get_mut(&seq)
                .ok_or_else(|| KeelError::comm(format!("collective {} is unknown", seq)))?;
            if round.arrived == self.size {
                round.collected += 1;
                let outcome = match (&round.error, &round.accum) {
                    (Some(err), _) => Err(err.clone()),
                    (None, Some(data)) => Ok(data.clone()),
                    (None, None) => Err(KeelError::comm("collective completed without data")),
                };
                if round.collected == self.size {
                    rounds.remove(&seq);
                }
                return outcome;
            }
            self.ready.wait(&mut rounds);
        }
    }

    fn is_complete(&self, seq: u64) -> bool {
        self.rounds
            .lock()
            .get(&seq)
            .is_some_and(|round| round.arrived == self.size)
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// One participant's endpoint of an in-process context.
pub struct LocalComm {
    shared: Arc<ContextShared>,
    rank: usize,
    next_seq: AtomicU64,
    dup_count: AtomicUsize,
    attrs: Mutex<FxHashMap<Keyval, AttrValue>>,
    freed: AtomicBool,
}

impl LocalComm {
    fn endpoint(shared: Arc<ContextShared>, rank: usize) -> Self {
        Self {
            shared,
            rank,
            next_seq: AtomicU64::new(0),
            dup_count: AtomicUsize::new(0),
            attrs: Mutex::new(FxHashMap::default()),
            freed: AtomicBool::new(false),
        }
    }

    /// A context with a single participant.
    pub fn solo() -> CommRef {
        LocalWorld::new(1).endpoints().remove(0)
    }

    fn ensure_live(&self) -> KeelResult<()> {
        if self.freed.load(Ordering::Acquire) {
            Err(KeelError::invalid(format!(
                "communicator {} (rank {}) has been freed",
                self.shared.id.raw(),
                self.rank
            )))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("context", &self.shared.id)
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .field("freed", &self.freed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Communicator for LocalComm {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.shared.size
    }

    #[inline]
    fn context_id(&self) -> ContextId {
        self.shared.id
    }

    #[inline]
    fn group_id(&self) -> GroupId {
        self.shared.group
    }

    #[inline]
    fn tag_upper_bound(&self) -> Tag {
        self.shared.tag_upper_bound
    }

    fn duplicate(&self) -> KeelResult<CommRef> {
        self.ensure_live()?;
        let index = self.dup_count.fetch_add(1, Ordering::Relaxed);
        let child = self.shared.child(index);
        Ok(Arc::new(LocalComm::endpoint(child, self.rank)))
    }

    fn free(&self) -> KeelResult<()> {
        if self.freed.swap(true, Ordering::AcqRel) {
            return Err(KeelError::invalid("communicator freed twice"));
        }
        // Attribute values may own other endpoints; drop them outside the lock.
        let attrs = std::mem::take(&mut *self.attrs.lock());
        drop(attrs);
        Ok(())
    }

    fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    fn attr_get(&self, key: Keyval) -> Option<AttrValue> {
        self.attrs.lock().get(&key).cloned()
    }

    fn attr_set(&self, key: Keyval, value: AttrValue) -> KeelResult<()> {
        self.ensure_live()?;
        let previous = self.attrs.lock().insert(key, value);
        drop(previous);
        Ok(())
    }

    fn attr_delete(&self, key: Keyval) -> Option<AttrValue> {
        self.attrs.lock().remove(&key)
    }

    fn iall_reduce(&self, data: ReduceData, ops: ReduceOps) -> KeelResult<Box<dyn ReduceRequest>> {
        self.ensure_live()?;
        ops.validate(data.len())?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.contribute(seq, data, ops);
        Ok(Box::new(LocalRequest {
            shared: Arc::clone(&self.shared),
            seq,
        }))
    }
}

/// Pending reduction on a [`LocalComm`].
struct LocalRequest {
    shared: Arc<ContextShared>,
    seq: u64,
}

impl ReduceRequest for LocalRequest {
    fn wait(self: Box<Self>) -> KeelResult<ReduceData> {
        self.shared.wait(self.seq)
    }

    fn test(&self) -> bool {
        self.shared.is_complete(self.seq)
    }
}

// =============================================================================
// World
// =============================================================================

/// Factory for the endpoints of a fresh in-process context.
#[derive(Debug, Clone, Copy)]
pub struct LocalWorld {
    size: usize,
    tag_upper_bound: Tag,
}

impl LocalWorld {
    /// A world of `size` participants (at least one).
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            tag_upper_bound: DEFAULT_TAG_UPPER_BOUND,
        }
    }

    /// Override the largest usable tag.
    pub fn with_tag_upper_bound(mut self, tag_upper_bound: Tag) -> Self {
        self.tag_upper_bound = tag_upper_bound;
        self
    }

    /// Number of participants.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Create the endpoints, indexed by rank.
    pub fn endpoints(&self) -> Vec<CommRef> {
        let group = GroupId(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed));
        let shared = ContextShared::new(group, self.size, self.tag_upper_bound);
        (0..self.size)
            .map(|rank| Arc::new(LocalComm::endpoint(Arc::clone(&shared), rank)) as CommRef)
            .collect()
    }

    /// Run `body` once per participant, each on its own thread, and collect
    /// the results in rank order.
    ///
    /// A panic on any participant is resumed on the caller.
    pub fn run<R, F>(&self, body: F) -> Vec<R>
    where
        R: Send,
        F: Fn(CommRef) -> R + Sync,
    {
        let endpoints = self.endpoints();
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(value) => value,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
