//! Split reductions: many independent collective values, one round trip.
//!
//! Callers queue values with an operator, flush once, then retrieve each
//! result by the ticket they got at queue time.
//!
//! ```text
//!   Collecting ──flush──► Pending ──first retrieve──► Complete
//!       ▲                    │ (synchronous flush)       │
//!       │                    └─────────► Complete         │
//!       └──────────── last ticket retrieved ──────────────┘
//! ```
//!
//! Every participant must queue the same operator sequence in a round; the
//! values travel in a single reduction, with a composite operator when the
//! round mixes sums, maxima and minima.

use crate::comm::{AttrValue, Communicator, Keyval, ReduceRequest, attr_get_as};
use crate::reduce::{ReduceData, ReduceOp, ReduceOps};
use keel_core::{KeelConfig, KeelError, KeelResult, Scalar, Spinlock};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Phase of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    /// Values are being queued.
    Collecting,
    /// The reduction has been started but not waited on.
    Pending,
    /// Global values are available.
    Complete,
}

/// Receipt for a queued value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    round: u64,
    index: usize,
}

impl Ticket {
    /// Round the value was queued in.
    #[inline]
    pub fn round(self) -> u64 {
        self.round
    }

    /// Offset of the value within its round.
    #[inline]
    pub fn index(self) -> usize {
        self.index
    }
}

// =============================================================================
// Split Reduction
// =============================================================================

/// Per-context accumulator of split-reduction values.
pub struct SplitReduction {
    state: SplitState,
    round: u64,
    lvalues: Vec<Scalar>,
    gvalues: Vec<Scalar>,
    ops: Vec<ReduceOp>,
    retrieved: Vec<bool>,
    num_retrieved: usize,
    request: Option<Box<dyn ReduceRequest>>,
    max_ops: usize,
    use_async: bool,
}

impl SplitReduction {
    /// Create an accumulator.
    pub fn new(initial_ops: usize, max_ops: usize, use_async: bool) -> Self {
        let initial_ops = initial_ops.min(max_ops);
        Self {
            state: SplitState::Collecting,
            round: 0,
            lvalues: Vec::with_capacity(initial_ops),
            gvalues: Vec::with_capacity(initial_ops),
            ops: Vec::with_capacity(initial_ops),
            retrieved: Vec::with_capacity(initial_ops),
            num_retrieved: 0,
            request: None,
            max_ops,
            use_async,
        }
    }

    /// Create an accumulator sized by `config`.
    pub fn from_config(config: &KeelConfig) -> Self {
        Self::new(
            config.split_reduction_initial_ops,
            config.split_reduction_max_ops,
            config.split_reduction_async,
        )
    }

    /// Get the accumulator attached to `comm`, creating it on first use.
    pub fn for_comm(comm: &dyn Communicator) -> KeelResult<Arc<Mutex<SplitReduction>>> {
        static ATTACH: Spinlock<()> = Spinlock::new(());
        let _attach = ATTACH.lock();
        if let Some(existing) = attr_get_as::<Mutex<SplitReduction>>(comm, Keyval::SPLIT_REDUCTION) {
            return Ok(existing);
        }
        let created = Arc::new(Mutex::new(SplitReduction::from_config(keel_core::config())));
        let value: AttrValue = created.clone();
        comm.attr_set(Keyval::SPLIT_REDUCTION, value)?;
        Ok(created)
    }

    /// Current phase.
    #[inline]
    pub fn state(&self) -> SplitState {
        self.state
    }

    /// Number of the current round.
    #[inline]
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Number of values queued in the current round.
    #[inline]
    pub fn queued(&self) -> usize {
        self.lvalues.len()
    }

    /// Queue a local value.
    pub fn queue_value(&mut self, value: Scalar, op: ReduceOp) -> KeelResult<Ticket> {
        if self.state != SplitState::Collecting {
            return Err(KeelError::usage(
                "cannot queue a value while a split reduction is in flight; retrieve every result first",
            ));
        }
        if self.lvalues.len() >= self.max_ops {
            return Err(KeelError::exhausted(format!(
                "split reduction holds at most {} values per round",
                self.max_ops
            )));
        }
        let index = self.lvalues.len();
        self.lvalues.push(value);
        self.ops.push(op);
        self.retrieved.push(false);
        Ok(Ticket {
            round: self.round,
            index,
        })
    }

    /// Start the reduction of every queued value (collective when values are
    /// queued).
    pub fn flush(&mut self, comm: &dyn Communicator) -> KeelResult<()> {
        if self.state != SplitState::Collecting || self.lvalues.is_empty() {
            return Ok(());
        }

        let ops = ReduceOps::from_slots(&self.ops);
        let data = ReduceData::Real(self.lvalues.clone());
        debug!(
            context = comm.context_id().raw(),
            round = self.round,
            values = self.lvalues.len(),
            mixed = ops.is_mixed(),
            "flushing split reduction"
        );

        let request = match comm.iall_reduce(data, ops) {
            Ok(request) => request,
            Err(err) => {
                self.reset();
                return Err(err);
            }
        };

        if self.use_async && comm.supports_async() {
            self.request = Some(request);
            self.state = SplitState::Pending;
            Ok(())
        } else {
            self.complete(request)
        }
    }

    fn complete(&mut self, request: Box<dyn ReduceRequest>) -> KeelResult<()> {
        match request.wait().and_then(ReduceData::into_real) {
            Ok(values) => {
                self.gvalues = values;
                self.state = SplitState::Complete;
                Ok(())
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Return the global value for `ticket`, waiting on the reduction if it
    /// is still pending.
    pub fn retrieve_result(&mut self, ticket: Ticket) -> KeelResult<Scalar> {
        if ticket.round != self.round {
            return Err(KeelError::usage(format!(
                "ticket from round {} presented in round {}",
                ticket.round, self.round
            )));
        }
        match self.state {
            SplitState::Collecting => {
                return Err(KeelError::usage(
                    "split reduction results retrieved before the values were flushed",
                ));
            }
            SplitState::Pending => {
                let request = self
                    .request
                    .take()
                    .ok_or_else(|| KeelError::comm("pending split reduction lost its request"))?;
                self.complete(request)?;
            }
            SplitState::Complete => {}
        }

        let value = match (self.retrieved.get(ticket.index), self.gvalues.get(ticket.index)) {
            (Some(false), Some(&value)) => value,
            (Some(true), _) => {
                return Err(KeelError::usage(format!(
                    "split reduction result {} retrieved twice",
                    ticket.index
                )));
            }
            _ => {
                return Err(KeelError::usage(format!(
                    "ticket {} is outside the current round",
                    ticket.index
                )));
            }
        };

        self.retrieved[ticket.index] = true;
        self.num_retrieved += 1;
        if self.num_retrieved == self.lvalues.len() {
            self.reset();
        }
        Ok(value)
    }

    /// Start a new round, keeping buffer capacity.
    fn reset(&mut self) {
        self.lvalues.clear();
        self.gvalues.clear();
        self.ops.clear();
        self.retrieved.clear();
        self.num_retrieved = 0;
        self.request = None;
        self.state = SplitState::Collecting;
        self.round += 1;
    }
}

impl fmt::Debug for SplitReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitReduction")
            .field("state", &self.state)
            .field("round", &self.round)
            .field("queued", &self.lvalues.len())
            .field("retrieved", &self.num_retrieved)
            .field("max_ops", &self.max_ops)
            .field("async", &self.use_async)
            .finish()
    }
}

impl Default for SplitReduction {
    fn default() -> Self {
        Self::from_config(&KeelConfig::default())
    }
}

// =============================================================================
// Context-Level Operations
// =============================================================================

/// Queue `value` on the split reduction of `comm`.
pub fn queue_value(comm: &dyn Communicator, value: Scalar, op: ReduceOp) -> KeelResult<Ticket> {
    SplitReduction::for_comm(comm)?.lock().queue_value(value, op)
}

/// Flush the split reduction of `comm` (collective when values are queued).
pub fn flush(comm: &dyn Communicator) -> KeelResult<()> {
    SplitReduction::for_comm(comm)?.lock().flush(comm)
}

/// Retrieve the global value for `ticket` from the split reduction of `comm`.
pub fn retrieve_result(comm: &dyn Communicator, ticket: Ticket) -> KeelResult<Scalar> {
    SplitReduction::for_comm(comm)?.lock().retrieve_result(ticket)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalComm;

    #[test]
    fn test_single_participant_returns_local_values() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::new(4, 16, false);
        let a = sr.queue_value(2.0, ReduceOp::Sum).unwrap();
        let b = sr.queue_value(7.0, ReduceOp::Max).unwrap();
        let c = sr.queue_value(1.0, ReduceOp::Min).unwrap();
        sr.flush(&*comm).unwrap();
        assert_eq!(sr.state(), SplitState::Complete);
        assert_eq!(sr.retrieve_result(b).unwrap(), 7.0);
        assert_eq!(sr.retrieve_result(a).unwrap(), 2.0);
        assert_eq!(sr.retrieve_result(c).unwrap(), 1.0);
        assert_eq!(sr.state(), SplitState::Collecting);
        assert_eq!(sr.round(), 1);
    }

    #[test]
    fn test_async_flush_is_pending_until_retrieve() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::new(4, 16, true);
        let t = sr.queue_value(3.5, ReduceOp::Sum).unwrap();
        sr.flush(&*comm).unwrap();
        assert_eq!(sr.state(), SplitState::Pending);
        assert_eq!(sr.retrieve_result(t).unwrap(), 3.5);
    }

    #[test]
    fn test_concurrent_attach_shares_one_accumulator() {
        let comm = LocalComm::solo();
        let barrier = std::sync::Barrier::new(4);
        let attached: Vec<Arc<Mutex<SplitReduction>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        SplitReduction::for_comm(&*comm).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(attached.iter().all(|sr| Arc::ptr_eq(sr, &attached[0])));
        let stored = attr_get_as::<Mutex<SplitReduction>>(&*comm, Keyval::SPLIT_REDUCTION).unwrap();
        assert!(Arc::ptr_eq(&stored, &attached[0]));
    }

    #[test]
    fn test_retrieve_before_flush_is_usage_error() {
        let mut sr = SplitReduction::default();
        let t = sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        assert!(matches!(sr.retrieve_result(t), Err(KeelError::Usage(_))));
    }

    #[test]
    fn test_queue_while_in_flight_is_usage_error() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::default();
        sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        sr.flush(&*comm).unwrap();
        assert!(matches!(sr.queue_value(2.0, ReduceOp::Sum), Err(KeelError::Usage(_))));
    }

    #[test]
    fn test_double_retrieve_is_usage_error() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::default();
        let a = sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        sr.queue_value(2.0, ReduceOp::Sum).unwrap();
        sr.flush(&*comm).unwrap();
        sr.retrieve_result(a).unwrap();
        assert!(matches!(sr.retrieve_result(a), Err(KeelError::Usage(_))));
    }

    #[test]
    fn test_stale_ticket_is_usage_error() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::default();
        let old = sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        sr.flush(&*comm).unwrap();
        sr.retrieve_result(old).unwrap();

        sr.queue_value(5.0, ReduceOp::Sum).unwrap();
        sr.flush(&*comm).unwrap();
        assert!(matches!(sr.retrieve_result(old), Err(KeelError::Usage(_))));
    }

    #[test]
    fn test_queue_limit_is_resource_exhausted() {
        let mut sr = SplitReduction::new(1, 2, false);
        sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        sr.queue_value(1.0, ReduceOp::Sum).unwrap();
        assert!(matches!(
            sr.queue_value(1.0, ReduceOp::Sum),
            Err(KeelError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let comm = LocalComm::solo();
        let mut sr = SplitReduction::default();
        sr.flush(&*comm).unwrap();
        assert_eq!(sr.state(), SplitState::Collecting);
        assert_eq!(sr.round(), 0);
    }

    #[test]
    fn test_context_level_functions_share_state() {
        let comm = LocalComm::solo();
        let t = queue_value(&*comm, 4.0, ReduceOp::Max).unwrap();
        flush(&*comm).unwrap();
        assert_eq!(retrieve_result(&*comm, t).unwrap(), 4.0);
        let sr = SplitReduction::for_comm(&*comm).unwrap();
        assert_eq!(sr.lock().round(), 1);
    }
}
