//! Communication contexts for keel objects.
//!
//! This crate provides:
//! - The `Communicator` abstraction and reduction kernels
//! - `LocalComm`, an in-process communicator whose participants are threads
//! - The registry of duplicated contexts with deterministic tag allocation
//! - Split reductions that coalesce many collective values into one round trip

pub mod comm;
pub mod local;
pub mod reduce;
pub mod registry;
pub mod split;

pub use comm::{
    AttrValue, CommCompare, CommRef, Communicator, ContextId, GroupId, Keyval, ReduceRequest, Tag,
    attr_get_as, compare,
};
pub use local::{LocalComm, LocalWorld};
pub use reduce::{ReduceData, ReduceOp, ReduceOps};
pub use registry::{CommRegistry, FIRST_TAG, comm_registry};
pub use split::{SplitReduction, SplitState, Ticket, flush, queue_value, retrieve_result};
