//! Object substrate for keel entities.
//!
//! This crate provides:
//! - The object header, the four-slot vtable and logical reference counting
//! - The class registry for fast type checks
//! - Attribute directories and optional-capability calls
//! - Version-stamped composed data
//! - Per-instance callback slots and options handlers
//! - Debug-build validity and collective-consistency checks
//! - Library initialization and finalization

pub mod object;

// Re-export commonly used items
pub use object::callback::{
    CallbackRange, CallbackRegistry, CallbackType, SMALLEST_CALLBACK_ID, callback_registry,
};
pub use object::compose::{ComposeOps, ErasedFn, try_method, use_method};
pub use object::composed::{ComposedId, register_composed_id, registered_composed_ids};
pub use object::container::{Container, container_class_id};
pub use object::options::{MAX_OPTIONS_HANDLERS, OptionsDestroyFn, OptionsHandlerFn};
pub use object::registry::{ClassId, ClassRegistry, base_class_id, class_registry};
pub use object::view::{default_view, view, view_to_stream};
pub use object::{
    DestroyFn, GetCommFn, HeaderFlags, KeelObject, ObjectHeader, ObjectId, ObjectOps, ObjectRef,
    ViewFn, destroy_object, downcast_object,
};

use keel_comm::comm_registry;
use keel_core::{KeelConfig, KeelResult};

/// Install `config` and register the built-in classes.
///
/// Must run before anything reads the configuration; afterwards it is a
/// usage error.
pub fn initialize(config: KeelConfig) -> KeelResult<()> {
    keel_core::configure(config)?;
    let base = base_class_id();
    let container = container_class_id();
    tracing::debug!(base = base.raw(), container = container.raw(), "keel initialized");
    Ok(())
}

/// Free every parked communicator; returns how many were freed.
pub fn finalize() -> KeelResult<usize> {
    let freed = comm_registry().free_parked()?;
    tracing::debug!(freed, "keel finalized");
    Ok(freed)
}
