//! Core object header and reference types.
//!
//! Every keel entity embeds an [`ObjectHeader`] and implements [`KeelObject`].
//! The header carries the class id and the four-slot vtable used for
//! dispatch, the logical reference count, the version counter that stamps
//! composed data, naming fields, and the per-object tables (attribute
//! directories, composed data, callback slots, options handlers).
//!
//! # Lifetime
//!
//! Storage is owned through `Arc`; the logical reference count is separate.
//! [`destroy_object`] drops one logical reference and, at zero, runs the
//! kind's destroy routine followed by [`ObjectHeader::destroy`]. A header
//! dropped without having been destroyed destroys itself.

pub mod callback;
pub mod compose;
pub mod composed;
pub mod container;
pub mod options;
pub mod registry;
pub mod validate;
pub mod view;

use crate::object::callback::{CallbackTable, callback_registry};
use crate::object::compose::{ComposeOps, FunctionList, ObjectList};
use crate::object::composed::ComposedData;
use crate::object::options::OptionsHandlers;
use crate::object::registry::{ClassId, class_registry};
use keel_comm::{CommRef, Tag, comm_registry};
use keel_core::{KeelError, KeelResult};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Shared handle to any keel object.
pub type ObjectRef = Arc<dyn KeelObject>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Get raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

bitflags::bitflags! {
    /// Per-object state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// The name was generated rather than set.
        const NAME_GENERATED = 1 << 0;
        /// Options handlers have run at least once.
        const OPTIONS_PROCESSED = 1 << 1;
    }
}

// =============================================================================
// Vtable
// =============================================================================

/// Return the communicator of an object.
pub type GetCommFn = fn(&ObjectHeader) -> KeelResult<CommRef>;

/// Render an object.
pub type ViewFn = fn(&dyn KeelObject, &mut dyn fmt::Write) -> KeelResult<()>;

/// Release the kind-specific state of an object.
pub type DestroyFn = fn(&dyn KeelObject) -> KeelResult<()>;

/// The universal four-slot vtable.
#[derive(Debug, Clone, Copy)]
pub struct ObjectOps {
    /// Communicator accessor.
    pub get_comm: GetCommFn,
    /// Viewer; `None` renders the generic summary.
    pub view: Option<ViewFn>,
    /// Kind-specific destroy routine.
    pub destroy: Option<DestroyFn>,
    /// Attribute composition and lookup.
    pub compose: ComposeOps,
}

impl ObjectOps {
    /// Vtable with the generic communicator accessor and attribute
    /// directories.
    pub fn new(destroy: Option<DestroyFn>, view: Option<ViewFn>) -> Self {
        Self {
            get_comm: header_comm,
            view,
            destroy,
            compose: ComposeOps::DIRECTORY,
        }
    }
}

impl Default for ObjectOps {
    fn default() -> Self {
        Self::new(None, None)
    }
}

fn header_comm(header: &ObjectHeader) -> KeelResult<CommRef> {
    header
        .comm
        .read()
        .clone()
        .ok_or_else(|| KeelError::invalid(format!("object {} has been destroyed", header.id.raw())))
}

// =============================================================================
// Object Header
// =============================================================================

#[derive(Debug, Default)]
struct Naming {
    name: Option<String>,
    type_name: Option<String>,
    prefix: Option<String>,
    tab_level: usize,
}

struct ParentLink {
    object: Weak<dyn KeelObject>,
    id: ObjectId,
}

/// Common leading structure of every keel entity.
pub struct ObjectHeader {
    class_id: AtomicI32,
    class_name: Arc<str>,
    description: String,
    section: String,
    ops: ObjectOps,
    comm: RwLock<Option<CommRef>>,
    tag: Tag,
    id: ObjectId,
    refct: AtomicUsize,
    version: AtomicU64,
    flags: AtomicU32,
    naming: RwLock<Naming>,
    parent: Mutex<Option<ParentLink>>,
    pub(crate) olist: Mutex<ObjectList>,
    pub(crate) qlist: Mutex<FunctionList>,
    pub(crate) composed: RwLock<ComposedData>,
    pub(crate) callbacks: RwLock<CallbackTable>,
    pub(crate) options: Mutex<OptionsHandlers>,
}

impl ObjectHeader {
    /// Create a header with refcount 1 and version 0 (collective on `comm`).
    ///
    /// The header communicates on the private duplicate of `comm` and keeps
    /// the first tag issued on it.
    pub fn create(
        class_id: ClassId,
        class_name: &str,
        description: &str,
        section: &str,
        comm: &CommRef,
        destroy: Option<DestroyFn>,
        view: Option<ViewFn>,
    ) -> KeelResult<Self> {
        if !class_registry().contains(class_id) {
            return Err(KeelError::out_of_range(format!(
                "class id {} of {} was never registered",
                class_id.raw(),
                class_name
            )));
        }

        let (inner, tag) = comm_registry().get_or_duplicate(comm)?;
        let (class_slots, subtype_slots) = callback_registry().get_sizes(class_id);
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        trace!(class = class_name, id = id.raw(), tag, "created object");

        Ok(Self {
            class_id: AtomicI32::new(class_id.raw()),
            class_name: Arc::from(class_name),
            description: description.to_string(),
            section: section.to_string(),
            ops: ObjectOps::new(destroy, view),
            comm: RwLock::new(Some(inner)),
            tag,
            id,
            refct: AtomicUsize::new(1),
            version: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            naming: RwLock::new(Naming::default()),
            parent: Mutex::new(None),
            olist: Mutex::new(ObjectList::default()),
            qlist: Mutex::new(FunctionList::default()),
            composed: RwLock::new(ComposedData::default()),
            callbacks: RwLock::new(CallbackTable::with_sizes(class_slots, subtype_slots)),
            options: Mutex::new(OptionsHandlers::default()),
        })
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Class id; [`ClassId::FREED`] once destroyed.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        ClassId(self.class_id.load(Ordering::Acquire))
    }

    /// Check if the header has been destroyed.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.class_id().is_freed()
    }

    /// Name of the class.
    #[inline]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// One-line description of the class.
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Manual section the class is documented in.
    #[inline]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Process-wide unique id.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Tag reserved for this object's messages.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The vtable.
    #[inline]
    pub fn ops(&self) -> &ObjectOps {
        &self.ops
    }

    /// Replace the vtable; only possible before the object is shared.
    pub fn set_ops(&mut self, ops: ObjectOps) {
        self.ops = ops;
    }

    /// Communicator of the object, through the vtable.
    #[inline]
    pub fn comm(&self) -> KeelResult<CommRef> {
        (self.ops.get_comm)(self)
    }

    /// State bits.
    #[inline]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn insert_flags(&self, flags: HeaderFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    fn ensure_live(&self) -> KeelResult<()> {
        if self.is_destroyed() {
            Err(KeelError::invalid(format!(
                "object {} has been destroyed",
                self.id.raw()
            )))
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Reference Counting
    // -------------------------------------------------------------------------

    /// Current logical reference count.
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refct.load(Ordering::Acquire)
    }

    /// Take a logical reference; returns the new count.
    pub fn reference(&self) -> KeelResult<usize> {
        self.ensure_live()?;
        Ok(self.refct.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drop a logical reference without destroying; returns the new count.
    pub fn dereference(&self) -> KeelResult<usize> {
        self.ensure_live()?;
        self.refct
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                KeelError::invalid(format!(
                    "object {} has no references left",
                    self.id.raw()
                ))
            })
    }

    // -------------------------------------------------------------------------
    // Version
    // -------------------------------------------------------------------------

    /// Current version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Mark the object as changed, invalidating every composed value.
    #[inline]
    pub fn increment_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    // -------------------------------------------------------------------------
    // Naming
    // -------------------------------------------------------------------------

    /// Set the name.
    pub fn set_name(&self, name: &str) {
        self.naming.write().name = Some(name.to_string());
        self.flags
            .fetch_and(!HeaderFlags::NAME_GENERATED.bits(), Ordering::Relaxed);
    }

    /// Name of the object, generating `<ClassName>_<n>` when none was set.
    ///
    /// Generation draws `n` from the communicator's name counter, so it is
    /// identical on every participant when called collectively.
    pub fn name(&self) -> KeelResult<String> {
        if let Some(name) = self.naming.read().name.clone() {
            return Ok(name);
        }
        let comm = self.comm()?;
        let index = comm_registry().next_name_index(&*comm)?;
        let generated = format!("{}_{}", self.class_name, index);

        let mut naming = self.naming.write();
        match &naming.name {
            Some(existing) => Ok(existing.clone()),
            None => {
                naming.name = Some(generated.clone());
                self.insert_flags(HeaderFlags::NAME_GENERATED);
                Ok(generated)
            }
        }
    }

    /// Name if one was set or generated already.
    pub fn name_if_set(&self) -> Option<String> {
        self.naming.read().name.clone()
    }

    /// Set the implementation (subtype) name.
    pub fn set_type_name(&self, type_name: &str) {
        self.naming.write().type_name = Some(type_name.to_string());
    }

    /// Implementation name, if set.
    pub fn type_name(&self) -> Option<String> {
        self.naming.read().type_name.clone()
    }

    /// Check if the implementation name equals `type_name`.
    pub fn type_compare(&self, type_name: &str) -> bool {
        self.naming.read().type_name.as_deref() == Some(type_name)
    }

    /// Check if the implementation name is any of `type_names`.
    pub fn type_compare_any(&self, type_names: &[&str]) -> bool {
        let naming = self.naming.read();
        naming
            .type_name
            .as_deref()
            .is_some_and(|current| type_names.contains(&current))
    }

    // -------------------------------------------------------------------------
    // Options Prefix
    // -------------------------------------------------------------------------

    fn check_prefix(prefix: &str) -> KeelResult<()> {
        if prefix.starts_with('-') {
            Err(KeelError::usage(format!(
                "options prefix {:?} should not begin with a hyphen",
                prefix
            )))
        } else {
            Ok(())
        }
    }

    /// Set or clear the options prefix.
    pub fn set_options_prefix(&self, prefix: Option<&str>) -> KeelResult<()> {
        if let Some(prefix) = prefix {
            Self::check_prefix(prefix)?;
        }
        self.naming.write().prefix = prefix.filter(|p| !p.is_empty()).map(str::to_string);
        Ok(())
    }

    /// Append to the options prefix.
    pub fn append_options_prefix(&self, suffix: &str) -> KeelResult<()> {
        Self::check_prefix(suffix)?;
        let mut naming = self.naming.write();
        let combined = format!("{}{}", naming.prefix.as_deref().unwrap_or(""), suffix);
        naming.prefix = (!combined.is_empty()).then_some(combined);
        Ok(())
    }

    /// Prepend to the options prefix.
    pub fn prepend_options_prefix(&self, head: &str) -> KeelResult<()> {
        Self::check_prefix(head)?;
        let mut naming = self.naming.write();
        let combined = format!("{}{}", head, naming.prefix.as_deref().unwrap_or(""));
        naming.prefix = (!combined.is_empty()).then_some(combined);
        Ok(())
    }

    /// Options prefix, if set.
    pub fn options_prefix(&self) -> Option<String> {
        self.naming.read().prefix.clone()
    }

    // -------------------------------------------------------------------------
    // Tab Level
    // -------------------------------------------------------------------------

    /// Indentation level for nested output.
    #[inline]
    pub fn tab_level(&self) -> usize {
        self.naming.read().tab_level
    }

    /// Set the indentation level.
    pub fn set_tab_level(&self, level: usize) {
        self.naming.write().tab_level = level;
    }

    /// Indent `n` levels deeper than `parent`.
    pub fn increment_tab_level(&self, parent: &ObjectHeader, n: usize) {
        let level = parent.tab_level() + n;
        self.set_tab_level(level);
    }

    // -------------------------------------------------------------------------
    // Parent
    // -------------------------------------------------------------------------

    /// Record `parent` without keeping it alive.
    pub fn set_parent(&self, parent: &ObjectRef) {
        *self.parent.lock() = Some(ParentLink {
            object: Arc::downgrade(parent),
            id: parent.header().id(),
        });
    }

    /// The parent, if one was recorded and is still alive.
    pub fn parent(&self) -> Option<ObjectRef> {
        self.parent.lock().as_ref().and_then(|link| link.object.upgrade())
    }

    /// Id of the recorded parent.
    pub fn parent_id(&self) -> Option<ObjectId> {
        self.parent.lock().as_ref().map(|link| link.id)
    }

    // -------------------------------------------------------------------------
    // Destruction
    // -------------------------------------------------------------------------

    /// Release everything the header owns and mark it destroyed.
    ///
    /// Options destroy callbacks run first, in registration order. Composed
    /// objects lose the reference the header held on them and the
    /// communicator reference goes back to the registry.
    pub fn destroy(&self) -> KeelResult<()> {
        self.ensure_live()?;
        let mut result = self.destroy_options_handlers();

        if self.class_id.swap(ClassId::FREED.raw(), Ordering::AcqRel) == ClassId::FREED.raw() {
            return Err(KeelError::invalid(format!(
                "object {} destroyed twice",
                self.id.raw()
            )));
        }

        let composed_objects = std::mem::take(&mut *self.olist.lock());
        result = result.and(composed_objects.release_all());
        self.qlist.lock().clear();
        *self.composed.write() = ComposedData::default();
        self.callbacks.write().clear();
        *self.parent.lock() = None;

        if let Some(comm) = self.comm.write().take() {
            result = result.and(comm_registry().release(&comm));
        }

        trace!(class = %self.class_name, id = self.id.raw(), "destroyed object");
        result
    }
}

impl Drop for ObjectHeader {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            if let Err(err) = self.destroy() {
                warn!(class = %self.class_name, id = self.id.raw(), %err, "implicit destroy failed");
            }
        }
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("class_id", &self.class_id())
            .field("class_name", &self.class_name)
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("refct", &self.refcount())
            .field("version", &self.version())
            .field("flags", &self.flags())
            .finish()
    }
}

// =============================================================================
// Object Trait
// =============================================================================

/// Trait for all keel objects.
pub trait KeelObject: Any + Send + Sync {
    /// Get the object header.
    fn header(&self) -> &ObjectHeader;

    /// Upcast for downcasting to the concrete kind.
    fn as_any(&self) -> &dyn Any;
}

/// Downcast an object to its concrete kind.
#[inline]
pub fn downcast_object<T: KeelObject>(obj: &dyn KeelObject) -> Option<&T> {
    obj.as_any().downcast_ref::<T>()
}

/// Drop one logical reference to `obj` and destroy it at zero.
///
/// Returns whether the object was destroyed.
pub fn destroy_object(obj: &dyn KeelObject) -> KeelResult<bool> {
    let header = obj.header();
    if header.dereference()? > 0 {
        return Ok(false);
    }
    let kind_result = match header.ops().destroy {
        Some(destroy) => destroy(obj),
        None => Ok(()),
    };
    kind_result.and(header.destroy())?;
    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use keel_comm::{Communicator, LocalComm};
    use std::sync::OnceLock;

    /// Minimal kind used by the unit tests of the object modules.
    pub(crate) struct Probe {
        pub(crate) header: ObjectHeader,
    }

    impl KeelObject for Probe {
        fn header(&self) -> &ObjectHeader {
            &self.header
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) fn probe_class() -> ClassId {
        static CLASS: OnceLock<ClassId> = OnceLock::new();
        *CLASS.get_or_init(|| class_registry().register("Probe"))
    }

    pub(crate) fn probe_on(comm: &CommRef) -> Arc<Probe> {
        let header = ObjectHeader::create(probe_class(), "Probe", "test object", "Sys", comm, None, None)
            .unwrap();
        Arc::new(Probe { header })
    }

    pub(crate) fn probe() -> Arc<Probe> {
        probe_on(&LocalComm::solo())
    }

    #[test]
    fn test_create_defaults() {
        let obj = probe();
        let h = obj.header();
        assert_eq!(h.class_id(), probe_class());
        assert_eq!(h.class_name(), "Probe");
        assert_eq!(h.refcount(), 1);
        assert_eq!(h.version(), 0);
        assert!(h.flags().is_empty());
        assert!(h.name_if_set().is_none());
    }

    #[test]
    fn test_unregistered_class_rejected() {
        let comm = LocalComm::solo();
        let err = ObjectHeader::create(ClassId(5), "Bogus", "", "", &comm, None, None).unwrap_err();
        assert!(matches!(err, KeelError::OutOfRange(_)));
    }

    #[test]
    fn test_unique_ids() {
        let a = probe();
        let b = probe();
        assert_ne!(a.header().id(), b.header().id());
    }

    #[test]
    fn test_version_is_monotonic() {
        let obj = probe();
        let h = obj.header();
        assert_eq!(h.version(), h.version());
        let v1 = h.increment_version();
        let v2 = h.increment_version();
        assert!(v1 < v2);
        assert_eq!(h.version(), v2);
    }

    #[test]
    fn test_objects_share_duplicate() {
        let comm = LocalComm::solo();
        let a = probe_on(&comm);
        let b = probe_on(&comm);
        let ca = a.header().comm().unwrap();
        let cb = b.header().comm().unwrap();
        assert!(Arc::ptr_eq(&ca, &cb));
        assert_ne!(ca.context_id(), comm.context_id());
        assert!(a.header().tag() < b.header().tag());
        assert_eq!(comm_registry().refcount(&*ca), Some(2));
    }

    #[test]
    fn test_generated_names() {
        let comm = LocalComm::solo();
        let a = probe_on(&comm);
        let b = probe_on(&comm);
        assert_eq!(a.header().name().unwrap(), "Probe_0");
        assert_eq!(a.header().name().unwrap(), "Probe_0");
        assert_eq!(b.header().name().unwrap(), "Probe_1");
        assert!(a.header().flags().contains(HeaderFlags::NAME_GENERATED));

        a.header().set_name("x");
        assert_eq!(a.header().name().unwrap(), "x");
        assert!(!a.header().flags().contains(HeaderFlags::NAME_GENERATED));
    }

    #[test]
    fn test_type_names() {
        let obj = probe();
        let h = obj.header();
        assert!(!h.type_compare("seq"));
        h.set_type_name("seq");
        assert!(h.type_compare("seq"));
        assert!(h.type_compare_any(&["mpi", "seq"]));
        assert!(!h.type_compare_any(&["mpi"]));
    }

    #[test]
    fn test_options_prefix() {
        let obj = probe();
        let h = obj.header();
        h.set_options_prefix(Some("sub_")).unwrap();
        h.append_options_prefix("pc_").unwrap();
        h.prepend_options_prefix("outer_").unwrap();
        assert_eq!(h.options_prefix().as_deref(), Some("outer_sub_pc_"));
        assert!(matches!(h.set_options_prefix(Some("-bad")), Err(KeelError::Usage(_))));
        h.set_options_prefix(None).unwrap();
        assert_eq!(h.options_prefix(), None);
    }

    #[test]
    fn test_tab_level_and_parent() {
        let parent = probe();
        let child = probe();
        parent.header().set_tab_level(2);
        child.header().increment_tab_level(parent.header(), 1);
        assert_eq!(child.header().tab_level(), 3);

        let parent_ref: ObjectRef = parent.clone();
        child.header().set_parent(&parent_ref);
        assert_eq!(child.header().parent_id(), Some(parent.header().id()));
        assert!(child.header().parent().is_some());

        drop(parent_ref);
        drop(parent);
        assert!(child.header().parent().is_none());
        assert!(child.header().parent_id().is_some());
    }

    #[test]
    fn test_reference_and_destroy_object() {
        let obj = probe();
        assert_eq!(obj.header().reference().unwrap(), 2);
        assert!(!destroy_object(&*obj).unwrap());
        assert!(destroy_object(&*obj).unwrap());
        assert!(obj.header().is_destroyed());
        assert_eq!(obj.header().class_id(), ClassId::FREED);
        assert!(matches!(obj.header().destroy(), Err(KeelError::InvalidHandle(_))));
        assert!(obj.header().comm().is_err());
    }

    #[test]
    fn test_destroy_releases_comm() {
        let comm = LocalComm::solo();
        let obj = probe_on(&comm);
        let inner = obj.header().comm().unwrap();
        destroy_object(&*obj).unwrap();
        assert_eq!(comm_registry().refcount(&*inner), None);
    }

    #[test]
    fn test_drop_destroys() {
        let comm = LocalComm::solo();
        let obj = probe_on(&comm);
        let inner = obj.header().comm().unwrap();
        drop(obj);
        assert_eq!(comm_registry().refcount(&*inner), None);
    }

    fn counting_destroy(obj: &dyn KeelObject) -> KeelResult<()> {
        obj.header().set_name("kind destroyed");
        Ok(())
    }

    #[test]
    fn test_kind_destroy_runs_before_header() {
        let comm = LocalComm::solo();
        let header = ObjectHeader::create(
            probe_class(),
            "Probe",
            "",
            "",
            &comm,
            Some(counting_destroy),
            None,
        )
        .unwrap();
        let obj = Arc::new(Probe { header });
        destroy_object(&*obj).unwrap();
        assert_eq!(obj.header().name_if_set().as_deref(), Some("kind destroyed"));
    }

    #[test]
    fn test_downcast() {
        let obj: ObjectRef = probe();
        assert!(downcast_object::<Probe>(&*obj).is_some());
    }
}
