//! Attribute directories: name to object and name to function.
//!
//! Composition is last-writer-wins. Composing `None` under a name removes
//! the entry. A composed object gains a logical reference, given back through
//! [`destroy_object`] when it is replaced, removed, or its holder is
//! destroyed.
//!
//! Functions are stored type-erased and recovered by the caller's expected
//! type, which is the basis of [`try_method`] and [`use_method`].

use crate::object::{ObjectHeader, ObjectRef, destroy_object};
use keel_core::{KeelError, KeelResult};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;

/// A function stored in a directory.
pub type ErasedFn = Arc<dyn Any + Send + Sync>;

/// Compose slot of the vtable: store or remove an object.
pub type ComposeFn = fn(&ObjectHeader, &str, Option<ObjectRef>) -> KeelResult<()>;
/// Compose slot of the vtable: look up an object.
pub type QueryFn = fn(&ObjectHeader, &str) -> KeelResult<Option<ObjectRef>>;
/// Compose slot of the vtable: store or remove a function.
pub type ComposeFunctionFn = fn(&ObjectHeader, &str, Option<ErasedFn>) -> KeelResult<()>;
/// Compose slot of the vtable: look up a function.
pub type QueryFunctionFn = fn(&ObjectHeader, &str) -> KeelResult<Option<ErasedFn>>;

/// The compose/query slot of [`ObjectOps`](crate::object::ObjectOps).
#[derive(Debug, Clone, Copy)]
pub struct ComposeOps {
    /// Store or remove an object.
    pub compose: ComposeFn,
    /// Look up an object.
    pub query: QueryFn,
    /// Store or remove a function.
    pub compose_function: ComposeFunctionFn,
    /// Look up a function.
    pub query_function: QueryFunctionFn,
}

impl ComposeOps {
    /// Operations backed by the header's own directories.
    pub const DIRECTORY: ComposeOps = ComposeOps {
        compose: directory_compose,
        query: directory_query,
        compose_function: directory_compose_function,
        query_function: directory_query_function,
    };
}

// =============================================================================
// Directories
// =============================================================================

/// Name to object directory.
#[derive(Default)]
pub struct ObjectList {
    entries: FxHashMap<Box<str>, ObjectRef>,
}

impl ObjectList {
    /// Insert, returning the replaced object.
    pub fn insert(&mut self, name: &str, obj: ObjectRef) -> Option<ObjectRef> {
        self.entries.insert(Box::from(name), obj)
    }

    /// Remove and return an entry.
    pub fn remove(&mut self, name: &str) -> Option<ObjectRef> {
        self.entries.remove(name)
    }

    /// Look up an entry.
    pub fn get(&self, name: &str) -> Option<ObjectRef> {
        self.entries.get(name).cloned()
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().map(|k| k.to_string()).collect();
        names.sort_unstable();
        names
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Give back the reference held on every entry.
    ///
    /// Every entry is released; the first failure is returned.
    pub fn release_all(self) -> KeelResult<()> {
        self.entries
            .into_values()
            .map(|obj| destroy_object(&*obj).map(|_| ()))
            .fold(Ok(()), |acc, r| acc.and(r))
    }
}

/// Name to function directory.
#[derive(Default)]
pub struct FunctionList {
    entries: FxHashMap<Box<str>, ErasedFn>,
}

impl FunctionList {
    /// Insert or, with `None`, remove an entry.
    pub fn set(&mut self, name: &str, func: Option<ErasedFn>) {
        match func {
            Some(func) => {
                self.entries.insert(Box::from(name), func);
            }
            None => {
                self.entries.remove(name);
            }
        }
    }

    /// Look up an entry.
    pub fn get(&self, name: &str) -> Option<ErasedFn> {
        self.entries.get(name).cloned()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn directory_compose(header: &ObjectHeader, name: &str, obj: Option<ObjectRef>) -> KeelResult<()> {
    if header.is_destroyed() {
        return Err(KeelError::invalid("cannot compose on a destroyed object"));
    }
    let previous = match obj {
        Some(obj) => {
            obj.header().reference()?;
            header.olist.lock().insert(name, obj)
        }
        None => header.olist.lock().remove(name),
    };
    if let Some(previous) = previous {
        destroy_object(&*previous)?;
    }
    Ok(())
}

fn directory_query(header: &ObjectHeader, name: &str) -> KeelResult<Option<ObjectRef>> {
    Ok(header.olist.lock().get(name))
}

fn directory_compose_function(
    header: &ObjectHeader,
    name: &str,
    func: Option<ErasedFn>,
) -> KeelResult<()> {
    if header.is_destroyed() {
        return Err(KeelError::invalid("cannot compose on a destroyed object"));
    }
    header.qlist.lock().set(name, func);
    Ok(())
}

fn directory_query_function(header: &ObjectHeader, name: &str) -> KeelResult<Option<ErasedFn>> {
    Ok(header.qlist.lock().get(name))
}

// =============================================================================
// Header Operations
// =============================================================================

impl ObjectHeader {
    /// Associate `obj` with `name`, or remove the association with `None`.
    pub fn compose(&self, name: &str, obj: Option<&ObjectRef>) -> KeelResult<()> {
        (self.ops().compose.compose)(self, name, obj.cloned())
    }

    /// Object associated with `name`; absence is not an error.
    pub fn query(&self, name: &str) -> KeelResult<Option<ObjectRef>> {
        (self.ops().compose.query)(self, name)
    }

    /// Associate `func` with `name`, or remove the association with `None`.
    ///
    /// `F` is usually a `fn` pointer or an `Arc<dyn Fn(..)>`.
    pub fn compose_function<F>(&self, name: &str, func: Option<F>) -> KeelResult<()>
    where
        F: Any + Send + Sync,
    {
        let erased = func.map(|f| Arc::new(f) as ErasedFn);
        (self.ops().compose.compose_function)(self, name, erased)
    }

    /// Function associated with `name`.
    ///
    /// Absence is `Ok(None)`; a function of another type is a WrongType error.
    pub fn query_function<F>(&self, name: &str) -> KeelResult<Option<F>>
    where
        F: Any + Clone,
    {
        match (self.ops().compose.query_function)(self, name)? {
            None => Ok(None),
            Some(erased) => erased.downcast_ref::<F>().cloned().map(Some).ok_or_else(|| {
                KeelError::wrong_type(format!(
                    "function {} of {} has a different signature",
                    name,
                    self.class_name()
                ))
            }),
        }
    }

    /// Names of the composed objects, sorted.
    pub fn composed_names(&self) -> Vec<String> {
        self.olist.lock().names()
    }
}

// =============================================================================
// Optional-Capability Calls
// =============================================================================

/// Call the function composed under `name` if there is one.
///
/// Returns `Ok(None)` when nothing is composed under `name`.
pub fn try_method<F, R>(
    header: &ObjectHeader,
    name: &str,
    call: impl FnOnce(F) -> KeelResult<R>,
) -> KeelResult<Option<R>>
where
    F: Any + Clone,
{
    match header.query_function::<F>(name)? {
        Some(func) => call(func).map(Some),
        None => Ok(None),
    }
}

/// Call the function composed under `name`; its absence is NotSupported.
pub fn use_method<F, R>(
    header: &ObjectHeader,
    name: &str,
    call: impl FnOnce(F) -> KeelResult<R>,
) -> KeelResult<R>
where
    F: Any + Clone,
{
    try_method(header, name, call)?.ok_or_else(|| {
        KeelError::not_supported(format!(
            "cannot locate function {} in object of class {}",
            name,
            header.class_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::probe;
    use crate::object::KeelObject;

    type Scale = fn(f64) -> f64;

    fn double(x: f64) -> f64 {
        2.0 * x
    }

    #[test]
    fn test_compose_and_query() {
        let holder = probe();
        let item: ObjectRef = probe();
        holder.header().compose("k", Some(&item)).unwrap();
        let found = holder.header().query("k").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &item));
        assert!(holder.header().query("missing").unwrap().is_none());
        assert_eq!(item.header().refcount(), 2);
    }

    #[test]
    fn test_compose_none_removes_and_releases() {
        let holder = probe();
        let item: ObjectRef = probe();
        holder.header().compose("k", Some(&item)).unwrap();
        holder.header().compose("k", None).unwrap();
        assert!(holder.header().query("k").unwrap().is_none());
        assert_eq!(item.header().refcount(), 1);
    }

    #[test]
    fn test_last_writer_wins() {
        let holder = probe();
        let first: ObjectRef = probe();
        let second: ObjectRef = probe();
        holder.header().compose("k", Some(&first)).unwrap();
        holder.header().compose("k", Some(&second)).unwrap();
        let found = holder.header().query("k").unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &second));
        assert_eq!(first.header().refcount(), 1);
        assert_eq!(holder.header().composed_names(), vec!["k".to_string()]);
    }

    #[test]
    fn test_destroy_releases_composed_objects() {
        let holder = probe();
        let item: ObjectRef = probe();
        holder.header().compose("k", Some(&item)).unwrap();
        holder.header().destroy().unwrap();
        assert_eq!(item.header().refcount(), 1);
    }

    #[test]
    fn test_compose_function_roundtrip() {
        let obj = probe();
        obj.header()
            .compose_function::<Scale>("scale", Some(double))
            .unwrap();
        let f = obj.header().query_function::<Scale>("scale").unwrap().unwrap();
        assert_eq!(f(3.0), 6.0);
        assert!(obj.header().query_function::<Scale>("other").unwrap().is_none());
    }

    #[test]
    fn test_query_function_wrong_signature() {
        let obj = probe();
        obj.header()
            .compose_function::<Scale>("scale", Some(double))
            .unwrap();
        let err = obj.header().query_function::<fn() -> i32>("scale").unwrap_err();
        assert!(matches!(err, KeelError::WrongType(_)));
    }

    #[test]
    fn test_try_and_use_method() {
        let obj = probe();
        let absent = try_method(obj.header(), "scale", |f: Scale| Ok(f(1.0))).unwrap();
        assert_eq!(absent, None);
        let err = use_method(obj.header(), "scale", |f: Scale| Ok(f(1.0))).unwrap_err();
        assert!(matches!(err, KeelError::NotSupported(_)));

        obj.header()
            .compose_function::<Scale>("scale", Some(double))
            .unwrap();
        assert_eq!(
            try_method(obj.header(), "scale", |f: Scale| Ok(f(4.0))).unwrap(),
            Some(8.0)
        );
        assert_eq!(use_method(obj.header(), "scale", |f: Scale| Ok(f(5.0))).unwrap(), 10.0);
    }

    #[test]
    fn test_closure_functions() {
        let obj = probe();
        let offset = 3;
        let add: Arc<dyn Fn(i32) -> i32 + Send + Sync> = Arc::new(move |x| x + offset);
        obj.header().compose_function("add", Some(add)).unwrap();
        let got = use_method(obj.header(), "add", |f: Arc<dyn Fn(i32) -> i32 + Send + Sync>| {
            Ok(f(4))
        })
        .unwrap();
        assert_eq!(got, 7);

        obj.header()
            .compose_function::<Arc<dyn Fn(i32) -> i32 + Send + Sync>>("add", None)
            .unwrap();
        assert!(obj.header().qlist.lock().is_empty());
    }
}
