//! Container objects: arbitrary user data wrapped in an object so it can be
//! composed onto other objects.

use crate::object::registry::{ClassId, class_registry};
use crate::object::{KeelObject, ObjectHeader, ObjectRef, destroy_object, downcast_object};
use keel_comm::{AttrValue, CommRef};
use keel_core::{KeelError, KeelResult};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::{Arc, OnceLock};

/// Class id of containers, registered on first use.
pub fn container_class_id() -> ClassId {
    static CLASS: OnceLock<ClassId> = OnceLock::new();
    *CLASS.get_or_init(|| class_registry().register("Container"))
}

/// An object holding one shared value.
pub struct Container {
    header: ObjectHeader,
    value: RwLock<Option<AttrValue>>,
}

impl Container {
    /// Create an empty container on `comm`.
    pub fn create(comm: &CommRef) -> KeelResult<Arc<Container>> {
        let header = ObjectHeader::create(
            container_class_id(),
            "Container",
            "Container",
            "Sys",
            comm,
            None,
            None,
        )?;
        Ok(Arc::new(Container {
            header,
            value: RwLock::new(None),
        }))
    }

    /// Store `value`, replacing the previous one.
    pub fn set<T: Any + Send + Sync>(&self, value: T) {
        *self.value.write() = Some(Arc::new(value));
    }

    /// The stored value, if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.read().clone().and_then(|v| v.downcast::<T>().ok())
    }

    /// Drop the stored value.
    pub fn clear(&self) {
        *self.value.write() = None;
    }
}

impl KeelObject for Container {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ObjectHeader {
    /// Wrap `value` in a container on this object's communicator and compose
    /// it under `name`.
    pub fn compose_value<T: Any + Send + Sync>(&self, name: &str, value: T) -> KeelResult<()> {
        let comm = self.comm()?;
        let container = Container::create(&comm)?;
        container.set(value);
        let obj: ObjectRef = container;
        self.compose(name, Some(&obj))?;
        destroy_object(&*obj)?;
        Ok(())
    }

    /// Value composed with [`compose_value`](Self::compose_value).
    ///
    /// Absence is `Ok(None)`; a non-container or a value of another type is
    /// a WrongType error.
    pub fn query_value<T: Any + Send + Sync>(&self, name: &str) -> KeelResult<Option<Arc<T>>> {
        let Some(obj) = self.query(name)? else {
            return Ok(None);
        };
        let container = downcast_object::<Container>(&*obj).ok_or_else(|| {
            KeelError::wrong_type(format!("{} is composed with a non-container object", name))
        })?;
        container
            .get::<T>()
            .map(Some)
            .ok_or_else(|| KeelError::wrong_type(format!("{} holds a value of another type", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::probe;

    #[test]
    fn test_container_holds_value() {
        let comm = keel_comm::LocalComm::solo();
        let container = Container::create(&comm).unwrap();
        assert!(container.get::<u32>().is_none());
        container.set(5u32);
        assert_eq!(container.get::<u32>().as_deref(), Some(&5));
        assert!(container.get::<String>().is_none());
        container.clear();
        assert!(container.get::<u32>().is_none());
    }

    #[test]
    fn test_compose_and_query_value() {
        let obj = probe();
        obj.header().compose_value("ctx", vec![1.0f64, 2.0]).unwrap();
        let got = obj.header().query_value::<Vec<f64>>("ctx").unwrap().unwrap();
        assert_eq!(*got, vec![1.0, 2.0]);
        assert!(obj.header().query_value::<Vec<f64>>("none").unwrap().is_none());
        assert!(matches!(
            obj.header().query_value::<u8>("ctx"),
            Err(KeelError::WrongType(_))
        ));

        let held = obj.header().query("ctx").unwrap().unwrap();
        assert_eq!(held.header().refcount(), 1);
    }

    #[test]
    fn test_query_value_on_plain_object() {
        let obj = probe();
        let other: ObjectRef = probe();
        obj.header().compose("plain", Some(&other)).unwrap();
        assert!(matches!(
            obj.header().query_value::<u8>("plain"),
            Err(KeelError::WrongType(_))
        ));
    }
}
