//! Options handlers attached to individual objects.
//!
//! A package that configures an object from outside its own class (a monitor,
//! a preconditioner hook) adds a handler; the handlers run, in registration
//! order, whenever the object processes its options. A handler may carry a
//! destroy callback that releases its context when the object goes away.

use crate::object::{HeaderFlags, ObjectHeader};
use keel_core::{KeelError, KeelResult};
use smallvec::SmallVec;

/// Maximum number of handlers per object.
pub const MAX_OPTIONS_HANDLERS: usize = 5;

/// Handler run by [`ObjectHeader::process_options_handlers`].
pub type OptionsHandlerFn = Box<dyn FnMut(&ObjectHeader) -> KeelResult<()> + Send>;

/// Destroy callback run once when the handlers are destroyed.
pub type OptionsDestroyFn = Box<dyn FnOnce(&ObjectHeader) -> KeelResult<()> + Send>;

struct OptionsHandler {
    handler: OptionsHandlerFn,
    destroy: Option<OptionsDestroyFn>,
}

/// Handler table of one object.
#[derive(Default)]
pub struct OptionsHandlers {
    entries: SmallVec<[OptionsHandler; MAX_OPTIONS_HANDLERS]>,
    /// Handlers taken out of `entries` while they run.
    in_flight: usize,
}

impl OptionsHandlers {
    /// Number of registered handlers, including any that are running.
    pub fn len(&self) -> usize {
        self.entries.len() + self.in_flight
    }

    /// Check if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectHeader {
    /// Register a handler and an optional destroy callback.
    pub fn add_options_handler<H>(&self, handler: H, destroy: Option<OptionsDestroyFn>) -> KeelResult<()>
    where
        H: FnMut(&ObjectHeader) -> KeelResult<()> + Send + 'static,
    {
        let mut table = self.options.lock();
        if table.len() >= MAX_OPTIONS_HANDLERS {
            return Err(KeelError::exhausted(format!(
                "{} already has {} options handlers",
                self.class_name(),
                MAX_OPTIONS_HANDLERS
            )));
        }
        table.entries.push(OptionsHandler {
            handler: Box::new(handler),
            destroy,
        });
        Ok(())
    }

    /// Run every handler in registration order, stopping at the first
    /// failure.
    pub fn process_options_handlers(&self) -> KeelResult<()> {
        // Handlers run unlocked so they may use the header freely; they still
        // count against the limit while out of the table.
        let mut running = {
            let mut table = self.options.lock();
            let running = std::mem::take(&mut table.entries);
            table.in_flight += running.len();
            running
        };
        let result = running
            .iter_mut()
            .try_for_each(|entry| (entry.handler)(self));

        let mut table = self.options.lock();
        table.in_flight -= running.len();
        let added = std::mem::take(&mut table.entries);
        running.extend(added);
        table.entries = running;
        drop(table);

        if result.is_ok() {
            self.insert_flags(HeaderFlags::OPTIONS_PROCESSED);
        }
        result
    }

    /// Run every destroy callback in registration order and clear the table.
    ///
    /// Every callback runs; the first failure is returned.
    pub fn destroy_options_handlers(&self) -> KeelResult<()> {
        let entries = std::mem::take(&mut self.options.lock().entries);
        entries
            .into_iter()
            .filter_map(|entry| entry.destroy)
            .map(|destroy| destroy(self))
            .fold(Ok(()), |acc, r| acc.and(r))
    }

    /// Number of registered handlers.
    pub fn options_handler_count(&self) -> usize {
        self.options.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::probe;
    use crate::object::KeelObject;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_handlers_run_in_order() {
        let obj = probe();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            obj.header()
                .add_options_handler(
                    move |_: &ObjectHeader| {
                        log.lock().push(i);
                        Ok(())
                    },
                    None,
                )
                .unwrap();
        }
        obj.header().process_options_handlers().unwrap();
        obj.header().process_options_handlers().unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2, 0, 1, 2]);
        assert!(obj.header().flags().contains(HeaderFlags::OPTIONS_PROCESSED));
    }

    #[test]
    fn test_limit_is_resource_exhausted() {
        let obj = probe();
        for _ in 0..MAX_OPTIONS_HANDLERS {
            obj.header().add_options_handler(|_: &ObjectHeader| Ok(()), None).unwrap();
        }
        let err = obj
            .header()
            .add_options_handler(|_: &ObjectHeader| Ok(()), None)
            .unwrap_err();
        assert!(matches!(err, KeelError::ResourceExhausted(_)));
        assert_eq!(obj.header().options_handler_count(), MAX_OPTIONS_HANDLERS);
    }

    #[test]
    fn test_handlers_added_while_processing_respect_limit() {
        let obj = probe();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        obj.header()
            .add_options_handler(
                move |h: &ObjectHeader| {
                    for _ in 0..MAX_OPTIONS_HANDLERS {
                        let added = h.add_options_handler(|_: &ObjectHeader| Ok(()), None);
                        sink.lock().push(added.is_ok());
                    }
                    Ok(())
                },
                None,
            )
            .unwrap();

        obj.header().process_options_handlers().unwrap();
        assert_eq!(*outcomes.lock(), vec![true, true, true, true, false]);
        assert_eq!(obj.header().options_handler_count(), MAX_OPTIONS_HANDLERS);
    }

    #[test]
    fn test_handler_sees_prefix() {
        let obj = probe();
        obj.header().set_options_prefix(Some("ksp_")).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        obj.header()
            .add_options_handler(
                move |h: &ObjectHeader| {
                    *sink.lock() = h.options_prefix();
                    Ok(())
                },
                None,
            )
            .unwrap();
        obj.header().process_options_handlers().unwrap();
        assert_eq!(seen.lock().as_deref(), Some("ksp_"));
    }

    #[test]
    fn test_failure_stops_processing() {
        let obj = probe();
        let ran = Arc::new(Mutex::new(0));
        obj.header()
            .add_options_handler(|_: &ObjectHeader| Err(KeelError::usage("bad option")), None)
            .unwrap();
        let counter = Arc::clone(&ran);
        obj.header()
            .add_options_handler(
                move |_: &ObjectHeader| {
                    *counter.lock() += 1;
                    Ok(())
                },
                None,
            )
            .unwrap();
        assert!(obj.header().process_options_handlers().is_err());
        assert_eq!(*ran.lock(), 0);
        assert_eq!(obj.header().options_handler_count(), 2);
    }

    #[test]
    fn test_destroy_callbacks_run_in_order_on_destroy() {
        let obj = probe();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..2 {
            let log = Arc::clone(&log);
            obj.header()
                .add_options_handler(
                    |_: &ObjectHeader| Ok(()),
                    Some(Box::new(move |_: &ObjectHeader| -> KeelResult<()> {
                        log.lock().push(i);
                        Ok(())
                    })),
                )
                .unwrap();
        }
        obj.header().destroy().unwrap();
        assert_eq!(*log.lock(), vec![0, 1]);
        assert_eq!(obj.header().options_handler_count(), 0);
    }
}
