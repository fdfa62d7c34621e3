//! Per-worker object slots.
//!
//! Each worker owns a [`Dispatcher`] for the lifetime of its scheduling loop. Sinks allocate a [`Slot`] when they are
//! constructed, binding a factory that builds one object per worker. At pool startup, the slot is bound to every
//! worker's dispatcher, yielding one [`LocalSlot`] per worker. A local slot is owned exclusively by its worker, so the
//! object inside it is never shared or locked. It is built lazily on first use, and torn down when the worker shuts the
//! slot down or drops it.
//!
//! Objects that must not be destroyed while one of their own methods may still be on the stack are handed to the
//! dispatcher through [`DispatcherHandle::deferred_delete`], and are only dropped when the scheduling loop calls
//! [`Dispatcher::clear_deferred_delete_list`] between callback invocations.
use std::{any::Any, fmt, sync::Arc};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

type Deferred = Box<dyn Any + Send>;

/// Per-worker scheduling state.
pub struct Dispatcher {
    name: Arc<str>,
    deferred_tx: Sender<Deferred>,
    deferred_rx: Receiver<Deferred>,
}

impl Dispatcher {
    /// Creates a new `Dispatcher` for the worker called `name`.
    pub fn new<N: AsRef<str>>(name: N) -> Self {
        let (deferred_tx, deferred_rx) = unbounded();
        Self { name: Arc::from(name.as_ref()), deferred_tx, deferred_rx }
    }

    /// Returns the worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a handle that objects bound to this worker can use to reach the dispatcher.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle { name: Arc::clone(&self.name), deferred_tx: self.deferred_tx.clone() }
    }

    /// Returns the number of objects awaiting deferred deletion.
    pub fn deferred_len(&self) -> usize {
        self.deferred_rx.len()
    }

    /// Drops every object scheduled for deferred deletion, returning how many were dropped.
    ///
    /// Must only be called from the scheduling loop, never from within a callback.
    pub fn clear_deferred_delete_list(&self) -> usize {
        let mut deleted = 0;
        for object in self.deferred_rx.try_iter() {
            drop(object);
            deleted += 1;
        }

        if deleted > 0 {
            trace!(worker = %self.name, deleted, "Cleared deferred delete list.");
        }
        deleted
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("deferred", &self.deferred_rx.len())
            .finish()
    }
}

/// A clonable handle to a worker's [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    name: Arc<str>,
    deferred_tx: Sender<Deferred>,
}

impl DispatcherHandle {
    /// Returns the worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules `object` to be dropped by the dispatcher the next time it clears its deferred delete list.
    ///
    /// If the dispatcher is already gone, the worker is tearing down and the object is dropped right away.
    pub fn deferred_delete<T: Send + 'static>(&self, object: T) {
        if let Err(e) = self.deferred_tx.send(Box::new(object)) {
            drop(e.into_inner());
        }
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle").field("name", &self.name).finish()
    }
}

type Factory<T> = Arc<dyn Fn(&DispatcherHandle) -> T + Send + Sync>;

/// A per-worker object factory.
pub struct Slot<T> {
    factory: Factory<T>,
}

impl<T> Slot<T> {
    /// Creates a new `Slot` that builds each worker's object with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&DispatcherHandle) -> T + Send + Sync + 'static,
    {
        Self { factory: Arc::new(factory) }
    }

    /// Binds the slot to a single worker.
    pub fn local(&self, dispatcher: &Dispatcher) -> LocalSlot<T> {
        LocalSlot { factory: Arc::clone(&self.factory), dispatcher: dispatcher.handle(), object: None }
    }

    /// Binds the slot to every worker in a pool, returning local slots indexed by worker.
    pub fn locals(&self, dispatchers: &[Dispatcher]) -> Vec<LocalSlot<T>> {
        dispatchers.iter().map(|dispatcher| self.local(dispatcher)).collect()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self { factory: Arc::clone(&self.factory) }
    }
}

/// A slot bound to a single worker.
pub struct LocalSlot<T> {
    factory: Factory<T>,
    dispatcher: DispatcherHandle,
    object: Option<T>,
}

impl<T> LocalSlot<T> {
    /// Returns the worker's object, building it first if necessary.
    pub fn get(&mut self) -> &mut T {
        let factory = &self.factory;
        let dispatcher = &self.dispatcher;
        self.object.get_or_insert_with(|| factory(dispatcher))
    }

    /// Returns the worker's object if it has already been built.
    pub fn try_get(&mut self) -> Option<&mut T> {
        self.object.as_mut()
    }

    /// Returns `true` if the worker's object has been built.
    pub fn is_initialized(&self) -> bool {
        self.object.is_some()
    }

    /// Returns the handle of the worker this slot is bound to.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Tears down the worker's object immediately.
    ///
    /// A later call to [`get`][LocalSlot::get] builds a fresh object.
    pub fn shutdown(&mut self) {
        self.object = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{Dispatcher, Slot};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn objects_are_built_lazily_per_worker() {
        let built = Arc::new(AtomicUsize::new(0));
        let slot = {
            let built = Arc::clone(&built);
            Slot::new(move |dispatcher| {
                built.fetch_add(1, Ordering::SeqCst);
                dispatcher.name().to_string()
            })
        };

        let dispatchers = [Dispatcher::new("worker_0"), Dispatcher::new("worker_1")];
        let mut locals = slot.locals(&dispatchers);
        assert_eq!(locals.len(), 2);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(!locals[0].is_initialized());
        assert!(locals[0].try_get().is_none());

        assert_eq!(locals[1].get(), "worker_1");
        assert_eq!(locals[1].get(), "worker_1");
        assert_eq!(built.load(Ordering::SeqCst), 1);

        assert_eq!(locals[0].get(), "worker_0");
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(locals[0].dispatcher().name(), "worker_0");
    }

    #[test]
    fn shutdown_drops_object_immediately() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let slot = {
            let dropped = Arc::clone(&dropped);
            Slot::new(move |_| DropCounter(Arc::clone(&dropped)))
        };

        let dispatcher = Dispatcher::new("worker_0");
        let mut local = slot.local(&dispatcher);
        local.get();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        local.shutdown();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!local.is_initialized());
    }

    #[test]
    fn deferred_delete_waits_for_dispatcher() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new("worker_0");
        let handle = dispatcher.handle();

        handle.deferred_delete(DropCounter(Arc::clone(&dropped)));
        handle.deferred_delete(DropCounter(Arc::clone(&dropped)));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.deferred_len(), 2);

        assert_eq!(dispatcher.clear_deferred_delete_list(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.clear_deferred_delete_list(), 0);
    }

    #[test]
    fn deferred_delete_after_dispatcher_is_gone_drops_immediately() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = Dispatcher::new("worker_0").handle();

        handle.deferred_delete(DropCounter(Arc::clone(&dropped)));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_dispatcher_drops_pending_objects() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new("worker_0");
        dispatcher.handle().deferred_delete(DropCounter(Arc::clone(&dropped)));

        drop(dispatcher);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
