//! Observer registration and event fan-out.
//!
//! Registrations hold a [`Weak`] link to the observer, so the library never keeps
//! an application object alive. Each observer type's [`DispatchTable`] is built
//! once and shared by every instance of that type. A broadcast snapshots the
//! live registrations under a short lock and delivers outside it; an observer
//! unregistered while a snapshot is in flight is skipped at delivery time.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{BleError, Result};
use crate::event::{BleEvent, EventKind};
use crate::observer::EventObserver;
use crate::poster::{ExecutionContext, Job, Poster};

/// Per-type routing: whether each event kind is delivered, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    routes: [Option<Option<ExecutionContext>>; EventKind::COUNT],
}

impl DispatchTable {
    /// Read the routing from an observer.
    #[must_use]
    pub fn build(observer: &dyn EventObserver) -> Self {
        let mut routes = [None; EventKind::COUNT];
        for kind in EventKind::ALL {
            if observer.subscriptions(kind) {
                routes[kind.index()] = Some(observer.execution_context(kind));
            }
        }
        Self { routes }
    }

    /// `None` if `kind` is not delivered, otherwise the context override.
    #[inline]
    #[must_use]
    pub const fn route(&self, kind: EventKind) -> Option<Option<ExecutionContext>> {
        self.routes[kind.index()]
    }
}

/// Token identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    /// Raw id, unique for the life of the dispatcher.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

struct Registration {
    handle: ObserverHandle,
    observer: Weak<dyn EventObserver>,
    table: Arc<DispatchTable>,
    active: Arc<AtomicBool>,
}

struct Target {
    handle: ObserverHandle,
    observer: Arc<dyn EventObserver>,
    table: Arc<DispatchTable>,
    active: Arc<AtomicBool>,
}

/// An observer attached to a single connection rather than registered globally.
#[derive(Clone)]
pub struct DirectObserver {
    observer: Arc<dyn EventObserver>,
    table: Arc<DispatchTable>,
    affinity: u64,
}

impl DirectObserver {
    /// Wrap an observer, building its table from the instance.
    #[must_use]
    pub fn new(observer: Arc<dyn EventObserver>, affinity: u64) -> Self {
        let table = Arc::new(DispatchTable::build(observer.as_ref()));
        Self {
            observer,
            table,
            affinity,
        }
    }
}

impl std::fmt::Debug for DirectObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectObserver")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Observer registry plus the poster that runs deliveries.
pub struct Dispatcher {
    poster: Poster,
    registrations: Mutex<Vec<Registration>>,
    tables: Mutex<HashMap<TypeId, Arc<DispatchTable>>>,
    next_handle: AtomicU64,
}

fn same_object<T: ?Sized, U: ?Sized>(a: *const T, b: *const U) -> bool {
    a.cast::<()>() == b.cast::<()>()
}

impl Dispatcher {
    /// Create a dispatcher delivering through `poster`.
    #[must_use]
    pub fn new(poster: Poster) -> Self {
        Self {
            poster,
            registrations: Mutex::new(Vec::new()),
            tables: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The poster used for deliveries.
    #[must_use]
    pub const fn poster(&self) -> &Poster {
        &self.poster
    }

    /// Register an observer for broadcasts.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::DuplicateObserver`] if this instance is already registered.
    pub fn register<O: EventObserver>(&self, observer: &Arc<O>) -> Result<ObserverHandle> {
        let table = self.table_for(observer.as_ref());
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| r.observer.strong_count() > 0);
        if registrations
            .iter()
            .any(|r| same_object(r.observer.as_ptr(), Arc::as_ptr(observer)))
        {
            return Err(BleError::DuplicateObserver);
        }

        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<O> = Arc::downgrade(observer);
        let weak: Weak<dyn EventObserver> = weak;
        registrations.push(Registration {
            handle,
            observer: weak,
            table,
            active: Arc::new(AtomicBool::new(true)),
        });
        trace!(handle = handle.id(), "observer registered");
        Ok(handle)
    }

    /// Remove a registration. Returns `false` if the handle is unknown.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        self.remove_where(|r| r.handle == handle)
    }

    /// Remove the registration of `observer`. Returns `false` if it was not registered.
    pub fn unregister_observer<O: EventObserver>(&self, observer: &Arc<O>) -> bool {
        let target = Arc::as_ptr(observer);
        self.remove_where(|r| same_object(r.observer.as_ptr(), target))
    }

    fn remove_where(&self, predicate: impl Fn(&Registration) -> bool) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| {
            if predicate(r) {
                r.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        before != registrations.len()
    }

    /// Returns `true` if `observer` is currently registered.
    #[must_use]
    pub fn is_registered<O: EventObserver>(&self, observer: &Arc<O>) -> bool {
        let target = Arc::as_ptr(observer);
        self.registrations
            .lock()
            .iter()
            .any(|r| r.observer.strong_count() > 0 && same_object(r.observer.as_ptr(), target))
    }

    /// Number of registrations whose observer is still alive.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|r| r.observer.strong_count() > 0)
            .count()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut registrations = self.registrations.lock();
        for r in registrations.iter() {
            r.active.store(false, Ordering::Release);
        }
        registrations.clear();
    }

    fn table_for<O: EventObserver>(&self, observer: &O) -> Arc<DispatchTable> {
        self.tables
            .lock()
            .entry(TypeId::of::<O>())
            .or_insert_with(|| Arc::new(DispatchTable::build(observer)))
            .clone()
    }

    fn snapshot(&self) -> Vec<Target> {
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| r.observer.strong_count() > 0);
        registrations
            .iter()
            .filter_map(|r| {
                r.observer.upgrade().map(|observer| Target {
                    handle: r.handle,
                    observer,
                    table: r.table.clone(),
                    active: r.active.clone(),
                })
            })
            .collect()
    }

    /// Deliver `event` to every registered observer that subscribes to it.
    pub fn broadcast(&self, event: BleEvent) {
        self.broadcast_shared(&Arc::new(event));
    }

    /// Deliver a shared event to every registered observer that subscribes to it.
    pub fn broadcast_shared(&self, event: &Arc<BleEvent>) {
        let kind = event.kind();
        for target in self.snapshot() {
            let Some(context) = target.table.route(kind) else {
                continue;
            };
            let event = Arc::clone(event);
            let Target {
                handle,
                observer,
                active,
                ..
            } = target;
            let job: Job = Box::new(move || {
                if active.load(Ordering::Acquire) {
                    event.deliver(observer.as_ref());
                }
            });
            self.poster.post(context, handle.id(), job);
        }
    }

    /// Deliver `event` to a single connection-scoped observer.
    pub fn post_to(&self, target: &DirectObserver, event: &Arc<BleEvent>) {
        let Some(context) = target.table.route(event.kind()) else {
            return;
        };
        let event = Arc::clone(event);
        let observer = Arc::clone(&target.observer);
        self.poster.post(
            context,
            target.affinity,
            Box::new(move || event.deliver(observer.as_ref())),
        );
    }

    /// Run an arbitrary callback on `context`.
    pub fn post(&self, context: Option<ExecutionContext>, affinity: u64, job: Job) {
        self.poster.post(context, affinity, job);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("poster", &self.poster)
            .field("observers", &self.observer_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poster::SerialExecutor;
    use crate::types::{AdapterState, Device};
    use std::sync::atomic::AtomicUsize;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Counter {
        states: AtomicUsize,
        adapters: AtomicUsize,
    }

    impl EventObserver for Counter {
        fn on_connection_state_changed(&self, _device: &Device) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn on_adapter_state_changed(&self, _state: AdapterState) {
            self.adapters.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StateOnly(AtomicUsize);

    impl EventObserver for StateOnly {
        fn on_adapter_state_changed(&self, _state: AdapterState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn subscriptions(&self, kind: EventKind) -> bool {
            kind == EventKind::ConnectionStateChanged
        }
    }

    #[derive(Default)]
    struct Asked(AtomicUsize);

    impl EventObserver for Asked {
        fn subscriptions(&self, _kind: EventKind) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn dispatcher() -> Dispatcher {
        let handle = Handle::current();
        let main = Arc::new(SerialExecutor::spawn(&handle, "main"));
        Dispatcher::new(Poster::new(&handle, main, 2, ExecutionContext::Caller))
    }

    fn state_event() -> BleEvent {
        BleEvent::ConnectionStateChanged {
            device: Device::new("AA:BB:CC:DD:EE:FF").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let dispatcher = dispatcher();
        let observer = Arc::new(Counter::default());

        dispatcher.register(&observer).unwrap();
        let err = dispatcher.register(&observer).unwrap_err();
        assert!(matches!(err, BleError::DuplicateObserver));
        assert_eq!(dispatcher.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_observer() {
        let dispatcher = dispatcher();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        dispatcher.register(&a).unwrap();
        dispatcher.register(&b).unwrap();

        dispatcher.broadcast(state_event());

        assert_eq!(a.states.load(Ordering::SeqCst), 1);
        assert_eq!(b.states.load(Ordering::SeqCst), 1);
        assert_eq!(a.adapters.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let dispatcher = dispatcher();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let handle = dispatcher.register(&a).unwrap();
        dispatcher.register(&b).unwrap();

        dispatcher.broadcast(state_event());
        assert!(dispatcher.unregister(handle));
        assert!(!dispatcher.unregister(handle));
        dispatcher.broadcast(state_event());

        assert_eq!(a.states.load(Ordering::SeqCst), 1);
        assert_eq!(b.states.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_observer_is_pruned() {
        let dispatcher = dispatcher();
        let observer = Arc::new(Counter::default());
        dispatcher.register(&observer).unwrap();
        drop(observer);

        dispatcher.broadcast(state_event());
        assert_eq!(dispatcher.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriptions_filter_kinds() {
        let dispatcher = dispatcher();
        let observer = Arc::new(StateOnly(AtomicUsize::new(0)));
        dispatcher.register(&observer).unwrap();

        dispatcher.broadcast(BleEvent::AdapterStateChanged {
            state: AdapterState::Off,
        });
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_table_is_cached_per_type() {
        let dispatcher = dispatcher();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        dispatcher.register(&a).unwrap();
        dispatcher.register(&b).unwrap();

        assert_eq!(dispatcher.tables.lock().len(), 1);
        let registrations = dispatcher.registrations.lock();
        assert!(Arc::ptr_eq(&registrations[0].table, &registrations[1].table));
    }

    #[tokio::test]
    async fn test_unregister_by_instance() {
        let dispatcher = dispatcher();
        let observer = Arc::new(Counter::default());
        dispatcher.register(&observer).unwrap();

        assert!(dispatcher.is_registered(&observer));
        assert!(dispatcher.unregister_observer(&observer));
        assert!(!dispatcher.is_registered(&observer));
    }

    #[tokio::test]
    async fn test_routing_is_asked_of_the_first_instance_only() {
        let dispatcher = dispatcher();
        let first = Arc::new(Asked::default());
        let second = Arc::new(Asked::default());
        dispatcher.register(&first).unwrap();
        dispatcher.register(&second).unwrap();
        dispatcher.broadcast(state_event());

        assert!(first.0.load(Ordering::SeqCst) > 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
    }
}
