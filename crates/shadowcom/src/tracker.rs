//! Native pointer identity registry
//!
//! Maps a [`NativeHandle`] to every live Rust wrapper currently bound to it. Wrappers are
//! held weakly; the tracker never keeps an object alive and never dereferences a handle.
//!
//! Depending on [`TrackingMode`], entries live in one process-wide table or in one table
//! per thread. Each table has its own lock; backtrace capture and subscriber callbacks
//! always run outside of it.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::config::{TrackerConfig, TrackingMode};
use crate::error::{Error, Result};

/// Opaque address of a native object. Zero means "unbound".
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NativeHandle(pub usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// A wrapper that can be registered with an [`ObjectTracker`].
pub trait Trackable: Send + Sync + 'static {
    fn native_handle(&self) -> NativeHandle;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

// =============================================================================
// ObjectReference
// =============================================================================

/// One tracked wrapper.
#[derive(Clone)]
pub struct ObjectReference {
    handle: NativeHandle,
    created: SystemTime,
    object: Weak<dyn Trackable>,
    type_name: &'static str,
    backtrace: Option<Arc<str>>,
}

impl ObjectReference {
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Backtrace of the tracking call, when capture is configured.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    pub fn object(&self) -> Option<Arc<dyn Trackable>> {
        self.object.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }

    fn refers_to(&self, address: *const ()) -> bool {
        std::ptr::addr_eq(self.object.as_ptr(), address)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_alive() {
            return Ok(());
        }
        let age = self.created.elapsed().unwrap_or_default();
        writeln!(
            f,
            "Active native object: [{}] Type: [{}] Age: [{:.3}s]",
            self.handle,
            self.type_name,
            age.as_secs_f64()
        )?;
        if let Some(backtrace) = &self.backtrace {
            writeln!(f, "Stack:")?;
            writeln!(f, "{backtrace}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReference")
            .field("handle", &self.handle)
            .field("type_name", &self.type_name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEventKind {
    Tracked,
    Untracked,
}

#[derive(Debug, Clone)]
pub struct TrackingEvent {
    pub kind: TrackingEventKind,
    pub handle: NativeHandle,
    /// The wrapper, if one was found (an untrack can clear a handle entry without it)
    pub object: Option<ObjectReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handler list shared by the tracker and wrapper dispose events.
///
/// Handlers run outside the list lock; a panicking handler is logged and skipped.
pub(crate) struct Subscribers<E> {
    list: RwLock<Vec<(SubscriptionId, Subscriber<E>)>>,
    next: AtomicU64,
}

impl<E: 'static> Subscribers<E> {
    pub(crate) fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self, subscriber: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.list.write().push((id, Arc::new(subscriber)));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    pub(crate) fn notify(&self, event: &E, source: &'static str) {
        let subscribers: Vec<Subscriber<E>> = self
            .list
            .read()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                warn!(source, "subscriber panicked");
            }
        }
    }
}

// =============================================================================
// ObjectTracker
// =============================================================================

type Table = HashMap<NativeHandle, Vec<ObjectReference>>;

/// Which table an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Global,
    Thread(ThreadId),
}

struct PendingConfig {
    config: TrackerConfig,
    frozen: bool,
}

/// Registry from native handles to the wrappers bound to them.
///
/// In per-thread mode a wrapper stays in the partition of the thread that tracked it,
/// whichever thread later rebinds or untracks it. A thread's table is dropped as soon
/// as it becomes empty.
pub struct ObjectTracker {
    pending: Mutex<PendingConfig>,
    config: OnceCell<TrackerConfig>,
    global: Mutex<Table>,
    threads: DashMap<ThreadId, Mutex<Table>>,
    /// Wrapper address → partition it was tracked into (per-thread mode only)
    homes: DashMap<usize, Partition>,
    subscribers: Subscribers<TrackingEvent>,
}

static GLOBAL: Lazy<Arc<ObjectTracker>> =
    Lazy::new(|| Arc::new(ObjectTracker::new(TrackerConfig::from_env())));

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            pending: Mutex::new(PendingConfig {
                config,
                frozen: false,
            }),
            config: OnceCell::new(),
            global: Mutex::default(),
            threads: DashMap::new(),
            homes: DashMap::new(),
            subscribers: Subscribers::new(),
        }
    }

    /// Process-wide tracker, configured from the environment.
    pub fn global() -> Arc<ObjectTracker> {
        Arc::clone(&GLOBAL)
    }

    /// Current configuration, without freezing it.
    pub fn config(&self) -> TrackerConfig {
        match self.config.get() {
            Some(config) => *config,
            None => self.pending.lock().config,
        }
    }

    /// Replace the configuration. Fails once tracking has started, unless unchanged.
    pub fn set_config(&self, config: TrackerConfig) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.frozen {
            return if pending.config == config {
                Ok(())
            } else {
                Err(Error::ConfigurationImmutable)
            };
        }
        pending.config = config;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.config.get().is_some()
    }

    fn effective_config(&self) -> TrackerConfig {
        *self.config.get_or_init(|| {
            let mut pending = self.pending.lock();
            pending.frozen = true;
            pending.config
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.effective_config().enabled
    }

    /// Number of per-thread tables currently allocated.
    pub fn partition_count(&self) -> usize {
        self.threads.len()
    }

    fn current_partition(&self) -> Partition {
        match self.effective_config().mode {
            TrackingMode::Global => Partition::Global,
            TrackingMode::PerThread => Partition::Thread(thread::current().id()),
        }
    }

    /// The partition the wrapper at `address` was tracked into, else the caller's.
    fn home_of(&self, address: *const ()) -> Partition {
        self.homes
            .get(&(address as usize))
            .map(|home| *home)
            .unwrap_or_else(|| self.current_partition())
    }

    fn set_home(&self, address: *const (), partition: Partition) {
        if let Partition::Thread(_) = partition {
            self.homes.insert(address as usize, partition);
        }
    }

    fn clear_home(&self, address: *const ()) {
        self.homes.remove(&(address as usize));
    }

    /// Run `f` on a partition's table under its lock.
    ///
    /// A missing thread table is created only when `create` is set, otherwise the
    /// result is `None`. A thread table left empty is dropped. Lock order is always
    /// map shard, then table.
    fn with_table<R>(
        &self,
        partition: Partition,
        create: bool,
        f: impl FnOnce(&mut Table) -> R,
    ) -> Option<R> {
        let id = match partition {
            Partition::Global => return Some(f(&mut self.global.lock())),
            Partition::Thread(id) => id,
        };

        let (result, empty) = if create {
            let entry = self.threads.entry(id).or_default();
            let mut table = entry.lock();
            let result = f(&mut table);
            (result, table.is_empty())
        } else {
            let entry = self.threads.get(&id)?;
            let mut table = entry.lock();
            let result = f(&mut table);
            (result, table.is_empty())
        };

        if empty {
            // Rechecked under the shard lock; inserts also hold it
            self.threads.remove_if(&id, |_, table| table.lock().is_empty());
        }
        Some(result)
    }

    fn new_reference<T: Trackable>(&self, object: &Arc<T>, handle: NativeHandle) -> ObjectReference {
        let backtrace = self
            .effective_config()
            .capture_backtraces
            .then(|| Arc::from(Backtrace::force_capture().to_string()));
        let weak: Weak<T> = Arc::downgrade(object);
        let weak: Weak<dyn Trackable> = weak;
        ObjectReference {
            handle,
            created: SystemTime::now(),
            object: weak,
            type_name: object.type_name(),
            backtrace,
        }
    }

    /// Register `object` under its current native handle.
    pub fn track<T: Trackable>(&self, object: &Arc<T>) {
        self.track_as(object, object.native_handle());
    }

    pub(crate) fn track_as<T: Trackable>(&self, object: &Arc<T>, handle: NativeHandle) {
        if handle.is_null() || !self.is_enabled() {
            return;
        }
        let reference = self.new_reference(object, handle);
        let partition = self.current_partition();
        self.set_home(Arc::as_ptr(object) as *const (), partition);
        self.with_table(partition, true, |table| {
            table.entry(handle).or_default().push(reference.clone());
        });
        trace!(%handle, type_name = reference.type_name, "tracked");
        self.notify(TrackingEventKind::Tracked, handle, Some(reference));
    }

    /// Remove `object` from the entry of its current native handle.
    pub fn untrack<T: Trackable + ?Sized>(&self, object: &T) -> bool {
        self.untrack_as(
            object as *const T as *const (),
            object.native_handle(),
        )
    }

    /// Remove the wrapper at `address` from `handle`, along with dead references.
    ///
    /// Returns whether an entry for `handle` existed.
    pub(crate) fn untrack_as(&self, address: *const (), handle: NativeHandle) -> bool {
        if handle.is_null() || !self.is_enabled() {
            return false;
        }
        let partition = self.home_of(address);
        let removed = self
            .with_table(partition, false, |table| remove_locked(table, handle, address))
            .flatten();
        match removed {
            Some(reference) => {
                if reference.is_some() {
                    self.clear_home(address);
                }
                trace!(%handle, "untracked");
                self.notify(TrackingEventKind::Untracked, handle, reference);
                true
            }
            None => false,
        }
    }

    /// Move `object` from `old` to `new` in one critical section.
    ///
    /// A reader never observes the object under neither handle.
    pub fn migrate<T: Trackable>(&self, object: &Arc<T>, old: NativeHandle, new: NativeHandle) {
        if old == new || !self.is_enabled() {
            return;
        }
        let address = Arc::as_ptr(object) as *const ();
        let reference = (!new.is_null()).then(|| self.new_reference(object, new));
        let partition = if old.is_null() {
            self.current_partition()
        } else {
            self.home_of(address)
        };
        if reference.is_some() {
            self.set_home(address, partition);
        }

        let removed = self
            .with_table(partition, reference.is_some(), |table| {
                let removed = if old.is_null() {
                    None
                } else {
                    remove_locked(table, old, address)
                };
                if let Some(reference) = &reference {
                    table.entry(new).or_default().push(reference.clone());
                }
                removed
            })
            .flatten();

        if !old.is_null() && !matches!(removed, Some(Some(_))) {
            let err = Error::TrackingInconsistency(format!(
                "{} was not tracked under {old} when rebinding to {new}",
                object.type_name()
            ));
            warn!(%old, %new, "{err}");
        }
        if reference.is_none() {
            self.clear_home(address);
        }
        trace!(%old, %new, "migrated");

        if let Some(reference) = removed {
            self.notify(TrackingEventKind::Untracked, old, reference);
        }
        if let Some(reference) = reference {
            self.notify(TrackingEventKind::Tracked, new, Some(reference));
        }
    }

    /// Snapshot of the live references in the caller's partition.
    ///
    /// Entries can go stale as soon as the lock is released.
    pub fn find_active_objects(&self) -> Vec<ObjectReference> {
        self.with_table(self.current_partition(), false, |table| {
            table
                .values()
                .flatten()
                .filter(|reference| reference.is_alive())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Live references registered under `handle`.
    pub fn find(&self, handle: NativeHandle) -> Vec<ObjectReference> {
        if handle.is_null() {
            return Vec::new();
        }
        self.with_table(self.current_partition(), false, |table| {
            table
                .get(&handle)
                .map(|references| {
                    references
                        .iter()
                        .filter(|reference| reference.is_alive())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// The reference for this exact wrapper, if tracked.
    pub fn find_object<T: Trackable + ?Sized>(&self, object: &T) -> Option<ObjectReference> {
        let handle = object.native_handle();
        if handle.is_null() {
            return None;
        }
        let address = object as *const T as *const ();
        self.with_table(self.home_of(address), false, |table| {
            table
                .get(&handle)?
                .iter()
                .find(|reference| reference.refers_to(address))
                .cloned()
        })
        .flatten()
    }

    /// Number of handle entries in the caller's partition.
    pub fn handle_count(&self) -> usize {
        self.with_table(self.current_partition(), false, |table| table.len())
            .unwrap_or(0)
    }

    /// Human-readable report of every live tracked object.
    pub fn report_active_objects(&self) -> String {
        let active = self.find_active_objects();
        let mut per_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut report = String::new();

        for reference in &active {
            report.push_str(&reference.to_string());
            *per_type.entry(reference.type_name).or_default() += 1;
        }

        report.push_str(&format!("{} active native object(s)\n", active.len()));
        for (type_name, count) in per_type {
            report.push_str(&format!("Count per type: {type_name} : {count}\n"));
        }
        report
    }

    pub fn subscribe(&self, subscriber: impl Fn(&TrackingEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribers.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    fn notify(&self, kind: TrackingEventKind, handle: NativeHandle, object: Option<ObjectReference>) {
        if self.subscribers.is_empty() {
            return;
        }
        let event = TrackingEvent {
            kind,
            handle,
            object,
        };
        self.subscribers.notify(&event, "object tracker");
    }
}

impl fmt::Debug for ObjectTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTracker")
            .field("config", &self.config())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Drop the reference at `address` and every dead reference under `handle`.
///
/// `None` if there was no entry; otherwise the removed reference, if any.
fn remove_locked(
    table: &mut Table,
    handle: NativeHandle,
    address: *const (),
) -> Option<Option<ObjectReference>> {
    let references = table.get_mut(&handle)?;
    let mut removed = None;
    references.retain(|reference| {
        if removed.is_none() && reference.refers_to(address) {
            removed = Some(reference.clone());
            false
        } else {
            reference.is_alive()
        }
    });
    if references.is_empty() {
        table.remove(&handle);
    }
    Some(removed)
}
