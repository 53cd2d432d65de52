//! Cooperative single-threaded event loop.
//!
//! An [`EventLoop`] owns a queue and a registry of objects. [`EventLoop::exec`]
//! blocks on the queue with a short timeout, drains everything visible in one
//! pass, and invokes the addressed slots one at a time on the calling thread.
//! Timers are serviced between passes, on the same thread.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sigslot_log::{debug_every_n, warn_every_n};

use crate::envelope::{Args, Control, Destination, Envelope};
use crate::error::{LoopError, ObjectError, QueueError, SlotResult};
use crate::object::{Bound, EventLoopObject, Handle, ObjectBase, Origin, SlotRef};
use crate::queue::{MessageQueue, QueueConfig, QueueSender};
use crate::registry::{Dispatch, ObjectId, Registry};
use crate::signal::{Signal, SignalCore};
use crate::timer::TimerShared;

/// Name of the built-in slot that stops a loop.
pub const STOP_SLOT: &str = "stop";

/// Configuration for an event loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Longest a single receive blocks; bounds timer precision.
    pub poll_interval: Duration,
    /// Rate limit for repeated delivery diagnostics: log 1 in `n`.
    pub log_every_n: u64,
    pub queue: QueueConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            log_every_n: 100,
            queue: QueueConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::default()
    }
}

/// Builder for [`LoopConfig`].
#[derive(Debug, Clone, Default)]
pub struct LoopConfigBuilder {
    config: LoopConfig,
}

impl LoopConfigBuilder {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn log_every_n(mut self, n: u64) -> Self {
        self.config.log_every_n = n;
        self
    }

    /// Requested kernel buffer size of the loop's queue.
    pub fn queue_buffer_bytes(mut self, bytes: usize) -> Self {
        self.config.queue.buffer_bytes = bytes;
        self
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.config.queue.max_message_bytes = bytes;
        self
    }

    pub fn max_batch(mut self, datagrams: usize) -> Self {
        self.config.queue.max_batch = datagrams;
        self
    }

    pub fn build(self) -> LoopConfig {
        self.config
    }
}

/// Lifecycle of an event loop. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Terminated = 3,
}

impl LoopState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Terminated,
        }
    }
}

/// Registry entry for the loop itself, so `stop` can be connected to like
/// any other slot.
struct LoopControl {
    name: ObjectId,
    queue: QueueSender,
    stop_requested: Arc<AtomicBool>,
}

impl Dispatch for LoopControl {
    fn has_slot(&self, slot: &str) -> bool {
        slot == STOP_SLOT
    }

    fn invoke(&self, slot: &str, _args: &Args) -> Option<SlotResult> {
        (slot == STOP_SLOT).then(|| {
            request_stop(&self.name, &self.queue, &self.stop_requested);
            Ok(())
        })
    }
}

fn request_stop(name: &ObjectId, queue: &QueueSender, stop_requested: &AtomicBool) {
    if stop_requested.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(err) = queue.put(&Envelope::control(Control::Stop)) {
        stop_requested.store(false, Ordering::SeqCst);
        log::warn!("event loop {name}: stop request could not be enqueued: {err}");
    }
}

struct LoopInner {
    name: ObjectId,
    config: LoopConfig,
    queue: MessageQueue,
    registry: Mutex<Registry>,
    signals: Mutex<Vec<Weak<SignalCore>>>,
    inbound: Mutex<Vec<Weak<SignalCore>>>,
    timers: Mutex<Vec<Weak<TimerShared>>>,
    state: AtomicU8,
    stop_requested: Arc<AtomicBool>,
    /// Set in the parent once a forked child owns `exec()`.
    forked: AtomicBool,
    start: Signal,
    terminate: Signal,
}

/// Handle to an event loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

/// Non-owning reference to a loop, held by the objects the loop owns.
#[derive(Clone)]
pub(crate) struct WeakLoop(Weak<LoopInner>);

impl WeakLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.0.upgrade().map(|inner| EventLoop { inner })
    }
}

impl EventLoop {
    pub fn new(name: impl Into<ObjectId>) -> Result<Self, LoopError> {
        Self::with_config(name, LoopConfig::default())
    }

    pub fn with_config(name: impl Into<ObjectId>, config: LoopConfig) -> Result<Self, LoopError> {
        let name = name.into();
        let queue = MessageQueue::new(name.as_str(), &config.queue)?;

        let origin = Origin::new(name.clone());
        let start = Signal::new(Arc::clone(&origin), "start", config.log_every_n);
        let terminate = Signal::new(origin, "terminate", config.log_every_n);
        let stop_requested = Arc::new(AtomicBool::new(false));

        let mut registry = Registry::default();
        let control = LoopControl {
            name: name.clone(),
            queue: queue.sender(),
            stop_requested: Arc::clone(&stop_requested),
        };
        registry.insert(&name, name.clone(), Arc::new(control))?;

        let signals = vec![start.downgrade(), terminate.downgrade()];
        Ok(Self {
            inner: Arc::new(LoopInner {
                name,
                config,
                queue,
                registry: Mutex::new(registry),
                signals: Mutex::new(signals),
                inbound: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                state: AtomicU8::new(LoopState::Created as u8),
                stop_requested,
                forked: AtomicBool::new(false),
                start,
                terminate,
            }),
        })
    }

    pub fn name(&self) -> &ObjectId {
        &self.inner.name
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_raw(self.inner.state.load(Ordering::SeqCst))
    }

    /// Fired once when `exec()` starts.
    pub fn start_signal(&self) -> &Signal {
        &self.inner.start
    }

    /// Fired once right before `exec()` returns.
    pub fn terminate_signal(&self) -> &Signal {
        &self.inner.terminate
    }

    /// Asks the loop to stop. Safe from any thread or process that holds the
    /// loop; repeated calls are ignored.
    pub fn stop(&self) {
        request_stop(&self.inner.name, &self.inner.queue.sender(), &self.inner.stop_requested);
    }

    /// The loop's `stop` as a connectable slot.
    pub fn stop_slot(&self) -> SlotRef {
        SlotRef::new(self.inner.name.clone(), STOP_SLOT, self.clone())
    }

    /// Makes `exec()` return without processing the rest of its batch.
    pub fn request_terminate(&self) {
        if let Err(err) = self.inner.queue.put(&Envelope::control(Control::Terminate)) {
            log::warn!("event loop {}: terminate request could not be enqueued: {err}", self.name());
        }
    }

    /// Enqueues a raw envelope on this loop.
    pub fn post(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.inner.queue.put(envelope)
    }

    /// Registers a new object under `id`; `build` receives the object's base.
    pub fn attach<T, F>(&self, id: impl Into<ObjectId>, build: F) -> Result<Handle<T>, ObjectError>
    where
        T: EventLoopObject,
        F: FnOnce(ObjectBase) -> T,
    {
        let id = id.into();
        if id.is_empty() {
            return Err(ObjectError::EmptyId);
        }
        if self.inner.registry.lock().contains(&id) {
            return Err(ObjectError::DuplicateId {
                id,
                event_loop: self.name().clone(),
            });
        }

        let base = ObjectBase::new(id.clone(), self);
        let bound = Bound::new(build(base.clone()), base);
        self.inner.registry.lock().insert(
            &self.inner.name,
            id.clone(),
            Arc::clone(&bound) as Arc<dyn Dispatch>,
        )?;

        log::debug!("attached {id} to event loop {}", self.name());
        Ok(Handle::new(bound))
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner.registry.lock().contains(id)
    }

    /// Number of registered objects, the loop itself included.
    pub fn object_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.inner.registry.lock().ids()
    }

    /// Runs the loop on the calling thread until it is stopped or
    /// terminated. A loop runs at most once, and never in the parent of a
    /// forked [`EventLoopProcess`](crate::EventLoopProcess) that runs it.
    pub fn exec(&self) -> Result<(), LoopError> {
        if self.inner.forked.load(Ordering::SeqCst) {
            return Err(LoopError::Forked(self.name().clone()));
        }
        let started = self.inner.state.compare_exchange(
            LoopState::Created as u8,
            LoopState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if started.is_err() {
            return Err(LoopError::AlreadyStarted(self.name().clone()));
        }

        log::debug!("event loop {} running in process {}", self.name(), std::process::id());
        self.inner.start.emit(());

        let result = self.run();
        if let Err(err) = &result {
            log::error!("event loop {} failed: {err}", self.name());
        }

        self.advance(LoopState::Stopping);
        self.inner.terminate.emit(());
        self.advance(LoopState::Terminated);
        log::debug!("event loop {} terminated", self.name());
        result
    }

    fn run(&self) -> Result<(), LoopError> {
        loop {
            self.service_timers();

            let mut batch = match self.inner.queue.get(self.next_wait()) {
                Ok(batch) => batch,
                Err(QueueError::Empty) => continue,
                Err(source) => return Err(self.queue_failed(source)),
            };
            match self.inner.queue.get_many_nowait() {
                Ok(more) => batch.extend(more),
                Err(QueueError::Empty) => {}
                Err(source) => return Err(self.queue_failed(source)),
            }

            if !self.process_batch(batch) {
                return Ok(());
            }
        }
    }

    fn queue_failed(&self, source: QueueError) -> LoopError {
        LoopError::Queue {
            name: self.name().clone(),
            source,
        }
    }

    /// Returns `false` once the loop should leave `exec()`. A stop request
    /// lets the rest of the batch through; terminate does not.
    fn process_batch(&self, batch: Vec<Envelope>) -> bool {
        let mut keep_running = true;
        for envelope in batch {
            match envelope.control {
                Control::Normal => self.dispatch(envelope),
                Control::Stop => {
                    if keep_running {
                        log::debug!("event loop {} stopping", self.name());
                    }
                    self.advance(LoopState::Stopping);
                    keep_running = false;
                }
                Control::Terminate => {
                    log::debug!("event loop {} terminating", self.name());
                    self.advance(LoopState::Stopping);
                    return false;
                }
            }
        }
        keep_running
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope {
            destination,
            name,
            args,
            ..
        } = envelope;

        match destination {
            Destination::Object(id) => self.invoke(&id, &name, &args),
            Destination::Broadcast => {
                let subscribers = self.inner.registry.lock().subscribers(&name);
                if subscribers.is_empty() {
                    debug_every_n!(
                        self.inner.config.log_every_n,
                        "event loop {}: broadcast {} has no subscribers",
                        self.name(),
                        name
                    );
                }
                for subscriber in subscribers {
                    self.invoke(&subscriber.object, &subscriber.slot, &args);
                }
            }
            Destination::Loop => {}
        }
    }

    fn invoke(&self, id: &ObjectId, slot: &str, args: &Args) {
        let every_n = self.inner.config.log_every_n;
        let Some(entry) = self.lookup(id) else {
            warn_every_n!(
                every_n,
                "event loop {}: object {} not found, dropping call to {}",
                self.name(),
                id,
                slot
            );
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| entry.invoke(slot, args))) {
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(err))) => {
                log::error!("event loop {}: slot {id}.{slot} failed: {err}", self.name());
            }
            Ok(None) => {
                warn_every_n!(
                    every_n,
                    "event loop {}: object {} has no slot {}, dropping call",
                    self.name(),
                    id,
                    slot
                );
            }
            Err(payload) => {
                log::error!(
                    "event loop {}: slot {id}.{slot} panicked: {}",
                    self.name(),
                    panic_message(&*payload)
                );
            }
        }
    }

    fn service_timers(&self) {
        let timers: Vec<Arc<TimerShared>> = {
            let mut timers = self.inner.timers.lock();
            timers.retain(|timer| timer.strong_count() > 0);
            timers.iter().filter_map(Weak::upgrade).collect()
        };

        let now = Instant::now();
        for timer in timers {
            timer.poll(now);
        }
    }

    /// Receive timeout: the poll interval, shortened to the nearest timer
    /// deadline.
    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.inner
            .timers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|timer| timer.deadline())
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.inner.config.poll_interval, Duration::min)
    }

    fn advance(&self, state: LoopState) {
        self.inner.state.fetch_max(state as u8, Ordering::SeqCst);
    }
}

impl EventLoop {
    pub(crate) fn downgrade(&self) -> WeakLoop {
        WeakLoop(Arc::downgrade(&self.inner))
    }

    pub(crate) fn mark_forked(&self) {
        self.inner.forked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sender(&self) -> QueueSender {
        self.inner.queue.sender()
    }

    pub(crate) fn lookup(&self, id: &ObjectId) -> Option<Arc<dyn Dispatch>> {
        self.inner.registry.lock().get(id)
    }

    pub(crate) fn subscribe(&self, signal: &str, object: &ObjectId, slot: &str) {
        self.inner
            .registry
            .lock()
            .subscribe(signal, object.clone(), slot.to_owned());
        log::debug!(
            "{object}.{slot} subscribed to broadcasts of {signal} on {}",
            self.name()
        );
    }

    pub(crate) fn track_signal(&self, signal: &Signal) {
        self.inner.signals.lock().push(signal.downgrade());
    }

    /// Remembers a signal that sends to objects of this loop, so detaching
    /// one of them can remove the connection.
    pub(crate) fn track_inbound(&self, signal: &Signal) {
        let weak = signal.downgrade();
        let mut inbound = self.inner.inbound.lock();
        inbound.retain(|known| known.strong_count() > 0);
        if !inbound.iter().any(|known| known.ptr_eq(&weak)) {
            inbound.push(weak);
        }
    }

    pub(crate) fn track_timer(&self, timer: &Arc<TimerShared>) {
        self.inner.timers.lock().push(Arc::downgrade(timer));
    }

    pub(crate) fn find_signal(&self, origin: &Arc<Origin>, name: &str) -> Option<Signal> {
        self.inner
            .signals
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|core| Arc::ptr_eq(core.origin(), origin) && core.name() == name)
            .map(Signal::from_core)
    }

    /// Detaches the object registered under `id`, provided it is the one
    /// identified by `origin` and not a later object reusing the id.
    pub(crate) fn detach_object(&self, id: &ObjectId, origin: &Arc<Origin>) -> bool {
        let removed = self.inner.registry.lock().remove_if(id, |entry| {
            entry.origin().is_some_and(|known| Arc::ptr_eq(known, origin))
        });
        if removed.is_none() {
            return false;
        }

        self.inner.timers.lock().retain(|weak| match weak.upgrade() {
            Some(timer) if timer.owner() == id => {
                timer.disarm();
                false
            }
            Some(_) => true,
            None => false,
        });

        let owned: Vec<Arc<SignalCore>> = {
            let mut owned = Vec::new();
            self.inner.signals.lock().retain(|weak| match weak.upgrade() {
                Some(core) if Arc::ptr_eq(core.origin(), origin) => {
                    owned.push(core);
                    false
                }
                Some(_) => true,
                None => false,
            });
            owned
        };
        for core in &owned {
            core.clear();
        }

        let inbound: Vec<Arc<SignalCore>> = {
            let mut inbound = self.inner.inbound.lock();
            inbound.retain(|weak| weak.strong_count() > 0);
            inbound.iter().filter_map(Weak::upgrade).collect()
        };
        let removed: usize = inbound.iter().map(|core| core.drop_target(id)).sum();

        log::debug!(
            "detached {id} from event loop {} ({} signal(s) cleared, {removed} inbound connection(s) removed)",
            self.name(),
            owned.len()
        );
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", self.name())
            .field("state", &self.state())
            .finish()
    }
}
