//! Event loop objects.
//!
//! Application types implement [`EventLoopObject`] and are attached to an
//! event loop with [`EventLoop::attach`]. The loop's registry owns the object
//! from then on; callers keep a [`Handle`] to reach it, to connect its
//! signals, and to detach it again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::envelope::Args;
use crate::error::{SignalError, SlotResult};
use crate::event_loop::{EventLoop, WeakLoop};
use crate::registry::{Dispatch, ObjectId, SlotTable};
use crate::signal::Signal;

/// Implemented by every type that lives on an event loop.
pub trait EventLoopObject: Send + Sized + 'static {
    /// Declares the slots other objects may connect to.
    fn register_slots(slots: &mut SlotTable<Self>);
}

struct Route {
    event_loop: ObjectId,
    connections: usize,
}

/// Emitter identity shared by all signals of one object.
///
/// Remembers which loop each connected receiver id lives on, so a second
/// object reusing the id on another loop is caught at connect time. A route
/// is forgotten once the last connection to that receiver is gone.
pub(crate) struct Origin {
    id: ObjectId,
    routes: Mutex<HashMap<ObjectId, Route>>,
}

impl Origin {
    pub fn new(id: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            id,
            routes: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Records one more connection to `receiver` on `event_loop`.
    pub fn claim_route(&self, receiver: &ObjectId, event_loop: &ObjectId) -> Result<(), SignalError> {
        let mut routes = self.routes.lock();
        match routes.get_mut(receiver) {
            Some(route) if &route.event_loop != event_loop => Err(SignalError::IdentityConflict {
                id: receiver.clone(),
                existing: route.event_loop.clone(),
                requested: event_loop.clone(),
            }),
            Some(route) => {
                route.connections += 1;
                Ok(())
            }
            None => {
                routes.insert(
                    receiver.clone(),
                    Route {
                        event_loop: event_loop.clone(),
                        connections: 1,
                    },
                );
                Ok(())
            }
        }
    }

    /// Forgets `count` connections to `receiver`.
    pub fn release_route(&self, receiver: &ObjectId, count: usize) {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get_mut(receiver) {
            route.connections = route.connections.saturating_sub(count);
            if route.connections == 0 {
                routes.remove(receiver);
            }
        }
    }

    #[cfg(test)]
    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }
}

/// What an object knows about itself: its id and its loop.
///
/// Handed to the constructor closure of [`EventLoop::attach`]; objects
/// usually keep it as a field and create their signals from it. The base
/// does not keep its loop alive.
#[derive(Clone)]
pub struct ObjectBase {
    origin: Arc<Origin>,
    event_loop: WeakLoop,
    loop_name: ObjectId,
    log_every_n: u64,
}

impl ObjectBase {
    pub(crate) fn new(id: ObjectId, event_loop: &EventLoop) -> Self {
        Self {
            origin: Origin::new(id),
            event_loop: event_loop.downgrade(),
            loop_name: event_loop.name().clone(),
            log_every_n: event_loop.config().log_every_n,
        }
    }

    pub(crate) fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub fn object_id(&self) -> &ObjectId {
        self.origin.id()
    }

    /// Name of the loop the object was attached to.
    pub fn loop_name(&self) -> &ObjectId {
        &self.loop_name
    }

    /// The object's loop, or `None` once the loop has been dropped.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.event_loop.upgrade()
    }

    /// Declares a signal owned by this object.
    pub fn signal(&self, name: &str) -> Signal {
        let signal = Signal::new(Arc::clone(&self.origin), name, self.log_every_n);
        if let Some(event_loop) = self.event_loop() {
            event_loop.track_signal(&signal);
        }
        signal
    }

    /// Addresses one of this object's slots.
    pub fn slot(&self, name: &str) -> Result<SlotRef, SignalError> {
        let id = self.object_id();
        let (event_loop, entry) = self
            .registered()
            .ok_or_else(|| SignalError::Detached(id.clone()))?;
        if !entry.has_slot(name) {
            return Err(SignalError::UnknownSlot {
                id: id.clone(),
                slot: name.to_owned(),
            });
        }
        Ok(SlotRef::new(id.clone(), name, event_loop))
    }

    /// Receives every broadcast of `signal` arriving on this object's loop.
    pub fn subscribe(&self, signal: &str, slot: &str) -> Result<(), SignalError> {
        let target = self.slot(slot)?;
        target.event_loop().subscribe(signal, self.object_id(), slot);
        Ok(())
    }

    /// Whether the loop's registry still holds this very object, and not
    /// another one registered later under the same id.
    pub fn is_attached(&self) -> bool {
        self.registered().is_some()
    }

    /// Removes the object from its loop and from every connection that
    /// references it. Returns `false` if it was already detached.
    pub fn detach(&self) -> bool {
        self.event_loop()
            .is_some_and(|event_loop| event_loop.detach_object(self.object_id(), &self.origin))
    }

    fn registered(&self) -> Option<(EventLoop, Arc<dyn Dispatch>)> {
        let event_loop = self.event_loop()?;
        let entry = event_loop.lookup(self.object_id())?;
        let same = entry
            .origin()
            .is_some_and(|origin| Arc::ptr_eq(origin, &self.origin));
        same.then_some((event_loop, entry))
    }
}

impl fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBase")
            .field("id", self.object_id())
            .field("event_loop", &self.loop_name)
            .finish()
    }
}

/// Address of a slot: object id, slot name and the loop that delivers it.
#[derive(Clone)]
pub struct SlotRef {
    object: ObjectId,
    slot: String,
    target: EventLoop,
}

impl SlotRef {
    pub(crate) fn new(object: ObjectId, slot: &str, target: EventLoop) -> Self {
        Self {
            object,
            slot: slot.to_owned(),
            target,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object
    }

    pub fn slot_name(&self) -> &str {
        &self.slot
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.target
    }
}

impl fmt::Debug for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.object, self.slot, self.target.name())
    }
}

/// Registry entry: the object, its dispatch table and its base.
pub(crate) struct Bound<T> {
    object: Mutex<T>,
    table: SlotTable<T>,
    base: ObjectBase,
}

impl<T: EventLoopObject> Bound<T> {
    pub fn new(object: T, base: ObjectBase) -> Arc<Self> {
        let mut table = SlotTable::new();
        T::register_slots(&mut table);
        Arc::new(Self {
            object: Mutex::new(object),
            table,
            base,
        })
    }
}

impl<T: EventLoopObject> Dispatch for Bound<T> {
    fn has_slot(&self, slot: &str) -> bool {
        self.table.contains(slot)
    }

    fn invoke(&self, slot: &str, args: &Args) -> Option<SlotResult> {
        let mut object = self.object.lock();
        self.table.call(&mut object, slot, args)
    }

    fn origin(&self) -> Option<&Arc<Origin>> {
        Some(self.base.origin())
    }
}

/// Caller-side handle to an attached object.
pub struct Handle<T> {
    bound: Arc<Bound<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            bound: Arc::clone(&self.bound),
        }
    }
}

impl<T: EventLoopObject> Handle<T> {
    pub(crate) fn new(bound: Arc<Bound<T>>) -> Self {
        Self { bound }
    }

    pub fn base(&self) -> &ObjectBase {
        &self.bound.base
    }

    pub fn object_id(&self) -> &ObjectId {
        self.bound.base.object_id()
    }

    pub fn event_loop(&self) -> Option<EventLoop> {
        self.bound.base.event_loop()
    }

    /// Locks the object. Do not hold the guard across `exec()` of the loop
    /// that owns it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.bound.object.lock()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.bound.object.lock())
    }

    /// Addresses a slot of this object, checking that it exists.
    pub fn slot(&self, name: &str) -> Result<SlotRef, SignalError> {
        if !self.bound.table.contains(name) {
            return Err(SignalError::UnknownSlot {
                id: self.object_id().clone(),
                slot: name.to_owned(),
            });
        }
        self.base().slot(name)
    }

    /// Looks up a signal this object declared through its base.
    pub fn signal(&self, name: &str) -> Result<Signal, SignalError> {
        let event_loop = self
            .event_loop()
            .ok_or_else(|| SignalError::Detached(self.object_id().clone()))?;
        event_loop
            .find_signal(self.base().origin(), name)
            .ok_or_else(|| SignalError::UnknownSignal(self.object_id().clone(), name.to_owned()))
    }

    pub fn subscribe(&self, signal: &str, slot: &str) -> Result<(), SignalError> {
        self.base().subscribe(signal, slot)
    }

    pub fn detach(&self) -> bool {
        self.base().detach()
    }

    pub fn is_attached(&self) -> bool {
        self.base().is_attached()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.bound.base).finish()
    }
}
