//! Signals: per-object emission points.
//!
//! A signal keeps only addresses (object id, slot name, target queue), never
//! references to the receiving objects, so a connection made before a fork
//! stays valid on both sides of it.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use sigslot_log::{error_every_n, warn_every_n};

use crate::envelope::{Args, Envelope};
use crate::error::SignalError;
use crate::event_loop::EventLoop;
use crate::object::{Origin, SlotRef};
use crate::queue::QueueSender;
use crate::registry::ObjectId;

#[derive(Clone)]
struct Connection {
    object: ObjectId,
    slot: String,
    queue: QueueSender,
}

#[derive(Default)]
struct SignalState {
    connections: Vec<Connection>,
    broadcast: Vec<QueueSender>,
}

pub(crate) struct SignalCore {
    origin: Arc<Origin>,
    name: String,
    state: Mutex<SignalState>,
    log_every_n: u64,
}

impl SignalCore {
    pub fn owner(&self) -> &ObjectId {
        self.origin.id()
    }

    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Removes every connection to `object`; returns how many were removed.
    pub fn drop_target(&self, object: &ObjectId) -> usize {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state.connections.retain(|conn| &conn.object != object);
        let removed = before - state.connections.len();
        self.origin.release_route(object, removed);
        removed
    }

    /// Removes all connections and broadcast targets.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for conn in state.connections.drain(..) {
            self.origin.release_route(&conn.object, 1);
        }
        state.broadcast.clear();
    }
}

/// Named emission point owned by one object.
#[derive(Clone)]
pub struct Signal {
    core: Arc<SignalCore>,
}

impl Signal {
    pub(crate) fn new(origin: Arc<Origin>, name: &str, log_every_n: u64) -> Self {
        Self {
            core: Arc::new(SignalCore {
                origin,
                name: name.to_owned(),
                state: Mutex::new(SignalState::default()),
                log_every_n,
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<SignalCore>) -> Self {
        Self { core }
    }

    pub(crate) fn downgrade(&self) -> Weak<SignalCore> {
        Arc::downgrade(&self.core)
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn owner(&self) -> &ObjectId {
        self.core.owner()
    }

    /// Adds a connection to `slot`. Connecting twice delivers twice.
    ///
    /// Fails with [`SignalError::IdentityConflict`] when this object already
    /// sends to the same receiver id on a different loop.
    pub fn connect(&self, slot: &SlotRef) -> Result<(), SignalError> {
        let target = slot.event_loop();
        self.core.origin.claim_route(slot.object_id(), target.name())?;

        self.core.state.lock().connections.push(Connection {
            object: slot.object_id().clone(),
            slot: slot.slot_name().to_owned(),
            queue: target.sender(),
        });
        target.track_inbound(self);

        log::debug!(
            "connected {}.{} -> {}.{} on {}",
            self.owner(),
            self.name(),
            slot.object_id(),
            slot.slot_name(),
            target.name()
        );
        Ok(())
    }

    /// Removes the first connection to `slot`. Returns `false` if there was
    /// none. Once no connection to the receiver is left, its id may be
    /// connected again on any loop.
    pub fn disconnect(&self, slot: &SlotRef) -> bool {
        let mut state = self.core.state.lock();
        let position = state.connections.iter().position(|conn| {
            &conn.object == slot.object_id() && conn.slot == slot.slot_name()
        });
        match position {
            Some(index) => {
                let conn = state.connections.remove(index);
                self.core.origin.release_route(&conn.object, 1);
                true
            }
            None => false,
        }
    }

    /// Delivers this signal to every subscriber on `event_loop`, including
    /// subscribers that appear after this call.
    pub fn broadcast_on(&self, event_loop: &EventLoop) {
        let queue = event_loop.sender();
        let mut state = self.core.state.lock();
        if !state.broadcast.iter().any(|known| known.same_queue(&queue)) {
            state.broadcast.push(queue);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.core.state.lock().connections.len()
    }

    pub fn broadcast_count(&self) -> usize {
        self.core.state.lock().broadcast.len()
    }

    /// Emits one set of positional arguments, given as a tuple.
    pub fn emit<A: Serialize>(&self, args: A) {
        match Args::encode(&args) {
            Ok(args) => self.deliver(vec![args]),
            Err(err) => self.encode_failed(err),
        }
    }

    /// Same deliveries as calling [`emit`](Self::emit) once per item, but
    /// each destination queue receives them as one batch.
    pub fn emit_many<I, A>(&self, batch: I)
    where
        I: IntoIterator<Item = A>,
        A: Serialize,
    {
        let mut encoded = Vec::new();
        for args in batch {
            match Args::encode(&args) {
                Ok(args) => encoded.push(args),
                Err(err) => self.encode_failed(err),
            }
        }
        self.deliver(encoded);
    }

    fn deliver(&self, batch: Vec<Args>) {
        let (connections, broadcast) = {
            let state = self.core.state.lock();
            (state.connections.clone(), state.broadcast.clone())
        };
        if batch.is_empty() || (connections.is_empty() && broadcast.is_empty()) {
            return;
        }

        let mut outgoing: Vec<(QueueSender, Vec<Envelope>)> = Vec::new();
        for args in &batch {
            for conn in &connections {
                let envelope = Envelope::call(conn.object.clone(), conn.slot.as_str(), args.clone());
                route(&mut outgoing, &conn.queue, envelope);
            }
            for queue in &broadcast {
                let envelope = Envelope::broadcast(self.name(), args.clone());
                route(&mut outgoing, queue, envelope);
            }
        }

        for (queue, envelopes) in outgoing {
            if let Err(err) = queue.put_many(&envelopes) {
                warn_every_n!(
                    self.core.log_every_n,
                    "signal {}.{} could not enqueue {} envelope(s) for loop {}: {}",
                    self.owner(),
                    self.name(),
                    envelopes.len(),
                    queue.label(),
                    err
                );
            }
        }
    }

    fn encode_failed(&self, err: serde_json::Error) {
        error_every_n!(
            self.core.log_every_n,
            "signal {}.{} arguments cannot be encoded: {}",
            self.owner(),
            self.name(),
            err
        );
    }
}

/// Appends `envelope` to the batch of its destination queue, keeping the
/// first-seen order of queues.
fn route(outgoing: &mut Vec<(QueueSender, Vec<Envelope>)>, queue: &QueueSender, envelope: Envelope) {
    match outgoing.iter_mut().find(|(known, _)| known.same_queue(queue)) {
        Some((_, envelopes)) => envelopes.push(envelope),
        None => outgoing.push((queue.clone(), vec![envelope])),
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("owner", self.owner())
            .field("name", &self.name())
            .field("connections", &self.connection_count())
            .field("broadcast", &self.broadcast_count())
            .finish()
    }
}
