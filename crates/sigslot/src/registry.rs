//! Object identity and the per-loop object registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::Args;
use crate::error::{ObjectError, SlotResult};
use crate::object::Origin;

/// Application-chosen identifier of an object.
///
/// Ids are the only way envelopes address objects, so they must be unique
/// across every event loop that exchanges signals, not just within one loop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates `<kind>_<pid>_<n>`, unique within the process tree.
    pub fn generate(kind: &str) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("{kind}_{}_{n}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&ObjectId> for ObjectId {
    fn from(value: &ObjectId) -> Self {
        value.clone()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Handler<T> = Box<dyn Fn(&mut T, &Args) -> SlotResult + Send + Sync>;

/// Typed dispatch table mapping slot names to methods of `T`.
///
/// Each handler names the argument tuple it expects; the table decodes the
/// envelope arguments into that tuple before calling it.
pub struct SlotTable<T> {
    handlers: HashMap<&'static str, Handler<T>>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn add<A, F>(&mut self, name: &'static str, handler: F) -> &mut Self
    where
        T: 'static,
        A: DeserializeOwned + 'static,
        F: Fn(&mut T, A) -> SlotResult + Send + Sync + 'static,
    {
        self.handlers.insert(
            name,
            Box::new(move |target: &mut T, args: &Args| {
                let decoded = args.decode::<A>().map_err(|err| {
                    format!("slot {name}: cannot decode {} argument(s): {err}", args.len())
                })?;
                handler(target, decoded)
            }),
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// `None` when no slot of that name exists.
    pub fn call(&self, target: &mut T, name: &str, args: &Args) -> Option<SlotResult> {
        self.handlers.get(name).map(|handler| handler(target, args))
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Object-safe view of a registered object used by the dispatcher.
pub(crate) trait Dispatch: Send + Sync {
    fn has_slot(&self, slot: &str) -> bool;
    /// `None` when the slot does not exist.
    fn invoke(&self, slot: &str, args: &Args) -> Option<SlotResult>;
    /// Identity of the object behind the entry; `None` for the loop itself.
    fn origin(&self) -> Option<&Arc<Origin>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub object: ObjectId,
    pub slot: String,
}

/// Objects registered with one event loop plus their broadcast
/// subscriptions.
#[derive(Default)]
pub(crate) struct Registry {
    objects: HashMap<ObjectId, Arc<dyn Dispatch>>,
    subscriptions: HashMap<String, Vec<Subscription>>,
}

impl Registry {
    pub fn insert(
        &mut self,
        owner: &ObjectId,
        id: ObjectId,
        object: Arc<dyn Dispatch>,
    ) -> Result<(), ObjectError> {
        if id.is_empty() {
            return Err(ObjectError::EmptyId);
        }
        if self.objects.contains_key(&id) {
            return Err(ObjectError::DuplicateId {
                id,
                event_loop: owner.clone(),
            });
        }
        self.objects.insert(id, object);
        Ok(())
    }

    /// Drops the object and every subscription it holds.
    pub fn remove(&mut self, id: &ObjectId) -> Option<Arc<dyn Dispatch>> {
        let removed = self.objects.remove(id)?;
        for subscribers in self.subscriptions.values_mut() {
            subscribers.retain(|sub| &sub.object != id);
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        Some(removed)
    }

    /// Removes the entry under `id` only if `accept` agrees.
    pub fn remove_if(
        &mut self,
        id: &ObjectId,
        accept: impl FnOnce(&dyn Dispatch) -> bool,
    ) -> Option<Arc<dyn Dispatch>> {
        if !self.objects.get(id).is_some_and(|entry| accept(entry.as_ref())) {
            return None;
        }
        self.remove(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<dyn Dispatch>> {
        self.objects.get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().cloned().collect()
    }

    pub fn subscribe(&mut self, signal: &str, object: ObjectId, slot: String) {
        self.subscriptions
            .entry(signal.to_owned())
            .or_default()
            .push(Subscription { object, slot });
    }

    pub fn subscribers(&self, signal: &str) -> Vec<Subscription> {
        self.subscriptions.get(signal).cloned().unwrap_or_default()
    }
}
