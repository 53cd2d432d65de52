//! Error types.
//!
//! Configuration mistakes (duplicate ids, unknown slots, misuse of the process
//! lifecycle) surface as `Err` values to the caller. Delivery problems at run
//! time never do: they are logged and the message is dropped.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::registry::ObjectId;

/// Error returned by a slot handler. The event loop logs it and moves on.
pub type SlotError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type of slot handlers.
pub type SlotResult = Result<(), SlotError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    #[error("queue is full")]
    Full,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("queue i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("object id must not be empty")]
    EmptyId,
    #[error("object {id} is already registered with event loop {event_loop}")]
    DuplicateId { id: ObjectId, event_loop: ObjectId },
    #[error("timer interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error(
        "object id {id} is already connected on event loop {existing}, \
         refusing a second object with the same id on {requested}"
    )]
    IdentityConflict {
        id: ObjectId,
        existing: ObjectId,
        requested: ObjectId,
    },
    #[error("object {id} has no slot named {slot}")]
    UnknownSlot { id: ObjectId, slot: String },
    #[error("object {0} has no signal named {1}")]
    UnknownSignal(ObjectId, String),
    #[error("object {0} is detached")]
    Detached(ObjectId),
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("event loop {0} was already started")]
    AlreadyStarted(ObjectId),
    #[error("event loop {0} runs in a forked child and cannot be executed by the parent")]
    Forked(ObjectId),
    #[error("event loop {name} queue failed: {source}")]
    Queue {
        name: ObjectId,
        #[source]
        source: QueueError,
    },
    #[error("failed to create event loop queue: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {0} was already started")]
    AlreadyStarted(String),
    #[error("process {0} was never started")]
    NotStarted(String),
    #[error("failed to spawn process {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for process {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Loop(#[from] LoopError),
}
