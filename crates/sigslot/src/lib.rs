//! # sigslot
//!
//! Signals and slots across event loops, threads and forked processes.
//! Objects live on exactly one [`EventLoop`]; a [`Signal`] emission becomes
//! one [`Envelope`] per connection, pushed onto the target loop's queue, and
//! the target loop invokes the named slot when it drains the queue. The same
//! path is used whether the receiver is on the emitting loop, another thread
//! or another process.
//!
//! ## Module Overview
//! - [`envelope`]   – Addressed messages and their positional arguments.
//! - [`queue`]      – Datagram queue shared by a loop and its producers.
//! - [`registry`]   – Object ids and slot dispatch tables.
//! - [`object`]     – Objects, handles and slot addresses.
//! - [`signal`]     – Connections, broadcast and emission.
//! - [`event_loop`] – The cooperative scheduler.
//! - [`timer`]      – Loop-serviced timers.
//! - [`process`]    – Running a loop in a child process or thread.
//!
//! ```no_run
//! use sigslot::{EventLoop, EventLoopObject, ObjectBase, Signal, SlotTable};
//!
//! struct Counter {
//!     count: u32,
//! }
//!
//! impl EventLoopObject for Counter {
//!     fn register_slots(slots: &mut SlotTable<Self>) {
//!         slots.add("inc", |c: &mut Counter, (): ()| {
//!             c.count += 1;
//!             Ok(())
//!         });
//!     }
//! }
//!
//! struct Button {
//!     clicked: Signal,
//! }
//!
//! impl EventLoopObject for Button {
//!     fn register_slots(_: &mut SlotTable<Self>) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let event_loop = EventLoop::new("main")?;
//! let counter = event_loop.attach("counter", |_| Counter { count: 0 })?;
//! let button = event_loop.attach("button", |base: ObjectBase| Button {
//!     clicked: base.signal("clicked"),
//! })?;
//!
//! button.lock().clicked.connect(&counter.slot("inc")?)?;
//! button.lock().clicked.connect(&event_loop.stop_slot())?;
//! button.lock().clicked.emit(());
//! event_loop.exec()?;
//! assert_eq!(counter.lock().count, 1);
//! # Ok(())
//! # }
//! ```

pub mod envelope;
pub mod error;
pub mod event_loop;
pub mod object;
pub mod process;
pub mod queue;
pub mod registry;
pub mod signal;
pub mod timer;

pub use envelope::{Args, Control, Destination, Envelope};
pub use error::{
    LoopError, ObjectError, ProcessError, QueueError, SignalError, SlotError, SlotResult,
};
pub use event_loop::{EventLoop, LoopConfig, LoopConfigBuilder, LoopState, STOP_SLOT};
pub use object::{EventLoopObject, Handle, ObjectBase, SlotRef};
pub use process::{EventLoopProcess, ExecutionContext, ExitStatus, ProcessState};
pub use queue::{MessageQueue, QueueConfig, QueueSender};
pub use registry::{ObjectId, SlotTable};
pub use signal::Signal;
pub use timer::Timer;

#[cfg(test)]
mod tests;
