mod signal;

use std::thread;
use std::time::Duration;

use crate::{EventLoop, EventLoopObject, Handle, ObjectBase, Signal, SlotResult, SlotTable};

pub(super) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Receiving side of most tests.
#[derive(Default)]
pub(super) struct Collector {
    pub count: usize,
    pub values: Vec<i64>,
    pub pairs: Vec<(i64, String)>,
}

impl EventLoopObject for Collector {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots
            .add("inc", |c: &mut Collector, (): ()| {
                c.count += 1;
                Ok(())
            })
            .add("record", |c: &mut Collector, (value,): (i64,)| {
                c.values.push(value);
                Ok(())
            })
            .add("pair", |c: &mut Collector, (n, label): (i64, String)| {
                c.pairs.push((n, label));
                Ok(())
            })
            .add("fail", |_: &mut Collector, (): ()| -> SlotResult {
                Err("failing on purpose".into())
            })
            .add("boom", |_: &mut Collector, (): ()| -> SlotResult {
                panic!("panicking on purpose")
            });
    }
}

/// Object with one signal and no slots.
pub(super) struct Emitter {
    pub foo: Signal,
}

impl EventLoopObject for Emitter {
    fn register_slots(_: &mut SlotTable<Self>) {}
}

/// Re-emits every received value plus one.
pub(super) struct Relay {
    pub out: Signal,
}

impl EventLoopObject for Relay {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots.add("forward", |relay: &mut Relay, (value,): (i64,)| {
            relay.out.emit((value + 1,));
            Ok(())
        });
    }
}

pub(super) fn collector(event_loop: &EventLoop, id: &str) -> Handle<Collector> {
    event_loop.attach(id, |_| Collector::default()).unwrap()
}

pub(super) fn emitter(event_loop: &EventLoop, id: &str) -> Handle<Emitter> {
    event_loop
        .attach(id, |base: ObjectBase| Emitter {
            foo: base.signal("foo"),
        })
        .unwrap()
}

pub(super) fn relay(event_loop: &EventLoop, id: &str) -> Handle<Relay> {
    event_loop
        .attach(id, |base: ObjectBase| Relay {
            out: base.signal("out"),
        })
        .unwrap()
}

/// Processes everything queued so far, then returns.
pub(super) fn drain(event_loop: &EventLoop) {
    event_loop.stop();
    event_loop.exec().unwrap();
}

/// Runs the loop on this thread and stops it from another after `duration`.
pub(super) fn run_for(event_loop: &EventLoop, duration: Duration) {
    let remote = event_loop.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(duration);
        remote.stop();
    });
    event_loop.exec().unwrap();
    stopper.join().unwrap();
}
