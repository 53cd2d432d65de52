#![allow(dead_code)]

use sigslot::{EventLoop, EventLoopObject, Handle, ObjectBase, Signal, SlotTable};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct Recorder {
    pub values: Vec<i64>,
    pub words: Vec<(String, i64)>,
}

impl EventLoopObject for Recorder {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots
            .add("record", |r: &mut Recorder, (value,): (i64,)| {
                r.values.push(value);
                Ok(())
            })
            .add("word", |r: &mut Recorder, (word, n): (String, i64)| {
                r.words.push((word, n));
                Ok(())
            });
    }
}

/// Answers every `ping` with a `pong` carrying the value plus one.
pub struct Echo {
    pub pong: Signal,
}

impl EventLoopObject for Echo {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots.add("ping", |echo: &mut Echo, (value,): (i64,)| {
            echo.pong.emit((value + 1,));
            Ok(())
        });
    }
}

pub struct Source {
    pub out: Signal,
}

impl EventLoopObject for Source {
    fn register_slots(_: &mut SlotTable<Self>) {}
}

pub fn recorder(event_loop: &EventLoop, id: &str) -> Handle<Recorder> {
    event_loop.attach(id, |_| Recorder::default()).unwrap()
}

pub fn echo(event_loop: &EventLoop, id: &str) -> Handle<Echo> {
    event_loop
        .attach(id, |base: ObjectBase| Echo {
            pong: base.signal("pong"),
        })
        .unwrap()
}

pub fn source(event_loop: &EventLoop, id: &str) -> Handle<Source> {
    event_loop
        .attach(id, |base: ObjectBase| Source {
            out: base.signal("out"),
        })
        .unwrap()
}
