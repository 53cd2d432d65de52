use std::time::Duration;

use super::{collector, drain, emitter, init_logging, relay, run_for};
use crate::{EventLoop, ObjectError, SignalError};

#[test]
fn foo_to_inc_increments_once() {
    init_logging();
    let event_loop = EventLoop::new("signal_foo_inc").unwrap();
    let o1 = collector(&event_loop, "o1");
    let o2 = emitter(&event_loop, "o2");

    o2.lock().foo.connect(&o1.slot("inc").unwrap()).unwrap();
    o2.lock().foo.emit(());
    drain(&event_loop);

    assert_eq!(o1.lock().count, 1);
}

#[test]
fn reconnecting_after_disconnect_delivers_once() {
    let event_loop = EventLoop::new("signal_reconnect").unwrap();
    let target = collector(&event_loop, "target");
    let source = emitter(&event_loop, "source");
    let inc = target.slot("inc").unwrap();

    let signal = source.lock().foo.clone();
    signal.connect(&inc).unwrap();
    assert!(signal.disconnect(&inc));
    assert!(!signal.disconnect(&inc));
    signal.connect(&inc).unwrap();
    assert_eq!(signal.connection_count(), 1);

    signal.emit(());
    drain(&event_loop);
    assert_eq!(target.lock().count, 1);
}

#[test]
fn every_connection_receives_the_same_arguments_in_order() {
    let event_loop = EventLoop::new("signal_fanout").unwrap();
    let first = collector(&event_loop, "first");
    let second = collector(&event_loop, "second");
    let source = emitter(&event_loop, "source");

    let signal = source.lock().foo.clone();
    signal.connect(&first.slot("pair").unwrap()).unwrap();
    signal.connect(&second.slot("pair").unwrap()).unwrap();
    signal.connect(&first.slot("pair").unwrap()).unwrap();

    signal.emit((7, "seven"));
    drain(&event_loop);

    let expected = (7, "seven".to_owned());
    assert_eq!(first.lock().pairs, vec![expected.clone(), expected.clone()]);
    assert_eq!(second.lock().pairs, vec![expected]);
}

#[test]
fn emit_many_matches_repeated_emit() {
    let event_loop = EventLoop::new("signal_emit_many").unwrap();
    let batched = collector(&event_loop, "batched");
    let single = collector(&event_loop, "single");
    let batch_source = emitter(&event_loop, "batch_source");
    let single_source = emitter(&event_loop, "single_source");

    batch_source
        .lock()
        .foo
        .connect(&batched.slot("record").unwrap())
        .unwrap();
    single_source
        .lock()
        .foo
        .connect(&single.slot("record").unwrap())
        .unwrap();

    let values = [3_i64, 1, 4, 1, 5];
    batch_source.lock().foo.emit_many(values.iter().map(|v| (*v,)));
    for v in values {
        single_source.lock().foo.emit((v,));
    }
    drain(&event_loop);

    assert_eq!(batched.lock().values, values.to_vec());
    assert_eq!(batched.lock().values, single.lock().values);
}

#[test]
fn subscription_made_after_broadcast_on_still_receives() {
    let event_loop = EventLoop::new("signal_broadcast").unwrap();
    let source = emitter(&event_loop, "source");
    let listener = collector(&event_loop, "listener");
    let other = collector(&event_loop, "other");

    source.lock().foo.broadcast_on(&event_loop);
    source.lock().foo.broadcast_on(&event_loop);
    assert_eq!(source.lock().foo.broadcast_count(), 1);

    listener.subscribe("foo", "record").unwrap();
    other.base().subscribe("foo", "record").unwrap();
    source.lock().foo.emit((11,));
    drain(&event_loop);

    assert_eq!(listener.lock().values, vec![11]);
    assert_eq!(other.lock().values, vec![11]);
}

#[test]
fn broadcast_without_subscribers_is_dropped() {
    let event_loop = EventLoop::new("signal_broadcast_empty").unwrap();
    let source = emitter(&event_loop, "source");
    source.lock().foo.broadcast_on(&event_loop);

    for n in 0..5 {
        source.lock().foo.emit((n,));
    }
    drain(&event_loop);
}

#[test]
fn duplicate_id_on_the_same_loop_is_rejected() {
    let event_loop = EventLoop::new("signal_dup_local").unwrap();
    collector(&event_loop, "dup");
    let err = event_loop
        .attach("dup", |_| super::Collector::default())
        .unwrap_err();
    assert!(matches!(err, ObjectError::DuplicateId { .. }));

    let err = event_loop
        .attach("", |_| super::Collector::default())
        .unwrap_err();
    assert!(matches!(err, ObjectError::EmptyId));
}

#[test]
fn same_id_on_two_loops_is_an_identity_conflict() {
    let home = EventLoop::new("signal_dup_home").unwrap();
    let left = EventLoop::new("signal_dup_left").unwrap();
    let right = EventLoop::new("signal_dup_right").unwrap();
    let source = emitter(&home, "source");
    let a = collector(&left, "twin");
    let b = collector(&right, "twin");

    let signal = source.lock().foo.clone();
    signal.connect(&a.slot("inc").unwrap()).unwrap();
    signal.connect(&a.slot("record").unwrap()).unwrap();
    let err = signal.connect(&b.slot("inc").unwrap()).unwrap_err();
    assert!(matches!(err, SignalError::IdentityConflict { .. }));
    assert_eq!(signal.connection_count(), 2);
}

#[test]
fn released_ids_can_move_to_another_loop() {
    let home = EventLoop::new("signal_move_home").unwrap();
    let left = EventLoop::new("signal_move_left").unwrap();
    let right = EventLoop::new("signal_move_right").unwrap();
    let source = emitter(&home, "source");
    let signal = source.lock().foo.clone();

    // Detaching the receiver forgets where it lived.
    let first = collector(&left, "mover");
    signal.connect(&first.slot("inc").unwrap()).unwrap();
    signal.connect(&first.slot("record").unwrap()).unwrap();
    assert!(first.detach());
    assert_eq!(signal.connection_count(), 0);
    assert_eq!(source.base().origin().route_count(), 0);
    let moved = collector(&right, "mover");
    signal.connect(&moved.slot("inc").unwrap()).unwrap();

    // So does disconnecting its last connection, but not an earlier one.
    let back = collector(&left, "mover");
    signal.connect(&moved.slot("record").unwrap()).unwrap();
    assert!(signal.disconnect(&moved.slot("inc").unwrap()));
    let err = signal.connect(&back.slot("inc").unwrap()).unwrap_err();
    assert!(matches!(err, SignalError::IdentityConflict { .. }));
    assert!(signal.disconnect(&moved.slot("record").unwrap()));
    signal.connect(&back.slot("inc").unwrap()).unwrap();

    source.lock().foo.emit(());
    drain(&left);
    drain(&right);
    assert_eq!(back.lock().count, 1);
    assert_eq!(moved.lock().count, 0);
    assert_eq!(first.lock().count, 0);
}

#[test]
fn unknown_slot_is_rejected_at_connect_time() {
    let event_loop = EventLoop::new("signal_unknown_slot").unwrap();
    let target = collector(&event_loop, "target");
    let err = target.slot("missing").unwrap_err();
    assert!(matches!(err, SignalError::UnknownSlot { .. }));
    assert!(target.subscribe("foo", "missing").is_err());
}

#[test]
fn detached_destination_is_dropped_silently() {
    init_logging();
    let event_loop = EventLoop::new("signal_detached").unwrap();
    let target = collector(&event_loop, "target");
    let source = emitter(&event_loop, "source");
    let signal = source.lock().foo.clone();
    signal.connect(&target.slot("inc").unwrap()).unwrap();

    signal.emit(());
    assert!(target.detach());
    assert!(!target.detach());
    assert!(!target.is_attached());
    assert_eq!(signal.connection_count(), 0);
    assert!(matches!(
        target.slot("inc").unwrap_err(),
        SignalError::Detached(_)
    ));

    signal.emit(());
    drain(&event_loop);

    assert_eq!(target.lock().count, 0);
    assert!(!event_loop.contains(target.object_id()));
}

#[test]
fn detaching_a_source_clears_its_signals() {
    let event_loop = EventLoop::new("signal_detach_source").unwrap();
    let target = collector(&event_loop, "target");
    let source = emitter(&event_loop, "source");
    source.lock().foo.connect(&target.slot("inc").unwrap()).unwrap();
    source.lock().foo.broadcast_on(&event_loop);

    assert!(source.detach());
    assert_eq!(source.lock().foo.connection_count(), 0);
    assert_eq!(source.lock().foo.broadcast_count(), 0);
    assert!(source.signal("foo").is_err());

    let again = emitter(&event_loop, "source");
    again.lock().foo.connect(&target.slot("inc").unwrap()).unwrap();
    again.lock().foo.emit(());
    drain(&event_loop);
    assert_eq!(target.lock().count, 1);
}

#[test]
fn signals_are_found_by_name() {
    let event_loop = EventLoop::new("signal_lookup").unwrap();
    let source = emitter(&event_loop, "source");
    let target = collector(&event_loop, "target");

    let found = source.signal("foo").unwrap();
    found.connect(&target.slot("inc").unwrap()).unwrap();
    assert_eq!(source.lock().foo.connection_count(), 1);
    assert!(matches!(
        source.signal("bar").unwrap_err(),
        SignalError::UnknownSignal(..)
    ));
}

#[test]
fn slots_can_emit_further_signals() {
    let event_loop = EventLoop::new("signal_chain").unwrap();
    let source = emitter(&event_loop, "source");
    let hop = relay(&event_loop, "hop");
    let sink = collector(&event_loop, "sink");

    source.lock().foo.connect(&hop.slot("forward").unwrap()).unwrap();
    hop.lock().out.connect(&sink.slot("record").unwrap()).unwrap();
    source.lock().foo.emit((1,));

    run_for(&event_loop, Duration::from_millis(200));
    assert_eq!(sink.lock().values, vec![2]);
}

#[test]
fn sustained_overflow_drops_without_failing() {
    init_logging();
    let config = crate::LoopConfig::builder().queue_buffer_bytes(4096).build();
    let event_loop = EventLoop::with_config("signal_overflow", config).unwrap();
    let target = collector(&event_loop, "target");
    let source = emitter(&event_loop, "source");
    source.lock().foo.connect(&target.slot("record").unwrap()).unwrap();

    let sent = 10_000;
    for n in 0..sent {
        source.lock().foo.emit((n,));
    }

    let remote = event_loop.clone();
    let runner = std::thread::spawn(move || remote.exec());
    while event_loop.state() != crate::LoopState::Terminated {
        event_loop.stop();
        std::thread::sleep(Duration::from_millis(20));
    }
    runner.join().unwrap().unwrap();

    let values = target.lock().values.clone();
    assert!(!values.is_empty());
    assert!(values.len() < sent as usize);
    assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
}
