//! EventLoopProcess in a forked child.
//!
//! Forking from a multi-threaded test harness is only safe with one test
//! per binary, so every forked scenario runs inside the single test below.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use sigslot::{EventLoop, EventLoopProcess, ExecutionContext, LoopError, LoopState, ProcessState};

use common::{echo, init_logging, recorder, source};

#[test]
fn forked_processes_exchange_signals_and_cascade_shutdown() {
    init_logging();
    let main_loop = EventLoop::new("fork_main").unwrap();
    let p = EventLoopProcess::new("fork_p").unwrap();
    let q = EventLoopProcess::new("fork_q").unwrap();
    assert_eq!(q.context(), ExecutionContext::Fork);

    let results = recorder(&main_loop, "results");
    let driver = source(&main_loop, "driver");
    let remote = echo(q.event_loop(), "echo");

    driver.lock().out.connect(&remote.slot("ping").unwrap()).unwrap();
    remote.lock().pong.connect(&results.slot("record").unwrap()).unwrap();
    p.event_loop()
        .terminate_signal()
        .connect(&q.stop_slot())
        .unwrap();
    q.event_loop()
        .terminate_signal()
        .connect(&main_loop.stop_slot())
        .unwrap();

    p.start().unwrap();
    q.start().unwrap();
    assert!(matches!(p.event_loop().exec(), Err(LoopError::Forked(_))));
    assert_eq!(p.event_loop().state(), LoopState::Created);
    driver.lock().out.emit((41,));
    p.stop();

    let started = Instant::now();
    main_loop.exec().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(main_loop.state(), LoopState::Terminated);

    // q was stopped by p's terminate signal, never by q.stop().
    let deadline = Instant::now() + Duration::from_secs(5);
    while q.state() == ProcessState::Started && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(q.state(), ProcessState::Stopped);

    let p_status = p.join().unwrap();
    let q_status = q.join().unwrap();
    assert!(p_status.success(), "p exited with {p_status}");
    assert!(q_status.success(), "q exited with {q_status}");
    assert_eq!(q.state(), ProcessState::Joined);
    assert_eq!(results.lock().values, vec![42]);

    // A child whose loop cannot run exits non-zero without failing the parent.
    let broken = EventLoopProcess::new("fork_broken").unwrap();
    broken.event_loop().stop();
    broken.event_loop().exec().unwrap();
    broken.start().unwrap();
    let status = broken.join().unwrap();
    assert_eq!(status.code, Some(1));
    assert!(!status.success());
}
