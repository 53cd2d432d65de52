use std::error::Error;

use clap::Parser;
use sigslot::{
    EventLoop, EventLoopObject, EventLoopProcess, ExecutionContext, ObjectBase, Signal, SlotTable,
    Timer,
};
use sigslot_log::debug_every_n;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ping-pong between an event loop and a worker process")]
struct Opts {
    /// How long to keep the rally going.
    #[arg(long, default_value_t = 1.0, value_name = "SECONDS")]
    seconds: f64,

    /// Run the worker on a thread instead of a forked process.
    #[arg(long)]
    thread: bool,

    /// Log one in N rallies at debug level.
    #[arg(long = "every", default_value_t = 1000, value_name = "N")]
    every_n: u64,
}

/// Lives on the main loop; serves again every time the ball comes back.
struct Server {
    ping: Signal,
    rallies: u64,
    every_n: u64,
}

impl EventLoopObject for Server {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots
            .add("serve", |server: &mut Server, (): ()| {
                server.ping.emit((0_u64,));
                Ok(())
            })
            .add("on_pong", |server: &mut Server, (count,): (u64,)| {
                server.rallies = count;
                debug_every_n!(server.every_n, "rally {}", count);
                server.ping.emit((count + 1,));
                Ok(())
            });
    }
}

/// Lives in the worker; returns every ball it receives.
struct Returner {
    pong: Signal,
}

impl EventLoopObject for Returner {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots.add("on_ping", |returner: &mut Returner, (count,): (u64,)| {
            returner.pong.emit((count,));
            Ok(())
        });
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts = Opts::parse();

    let context = if opts.thread {
        ExecutionContext::Thread
    } else {
        ExecutionContext::Fork
    };
    let main_loop = EventLoop::new("main_evt_loop")?;
    let worker = EventLoopProcess::with_context("worker", context)?;

    let server = main_loop.attach("server", |base: ObjectBase| Server {
        ping: base.signal("ping"),
        rallies: 0,
        every_n: opts.every_n,
    })?;
    let returner = worker.event_loop().attach("returner", |base: ObjectBase| Returner {
        pong: base.signal("pong"),
    })?;

    server.lock().ping.connect(&returner.slot("on_ping")?)?;
    returner.lock().pong.connect(&server.slot("on_pong")?)?;
    main_loop.start_signal().connect(&server.slot("serve")?)?;
    main_loop.terminate_signal().connect(&worker.stop_slot())?;

    let deadline = Timer::new(&main_loop, opts.seconds, true)?;
    deadline.lock().timeout.connect(&main_loop.stop_slot())?;

    worker.start()?;
    main_loop.exec()?;
    let status = worker.join()?;

    let rallies = server.lock().rallies;
    println!(
        "{rallies} rallies in {:.2}s between {} and {} ({status})",
        opts.seconds,
        main_loop.name(),
        worker.event_loop().name()
    );
    if !status.success() {
        return Err(format!("worker {} exited with {status}", worker.name()).into());
    }
    Ok(())
}
