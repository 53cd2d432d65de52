//! Loop-serviced timers.
//!
//! A [`Timer`] never owns a thread. Its loop checks the deadline once per
//! iteration and shortens its receive timeout to the nearest deadline, so
//! precision is bounded by the loop's poll interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ObjectError;
use crate::event_loop::EventLoop;
use crate::object::{EventLoopObject, Handle, ObjectBase};
use crate::registry::{ObjectId, SlotTable};
use crate::signal::Signal;

struct TimerState {
    interval: Duration,
    single_shot: bool,
    deadline: Option<Instant>,
}

/// Part of a timer the loop polls. The loop only keeps a weak reference.
pub(crate) struct TimerShared {
    owner: ObjectId,
    timeout: Signal,
    state: Mutex<TimerState>,
}

impl TimerShared {
    pub fn owner(&self) -> &ObjectId {
        &self.owner
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Fires `timeout` if the deadline has passed. The next deadline is
    /// counted from `now`, not from the missed one.
    pub fn poll(&self, now: Instant) -> bool {
        let fired = {
            let mut state = self.state.lock();
            match state.deadline {
                Some(deadline) if now >= deadline => {
                    state.deadline = if state.single_shot {
                        None
                    } else {
                        Some(now + state.interval)
                    };
                    true
                }
                _ => false,
            }
        };
        if fired {
            self.timeout.emit(());
        }
        fired
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        state.deadline = Some(Instant::now() + state.interval);
    }

    pub fn disarm(&self) {
        self.state.lock().deadline = None;
    }
}

/// Object emitting `timeout` once or periodically.
pub struct Timer {
    base: ObjectBase,
    /// Emitted with no arguments on every firing.
    pub timeout: Signal,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Attaches a timer with a generated id. The timer is armed right away:
    /// the first firing is one interval after construction.
    pub fn new(
        event_loop: &EventLoop,
        interval_secs: f64,
        single_shot: bool,
    ) -> Result<Handle<Timer>, ObjectError> {
        Self::with_id(event_loop, ObjectId::generate("Timer"), interval_secs, single_shot)
    }

    pub fn with_id(
        event_loop: &EventLoop,
        id: impl Into<ObjectId>,
        interval_secs: f64,
        single_shot: bool,
    ) -> Result<Handle<Timer>, ObjectError> {
        let interval = interval_from_secs(interval_secs)?;
        let handle = event_loop.attach(id, |base| {
            let timeout = base.signal("timeout");
            let shared = Arc::new(TimerShared {
                owner: base.object_id().clone(),
                timeout: timeout.clone(),
                state: Mutex::new(TimerState {
                    interval,
                    single_shot,
                    deadline: None,
                }),
            });
            Timer {
                base,
                timeout,
                shared,
            }
        })?;
        {
            let timer = handle.lock();
            event_loop.track_timer(&timer.shared);
            timer.shared.arm();
        }
        Ok(handle)
    }

    pub fn object_id(&self) -> &ObjectId {
        self.base.object_id()
    }

    /// Arms the timer; the first firing is one interval from now. Restarts
    /// a timer that is already running, and re-arms a single-shot timer
    /// that has fired.
    pub fn start(&mut self) {
        self.shared.arm();
        log::trace!("timer {} armed", self.object_id());
    }

    /// Disarms the timer. `timeout` envelopes already queued are still
    /// delivered.
    pub fn stop(&mut self) {
        self.shared.disarm();
    }

    pub fn is_active(&self) -> bool {
        self.shared.deadline().is_some()
    }

    /// Takes effect from the next arming or firing.
    pub fn set_interval(&mut self, interval_secs: f64) -> Result<(), ObjectError> {
        self.shared.state.lock().interval = interval_from_secs(interval_secs)?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    pub fn is_single_shot(&self) -> bool {
        self.shared.state.lock().single_shot
    }
}

impl EventLoopObject for Timer {
    fn register_slots(slots: &mut SlotTable<Self>) {
        slots
            .add("start", |timer: &mut Timer, (): ()| {
                timer.start();
                Ok(())
            })
            .add("stop", |timer: &mut Timer, (): ()| {
                timer.stop();
                Ok(())
            });
    }
}

fn interval_from_secs(secs: f64) -> Result<Duration, ObjectError> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(ObjectError::InvalidInterval(secs));
    }
    Ok(Duration::from_secs_f64(secs))
}
