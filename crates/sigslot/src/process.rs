//! Event loops running in their own OS process (or thread).
//!
//! An [`EventLoopProcess`] builds its loop up front so objects can be
//! attached and connections made before [`start`](EventLoopProcess::start).
//! With [`ExecutionContext::Fork`] the child inherits every queue created so
//! far, which is what lets signals cross the process boundary afterwards.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::ProcessError;
use crate::event_loop::{EventLoop, LoopConfig};
use crate::object::SlotRef;

/// Exit code of a child whose loop panicked.
const PANIC_EXIT_CODE: i32 = 101;

/// Where the loop of an [`EventLoopProcess`] runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Forked child process.
    #[default]
    Fork,
    /// Thread of the current process.
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Started,
    /// `stop` was called, or the child's loop has already exited, for
    /// example after a `stop_slot` connection fired.
    Stopped,
    Joined,
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    /// Terminating signal, for a forked child killed by one.
    pub signal: Option<i32>,
}

impl ExitStatus {
    fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

enum Child {
    Process(libc::pid_t),
    Thread(JoinHandle<i32>),
}

struct Inner {
    state: ProcessState,
    child: Option<Child>,
    status: Option<ExitStatus>,
}

/// One event loop plus the process that runs it.
pub struct EventLoopProcess {
    name: String,
    context: ExecutionContext,
    event_loop: EventLoop,
    inner: Mutex<Inner>,
}

impl EventLoopProcess {
    pub fn new(name: impl Into<String>) -> Result<Self, ProcessError> {
        Self::with_config(name, ExecutionContext::default(), LoopConfig::default())
    }

    pub fn with_context(
        name: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<Self, ProcessError> {
        Self::with_config(name, context, LoopConfig::default())
    }

    /// The loop is named `<name>_evt_loop`.
    pub fn with_config(
        name: impl Into<String>,
        context: ExecutionContext,
        config: LoopConfig,
    ) -> Result<Self, ProcessError> {
        let name = name.into();
        let event_loop = EventLoop::with_config(format!("{name}_evt_loop"), config)?;
        Ok(Self {
            name,
            context,
            event_loop,
            inner: Mutex::new(Inner {
                state: ProcessState::Created,
                child: None,
                status: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// The loop the child runs. Attach objects to it before `start`.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn state(&self) -> ProcessState {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Started && self.reap_exited(&mut inner) {
            inner.state = ProcessState::Stopped;
        }
        inner.state
    }

    /// Whether the child has finished, without blocking. An exited forked
    /// child is reaped and its status kept for `join`.
    fn reap_exited(&self, inner: &mut Inner) -> bool {
        let pid = match &inner.child {
            Some(Child::Thread(handle)) => return handle.is_finished(),
            Some(Child::Process(pid)) => *pid,
            None => return inner.status.is_some(),
        };
        match wait_pid(pid, libc::WNOHANG) {
            Ok(Some(status)) => {
                inner.status = Some(status);
                inner.child = None;
                true
            }
            Ok(None) => false,
            Err(err) => {
                log::warn!("process {}: cannot poll child {pid}: {err}", self.name);
                false
            }
        }
    }

    /// Spawns the child and runs the loop's `exec()` in it. After a fork the
    /// parent's copy of the loop can no longer be executed.
    pub fn start(&self) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock();
        if inner.state != ProcessState::Created {
            return Err(ProcessError::AlreadyStarted(self.name.clone()));
        }

        let child = match self.context {
            ExecutionContext::Fork => self.fork()?,
            ExecutionContext::Thread => {
                let event_loop = self.event_loop.clone();
                let name = self.name.clone();
                let handle = thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || run_child(&name, &event_loop))
                    .map_err(|source| ProcessError::Spawn {
                        name: self.name.clone(),
                        source,
                    })?;
                Child::Thread(handle)
            }
        };

        inner.child = Some(child);
        inner.state = ProcessState::Started;
        log::debug!("process {} started ({:?})", self.name, self.context);
        Ok(())
    }

    fn fork(&self) -> Result<Child, ProcessError> {
        // SAFETY: the child only runs the loop and leaves through `_exit`,
        // never returning into the caller's stack.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(ProcessError::Spawn {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            }),
            0 => {
                let code = run_child(&self.name, &self.event_loop);
                // SAFETY: terminates the forked child without running the
                // parent's atexit handlers or destructors a second time.
                unsafe { libc::_exit(code) }
            }
            pid => {
                self.event_loop.mark_forked();
                Ok(Child::Process(pid))
            }
        }
    }

    /// Asks the child's loop to stop. Callable before `start`, in which case
    /// the loop stops as soon as it runs.
    pub fn stop(&self) {
        self.event_loop.stop();
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Started {
            inner.state = ProcessState::Stopped;
        }
    }

    /// The child loop's `stop` as a connectable slot.
    pub fn stop_slot(&self) -> SlotRef {
        self.event_loop.stop_slot()
    }

    /// Blocks until the child has exited. A failed child is reported through
    /// the returned status, not as an error. Joining again returns the same
    /// status.
    pub fn join(&self) -> Result<ExitStatus, ProcessError> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.status {
            inner.state = ProcessState::Joined;
            return Ok(status);
        }
        let child = inner
            .child
            .take()
            .ok_or_else(|| ProcessError::NotStarted(self.name.clone()))?;

        let status = match child {
            Child::Process(pid) => match wait_pid(pid, 0) {
                Ok(Some(status)) => status,
                result => {
                    inner.child = Some(Child::Process(pid));
                    let source = result
                        .err()
                        .unwrap_or_else(|| io::Error::other("waitpid returned no status"));
                    return Err(ProcessError::Wait {
                        name: self.name.clone(),
                        source,
                    });
                }
            },
            Child::Thread(handle) => {
                ExitStatus::exited(handle.join().unwrap_or(PANIC_EXIT_CODE))
            }
        };

        inner.status = Some(status);
        inner.state = ProcessState::Joined;
        if status.success() {
            log::debug!("process {} joined: {status}", self.name);
        } else {
            log::warn!("process {} joined: {status}", self.name);
        }
        Ok(status)
    }
}

impl fmt::Debug for EventLoopProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopProcess")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("event_loop", self.event_loop.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Runs the loop and maps the outcome to an exit code.
fn run_child(name: &str, event_loop: &EventLoop) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(|| event_loop.exec())) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            log::error!("process {name}: {err}");
            1
        }
        Err(_) => {
            log::error!("process {name}: event loop panicked");
            PANIC_EXIT_CODE
        }
    }
}

/// `None` when `flags` holds `WNOHANG` and the child is still running.
fn wait_pid(pid: libc::pid_t, flags: libc::c_int) -> io::Result<Option<ExitStatus>> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, flags) };
        if rc == pid {
            break;
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let status = if libc::WIFEXITED(status) {
        ExitStatus::exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus {
            code: None,
            signal: Some(libc::WTERMSIG(status)),
        }
    } else {
        ExitStatus {
            code: None,
            signal: None,
        }
    };
    Ok(Some(status))
}
