//! Event loop queues.
//!
//! Every event loop owns one [`MessageQueue`]: a connected pair of Unix
//! datagram sockets. Producers hold a [`QueueSender`] (the sending end, safe to
//! clone across threads and inherited across `fork`), the loop reads from the
//! receiving end. One datagram carries one batch of envelopes, so a batch is
//! enqueued atomically and arrives in order.
//!
//! Puts never block. When the kernel buffer is full the put fails with
//! [`QueueError::Full`] and the caller decides what to log; nothing is
//! retried.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::QueueError;

/// Sizing of an event loop queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Requested socket buffer size in bytes; the kernel may clamp it.
    pub buffer_bytes: usize,
    /// Largest datagram accepted by `put`.
    pub max_message_bytes: usize,
    /// Upper bound on datagrams returned by one `get_many_nowait` call.
    pub max_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 1 << 20,
            max_message_bytes: 128 * 1024,
            max_batch: 1024,
        }
    }
}

/// Sending end of a queue.
#[derive(Clone)]
pub struct QueueSender {
    label: Arc<str>,
    socket: Arc<UnixDatagram>,
    max_message_bytes: usize,
}

impl QueueSender {
    /// Name of the event loop that reads this queue.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn same_queue(&self, other: &QueueSender) -> bool {
        Arc::ptr_eq(&self.socket, &other.socket)
    }

    pub fn put(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.put_many(std::slice::from_ref(envelope))
    }

    /// Enqueues `envelopes` as one datagram.
    ///
    /// A batch larger than the datagram limit is split into single puts. All
    /// envelopes are attempted; the first failure is returned.
    pub fn put_many(&self, envelopes: &[Envelope]) -> Result<(), QueueError> {
        if envelopes.is_empty() {
            return Ok(());
        }

        let bytes = serde_json::to_vec(envelopes)?;
        if bytes.len() <= self.max_message_bytes || envelopes.len() == 1 {
            return self.send(&bytes);
        }

        let mut first_error = None;
        for envelope in envelopes {
            if let Err(err) = self.put(envelope) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn send(&self, bytes: &[u8]) -> Result<(), QueueError> {
        if bytes.len() > self.max_message_bytes {
            return Err(QueueError::TooLarge {
                size: bytes.len(),
                limit: self.max_message_bytes,
            });
        }

        match self.socket.send(bytes) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Err(QueueError::Full),
            Err(err) => match err.raw_os_error() {
                Some(libc::ENOBUFS) => Err(QueueError::Full),
                Some(libc::EMSGSIZE) => Err(QueueError::TooLarge {
                    size: bytes.len(),
                    limit: self.max_message_bytes,
                }),
                _ => Err(QueueError::Io(err)),
            },
        }
    }
}

impl std::fmt::Debug for QueueSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("label", &self.label)
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}

/// Receiving end of a queue together with its sender.
pub struct MessageQueue {
    receiver: UnixDatagram,
    sender: QueueSender,
    max_batch: usize,
    scratch: Mutex<Vec<u8>>,
}

impl MessageQueue {
    pub fn new(label: &str, config: &QueueConfig) -> io::Result<Self> {
        let (receiver, sender) = UnixDatagram::pair()?;
        receiver.set_nonblocking(true)?;
        sender.set_nonblocking(true)?;

        if let Err(err) = set_buffer(sender.as_raw_fd(), libc::SO_SNDBUF, config.buffer_bytes) {
            log::debug!("queue {label}: could not size send buffer: {err}");
        }
        if let Err(err) = set_buffer(receiver.as_raw_fd(), libc::SO_RCVBUF, config.buffer_bytes) {
            log::debug!("queue {label}: could not size receive buffer: {err}");
        }

        Ok(Self {
            receiver,
            sender: QueueSender {
                label: Arc::from(label),
                socket: Arc::new(sender),
                max_message_bytes: config.max_message_bytes,
            },
            max_batch: config.max_batch.max(1),
            scratch: Mutex::new(vec![0; config.max_message_bytes + 1]),
        })
    }

    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    pub fn put(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.sender.put(envelope)
    }

    /// Blocks up to `timeout` for one queued batch.
    pub fn get(&self, timeout: Duration) -> Result<Vec<Envelope>, QueueError> {
        if !self.wait_readable(timeout)? {
            return Err(QueueError::Empty);
        }

        let mut scratch = self.scratch.lock();
        loop {
            match self.recv_batch(&mut scratch) {
                Ok(Some(batch)) => return Ok(batch),
                Ok(None) => return Err(QueueError::Empty),
                Err(QueueError::Codec(err)) => {
                    log::warn!("queue {}: dropping undecodable message: {err}", self.sender.label);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns every envelope that is already queued, in order.
    pub fn get_many_nowait(&self) -> Result<Vec<Envelope>, QueueError> {
        let mut scratch = self.scratch.lock();
        let mut envelopes = Vec::new();
        let mut received = 0;

        while received < self.max_batch {
            match self.recv_batch(&mut scratch) {
                Ok(Some(batch)) => envelopes.extend(batch),
                Ok(None) => break,
                Err(QueueError::Codec(err)) => {
                    log::warn!("queue {}: dropping undecodable message: {err}", self.sender.label);
                }
                Err(err) => return Err(err),
            }
            received += 1;
        }

        if envelopes.is_empty() {
            Err(QueueError::Empty)
        } else {
            Ok(envelopes)
        }
    }

    fn recv_batch(&self, scratch: &mut [u8]) -> Result<Option<Vec<Envelope>>, QueueError> {
        loop {
            match self.receiver.recv(scratch) {
                Ok(len) => return Ok(Some(serde_json::from_slice(&scratch[..len])?)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(QueueError::Io(err)),
            }
        }
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, QueueError> {
        let mut pfd = libc::pollfd {
            fd: self.receiver.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = poll_timeout_millis(timeout);

        // SAFETY: `pfd` is a valid pollfd for the duration of the call and the
        // count matches the single entry passed.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(QueueError::Io(err));
        }
        Ok(rc > 0)
    }
}

/// `poll` timeout for `timeout`, rounded up so a sub-millisecond wait still
/// blocks instead of returning at once.
fn poll_timeout_millis(timeout: Duration) -> libc::c_int {
    timeout
        .as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

fn set_buffer(fd: RawFd, option: libc::c_int, bytes: usize) -> io::Result<()> {
    let value = bytes.min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
