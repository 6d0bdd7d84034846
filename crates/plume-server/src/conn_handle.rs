//! Cross-thread connection write handle.
//!
//! Any thread may serialize packets into a connection's outbound buffer; the
//! buffer mutex is held across serialize+enqueue so output stays framed and
//! ordered. The owning worker is woken through `epoll_ctl`, which is
//! thread-safe, so no channel hop is needed for publish delivery.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::Token;
use parking_lot::{Condvar, Mutex};

use plume_core::packet::{self, Packet, Publish, QoS};

use crate::write_buffer::WriteBuffer;

// Thread-local buffer for packet encoding (avoids allocation per packet).
thread_local! {
    static ENCODE_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

/// How long a fan-out worker waits for a slow connection to drain before
/// giving up on a droppable message.
const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared write handle for one physical connection.
pub struct ConnHandle {
    /// Outbound ring buffer. Held across serialize+enqueue.
    write_buf: Mutex<WriteBuffer>,
    /// Signalled by the flush path; blocked fan-out writers wait here.
    drained: Condvar,
    /// Avoids redundant epoll_ctl calls.
    ready_for_writing: AtomicBool,
    /// Set when another connection took over the session, or on shutdown.
    close_requested: AtomicBool,
    /// The epoll fd owned by the worker's Poll.
    epoll_fd: RawFd,
    /// The connection's socket fd.
    socket_fd: RawFd,
    token: Token,
    worker_id: usize,
}

impl ConnHandle {
    pub fn new(worker_id: usize, epoll_fd: RawFd, socket_fd: RawFd, token: Token) -> Self {
        Self {
            write_buf: Mutex::new(WriteBuffer::new()),
            drained: Condvar::new(),
            ready_for_writing: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            epoll_fd,
            socket_fd,
            token,
            worker_id,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Ask the owning worker to close this connection. Used for session
    /// takeover (most-recent-wins) and shutdown.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        // Wake the blocked fan-out writers and the owning worker.
        self.drained.notify_all();
        self.force_wake();
    }

    #[inline]
    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Append pre-encoded bytes to the outbound buffer (the raw-bytes path).
    /// Bypasses the soft limit; callers route droppable traffic through
    /// `queue_publish` instead.
    pub fn write_raw(&self, data: &[u8]) -> std::io::Result<()> {
        if self.is_close_requested() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut buf = self.write_buf.lock();
        buf.write_bytes_guaranteed(data)?;
        drop(buf);
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Serialize and enqueue a protocol control packet (CONNACK, acks,
    /// SUBACK, PINGRESP, ...) that must not be dropped; only the hard cap
    /// applies.
    pub fn queue_control_packet(&self, pkt: &Packet) -> std::io::Result<()> {
        if self.is_close_requested() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        ENCODE_BUF.with(|cell| {
            let mut tmp = cell.borrow_mut();
            tmp.clear();
            packet::encode_packet(pkt, &mut tmp);
            let mut buf = self.write_buf.lock();
            let res = buf.write_bytes_guaranteed(&tmp);
            drop(buf);
            res
        })?;
        self.set_ready_for_writing(true);
        Ok(())
    }

    /// Enqueue an outbound PUBLISH. QoS 1/2 bypasses the soft limit. When
    /// `block` is set (fan-out workers only - never the owning worker), a
    /// QoS 0 publish waits for the buffer to drain instead of dropping,
    /// bounded by `BLOCK_TIMEOUT`.
    pub fn queue_publish(&self, publish: &Publish, block: bool) -> std::io::Result<()> {
        let guaranteed = publish.qos != QoS::AtMostOnce;
        ENCODE_BUF.with(|cell| {
            let mut tmp = cell.borrow_mut();
            tmp.clear();
            packet::encode_publish(publish, &mut tmp);

            let deadline = Instant::now() + BLOCK_TIMEOUT;
            let mut buf = self.write_buf.lock();
            loop {
                if self.is_close_requested() {
                    return Err(std::io::ErrorKind::BrokenPipe.into());
                }
                let res = if guaranteed {
                    buf.write_bytes_guaranteed(&tmp)
                } else {
                    buf.write_bytes(&tmp)
                };
                match res {
                    Ok(()) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && block => {
                        // Make sure the owning worker is flushing, then wait.
                        self.set_ready_for_writing(true);
                        if self.drained.wait_until(&mut buf, deadline).timed_out() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            drop(buf);
            self.set_ready_for_writing(true);
            Ok(())
        })
    }

    /// Flush buffered bytes to the socket. Called by the owning worker only.
    /// Returns Ok(true) when fully drained, Ok(false) on WouldBlock.
    pub fn flush(&self, socket: &mut impl std::io::Write) -> std::io::Result<bool> {
        loop {
            let mut buf = self.write_buf.lock();
            if buf.is_empty() {
                // Clear the ready flag while holding the lock; a concurrent
                // writer will set it again after us.
                self.set_ready_for_writing(false);
                return Ok(true);
            }

            let slices = buf.as_io_slices();
            match socket.write_vectored(&slices) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf.consume(n);
                    buf.maybe_shrink();
                    self.drained.notify_all();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.lock().is_empty()
    }

    /// Update epoll interest after writes or flushes.
    #[inline]
    fn set_ready_for_writing(&self, val: bool) {
        // Cheap load first to skip the swap when nothing changed.
        if self.ready_for_writing.load(Ordering::Relaxed) == val {
            return;
        }
        if self.ready_for_writing.swap(val, Ordering::Release) == val {
            return;
        }

        let events = if val {
            (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32
        } else {
            (libc::EPOLLIN | libc::EPOLLET) as u32
        };

        self.epoll_mod(events);
    }

    /// Force a writable event so the owning worker notices a close request.
    fn force_wake(&self) {
        self.ready_for_writing.store(true, Ordering::Release);
        self.epoll_mod((libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32);
    }

    fn epoll_mod(&self, events: u32) {
        let mut ev = libc::epoll_event {
            events,
            u64: self.token.0 as u64,
        };

        // epoll_ctl is thread-safe
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, self.socket_fd, &mut ev);
        }
    }
}

// Safety: the buffer is mutex-protected and epoll_ctl is thread-safe.
unsafe impl Send for ConnHandle {}
unsafe impl Sync for ConnHandle {}
