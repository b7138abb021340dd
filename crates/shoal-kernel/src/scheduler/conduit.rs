//! Bounded byte conduit between two adjacent pipeline stages.
//!
//! ```text
//!   stage i ── ConduitWriter ──▶ [ VecDeque<u8>, capacity N ] ──▶ ConduitReader ── stage i+1
//!                │ full: writer parks until the reader drains
//!                │ empty: reader parks until the writer fills
//!                │ writer gone: reader drains what is left, then EOF
//!                └ reader gone: writer gets BrokenPipe
//! ```
//!
//! Critical sections are a few `VecDeque` operations, so a std mutex guards
//! the buffer and the parked wakers together. End flags are atomics so both
//! `Drop` impls stay synchronous.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default conduit capacity, the size of a Linux pipe buffer.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

struct Buffer {
    bytes: VecDeque<u8>,
    capacity: usize,
    parked_reader: Option<Waker>,
    parked_writer: Option<Waker>,
}

impl Buffer {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.parked_reader.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.parked_writer.take() {
            waker.wake();
        }
    }
}

struct Shared {
    buffer: Mutex<Buffer>,
    write_end_closed: AtomicBool,
    read_end_closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_write_end(&self) {
        self.write_end_closed.store(true, Ordering::Release);
        self.lock().wake_reader();
    }

    fn close_read_end(&self) {
        self.read_end_closed.store(true, Ordering::Release);
        self.lock().wake_writer();
    }
}

/// Producing end of a conduit.
pub struct ConduitWriter {
    shared: Arc<Shared>,
}

/// Consuming end of a conduit.
pub struct ConduitReader {
    shared: Arc<Shared>,
}

/// Create a conduit holding at most `capacity` unread bytes.
pub fn conduit(capacity: usize) -> (ConduitWriter, ConduitReader) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        buffer: Mutex::new(Buffer {
            bytes: VecDeque::with_capacity(capacity.min(8192)),
            capacity,
            parked_reader: None,
            parked_writer: None,
        }),
        write_end_closed: AtomicBool::new(false),
        read_end_closed: AtomicBool::new(false),
    });
    (ConduitWriter { shared: shared.clone() }, ConduitReader { shared })
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "conduit reader closed")
}

impl AsyncWrite for ConduitWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut buffer = self.shared.lock();
        // Checked under the lock so a reader dropping concurrently is seen.
        if self.shared.read_end_closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(broken_pipe()));
        }
        let room = buffer.capacity.saturating_sub(buffer.bytes.len());
        if room == 0 {
            buffer.parked_writer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = room.min(data.len());
        buffer.bytes.extend(&data[..n]);
        buffer.wake_reader();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.close_write_end();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ConduitWriter {
    fn drop(&mut self) {
        self.shared.close_write_end();
    }
}

impl AsyncRead for ConduitReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut buffer = self.shared.lock();
        if buffer.bytes.is_empty() {
            if self.shared.write_end_closed.load(Ordering::Acquire) {
                return Poll::Ready(Ok(()));
            }
            buffer.parked_reader = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = out.remaining().min(buffer.bytes.len());
        let (front, back) = buffer.bytes.as_slices();
        let from_front = n.min(front.len());
        out.put_slice(&front[..from_front]);
        out.put_slice(&back[..n - from_front]);
        buffer.bytes.drain(..n);
        buffer.wake_writer();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ConduitReader {
    fn drop(&mut self) {
        self.shared.close_read_end();
    }
}

impl std::fmt::Debug for ConduitWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitWriter").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ConduitReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConduitReader").finish_non_exhaustive()
    }
}
