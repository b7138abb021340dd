//! Byte channels bound to a stage's descriptors.
//!
//! ```text
//!   Channel ─┬─ Reader   file, heredoc bytes, conduit reader, session stdin
//!            ├─ Writer   file, conduit writer, capture buffer, session stdout
//!            ├─ Duplex   `N<>file`
//!            ├─ Alias    `N>&M` onto an owned channel; last alias closes it
//!            └─ Multi    what a stage finally sees on each descriptor:
//!                        reads walk members in order, writes go to all
//! ```
//!
//! A channel closes at most once. Clones share the same underlying stream,
//! so closing any clone closes them all.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use shoal_types::JobStatus;

use super::conduit::conduit;
use super::job::Job;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A shared handle to one byte stream.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    label: String,
    kind: Kind,
    open: AtomicBool,
}

enum Kind {
    Reader(Mutex<Option<BoxReader>>),
    Writer(Mutex<Option<BoxWriter>>),
    Duplex {
        reader: Mutex<Option<BoxReader>>,
        writer: Mutex<Option<BoxWriter>>,
    },
    Alias {
        target: Channel,
        refs: Arc<AtomicUsize>,
    },
    Multi(Multiplexer),
}

fn closed(label: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("channel closed: {label}"))
}

fn unsupported(label: &str, what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("channel {label} is not {what}"))
}

impl Channel {
    fn build(label: impl Into<String>, kind: Kind) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                kind,
                open: AtomicBool::new(true),
            }),
        }
    }

    pub fn reader(label: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::build(label, Kind::Reader(Mutex::new(Some(Box::new(reader)))))
    }

    pub fn writer(label: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::build(label, Kind::Writer(Mutex::new(Some(Box::new(writer)))))
    }

    pub fn duplex(
        label: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self::build(
            label,
            Kind::Duplex {
                reader: Mutex::new(Some(Box::new(reader))),
                writer: Mutex::new(Some(Box::new(writer))),
            },
        )
    }

    /// A reader over fixed bytes (heredocs, here-strings).
    pub fn from_bytes(label: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::reader(label, io::Cursor::new(bytes.into()))
    }

    /// A writer appending to `buffer`.
    pub fn memory(buffer: &MemoryBuffer) -> Self {
        Self::writer("capture", buffer.clone())
    }

    /// Two ends of a bounded conduit: `(writer, reader)`.
    pub fn pipe(capacity: usize) -> (Channel, Channel) {
        let (w, r) = conduit(capacity);
        (Self::writer("pipe", w), Self::reader("pipe", r))
    }

    /// Open `path` for reading.
    pub async fn open_read(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::reader(path.display().to_string(), file))
    }

    /// Open `path` for writing, creating it. `append` keeps existing bytes.
    pub async fn open_write(path: &Path, append: bool) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await?;
        Ok(Self::writer(path.display().to_string(), file))
    }

    /// Open `path` for reading and writing, creating it.
    pub async fn open_duplex(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        let (r, w) = tokio::io::split(file);
        Ok(Self::duplex(path.display().to_string(), r, w))
    }

    /// A new handle on `self` counted in `refs`. `self` is closed when the
    /// last alias counted there closes.
    pub(crate) fn alias(&self, refs: &Arc<AtomicUsize>) -> Self {
        refs.fetch_add(1, Ordering::AcqRel);
        Self::build(
            self.inner.label.clone(),
            Kind::Alias {
                target: self.clone(),
                refs: refs.clone(),
            },
        )
    }

    pub(crate) fn multi(members: Vec<(Channel, bool)>, gate: Option<SuspendGate>) -> Self {
        let label = members
            .iter()
            .map(|(c, _)| c.label().to_string())
            .collect::<Vec<_>>()
            .join("+");
        Self::build(
            label,
            Kind::Multi(Multiplexer {
                members,
                cursor: AtomicUsize::new(0),
                gate,
            }),
        )
    }

    /// Process-unique identity, shared by clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn is_readable(&self) -> bool {
        match &self.inner.kind {
            Kind::Reader(_) | Kind::Duplex { .. } => true,
            Kind::Writer(_) => false,
            Kind::Alias { target, .. } => target.is_readable(),
            Kind::Multi(m) => m.members.iter().all(|(c, _)| c.is_readable()),
        }
    }

    pub fn is_writable(&self) -> bool {
        match &self.inner.kind {
            Kind::Writer(_) | Kind::Duplex { .. } => true,
            Kind::Reader(_) => false,
            Kind::Alias { target, .. } => target.is_writable(),
            Kind::Multi(m) => m.members.iter().all(|(c, _)| c.is_writable()),
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(closed(&self.inner.label))
        }
    }

    /// Read into `buf`. `Ok(0)` is end of stream.
    pub fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        async move {
            self.ensure_open()?;
            match &self.inner.kind {
                Kind::Reader(slot) | Kind::Duplex { reader: slot, .. } => match slot.lock().await.as_mut() {
                    Some(reader) => reader.read(buf).await,
                    None => Err(closed(&self.inner.label)),
                },
                Kind::Writer(_) => Err(unsupported(&self.inner.label, "readable")),
                Kind::Alias { target, .. } => target.read(buf).await,
                Kind::Multi(m) => m.read(buf).await,
            }
        }
        .boxed()
    }

    pub fn write_all<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            self.ensure_open()?;
            match &self.inner.kind {
                Kind::Writer(slot) | Kind::Duplex { writer: slot, .. } => match slot.lock().await.as_mut() {
                    Some(writer) => writer.write_all(data).await,
                    None => Err(closed(&self.inner.label)),
                },
                Kind::Reader(_) => Err(unsupported(&self.inner.label, "writable")),
                Kind::Alias { target, .. } => target.write_all(data).await,
                Kind::Multi(m) => m.write_all(data).await,
            }
        }
        .boxed()
    }

    pub fn flush(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            if !self.is_open() {
                return Ok(());
            }
            match &self.inner.kind {
                Kind::Writer(slot) | Kind::Duplex { writer: slot, .. } => match slot.lock().await.as_mut() {
                    Some(writer) => writer.flush().await,
                    None => Ok(()),
                },
                Kind::Reader(_) => Ok(()),
                Kind::Alias { target, .. } => target.flush().await,
                Kind::Multi(m) => {
                    for (member, _) in &m.members {
                        member.flush().await?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Close the channel. Later closes are no-ops.
    pub fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            if !self.inner.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            match &self.inner.kind {
                Kind::Reader(slot) => {
                    slot.lock().await.take();
                    Ok(())
                }
                Kind::Writer(slot) => shutdown(slot).await,
                Kind::Duplex { reader, writer } => {
                    reader.lock().await.take();
                    shutdown(writer).await
                }
                Kind::Alias { target, refs } => {
                    if refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                        target.close().await
                    } else {
                        Ok(())
                    }
                }
                Kind::Multi(m) => m.close().await,
            }
        }
        .boxed()
    }

    /// Copy everything from `self` to `out`.
    pub async fn copy_to(&self, out: &Channel) -> io::Result<u64> {
        let mut buf = vec![0u8; 8192];
        let mut total = 0u64;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                out.flush().await?;
                return Ok(total);
            }
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
}

async fn shutdown(slot: &Mutex<Option<BoxWriter>>) -> io::Result<()> {
    match slot.lock().await.take() {
        Some(mut writer) => {
            writer.flush().await?;
            writer.shutdown().await
        }
        None => Ok(()),
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Members of one descriptor slot, with whether the stage owns each.
pub(crate) struct Multiplexer {
    members: Vec<(Channel, bool)>,
    cursor: AtomicUsize,
    gate: Option<SuspendGate>,
}

impl Multiplexer {
    async fn check(&self, member: &Channel) -> io::Result<()> {
        match &self.gate {
            Some(gate) => gate.check(member).await,
            None => Ok(()),
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let Some((member, _)) = self.members.get(index) else {
                return Ok(0);
            };
            self.check(member).await?;
            let n = member.read(buf).await?;
            if n > 0 {
                return Ok(n);
            }
            self.cursor.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        for (member, _) in &self.members {
            self.check(member).await?;
            member.write_all(data).await?;
        }
        Ok(())
    }

    /// Close owned members; report the first failure after trying all.
    async fn close(&self) -> io::Result<()> {
        let mut first = None;
        for (member, owned) in &self.members {
            if !owned {
                if let Err(e) = member.flush().await {
                    first.get_or_insert(e);
                }
                continue;
            }
            if let Err(e) = member.close().await {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Background jobs stop when they touch the terminal.
///
/// Before each member operation: a `Background` job using one of the
/// session's own channels becomes `Suspended`, and any `Suspended` job
/// waits until it is resumed.
#[derive(Clone)]
pub(crate) struct SuspendGate {
    job: Job,
    session_channels: [u64; 3],
}

impl SuspendGate {
    pub(crate) fn new(job: Job, session_channels: [u64; 3]) -> Self {
        Self { job, session_channels }
    }

    async fn check(&self, member: &Channel) -> io::Result<()> {
        if self.session_channels.contains(&member.id()) && self.job.status() == JobStatus::Background {
            if let Err(e) = self.job.suspend() {
                tracing::debug!(job = %self.job.id(), error = %e, "could not suspend background job");
            }
        }
        self.job
            .wait_while_suspended()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Interrupted, "job interrupted"))
    }
}

/// Growable in-memory sink, shared by clones.
#[derive(Clone, Default)]
pub struct MemoryBuffer {
    bytes: Arc<StdMutex<Vec<u8>>>,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl AsyncWrite for MemoryBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.lock().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(channel: &Channel) -> String {
        let buffer = MemoryBuffer::new();
        channel.copy_to(&Channel::memory(&buffer)).await.unwrap();
        buffer.text()
    }

    #[tokio::test]
    async fn multi_reads_members_in_order() {
        let multi = Channel::multi(
            vec![
                (Channel::from_bytes("a", "first "), true),
                (Channel::from_bytes("b", "second"), true),
            ],
            None,
        );
        assert_eq!(drain(&multi).await, "first second");
    }

    #[tokio::test]
    async fn multi_writes_to_every_member() {
        let (one, two) = (MemoryBuffer::new(), MemoryBuffer::new());
        let multi = Channel::multi(
            vec![(Channel::memory(&one), true), (Channel::memory(&two), false)],
            None,
        );
        multi.write_all(b"tee").await.unwrap();
        multi.close().await.unwrap();
        assert_eq!(one.text(), "tee");
        assert_eq!(two.text(), "tee");
    }

    #[tokio::test]
    async fn closing_multi_spares_unowned_members() {
        let (owned, borrowed) = (Channel::memory(&MemoryBuffer::new()), Channel::memory(&MemoryBuffer::new()));
        let multi = Channel::multi(vec![(owned.clone(), true), (borrowed.clone(), false)], None);
        multi.close().await.unwrap();
        assert!(!owned.is_open());
        assert!(borrowed.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let channel = Channel::memory(&MemoryBuffer::new());
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        let err = channel.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn last_alias_closes_the_target() {
        let target = Channel::memory(&MemoryBuffer::new());
        let refs = Arc::new(AtomicUsize::new(0));
        let (a, b) = (target.alias(&refs), target.alias(&refs));
        a.close().await.unwrap();
        assert!(target.is_open());
        b.close().await.unwrap();
        assert!(!target.is_open());
    }

    #[tokio::test]
    async fn pipe_ends_see_eof_after_close() {
        let (w, r) = Channel::pipe(16);
        w.write_all(b"through").await.unwrap();
        w.close().await.unwrap();
        assert_eq!(drain(&r).await, "through");
    }

    #[tokio::test]
    async fn direction_checks() {
        let reader = Channel::from_bytes("in", "x");
        assert!(reader.is_readable() && !reader.is_writable());
        let err = reader.write_all(b"no").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let w = Channel::open_write(&path, false).await.unwrap();
        w.write_all(b"one\n").await.unwrap();
        w.close().await.unwrap();
        let w = Channel::open_write(&path, true).await.unwrap();
        w.write_all(b"two\n").await.unwrap();
        w.close().await.unwrap();

        let r = Channel::open_read(&path).await.unwrap();
        assert_eq!(drain(&r).await, "one\ntwo\n");
    }
}
