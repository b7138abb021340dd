//! What a callable sees while it runs.

use std::sync::Arc;

use crate::error::ShellError;
use crate::interpreter::Value;
use crate::scheduler::{Channel, Job, StageFrame};
use crate::session::Session;

/// The session plus, inside a pipeline stage, that stage's resolved
/// channels and job. Cheap to clone.
#[derive(Clone)]
pub struct CallContext {
    session: Session,
    frame: Option<Arc<StageFrame>>,
}

impl CallContext {
    /// Context outside of any pipeline stage; I/O goes to the session streams.
    pub fn new(session: Session) -> Self {
        Self { session, frame: None }
    }

    pub(crate) fn with_frame(session: Session, frame: Arc<StageFrame>) -> Self {
        Self {
            session,
            frame: Some(frame),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The job of the stage being run.
    pub fn job(&self) -> Option<&Job> {
        self.frame.as_ref().map(|f| f.job())
    }

    /// Channel bound to descriptor `fd`, falling back to the session streams.
    pub fn stream(&self, fd: usize) -> Option<Channel> {
        match &self.frame {
            Some(frame) => frame.stream(fd),
            None => self.session.channel(fd),
        }
    }

    /// The ten descriptor slots a nested program starts from.
    pub(crate) fn streams(&self) -> Vec<Option<Channel>> {
        (0..crate::scheduler::MAX_FD).map(|fd| self.stream(fd)).collect()
    }

    fn require(&self, fd: usize) -> Result<Channel, ShellError> {
        self.stream(fd)
            .ok_or_else(|| ShellError::illegal_state(format!("descriptor {fd} is not open")))
    }

    pub async fn write(&self, fd: usize, data: &[u8]) -> Result<(), ShellError> {
        let channel = self.require(fd)?;
        channel
            .write_all(data)
            .await
            .map_err(|e| ShellError::io(format!("write to fd {fd}"), e))?;
        channel
            .flush()
            .await
            .map_err(|e| ShellError::io(format!("flush fd {fd}"), e))
    }

    /// Write `text` to standard output.
    pub async fn print(&self, text: &str) -> Result<(), ShellError> {
        self.write(1, text.as_bytes()).await
    }

    /// Write `text` to standard error.
    pub async fn eprint(&self, text: &str) -> Result<(), ShellError> {
        self.write(2, text.as_bytes()).await
    }

    /// Read standard input until end of stream.
    pub async fn read_input(&self) -> Result<Vec<u8>, ShellError> {
        let channel = self.require(0)?;
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = channel
                .read(&mut buf)
                .await
                .map_err(|e| ShellError::io("read from stdin", e))?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn read_input_string(&self) -> Result<String, ShellError> {
        let bytes = self.read_input().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Finish the current stage with exit code `code` instead of a value.
    pub fn set_error(&self, code: i32) {
        if let Some(frame) = &self.frame {
            frame.set_error(code);
        }
    }

    /// Whether `fd` is still the session's own stream (not piped or
    /// redirected).
    pub fn is_inherited(&self, fd: usize) -> bool {
        match &self.frame {
            Some(frame) => !frame.owns(fd),
            None => fd < 3,
        }
    }

    pub fn get(&self, name: &str) -> Value {
        self.session.get(name)
    }
}
