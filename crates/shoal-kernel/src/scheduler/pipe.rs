//! One statement of a pipeline, run as its own task.
//!
//! A stage starts from the descriptor table its program handed it (ten
//! slots, each with an "owned" flag), applies the statement's redirections
//! left to right, runs the statement and closes whatever it owns.
//!
//! ```text
//!   slot ─ members: [(channel, owned)] ─ owned
//!
//!   > file      inherited slot: replaced     owned slot: file added (multios)
//!   2>&1        2 becomes 1's channel (aliased when 1 is owned)
//!   end         every slot wrapped in a Multi gated on job suspension
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::ast::{RedirectKind, Redirection, Statement};
use crate::error::ShellError;
use crate::interpreter::{text_of, Activation, FormatLevel, Value};
use crate::session::Session;
use crate::tools::CallContext;

use super::channel::{Channel, SuspendGate};
use super::job::{Job, StageResult};
use super::MAX_FD;

/// What a callable sees of its stage: resolved channels, job, error code.
pub struct StageFrame {
    job: Job,
    streams: Vec<Option<Channel>>,
    owned: [bool; MAX_FD],
    error: AtomicI32,
}

impl StageFrame {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn stream(&self, fd: usize) -> Option<Channel> {
        self.streams.get(fd).cloned().flatten()
    }

    /// Whether the stage opened (and will close) descriptor `fd`.
    pub fn owns(&self, fd: usize) -> bool {
        self.owned.get(fd).copied().unwrap_or(false)
    }

    pub fn set_error(&self, code: i32) {
        self.error.store(code, Ordering::Release);
    }

    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Clone, Default)]
struct Slot {
    members: Vec<(Channel, bool)>,
    owned: bool,
}

impl Slot {
    /// The slot as one channel.
    fn channel(&self) -> Option<Channel> {
        match self.members.as_slice() {
            [] => None,
            [(only, _)] => Some(only.clone()),
            _ => Some(Channel::multi(self.members.clone(), None)),
        }
    }

    async fn close_owned(&mut self) {
        for (member, owned) in self.members.drain(..) {
            if owned {
                if let Err(e) = member.close().await {
                    tracing::warn!(channel = member.label(), error = %e, "failed to close channel");
                }
            }
        }
        self.owned = false;
    }
}

pub(crate) struct Stage {
    activation: Arc<Activation>,
    /// Context of the program that built the pipeline; redirection targets
    /// expand there.
    parent: CallContext,
    statement: Arc<Statement>,
    slots: Vec<Slot>,
}

impl Stage {
    pub(crate) fn new(
        activation: Arc<Activation>,
        parent: CallContext,
        statement: Arc<Statement>,
        streams: Vec<Option<Channel>>,
        owned: [bool; MAX_FD],
    ) -> Self {
        let slots = (0..MAX_FD)
            .map(|fd| match streams.get(fd).cloned().flatten() {
                Some(channel) => Slot {
                    members: vec![(channel, owned[fd])],
                    owned: owned[fd],
                },
                None => Slot::default(),
            })
            .collect();
        Self {
            activation,
            parent,
            statement,
            slots,
        }
    }

    pub(crate) fn run(mut self, job: Job) -> BoxFuture<'static, StageResult> {
        async move {
            let session = self.parent.session().clone();
            let end_of_pipe = !self.slots[1].owned;
            let mut err_channel = self.slots[2].channel();
            tracing::debug!(job = %job.id(), statement = %self.statement, "stage started");

            let outcome = match self.redirect(&session).await {
                Ok(()) => {
                    let frame = Arc::new(self.frame(&session, job.clone()));
                    err_channel = frame.stream(2);
                    let ctx = CallContext::with_frame(session.clone(), frame.clone());
                    match self.execute(&ctx, &frame, end_of_pipe).await {
                        Ok(outcome) => Ok((outcome, frame)),
                        Err(e) => Err((e, Some(frame))),
                    }
                }
                Err(e) => Err((e, None)),
            };

            let (result, frame) = match outcome {
                Ok((result, frame)) => (result, Some(frame)),
                Err((error, frame)) => {
                    let line = format!("{}: {}: {}\n", session.name(), error.kind_name(), error);
                    if let Some(err) = &err_channel {
                        if let Err(e) = err.write_all(line.as_bytes()).await {
                            tracing::warn!(error = %e, "could not write diagnostic");
                        }
                    }
                    (StageResult::Failure(error), frame)
                }
            };

            match frame {
                Some(frame) => close_frame(&frame).await,
                None => {
                    for slot in &mut self.slots {
                        slot.close_owned().await;
                    }
                }
            }
            tracing::debug!(job = %job.id(), statement = %self.statement, success = result.is_success(), "stage finished");
            result
        }
        .boxed()
    }

    async fn execute(&self, ctx: &CallContext, frame: &StageFrame, end_of_pipe: bool) -> Result<StageResult, ShellError> {
        let value = if self.statement.words.is_empty() && frame.owns(0) {
            if let (Some(input), Some(output)) = (frame.stream(0), frame.stream(1)) {
                input
                    .copy_to(&output)
                    .await
                    .map_err(|e| ShellError::io("copy input to output", e))?;
            }
            Value::Null
        } else {
            self.activation.execute_statement(ctx, &self.statement).await?
        };

        let code = frame.error();
        if code != 0 {
            return Ok(StageResult::Code(code));
        }
        if !value.is_null() && !end_of_pipe && ctx.session().formats_pipe() {
            let text = ctx.session().format(&value, FormatLevel::Inspect);
            ctx.print(&format!("{text}\n")).await?;
        }
        Ok(StageResult::Value(value))
    }

    fn frame(&mut self, session: &Session, job: Job) -> StageFrame {
        let gate = SuspendGate::new(job.clone(), session.std_channel_ids());
        let mut streams = Vec::with_capacity(MAX_FD);
        let mut owned = [false; MAX_FD];
        for (fd, slot) in self.slots.drain(..).enumerate() {
            owned[fd] = slot.owned;
            streams.push(if slot.members.is_empty() {
                None
            } else {
                Some(Channel::multi(slot.members, Some(gate.clone())))
            });
        }
        StageFrame {
            job,
            streams,
            owned,
            error: AtomicI32::new(0),
        }
    }

    async fn redirect(&mut self, session: &Session) -> Result<(), ShellError> {
        let statement = self.statement.clone();
        for redirection in &statement.redirections {
            tracing::trace!(op = %redirection.op, "redirection");
            match redirection.kind {
                RedirectKind::Output { fd, both, append } => {
                    for path in self.paths(session, redirection).await? {
                        let channel = Channel::open_write(&path, append)
                            .await
                            .map_err(|e| ShellError::io(path.display().to_string(), e))?;
                        if both {
                            self.set_stream(channel.clone(), 1, Access::Write)?;
                            self.set_stream(channel, 2, Access::Write)?;
                        } else {
                            self.set_stream(channel, fd as usize, Access::Write)?;
                        }
                    }
                }
                RedirectKind::Duplicate { fd, target } => self.duplicate(fd as usize, target as usize).await?,
                RedirectKind::Input { fd, write } => {
                    for path in self.paths(session, redirection).await? {
                        let opened = if write {
                            Channel::open_duplex(&path).await
                        } else {
                            Channel::open_read(&path).await
                        };
                        let channel = opened.map_err(|e| ShellError::io(path.display().to_string(), e))?;
                        let access = if write { Access::ReadWrite } else { Access::Read };
                        self.set_stream(channel, fd as usize, access)?;
                    }
                }
                RedirectKind::HereDoc { strip_tabs } => {
                    let body = redirection.target.as_ref().map(|w| w.token().to_string()).unwrap_or_default();
                    let body = if strip_tabs { strip_leading_tabs(&body) } else { body };
                    self.set_stream(Channel::from_bytes("heredoc", body), 0, Access::Read)?;
                }
                RedirectKind::HereString => {
                    let value = match &redirection.target {
                        Some(word) => self.activation.expand_quoted(&self.parent, word.token()).await?,
                        None => Value::Null,
                    };
                    self.set_stream(Channel::from_bytes("here-string", text_of(&value)), 0, Access::Read)?;
                }
            }
        }
        Ok(())
    }

    /// Expand a redirection target into the paths it names.
    async fn paths(&self, session: &Session, redirection: &Redirection) -> Result<Vec<PathBuf>, ShellError> {
        let value = match &redirection.target {
            Some(word) => self.activation.eval_word(&self.parent, word).await?,
            None => Value::Null,
        };
        let paths: Vec<PathBuf> = value
            .into_items()
            .iter()
            .map(text_of)
            .filter(|p| !p.is_empty())
            .map(|p| session.resolve_path(&p))
            .collect();
        if paths.is_empty() {
            let target = redirection.target.as_ref().map(|w| w.to_string()).unwrap_or_default();
            return Err(ShellError::io(
                target,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
            ));
        }
        Ok(paths)
    }

    fn set_stream(&mut self, channel: Channel, fd: usize, access: Access) -> Result<(), ShellError> {
        let illegal = |m: &str| Err(ShellError::IllegalArgument(m.to_string()));
        if fd >= MAX_FD {
            return illegal("Bad file descriptor");
        }
        if access.reads() && !channel.is_readable() {
            return illegal("Channel is not readable");
        }
        if access.writes() && !channel.is_writable() {
            return illegal("Channel is not writable");
        }
        match fd {
            0 if !access.reads() => return illegal("Stdin is not readable"),
            1 if !access.writes() => return illegal("Stdout is not writable"),
            2 if !access.writes() => return illegal("Stderr is not writable"),
            _ => {}
        }
        let slot = &mut self.slots[fd];
        if !slot.members.is_empty() && access.reads() && access.writes() {
            return illegal("Can not do multios with read/write streams");
        }
        if !slot.owned {
            slot.members.clear();
        }
        slot.members.push((channel, true));
        slot.owned = true;
        Ok(())
    }

    /// `fd>&target`
    async fn duplicate(&mut self, fd: usize, target: usize) -> Result<(), ShellError> {
        if fd >= MAX_FD || target >= MAX_FD {
            return Err(ShellError::IllegalArgument("Bad file descriptor".to_string()));
        }
        if self.slots[fd].owned {
            self.slots[fd].close_owned().await;
        }
        let source = self.slots[target].clone();
        if source.owned {
            let Some(channel) = source.channel() else {
                return Err(ShellError::IllegalArgument(format!("descriptor {target} is not open")));
            };
            let refs = Arc::new(AtomicUsize::new(0));
            self.slots[target] = Slot {
                members: vec![(channel.alias(&refs), true)],
                owned: true,
            };
            self.slots[fd] = Slot {
                members: vec![(channel.alias(&refs), true)],
                owned: true,
            };
        } else {
            self.slots[fd] = Slot {
                members: source.members.into_iter().map(|(c, _)| (c, false)).collect(),
                owned: false,
            };
        }
        Ok(())
    }
}

/// Close owned descriptors; flush the inherited ones.
async fn close_frame(frame: &StageFrame) {
    for fd in 0..MAX_FD {
        let Some(channel) = frame.stream(fd) else { continue };
        let done = if frame.owns(fd) {
            channel.close().await
        } else {
            channel.flush().await
        };
        if let Err(e) = done {
            tracing::warn!(fd, channel = channel.label(), error = %e, "failed to release channel");
        }
    }
}

fn strip_leading_tabs(body: &str) -> String {
    body.split_inclusive('\n')
        .map(|line| line.trim_start_matches('\t'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heredoc_tabs() {
        assert_eq!(strip_leading_tabs("\t\ta\n\tb\nc\t\n"), "a\nb\nc\t\n");
        assert_eq!(strip_leading_tabs(""), "");
    }

    #[test]
    fn access_modes() {
        assert!(Access::ReadWrite.reads() && Access::ReadWrite.writes());
        assert!(!Access::Read.writes());
        assert!(!Access::Write.reads());
    }
}
