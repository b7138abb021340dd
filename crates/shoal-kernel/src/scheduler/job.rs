//! Jobs: one pipeline's stages plus their shared lifecycle.
//!
//! Status lives under the job's state mutex. Each change is handed to the
//! session (live table, listener) with the mutex released, then published on
//! a `watch` channel that waiters (a foreground caller, a suspended stage)
//! park on. Waiters therefore never run ahead of the listener.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use shoal_types::{JobId, JobInfo, JobStatus};

use crate::error::ShellError;
use crate::interpreter::Value;
use crate::session::{Session, WeakSession};

use super::pipe::Stage;

/// Session variable holding the failures of non-final stages of the last
/// pipeline, as a `PipeFailure` error value.
pub const PIPE_EXCEPTION: &str = "pipe-exception";

tokio::task_local! {
    static CURRENT_JOB: Job;
}

/// Called after every status change with `(job, previous, current)`.
pub type JobListener = Arc<dyn Fn(&Job, JobStatus, JobStatus) + Send + Sync>;

/// Outcome of one stage, and of a job (its last stage).
#[derive(Debug, Clone)]
pub enum StageResult {
    Value(Value),
    Failure(ShellError),
    /// The callable set a non-zero exit code.
    Code(i32),
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Value(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            StageResult::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ShellError> {
        match self {
            StageResult::Failure(e) => Some(e),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            StageResult::Value(_) => 0,
            StageResult::Failure(_) => 1,
            StageResult::Code(c) => *c,
        }
    }
}

#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    id: JobId,
    command: String,
    parent: Option<Job>,
    session: WeakSession,
    status: watch::Sender<JobStatus>,
    state: Mutex<JobState>,
    token: CancellationToken,
}

struct JobState {
    status: JobStatus,
    stages: Vec<Stage>,
    started: bool,
    result: Option<StageResult>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        command: impl Into<String>,
        parent: Option<Job>,
        session: WeakSession,
        token: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::Created);
        Self {
            inner: Arc::new(JobInner {
                id,
                command: command.into(),
                parent,
                session,
                status,
                state: Mutex::new(JobState {
                    status: JobStatus::Created,
                    stages: Vec::new(),
                    started: false,
                    result: None,
                }),
                token,
            }),
        }
    }

    /// The job whose stage is running on this task, if any.
    pub fn current() -> Option<Job> {
        CURRENT_JOB.try_with(|job| job.clone()).ok()
    }

    /// Run `fut` with this job as [`Job::current`].
    pub(crate) fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT_JOB.scope(self.clone(), fut)
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn command(&self) -> &str {
        &self.inner.command
    }

    pub fn parent(&self) -> Option<&Job> {
        self.inner.parent.as_ref()
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// Result of the last stage, once the job is done.
    pub fn result(&self) -> Option<StageResult> {
        self.lock().result.clone()
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id(),
            command: self.command().to_string(),
            status: self.status(),
            parent: self.parent().map(Job::id),
        }
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Option<Session> {
        self.inner.session.upgrade()
    }

    pub(crate) fn add_stage(&self, stage: Stage) {
        self.lock().stages.push(stage);
    }

    fn transition(&self, to: JobStatus) -> Result<(), ShellError> {
        let previous = {
            let mut state = self.lock();
            let previous = state.status;
            if previous == JobStatus::Done {
                return Err(ShellError::illegal_state("Job is finished"));
            }
            if previous == to {
                return Ok(());
            }
            state.status = to;
            previous
        };
        tracing::debug!(job = %self.id(), from = %previous, to = %to, "job status changed");
        if let Some(session) = self.session() {
            session.job_changed(self, previous, to);
        }
        self.publish();
        Ok(())
    }

    /// Wake waiters with the latest status.
    fn publish(&self) {
        let state = self.lock();
        self.inner.status.send_replace(state.status);
    }

    pub fn suspend(&self) -> Result<(), ShellError> {
        self.transition(JobStatus::Suspended)
    }

    pub fn background(&self) -> Result<(), ShellError> {
        self.transition(JobStatus::Background)
    }

    /// Bring the job to the foreground. Only one top-level job may be there,
    /// unless the caller is running inside the current foreground job.
    pub fn foreground(&self) -> Result<(), ShellError> {
        if self.inner.parent.is_none() {
            if let Some(fg) = self.session().and_then(|s| s.foreground_job()) {
                if fg != *self && Job::current().as_ref() != Some(&fg) {
                    return Err(ShellError::illegal_state("A job is already in foreground"));
                }
            }
        }
        self.transition(JobStatus::Foreground)
    }

    /// Cancel every stage of the job. Stages see `Interrupted`.
    pub fn interrupt(&self) {
        tracing::debug!(job = %self.id(), "interrupting job");
        self.inner.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Start the stages. For `Foreground`, returns once the job finishes or
    /// leaves the foreground; the result is `None` in the latter case.
    #[tracing::instrument(level = "debug", skip(self), fields(job = %self.id(), command = %self.command()))]
    pub async fn start(&self, status: JobStatus) -> Result<Option<StageResult>, ShellError> {
        if !status.is_start_status() {
            return Err(ShellError::IllegalArgument("Illegal start status".to_string()));
        }
        let stages = {
            let mut state = self.lock();
            if state.started || state.status != JobStatus::Created {
                return Err(ShellError::illegal_state("Job already started"));
            }
            state.started = true;
            std::mem::take(&mut state.stages)
        };

        match status {
            JobStatus::Foreground => self.foreground()?,
            JobStatus::Background => self.background()?,
            _ => self.suspend()?,
        }

        let session = self
            .session()
            .ok_or_else(|| ShellError::illegal_state("Session is closed"))?;
        session.pool().spawn(self.clone().control(session.clone(), stages));

        if status == JobStatus::Foreground {
            let mut rx = self.inner.status.subscribe();
            let left = rx.wait_for(|s| *s != JobStatus::Foreground).await.is_ok();
            if !left {
                return Err(ShellError::Interrupted);
            }
        }
        Ok(self.result())
    }

    /// Wait until the job is done and return its result.
    pub async fn wait(&self) -> Option<StageResult> {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|s| *s == JobStatus::Done).await.is_ok();
        self.result()
    }

    /// Park while the job is suspended.
    pub(crate) async fn wait_while_suspended(&self) -> Result<(), ShellError> {
        let mut rx = self.inner.status.subscribe();
        tokio::select! {
            resumed = rx.wait_for(|s| *s != JobStatus::Suspended) => {
                if resumed.is_ok() { Ok(()) } else { Err(ShellError::Interrupted) }
            }
            _ = self.inner.token.cancelled() => Err(ShellError::Interrupted),
        }
    }

    async fn control(self, session: Session, stages: Vec<Stage>) {
        let handles: Vec<_> = stages
            .into_iter()
            .map(|stage| {
                let token = self.inner.token.clone();
                let job = self.clone();
                session.pool().spawn(self.scope(async move {
                    tokio::select! {
                        result = stage.run(job) => result,
                        _ = token.cancelled() => StageResult::Failure(ShellError::Interrupted),
                    }
                }))
            })
            .collect();

        let mut results: Vec<StageResult> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => StageResult::Failure(ShellError::runtime(format!("stage task failed: {e}"))),
            })
            .collect();

        let last = results.pop();
        let failures: Vec<ShellError> = results
            .into_iter()
            .filter_map(|r| match r {
                StageResult::Failure(e) => Some(e),
                _ => None,
            })
            .collect();
        if failures.is_empty() {
            session.remove(PIPE_EXCEPTION);
        } else {
            tracing::debug!(job = %self.id(), failures = failures.len(), "upstream stages failed");
            session.put(PIPE_EXCEPTION, Value::from(ShellError::PipeFailure(failures)));
        }

        self.lock().result = last;
        if let Err(e) = self.transition(JobStatus::Done) {
            tracing::warn!(job = %self.id(), error = %e, "job finished twice");
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("command", &self.command())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionConfig};

    fn session() -> Session {
        Session::builder(SessionConfig::default()).build()
    }

    #[tokio::test]
    async fn transitions_after_done_fail() {
        let session = session();
        let job = session.create_job("true", None);
        let result = job.start(JobStatus::Foreground).await.unwrap();
        assert!(result.is_none(), "a job without stages has no result");
        assert_eq!(job.status(), JobStatus::Done);

        let err = job.suspend().unwrap_err();
        assert_eq!(err.to_string(), "Job is finished");
        let err = job.background().unwrap_err();
        assert_eq!(err.to_string(), "Job is finished");
    }

    #[tokio::test]
    async fn start_twice_or_with_bad_status() {
        let session = session();
        let job = session.create_job("x", None);
        let err = job.start(JobStatus::Created).await.unwrap_err();
        assert_eq!(err.to_string(), "Illegal start status");
        let err = job.start(JobStatus::Done).await.unwrap_err();
        assert_eq!(err.to_string(), "Illegal start status");

        job.start(JobStatus::Background).await.unwrap();
        let err = job.start(JobStatus::Background).await.unwrap_err();
        assert_eq!(err.to_string(), "Job already started");
    }

    #[tokio::test]
    async fn ids_are_smallest_free() {
        let session = session();
        let a = session.create_job("a", None);
        let b = session.create_job("b", None);
        assert_eq!((a.id(), b.id()), (JobId(1), JobId(2)));

        a.start(JobStatus::Foreground).await.unwrap();
        let c = session.create_job("c", None);
        assert_eq!(c.id(), JobId(1));

        let nested = session.create_job("n", Some(b.clone()));
        assert_eq!(nested.parent(), Some(&b));
        assert!(session.jobs().iter().all(|j| *j != nested));
    }

    #[tokio::test]
    async fn one_foreground_job_at_a_time() {
        let session = session();
        let a = session.create_job("a", None);
        let b = session.create_job("b", None);
        a.foreground().unwrap();
        let err = b.foreground().unwrap_err();
        assert_eq!(err.to_string(), "A job is already in foreground");

        let nested = session.create_job("n", Some(a.clone()));
        nested.foreground().unwrap();
    }

    #[tokio::test]
    async fn listener_sees_every_change() {
        let session = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.set_job_listener(Some(Arc::new(move |job: &Job, from: JobStatus, to: JobStatus| {
            sink.lock().unwrap().push((job.id(), from, to));
        })));

        let job = session.create_job("x", None);
        job.start(JobStatus::Background).await.unwrap();
        job.wait().await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (JobId(1), JobStatus::Created, JobStatus::Background),
                (JobId(1), JobStatus::Background, JobStatus::Done),
            ]
        );
        assert!(session.jobs().is_empty());
    }

    #[test]
    fn stage_result_codes() {
        assert!(StageResult::Value(Value::Null).is_success());
        assert!(!StageResult::Code(2).is_success());
        assert_eq!(StageResult::Code(2).code(), 2);
        assert_eq!(StageResult::Failure(ShellError::Interrupted).code(), 1);
    }
}
