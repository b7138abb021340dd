//! Sessions: variables, standard streams, jobs and the worker pool.
//!
//! A session is what an embedder holds per client. Scripts executed in it
//! share its variables, working directory and standard channels; every
//! pipeline they start becomes a job in its live job table.
//!
//! ```text
//!   Session::execute(script)
//!       │ parse
//!       ▼
//!   Activation (root) ──run──▶ Job ──▶ Stage tasks on the WorkerPool
//!       │                        │
//!       ▼                        ▼
//!   variables (shared, last write wins)   listener(job, from, to)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use shoal_types::{JobId, JobStatus};

use crate::arithmetic::{evaluate, MathContext, Variables};
use crate::error::ShellError;
use crate::interpreter::{format_value, Activation, FormatLevel, Value, LOCATION};
use crate::parser::parse;
use crate::scheduler::{Channel, Job, JobListener, WorkerPool, DEFAULT_CAPACITY};
use crate::tools::{CallContext, CommandRegistry};

/// Variable that overrides the command scope list, as `a:b:*`.
pub const SCOPE: &str = "SCOPE";
/// Set to `false` to stop stages printing their results.
pub const FORMAT_PIPE: &str = ".FormatPipe";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Engine name, used as the prefix of stage diagnostics.
    pub name: String,

    /// Initial working directory; relative redirection targets resolve here.
    pub cwd: PathBuf,

    /// Whether stages that feed a pipe print their non-null results into it.
    pub format_pipe: bool,

    /// Capacity in bytes of the conduit between two stages.
    pub pipe_buffer_size: usize,

    /// Precision and rounding for `%(...)` arithmetic.
    pub math: MathContext,

    /// Read-only values, consulted before variables.
    pub constants: BTreeMap<String, Value>,

    /// Command scopes searched for `*:name`, unless `SCOPE` is set.
    pub scope: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "shoal".to_string(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            format_pipe: true,
            pipe_buffer_size: DEFAULT_CAPACITY,
            math: MathContext::default(),
            constants: BTreeMap::new(),
            scope: vec!["*".to_string()],
        }
    }
}

impl SessionConfig {
    /// Default configuration with the given engine name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_constant(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(name.to_string(), value.into());
        self
    }
}

/// Builds a [`Session`] around a command registry and standard streams.
pub struct SessionBuilder {
    config: SessionConfig,
    registry: Option<Arc<dyn CommandRegistry>>,
    streams: [Option<Channel>; 3],
}

impl SessionBuilder {
    pub fn registry(mut self, registry: Arc<dyn CommandRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn stdin(mut self, channel: Channel) -> Self {
        self.streams[0] = Some(channel);
        self
    }

    pub fn stdout(mut self, channel: Channel) -> Self {
        self.streams[1] = Some(channel);
        self
    }

    pub fn stderr(mut self, channel: Channel) -> Self {
        self.streams[2] = Some(channel);
        self
    }

    /// Streams left unset default to an empty input and the process's own
    /// stdout and stderr.
    pub fn build(self) -> Session {
        let [stdin, stdout, stderr] = self.streams;
        let streams = [
            stdin.unwrap_or_else(|| Channel::from_bytes("stdin", Vec::new())),
            stdout.unwrap_or_else(|| Channel::writer("stdout", tokio::io::stdout())),
            stderr.unwrap_or_else(|| Channel::writer("stderr", tokio::io::stderr())),
        ];
        let cwd = RwLock::new(self.config.cwd.clone());
        Session {
            inner: Arc::new(SessionInner {
                config: self.config,
                registry: self.registry,
                variables: RwLock::new(HashMap::new()),
                cwd,
                streams,
                jobs: Mutex::new(Vec::new()),
                listener: RwLock::new(None),
                pool: WorkerPool::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// One client's execution state. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    registry: Option<Arc<dyn CommandRegistry>>,
    variables: RwLock<HashMap<String, Value>>,
    cwd: RwLock<PathBuf>,
    streams: [Channel; 3],
    /// Top-level jobs that are not done yet.
    jobs: Mutex<Vec<Job>>,
    listener: RwLock<Option<JobListener>>,
    pool: WorkerPool,
    closed: AtomicBool,
}

/// A session handle that does not keep it alive; held by jobs.
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            registry: None,
            streams: [None, None, None],
        }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> Option<&Arc<dyn CommandRegistry>> {
        self.inner.registry.as_ref()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub(crate) fn pipe_buffer_size(&self) -> usize {
        self.inner.config.pipe_buffer_size
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run `script` and return the value of its last statement.
    #[tracing::instrument(level = "info", skip(self, script), fields(input_len = script.len()))]
    pub async fn execute(&self, script: &str) -> Result<Value, ShellError> {
        self.run(script, None, None).await
    }

    /// Like [`execute`](Self::execute); locations in errors read
    /// `name:line.column`.
    #[tracing::instrument(level = "info", skip(self, script), fields(input_len = script.len()))]
    pub async fn execute_named(&self, script: &str, name: &str) -> Result<Value, ShellError> {
        self.run(script, Some(name), None).await
    }

    /// Run `script` with `args` as its positional parameters.
    #[tracing::instrument(level = "info", skip(self, script, args), fields(input_len = script.len(), args = args.len()))]
    pub async fn execute_with_args(&self, script: &str, args: Vec<Value>) -> Result<Value, ShellError> {
        self.run(script, None, Some(args)).await
    }

    async fn run(&self, script: &str, name: Option<&str>, args: Option<Vec<Value>>) -> Result<Value, ShellError> {
        if self.is_closed() {
            return Err(ShellError::illegal_state("session is closed"));
        }
        self.remove(LOCATION);

        let program = parse(script).map_err(|e| {
            let location = match name {
                Some(name) => format!("{name}:{}.{}", e.line, e.column),
                None => format!("{}.{}", e.line, e.column),
            };
            self.put(LOCATION, Value::from(location.as_str()));
            ShellError::from(e).located(|| location)
        })?;

        let activation = Activation::new(self, None, args, name.map(Arc::from));
        let ctx = CallContext::new(self.clone());
        let result = activation.run(&ctx, &program, None).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, location = e.location().unwrap_or("-"), "script failed");
        }
        result
    }

    /// Evaluate an arithmetic expression against the session variables.
    pub fn expr(&self, expression: &str) -> Result<Value, ShellError> {
        let mut vars = SessionVariables(self);
        Ok(evaluate(expression, &mut vars, self.inner.config.math)?)
    }

    /// Render `value` the way stage results are printed.
    pub fn format(&self, value: &Value, level: FormatLevel) -> String {
        format_value(value, level)
    }

    /// Whether stages print their non-null results.
    pub fn formats_pipe(&self) -> bool {
        self.inner.config.format_pipe && self.get(FORMAT_PIPE) != Value::Bool(false)
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Look `name` up: introspection names, constants, variables, then
    /// the command registry for `scope:name`.
    pub fn get(&self, name: &str) -> Value {
        match name {
            ".variables" => {
                return Value::Map(
                    read(&self.inner.variables)
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            }
            ".commands" => {
                let names = self.registry().map(|r| r.list_names()).unwrap_or_default();
                return Value::List(names.into_iter().map(Value::from).collect());
            }
            ".constants" => return Value::Map(self.inner.config.constants.clone()),
            _ => {}
        }
        if let Some(constant) = self.inner.config.constants.get(name) {
            return constant.clone();
        }
        if let Some(value) = read(&self.inner.variables).get(name) {
            return value.clone();
        }
        match self.registry() {
            Some(registry) if name.contains(':') => registry
                .resolve(name, &self.scope())
                .map(Value::Function)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Set a variable. `Null` removes it.
    pub fn put(&self, name: &str, value: Value) {
        let mut variables = write(&self.inner.variables);
        if value.is_null() {
            variables.remove(name);
        } else {
            variables.insert(name.to_string(), value);
        }
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        write(&self.inner.variables).remove(name)
    }

    fn scope(&self) -> Vec<String> {
        match read(&self.inner.variables).get(SCOPE) {
            Some(Value::String(scope)) => scope.split(':').map(str::to_string).collect(),
            Some(Value::List(items)) => items.iter().map(|v| v.to_string()).collect(),
            _ => self.inner.config.scope.clone(),
        }
    }

    pub fn cwd(&self) -> PathBuf {
        read(&self.inner.cwd).clone()
    }

    /// Change directory; relative paths resolve against the current one.
    pub fn set_cwd(&self, path: impl AsRef<Path>) {
        let path = self.resolve_path(&path.as_ref().to_string_lossy());
        *write(&self.inner.cwd) = path;
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd().join(path)
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// One of the session's standard channels.
    pub fn channel(&self, fd: usize) -> Option<Channel> {
        self.inner.streams.get(fd).cloned()
    }

    pub(crate) fn std_channel_ids(&self) -> [u64; 3] {
        let [a, b, c] = &self.inner.streams;
        [a.id(), b.id(), c.id()]
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    fn jobs_lock(&self) -> MutexGuard<'_, Vec<Job>> {
        self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a job for `command`. Only top-level jobs join the live table;
    /// ids are the smallest not used by a live job.
    pub fn create_job(&self, command: &str, parent: Option<Job>) -> Job {
        let token = match &parent {
            Some(parent) => parent.child_token(),
            None => self.inner.pool.child_token(),
        };
        let mut jobs = self.jobs_lock();
        let mut id = 1;
        while jobs.iter().any(|job| job.id() == JobId(id)) {
            id += 1;
        }
        let top_level = parent.is_none();
        let job = Job::new(JobId(id), command, parent, self.downgrade(), token);
        if top_level {
            jobs.push(job.clone());
        }
        tracing::debug!(job = id, command, top_level, "job created");
        job
    }

    /// Live top-level jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs_lock().clone()
    }

    pub fn foreground_job(&self) -> Option<Job> {
        self.jobs_lock()
            .iter()
            .find(|job| job.status() == JobStatus::Foreground)
            .cloned()
    }

    /// Called with every job status change.
    pub fn set_job_listener(&self, listener: Option<JobListener>) {
        *write(&self.inner.listener) = listener;
    }

    pub(crate) fn job_changed(&self, job: &Job, previous: JobStatus, current: JobStatus) {
        if current == JobStatus::Done {
            self.jobs_lock().retain(|j| j != job);
        }
        let listener = read(&self.inner.listener).clone();
        if let Some(listener) = listener {
            listener(job, previous, current);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Cancel every job and close the standard channels. Closing twice does
    /// nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(session = self.name(), jobs = self.jobs_lock().len(), "closing session");
        self.inner.pool.shutdown();
        for channel in &self.inner.streams {
            if let Err(e) = channel.close().await {
                tracing::warn!(channel = channel.label(), error = %e, "failed to close session channel");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name())
            .field("jobs", &self.jobs_lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Session variables as seen by `%(...)`.
struct SessionVariables<'a>(&'a Session);

impl Variables for SessionVariables<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        Some(self.0.get(name)).filter(|v| !v.is_null())
    }

    fn assign(&mut self, name: &str, value: Value) {
        self.0.put(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryBuffer;
    use crate::tools::CommandTable;

    fn session() -> Session {
        Session::new(SessionConfig::default())
    }

    #[test]
    fn null_removes_variables() {
        let session = session();
        session.put("x", Value::Int(1));
        assert_eq!(session.get("x"), Value::Int(1));
        session.put("x", Value::Null);
        assert!(session.get("x").is_null());
        assert!(session.remove("x").is_none());
    }

    #[test]
    fn constants_and_introspection() {
        let session = Session::new(SessionConfig::default().with_constant("answer", 42i64));
        session.put("answer", Value::Int(0));
        assert_eq!(session.get("answer"), Value::Int(42));

        session.put("y", Value::from("v"));
        let Value::Map(vars) = session.get(".variables") else {
            panic!("expected a map");
        };
        assert_eq!(vars.get("y"), Some(&Value::from("v")));
        assert!(matches!(session.get(".constants"), Value::Map(m) if m.len() == 1));
    }

    #[test]
    fn registry_lookup_honors_scope() {
        let table = CommandTable::new();
        table.register_fn("files:cat", |_, _| async move { Ok(Value::Null) });
        let session = Session::builder(SessionConfig::default())
            .registry(Arc::new(table))
            .build();

        assert!(session.get("*:cat").as_function().is_some());
        assert!(session.get("cat").is_null());
        session.put(SCOPE, Value::from("shell"));
        assert!(session.get("*:cat").is_null());
        session.put(SCOPE, Value::from("shell:files"));
        assert!(session.get("*:cat").as_function().is_some());
        assert_eq!(session.get(".commands"), Value::List(vec![Value::from("files:cat")]));
    }

    #[test]
    fn expressions_see_variables() {
        let session = session();
        session.put("x", Value::Int(4));
        assert_eq!(session.expr("x * 2 + 1").unwrap(), Value::Int(9));
        session.expr("y = x + 1").unwrap();
        assert_eq!(session.get("y"), Value::Int(5));
    }

    #[test]
    fn paths_resolve_against_cwd() {
        let session = Session::new(SessionConfig::default().with_cwd("/srv"));
        assert_eq!(session.resolve_path("a/b"), PathBuf::from("/srv/a/b"));
        assert_eq!(session.resolve_path("/etc"), PathBuf::from("/etc"));
        session.set_cwd("data");
        assert_eq!(session.cwd(), PathBuf::from("/srv/data"));
    }

    #[tokio::test]
    async fn closed_sessions_refuse_scripts() {
        let out = MemoryBuffer::new();
        let session = Session::builder(SessionConfig::default())
            .stdout(Channel::memory(&out))
            .build();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        let err = session.execute("x = 1").await.unwrap_err();
        assert_eq!(err.to_string(), "session is closed");
    }

    #[tokio::test]
    async fn syntax_errors_are_located() {
        let session = session();
        let err = session.execute_named("echo {", "init.gosh").await.unwrap_err();
        assert!(err.is_eof());
        assert!(err.location().is_some_and(|l| l.starts_with("init.gosh:1.")));
        assert_eq!(session.get(LOCATION).as_str(), err.location());
    }
}
