//! Executing programs: closures, statements, words.
//!
//! An [`Activation`] is one running program: its positional parameters and
//! the lexically enclosing activation. A [`Closure`] is a `{ ... }` literal
//! captured together with the activation it was written in, so `$1` inside
//! it falls back to the enclosing closure's parameters.
//!
//! ```text
//!   program  a | b && c &
//!              │     │
//!              ▼     ▼
//!            Job(a|b: two Stages)   Job(c: one Stage, background)
//!                 │
//!                 ▼  per stage task
//!   execute_statement: eval words ─▶ "x = ..." | bareword cmd | method call
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use shoal_types::JobStatus;

use crate::ast::{ArrayItems, ArrayLiteral, Executable, Operator, PipeOperator, Program, Statement, Word};
use crate::error::ShellError;
use crate::lexer::Token;
use crate::scheduler::{Channel, Job, MemoryBuffer, Stage, StageResult, MAX_FD};
use crate::session::Session;
use crate::tools::{CallContext, Function};

use super::expand::{self, needs_expansion, Evaluate};
use super::methods::invoke;
use super::value::Value;

/// Set while a `default` handler runs, so it is not re-entered.
pub const DEFAULT_LOCK: &str = ".defaultLock";
/// Where the last failure happened, as `script:line.column`.
pub const LOCATION: &str = ".location";

/// A `{ ... }` literal bound to the activation that created it.
pub struct Closure {
    program: Arc<Program>,
    token: Token,
    parent: Option<Arc<Activation>>,
}

impl Closure {
    pub(crate) fn new(program: Arc<Program>, token: Token, parent: Option<Arc<Activation>>) -> Self {
        Self { program, token, parent }
    }

    pub fn source(&self) -> &Token {
        &self.token
    }
}

#[async_trait]
impl Function for Closure {
    async fn execute(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, ShellError> {
        let script = self.parent.as_ref().and_then(|p| p.script.clone());
        let activation = Activation::new(ctx.session(), self.parent.clone(), Some(args), script);
        activation.run(ctx, &self.program, None).await
    }

    fn describe(&self) -> String {
        self.token.to_string()
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({})", self.token)
    }
}

/// One running program.
pub struct Activation {
    params: Option<Vec<Value>>,
    script: Option<Arc<str>>,
}

impl Activation {
    /// Positional parameters are `args` when given, even if empty; otherwise
    /// the parent's, and for a top-level program the session's `args` list.
    pub(crate) fn new(
        session: &Session,
        parent: Option<Arc<Activation>>,
        args: Option<Vec<Value>>,
        script: Option<Arc<str>>,
    ) -> Arc<Self> {
        let params = match (args, parent) {
            (Some(args), _) => Some(args),
            (_, Some(parent)) => parent.params.clone(),
            (_, None) => match session.get("args") {
                Value::List(items) => Some(items),
                _ => None,
            },
        };
        Arc::new(Self { params, script })
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Variable lookup: positional names first, then the session.
    pub(crate) fn lookup(&self, session: &Session, name: &str) -> Value {
        if let Some(params) = &self.params {
            match name {
                "args" => return Value::Args(params.clone()),
                "argv" => return Value::List(params.clone()),
                "it" => return params.first().cloned().unwrap_or(Value::Null),
                _ => {}
            }
            if let [d @ b'1'..=b'9'] = name.as_bytes() {
                let index = (d - b'1') as usize;
                return params.get(index).cloned().unwrap_or(Value::Null);
            }
        }
        session.get(name)
    }

    /// Tag `error` with where it happened, unless it already is.
    fn locate(&self, session: &Session, error: ShellError, token: &Token) -> ShellError {
        let error = match error.location() {
            Some(_) => error,
            None => {
                let (line, column) = match error.inner() {
                    ShellError::Syntax(se) => (se.line, se.column),
                    _ => (token.line(), token.column()),
                };
                let location = match &self.script {
                    Some(script) => format!("{script}:{line}.{column}"),
                    None => format!("{line}.{column}"),
                };
                error.located(|| location)
            }
        };
        if session.get(DEFAULT_LOCK).is_null() {
            if let Some(location) = error.location() {
                session.put(LOCATION, Value::from(location));
            }
        }
        error
    }

    /// Run `program`. With `capture`, standard output of every executable
    /// goes to the buffer.
    pub(crate) fn run<'a>(
        self: &'a Arc<Self>,
        ctx: &'a CallContext,
        program: &'a Program,
        capture: Option<&'a MemoryBuffer>,
    ) -> BoxFuture<'a, Result<Value, ShellError>> {
        async move {
            let session = ctx.session();
            let mut last: Option<StageResult> = None;
            let mut previous: Option<Operator> = None;

            for (executable, operator) in &program.items {
                let skip = match (previous, &last) {
                    (Some(Operator::And), Some(result)) => !result.is_success(),
                    (Some(Operator::Or), Some(result)) => result.is_success(),
                    _ => false,
                };
                previous = *operator;
                if skip {
                    continue;
                }

                let mut streams = ctx.streams();
                let mut owned = [false; MAX_FD];
                if let Some(buffer) = capture {
                    streams[1] = Some(Channel::memory(buffer));
                    owned[1] = true;
                }

                let job = session.create_job(executable.token().as_str(), Job::current());
                let background = match executable {
                    Executable::Pipeline(pipeline) => {
                        let count = pipeline.stages.len();
                        for (i, (statement, pipe)) in pipeline.stages.iter().enumerate() {
                            let (mut stage_streams, mut stage_owned) = (streams.clone(), owned);
                            if i + 1 < count {
                                let (writer, reader) = Channel::pipe(session.pipe_buffer_size());
                                stage_streams[1] = Some(writer.clone());
                                stage_owned[1] = true;
                                if *pipe == Some(PipeOperator::PipeAll) {
                                    stage_streams[2] = Some(writer);
                                    stage_owned[2] = true;
                                }
                                streams[0] = Some(reader);
                                owned[0] = true;
                            }
                            job.add_stage(Stage::new(
                                self.clone(),
                                ctx.clone(),
                                statement.clone(),
                                stage_streams,
                                stage_owned,
                            ));
                        }
                        pipeline.background
                    }
                    Executable::Statement(statement) => {
                        job.add_stage(Stage::new(self.clone(), ctx.clone(), statement.clone(), streams, owned));
                        false
                    }
                };

                last = Some(if background {
                    job.start(JobStatus::Background).await?;
                    StageResult::Value(Value::Null)
                } else {
                    match job.start(JobStatus::Foreground).await? {
                        Some(StageResult::Failure(error)) => return Err(error),
                        Some(result) => result,
                        None => StageResult::Value(Value::Null),
                    }
                });
            }

            Ok(match last {
                Some(StageResult::Value(value)) => value,
                _ => Value::Null,
            })
        }
        .boxed()
    }

    /// Run one statement with the stage's context.
    pub(crate) fn execute_statement<'a>(
        self: &'a Arc<Self>,
        ctx: &'a CallContext,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Result<Value, ShellError>> {
        async move {
            let session = ctx.session();
            let echo = session.get("echo");
            let tracing_on = !echo.is_null() && echo != Value::Bool(false) && echo.as_str() != Some("false");
            let trace = format!("+{statement}");
            if tracing_on {
                ctx.eprint(&format!("{trace}\n")).await?;
            }
            let Some(first) = statement.words.first() else {
                return Ok(Value::Null);
            };

            let mut values = Vec::with_capacity(statement.words.len());
            let mut head = 0;
            for (i, word) in statement.words.iter().enumerate() {
                match self.eval_word(ctx, word).await {
                    Ok(Value::Args(items)) => values.extend(items),
                    Ok(value) => values.push(value),
                    Err(e) => return Err(self.locate(session, e, word.token())),
                }
                if i == 0 {
                    head = values.len();
                }
            }
            // A spliced `$args` in command position never starts an assignment.
            let assignment = head == 1 && statement.words.get(1).is_some_and(is_equals);

            if echo.as_str() == Some("verbose") {
                let expanded = std::iter::once("+".to_string())
                    .chain(values.iter().map(|v| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(" ");
                if expanded != trace {
                    ctx.eprint(&format!("+{expanded}\n")).await?;
                }
            }

            self.dispatch(ctx, &statement.words, values, assignment)
                .await
                .map_err(|e| self.locate(session, e, first.token()))
        }
        .boxed()
    }

    async fn dispatch(
        self: &Arc<Self>,
        ctx: &CallContext,
        words: &[Word],
        mut values: Vec<Value>,
        assignment: bool,
    ) -> Result<Value, ShellError> {
        if values.is_empty() {
            return Ok(Value::Null);
        }
        let command = values.remove(0);
        if command.is_null() {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            return Err(ShellError::runtime(format!("Command name evaluates to null: {}", words[0])));
        }

        if let Value::String(name) = &command {
            if assignment && !values.is_empty() {
                values.remove(0);
                let value = match values.len() {
                    0 => Value::Null,
                    1 => values.remove(0),
                    _ => {
                        let target = values.remove(0);
                        let token = words.get(2);
                        if target.is_null() {
                            let text = token.map(|w| w.to_string()).unwrap_or_default();
                            return Err(ShellError::runtime(format!("Command name evaluates to null: {text}")));
                        }
                        match bareword(token, &target) {
                            Some(cmd) => self.execute_cmd(ctx, cmd, values).await?,
                            None => self.execute_method(ctx, target, values).await?,
                        }
                    }
                };
                ctx.session().put(name, value.clone());
                return Ok(value);
            }
        }

        match bareword(words.first(), &command) {
            Some(cmd) => self.execute_cmd(ctx, cmd, values).await,
            None => self.execute_method(ctx, command, values).await,
        }
    }

    async fn execute_cmd(&self, ctx: &CallContext, name: &str, values: Vec<Value>) -> Result<Value, ShellError> {
        let session = ctx.session();
        let function = match self.lookup(session, name) {
            Value::Function(f) => Some(f),
            _ if name.contains(':') => None,
            _ => session.get(&format!("*:{name}")).as_function().cloned(),
        };
        if let Some(function) = function {
            tracing::debug!(command = name, "resolved command");
            return function.execute(ctx, values).await;
        }

        if session.get(DEFAULT_LOCK).is_null() {
            let handler = session
                .get("default")
                .as_function()
                .cloned()
                .or_else(|| session.get("*:default").as_function().cloned());
            if let Some(handler) = handler {
                tracing::debug!(command = name, "dispatching to default handler");
                session.put(DEFAULT_LOCK, Value::Bool(true));
                let mut args = Vec::with_capacity(values.len() + 1);
                args.push(Value::from(name));
                args.extend(values);
                let result = handler.execute(ctx, args).await;
                session.remove(DEFAULT_LOCK);
                return result;
            }
        }
        Err(ShellError::CommandNotFound(name.to_string()))
    }

    async fn execute_method(&self, ctx: &CallContext, target: Value, mut values: Vec<Value>) -> Result<Value, ShellError> {
        if values.is_empty() {
            return Ok(target);
        }

        // `$x . first . second arg`
        if values.len() > 1 && values[0].as_str() == Some(".") {
            let mut target = target;
            let mut args: Vec<Value> = Vec::new();
            for value in values.into_iter().skip(1) {
                if value.as_str() == Some(".") {
                    if args.is_empty() {
                        return Err(ShellError::IllegalArgument("missing method name after '.'".to_string()));
                    }
                    let method = args.remove(0).to_string();
                    target = invoke(ctx, target, &method, std::mem::take(&mut args)).await?;
                } else {
                    args.push(value);
                }
            }
            if args.is_empty() {
                return Ok(target);
            }
            let method = args.remove(0).to_string();
            return invoke(ctx, target, &method, args).await;
        }

        if let (Value::List(items), 1) = (&target, values.len()) {
            let index = values[0].to_string();
            if index == "length" {
                return Ok(Value::Int(items.len() as i64));
            }
            let i: usize = index
                .parse()
                .map_err(|_| ShellError::IllegalArgument(format!("invalid index: {index}")))?;
            return items
                .get(i)
                .cloned()
                .ok_or_else(|| ShellError::IllegalArgument(format!("index out of range: {i}")));
        }

        let method = values.remove(0).to_string();
        invoke(ctx, target, &method, values).await
    }

    /// Evaluate one word to a value.
    pub(crate) fn eval_word<'a>(
        self: &'a Arc<Self>,
        ctx: &'a CallContext,
        word: &'a Word,
    ) -> BoxFuture<'a, Result<Value, ShellError>> {
        async move {
            match word {
                Word::Text(token) => {
                    if needs_expansion(token.as_str()) {
                        let scope = Scope { activation: self, ctx };
                        expand::expand(&scope, token).await
                    } else {
                        Ok(Value::from_literal(token.as_str()))
                    }
                }
                Word::Closure(block) => Ok(Value::Function(Arc::new(Closure::new(
                    block.program.clone(),
                    block.token.clone(),
                    Some(self.clone()),
                )))),
                Word::Sequence(block) => self.sequence(ctx, &block.program).await,
                Word::Array(array) => self.array(ctx, array).await,
            }
        }
        .boxed()
    }

    /// Expand `token` as a double-quoted word.
    pub(crate) async fn expand_quoted(self: &Arc<Self>, ctx: &CallContext, token: &Token) -> Result<Value, ShellError> {
        let scope = Scope { activation: self, ctx };
        expand::expand_quoted(&scope, token).await
    }

    /// `( ... )` and `$( ... )`: the program's result, or failing that its
    /// output without trailing newlines.
    async fn sequence(self: &Arc<Self>, ctx: &CallContext, program: &Program) -> Result<Value, ShellError> {
        let nested = Activation::new(ctx.session(), Some(self.clone()), self.params.clone(), self.script.clone());
        let buffer = MemoryBuffer::new();
        let result = nested.run(ctx, program, Some(&buffer)).await?;
        if !result.is_null() {
            return Ok(result);
        }
        let text = buffer.text();
        Ok(Value::String(text.trim_end_matches('\n').to_string()))
    }

    async fn array(self: &Arc<Self>, ctx: &CallContext, array: &ArrayLiteral) -> Result<Value, ShellError> {
        match &array.items {
            ArrayItems::List(words) => {
                let mut items = Vec::with_capacity(words.len());
                for word in words {
                    match self.eval_word(ctx, word).await? {
                        Value::Args(spliced) => items.extend(spliced),
                        value => items.push(value),
                    }
                }
                Ok(Value::List(items))
            }
            ArrayItems::Map(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval_word(ctx, key).await? {
                        Value::String(s) => s,
                        k @ (Value::Int(_) | Value::Float(_) | Value::Decimal(_) | Value::Bool(_)) => k.to_string(),
                        _ => {
                            return Err(ShellError::Syntax(crate::lexer::SyntaxError::new(
                                key.token().line(),
                                key.token().column(),
                                "map key null or not String",
                            )))
                        }
                    };
                    let value = self.eval_word(ctx, value).await?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
        }
    }
}

fn is_equals(word: &Word) -> bool {
    matches!(word, Word::Text(t) if t.as_str() == "=")
}

/// The command name when `value` is exactly the unquoted text of `word`.
fn bareword<'v>(word: Option<&Word>, value: &'v Value) -> Option<&'v str> {
    match (word, value) {
        (Some(Word::Text(token)), Value::String(s)) if token.as_str() == s => Some(s),
        _ => None,
    }
}

/// An activation and the context it runs in, as seen by the expander.
struct Scope<'a> {
    activation: &'a Arc<Activation>,
    ctx: &'a CallContext,
}

impl Evaluate for Scope<'_> {
    fn get(&self, name: &str) -> Value {
        self.activation.lookup(self.ctx.session(), name)
    }

    fn put(&self, name: &str, value: Value) {
        self.ctx.session().put(name, value);
    }

    fn substitute(&self, program: Program) -> BoxFuture<'_, Result<Value, ShellError>> {
        async move { self.activation.sequence(self.ctx, &program).await }.boxed()
    }

    fn expr(&self, expression: &str) -> Result<Value, ShellError> {
        self.ctx.session().expr(expression)
    }
}
