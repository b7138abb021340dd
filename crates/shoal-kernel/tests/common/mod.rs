//! Shared harness: a session with a handful of host commands and captured
//! standard streams.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use shoal_kernel::{
    CallContext, Channel, CommandTable, MemoryBuffer, Session, SessionConfig, ShellError, Value,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Route engine traces to the test output (respects RUST_LOG).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

pub struct Shell {
    pub session: Session,
    pub out: MemoryBuffer,
    pub err: MemoryBuffer,
}

impl Shell {
    pub async fn run(&self, script: &str) -> Result<Value, ShellError> {
        tokio::time::timeout(Duration::from_secs(5), self.session.execute(script))
            .await
            .expect("script timed out")
    }

    pub fn stdout(&self) -> String {
        self.out.text()
    }

    pub fn stderr(&self) -> String {
        self.err.text()
    }
}

fn joined(args: &[Value]) -> String {
    args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")
}

pub fn commands() -> CommandTable {
    let table = CommandTable::new();
    table.register_fn("echo", |ctx: CallContext, args| async move {
        ctx.print(&format!("{}\n", joined(&args))).await?;
        Ok::<_, ShellError>(Value::Null)
    });
    table.register_fn("warn", |ctx: CallContext, args| async move {
        ctx.eprint(&format!("{}\n", joined(&args))).await?;
        Ok::<_, ShellError>(Value::Null)
    });
    table.register_fn("cat", |ctx: CallContext, _| async move {
        let input = ctx.read_input().await?;
        ctx.write(1, &input).await?;
        Ok::<_, ShellError>(Value::Null)
    });
    table.register_fn("upper", |ctx: CallContext, _| async move {
        let input = ctx.read_input_string().await?;
        ctx.print(&format!("{}\n", input.trim_end().to_uppercase())).await?;
        Ok::<_, ShellError>(Value::Null)
    });
    table.register_fn("count", |ctx: CallContext, _| async move {
        let input = ctx.read_input_string().await?;
        Ok::<_, ShellError>(Value::Int(input.lines().count() as i64))
    });
    table.register_fn("list", |_, args| async move { Ok::<_, ShellError>(Value::List(args)) });
    table.register_fn("true", |_, _| async move { Ok::<_, ShellError>(Value::Null) });
    table.register_fn("false", |ctx: CallContext, _| async move {
        ctx.set_error(1);
        Ok::<_, ShellError>(Value::Null)
    });
    table.register_fn("fail", |_, args| async move {
        let message = if args.is_empty() { "boom".to_string() } else { joined(&args) };
        Err::<Value, _>(ShellError::runtime(message))
    });
    table.register_fn("sleep", |_, args: Vec<Value>| async move {
        let ms = args.first().and_then(Value::to_i64).unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok::<_, ShellError>(Value::Null)
    });
    table
}

pub fn shell_with(config: SessionConfig) -> Shell {
    init_tracing();
    let out = MemoryBuffer::new();
    let err = MemoryBuffer::new();
    let session = Session::builder(config)
        .registry(Arc::new(commands()))
        .stdout(Channel::memory(&out))
        .stderr(Channel::memory(&err))
        .build();
    Shell { session, out, err }
}

pub fn shell() -> Shell {
    shell_with(SessionConfig::default())
}
