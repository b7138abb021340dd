//! In-memory command table.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::ShellError;
use crate::interpreter::Value;

use super::context::CallContext;
use super::traits::{CommandRegistry, Function};

type Handler = dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value, ShellError>> + Send + Sync;

/// A host command backed by an async closure.
pub struct FnCommand {
    name: String,
    handler: Box<Handler>,
}

impl FnCommand {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ShellError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(move |ctx, args| f(ctx, args).boxed()),
        }
    }
}

#[async_trait]
impl Function for FnCommand {
    async fn execute(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, ShellError> {
        (self.handler)(ctx.clone(), args).await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Commands keyed by lowercase `scope:name`.
///
/// Names registered without a scope land in the `*` scope and are found
/// whatever `SCOPE` says.
#[derive(Default)]
pub struct CommandTable {
    commands: RwLock<BTreeMap<String, Arc<dyn Function>>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        let name = name.to_lowercase();
        if name.contains(':') {
            name
        } else {
            format!("*:{name}")
        }
    }

    pub fn register(&self, name: &str, function: Arc<dyn Function>) {
        let key = Self::key(name);
        tracing::debug!(command = %key, "registered command");
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, function);
    }

    /// Register an async closure as a command.
    pub fn register_fn<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ShellError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnCommand::new(name, f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&Self::key(name))
            .is_some()
    }
}

impl CommandRegistry for CommandTable {
    fn resolve(&self, name: &str, scope: &[String]) -> Option<Arc<dyn Function>> {
        let name = name.to_lowercase();
        let colon = name.find(':')?;
        let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
        if let Some(found) = commands.get(&name) {
            return Some(found.clone());
        }
        if &name[..colon] != "*" {
            return None;
        }

        let function = &name[colon..];
        for entry in scope {
            if entry == "*" {
                if let Some((_, found)) = commands.iter().find(|(key, _)| key.ends_with(function)) {
                    return Some(found.clone());
                }
            } else if let Some(found) = commands.get(&format!("{entry}{function}")) {
                return Some(found.clone());
            }
        }
        None
    }

    fn list_names(&self) -> Vec<String> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CommandTable {
        let table = CommandTable::new();
        table.register_fn("shell:echo", |_, args| async move { Ok(Value::List(args)) });
        table.register_fn("files:cat", |_, _| async move { Ok(Value::from("cat")) });
        table.register_fn("grep", |_, _| async move { Ok(Value::from("grep")) });
        table
    }

    fn scope(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_names() {
        let table = table();
        assert!(table.resolve("shell:echo", &scope(&["*"])).is_some());
        assert!(table.resolve("SHELL:ECHO", &scope(&["*"])).is_some());
        assert!(table.resolve("echo", &scope(&["*"])).is_none());
        assert!(table.resolve("other:echo", &scope(&["*"])).is_none());
    }

    #[test]
    fn any_scope_lookup() {
        let table = table();
        assert!(table.resolve("*:echo", &scope(&["*"])).is_some());
        assert!(table.resolve("*:cat", &scope(&["shell"])).is_none());
        assert!(table.resolve("*:cat", &scope(&["shell", "files"])).is_some());
        assert!(table.resolve("*:grep", &scope(&["shell"])).is_some());
    }

    #[test]
    fn names_and_removal() {
        let table = table();
        assert_eq!(table.list_names(), vec!["*:grep", "files:cat", "shell:echo"]);
        assert!(table.unregister("grep"));
        assert!(!table.unregister("grep"));
    }
}
