//! Core callable traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ShellError;
use crate::interpreter::Value;

use super::context::CallContext;

/// Something a statement can invoke: a closure literal, a host command.
#[async_trait]
pub trait Function: Send + Sync {
    /// Run with already expanded arguments.
    async fn execute(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, ShellError>;

    /// Text shown when the function itself is printed.
    fn describe(&self) -> String {
        "<function>".to_string()
    }
}

/// An object owned by the host that scripts can call methods on:
/// `$obj name`, `$obj . first . second`.
#[async_trait]
pub trait HostObject: Send + Sync {
    fn type_name(&self) -> &str;

    async fn invoke(&self, ctx: &CallContext, method: &str, args: Vec<Value>) -> Result<Value, ShellError>;

    /// Named properties, listed one per line when the object is inspected.
    fn properties(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn describe(&self) -> String {
        format!("<{}>", self.type_name())
    }
}

/// Resolves bareword command names to callables.
///
/// Names are `scope:name`. `*:name` asks for `name` in any scope listed by
/// `scope` (a `*` entry meaning every scope). Bare names without a colon are
/// never resolved here.
pub trait CommandRegistry: Send + Sync {
    fn resolve(&self, name: &str, scope: &[String]) -> Option<Arc<dyn Function>>;

    fn list_names(&self) -> Vec<String>;
}
