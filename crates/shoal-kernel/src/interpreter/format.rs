//! Rendering values as text for the terminal.

use super::value::Value;

/// Width of the key column when inspecting maps and objects.
const COLUMN: usize = 20;

/// How much detail to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatLevel {
    /// Multi-line: list items one per line, maps and objects as columns.
    #[default]
    Inspect,
    /// Single line: `[a, b]`, `[k=v]`.
    Line,
    /// An element inside a line: plain text.
    Part,
}

impl FormatLevel {
    fn nested(self) -> Self {
        match self {
            FormatLevel::Inspect => FormatLevel::Line,
            _ => FormatLevel::Part,
        }
    }
}

/// Render `value` at `level`. Multi-line output has no trailing newline.
pub fn format_value(value: &Value, level: FormatLevel) -> String {
    let inner = level.nested();
    match value {
        Value::List(items) | Value::Args(items) => match level {
            FormatLevel::Inspect => items
                .iter()
                .map(|item| format_value(item, inner))
                .collect::<Vec<_>>()
                .join("\n"),
            FormatLevel::Line => {
                let parts: Vec<_> = items.iter().map(|item| format_value(item, inner)).collect();
                format!("[{}]", parts.join(", "))
            }
            FormatLevel::Part => value.to_string(),
        },
        Value::Map(map) => match level {
            FormatLevel::Inspect => map
                .iter()
                .map(|(k, v)| column(k, &format_value(v, inner)))
                .collect::<Vec<_>>()
                .join("\n"),
            FormatLevel::Line => {
                let parts: Vec<_> = map
                    .iter()
                    .map(|(k, v)| format!("{k}={}", format_value(v, inner)))
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            FormatLevel::Part => value.to_string(),
        },
        Value::Object(object) if level == FormatLevel::Inspect => {
            let properties = object.properties();
            if properties.is_empty() {
                return object.describe();
            }
            properties
                .iter()
                .map(|(name, v)| column(name, &format_value(v, FormatLevel::Line)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Error(error) if level == FormatLevel::Inspect => format!("{}: {error}", error.kind_name()),
        other => other.to_string(),
    }
}

fn column(key: &str, value: &str) -> String {
    format!("{key:<width$} {value}", width = COLUMN)
}
