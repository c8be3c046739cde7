//! Seams between the debug subsystem and the script interpreter.

use autox_debug_proto::{ContextSnapshot, SourceLocation, StackElement, NOT_SERIALIZABLE_VALUE};
use serde_json::Value;

/// View of one in-flight execution, borrowed from the interpreter for the duration of a
/// breakpoint check. Only ever used on the thread that owns the execution.
pub trait ExecutionContext {
    /// Innermost frame first.
    fn call_stack(&self) -> Vec<StackElement>;

    /// Whether the current execution is nested inside the step at `location`.
    fn is_sub_execution_of(&self, location: &SourceLocation) -> bool;

    /// Named attributes visible to the script. Attributes whose value cannot be represented
    /// as JSON report an error instead of failing the whole snapshot.
    fn attributes(&self) -> Vec<(String, anyhow::Result<Value>)>;
}

/// Interpreter services needed while a thread is paused.
pub trait DebugHost: Send + Sync {
    /// Run ad-hoc steps (in the interpreter's own step syntax) against `ctx`.
    fn execute_steps(&self, ctx: &dyn ExecutionContext, steps: &str) -> anyhow::Result<()>;

    fn evaluate(&self, ctx: &dyn ExecutionContext, expression: &str) -> anyhow::Result<Value>;
}

/// Best-effort snapshot of `ctx`'s attributes as JSON text.
pub fn snapshot_context(ctx: &dyn ExecutionContext) -> ContextSnapshot {
    ctx.attributes()
        .into_iter()
        .map(|(name, value)| {
            let text = value
                .ok()
                .and_then(|value| serde_json::to_string(&value).ok())
                .unwrap_or_else(|| NOT_SERIALIZABLE_VALUE.to_owned());
            (name, text)
        })
        .collect()
}

/// Truthiness of an evaluated breakpoint condition.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
