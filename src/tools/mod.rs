//! Tool registry and invoker.
//!
//! Plugins are a closed set; each exposes functions under a fully
//! qualified `{Plugin}-{Function}` name with a string-typed JSON-schema
//! parameter list (the remote model sends arguments as JSON text).
//! Invocation failures are converted to `"Error: …"` output items — the
//! remote model decides the user-facing recovery.

pub mod plugins;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{EventBus, EventPayload};
use crate::config::ToolFlags;

pub use plugins::Plugin;

const SENDER: &str = "tool-registry";

/// Static description of one plugin function.
pub struct FunctionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: &'static [ParamSpec],
}

/// One string-typed parameter.
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

/// Tool descriptor handed to the remote session.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDescriptor {
    fn from_spec(plugin: &'static str, spec: &FunctionSpec) -> Self {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in spec.parameters {
            properties.insert(
                param.name.to_string(),
                json!({ "type": "string", "description": param.description }),
            );
            if param.required {
                required.push(Value::String(param.name.to_string()));
            }
        }
        Self {
            name: format!("{plugin}-{}", spec.name),
            description: spec.description.to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Function-call output item appended back to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallOutput {
    pub call_id: String,
    pub output: String,
}

/// Registry over the closed plugin set.
pub struct ToolRegistry {
    plugins: Vec<Plugin>,
    bus: EventBus,
}

impl ToolRegistry {
    pub fn new(plugins: Vec<Plugin>, bus: EventBus) -> Self {
        Self { plugins, bus }
    }

    /// Tool descriptors for the plugins an agent has enabled.
    pub fn descriptors(&self, flags: &ToolFlags) -> Vec<ToolDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.enabled(flags))
            .flat_map(|p| {
                p.functions()
                    .iter()
                    .map(|spec| ToolDescriptor::from_spec(p.name(), spec))
            })
            .collect()
    }

    /// Dispatch a tool call. Never fails: any error becomes an
    /// `"Error: …"` output item for the model to explain.
    pub async fn invoke_function(
        &self,
        fq_name: &str,
        call_id: &str,
        args_json: &str,
        cancel: &CancellationToken,
    ) -> FunctionCallOutput {
        self.bus.publish(
            SENDER,
            EventPayload::FunctionInvoking {
                name: fq_name.to_string(),
            },
        );

        let output = tokio::select! {
            result = self.dispatch(fq_name, args_json) => match result {
                Ok(value) => stringify_result(&value),
                Err(e) => {
                    warn!(tool = fq_name, "tool invocation failed: {e:#}");
                    format!("Error: {e}")
                }
            },
            _ = cancel.cancelled() => "Error: invocation cancelled".to_string(),
        };

        self.bus.publish(
            SENDER,
            EventPayload::FunctionInvoked {
                name: fq_name.to_string(),
            },
        );
        info!(tool = fq_name, call_id, "tool invoked");

        FunctionCallOutput {
            call_id: call_id.to_string(),
            output,
        }
    }

    async fn dispatch(&self, fq_name: &str, args_json: &str) -> anyhow::Result<Value> {
        let (plugin_name, function) = fq_name
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("malformed tool name: {fq_name}"))?;

        let plugin = self
            .plugins
            .iter()
            .find(|p| p.name() == plugin_name)
            .ok_or_else(|| anyhow::anyhow!("unknown plugin: {plugin_name}"))?;

        let args: Map<String, Value> = if args_json.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str(args_json)
                .map_err(|e| anyhow::anyhow!("invalid arguments: {e}"))?
        };

        plugin.invoke(function, &args).await
    }
}

/// Primitive results pass through as bare text; structured results are
/// JSON-serialized.
fn stringify_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Read an argument as f64, accepting both JSON numbers and numeric
/// strings — the remote model is inconsistent about which it sends.
pub(crate) fn arg_f64(args: &Map<String, Value>, key: &str) -> anyhow::Result<f64> {
    let value = args
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("missing argument: {key}"))?;
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("argument {key} is not a number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow::anyhow!("argument {key} is not a number: {s}")),
        _ => anyhow::bail!("argument {key} has unsupported type"),
    }
}

/// Read a required string argument.
pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing argument: {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(vec![Plugin::Calculator, Plugin::DateTime], EventBus::new())
    }

    #[tokio::test]
    async fn calculator_add_returns_bare_number() {
        let registry = registry();
        let out = registry
            .invoke_function(
                "Calculator-Add",
                "call-1",
                r#"{"a":2,"b":3}"#,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.call_id, "call-1");
        assert_eq!(out.output, "5");
    }

    #[tokio::test]
    async fn string_arguments_are_accepted() {
        let registry = registry();
        let out = registry
            .invoke_function(
                "Calculator-Multiply",
                "call-2",
                r#"{"a":"4","b":"2.5"}"#,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(out.output, "10");
    }

    #[tokio::test]
    async fn divide_by_zero_becomes_error_item() {
        let registry = registry();
        let out = registry
            .invoke_function(
                "Calculator-Divide",
                "call-3",
                r#"{"a":1,"b":0}"#,
                &CancellationToken::new(),
            )
            .await;
        assert!(out.output.starts_with("Error: "), "got: {}", out.output);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_item() {
        let registry = registry();
        let out = registry
            .invoke_function("Nope-Missing", "call-4", "{}", &CancellationToken::new())
            .await;
        assert!(out.output.starts_with("Error: "));
    }

    #[tokio::test]
    async fn malformed_arguments_become_error_item() {
        let registry = registry();
        let out = registry
            .invoke_function(
                "Calculator-Add",
                "call-5",
                "{not json",
                &CancellationToken::new(),
            )
            .await;
        assert!(out.output.starts_with("Error: "));
    }

    #[test]
    fn descriptors_use_fully_qualified_names() {
        let registry = registry();
        let descriptors = registry.descriptors(&ToolFlags::default());
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"Calculator-Add"));
        assert!(names.contains(&"Calculator-Divide"));
        assert!(names.contains(&"DateTime-CurrentDateTime"));
    }

    #[test]
    fn descriptors_honor_tool_flags() {
        let registry = registry();
        let flags = ToolFlags {
            calculator: false,
            ..ToolFlags::default()
        };
        let descriptors = registry.descriptors(&flags);
        assert!(descriptors.iter().all(|d| !d.name.starts_with("Calculator-")));
        assert!(descriptors.iter().any(|d| d.name.starts_with("DateTime-")));
    }

    #[test]
    fn schema_parameters_are_string_typed() {
        let registry = registry();
        let descriptors = registry.descriptors(&ToolFlags::default());
        let add = descriptors
            .iter()
            .find(|d| d.name == "Calculator-Add")
            .unwrap();
        assert_eq!(add.parameters["type"], "object");
        assert_eq!(add.parameters["properties"]["a"]["type"], "string");
        let required = add.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn stringify_handles_all_shapes() {
        assert_eq!(stringify_result(&json!("text")), "text");
        assert_eq!(stringify_result(&json!(5)), "5");
        assert_eq!(stringify_result(&json!(true)), "true");
        assert_eq!(stringify_result(&json!({"k": 1})), r#"{"k":1}"#);
    }
}
