//! Input and output guardrails
//!
//! A [`GuardrailInterceptor`] holds ordered lists of input and output
//! predicates. The first violation blocks the invocation with a
//! VALIDATION-classified error; the tool body never runs for an input
//! violation.

use super::{ToolExecutionContext, ToolInterceptor};
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

type CheckFn = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// One named predicate over a payload
#[derive(Clone)]
pub struct GuardrailRule {
    name: String,
    check: CheckFn,
}

impl GuardrailRule {
    /// Rule from a predicate returning `Err(reason)` on violation
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Cap the serialized payload length at `max` characters
    pub fn max_size(max: usize) -> Self {
        Self::new(format!("maxSize({})", max), move |value| {
            let len = match value {
                Value::String(s) => s.len(),
                other => other.to_string().len(),
            };
            if len > max {
                Err(format!("payload length {} exceeds cap {}", len, max))
            } else {
                Ok(())
            }
        })
    }

    /// Reject payloads containing `needle` (case-sensitive substring)
    pub fn deny_substring(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(format!("denySubstring('{}')", needle), move |value| {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if text.contains(needle.as_str()) {
                Err(format!("payload contains forbidden text '{}'", needle))
            } else {
                Ok(())
            }
        })
    }

    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        (self.check)(value)
    }
}

/// Blocks invocations whose input or output violates a rule
pub struct GuardrailInterceptor {
    order: i32,
    input_rules: Vec<GuardrailRule>,
    output_rules: Vec<GuardrailRule>,
}

impl GuardrailInterceptor {
    /// Interceptor with no rules; add them with the `with_*` methods
    pub fn new() -> Self {
        Self {
            order: -1000,
            input_rules: Vec::new(),
            output_rules: Vec::new(),
        }
    }

    /// Override the chain position
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Append an input rule; rules run in insertion order
    pub fn with_input_rule(mut self, rule: GuardrailRule) -> Self {
        self.input_rules.push(rule);
        self
    }

    /// Append an output rule; rules run in insertion order
    pub fn with_output_rule(mut self, rule: GuardrailRule) -> Self {
        self.output_rules.push(rule);
        self
    }

    fn violation(
        &self,
        ctx: &ToolExecutionContext,
        rule: &GuardrailRule,
        direction: &str,
        reason: String,
    ) -> FlowError {
        tracing::warn!(
            tool = %ctx.tool_name,
            rule = %rule.name,
            direction = %direction,
            reason = %reason,
            "Guardrail violation"
        );
        FlowError::Validation(format!(
            "guardrail '{}' blocked {} of tool '{}': {}",
            rule.name, direction, ctx.tool_name, reason
        ))
    }
}

impl Default for GuardrailInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInterceptor for GuardrailInterceptor {
    fn name(&self) -> &str {
        "guardrails"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn before_execute(&self, ctx: &mut ToolExecutionContext) -> Result<()> {
        for rule in &self.input_rules {
            if let Err(reason) = rule.check(&ctx.input) {
                return Err(self.violation(ctx, rule, "input", reason));
            }
        }
        Ok(())
    }

    async fn after_execute(&self, ctx: &mut ToolExecutionContext, result: Value) -> Result<Value> {
        for rule in &self.output_rules {
            if let Err(reason) = rule.check(&result) {
                return Err(self.violation(ctx, rule, "output", reason));
            }
        }
        Ok(result)
    }
}
