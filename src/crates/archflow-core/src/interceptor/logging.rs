//! Structured begin/end/error logging around tool invocations

use super::{ToolExecutionContext, ToolInterceptor};
use crate::error::{FlowError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Logs invocation begin, end with duration, and errors
///
/// Runs outermost (`order = i32::MIN + 100`) so its duration covers the
/// whole chain. Payloads are sanitized to a length cap before logging.
pub struct LoggingInterceptor {
    max_payload_len: usize,
}

impl LoggingInterceptor {
    /// Interceptor with the default 512-char payload cap
    pub fn new() -> Self {
        Self {
            max_payload_len: 512,
        }
    }

    /// Set the payload cap
    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }

    fn sanitize(&self, value: &Value) -> String {
        let mut text = value.to_string();
        if text.len() > self.max_payload_len {
            text.truncate(self.max_payload_len);
            text.push_str("...");
        }
        text
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn order(&self) -> i32 {
        i32::MIN + 100
    }

    async fn before_execute(&self, ctx: &mut ToolExecutionContext) -> Result<()> {
        tracing::debug!(
            tool = %ctx.tool_name,
            flow_id = %ctx.flow_id,
            input = %self.sanitize(&ctx.input),
            "Tool invocation begin"
        );
        ctx.attributes.insert(
            "logging.begin_instant_ms".to_string(),
            json!(instant_now_ms()),
        );
        Ok(())
    }

    async fn after_execute(&self, ctx: &mut ToolExecutionContext, result: Value) -> Result<Value> {
        let duration_ms = ctx
            .attributes
            .get("logging.begin_instant_ms")
            .and_then(Value::as_u64)
            .map(|begin| instant_now_ms().saturating_sub(begin));
        tracing::debug!(
            tool = %ctx.tool_name,
            flow_id = %ctx.flow_id,
            duration_ms = ?duration_ms,
            output = %self.sanitize(&result),
            "Tool invocation end"
        );
        Ok(result)
    }

    async fn on_error(&self, ctx: &ToolExecutionContext, error: &FlowError) {
        tracing::error!(
            tool = %ctx.tool_name,
            flow_id = %ctx.flow_id,
            error = %error,
            "Tool invocation failed"
        );
    }
}

fn instant_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
