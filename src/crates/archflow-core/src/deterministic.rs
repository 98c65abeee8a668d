//! Deterministic executor
//!
//! A strict wrapper around a unit of work with hard guarantees: bounded
//! retries with exponential backoff, input/output schema validation, output
//! formatting, and an optional deadline. Used for func-agent style steps
//! where the caller needs schema-conforming output or a classified failure,
//! never a half-result.
//!
//! # Modes
//!
//! - [`ExecutionMode::Deterministic`] (default): input validated before the
//!   first attempt; the unit of work retries until the output validates or
//!   attempts are exhausted. Output-validation failures count as retryable
//!   here - the whole point of the mode is to insist on conforming output -
//!   while exceptions retry only when their classification is retryable.
//! - [`ExecutionMode::Creative`]: one attempt, no output validation.
//!
//! # Protocol
//!
//! 1. Allocate an opaque `execution_id`, record the start time.
//! 2. Validate input against the input schema (fail fast, no retry).
//! 3. Retry loop: run the work, validate the output, record an [`Attempt`]
//!    per try, sleeping `backoff * multiplier^(attempt-1)` between tries.
//! 4. Format the output per [`OutputFormat`].
//! 5. Return an [`ExecutionResult`] carrying value, formatted output,
//!    attempts, duration, and the error on failure.
//!
//! The retry bound is strict: the unit of work runs at most `max_attempts`
//! times per [`DeterministicExecutor::execute`] call.

use archflow_state::{ExecutionError, ExecutionErrorType};
use crate::error::{FlowError, Result};
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Retry/validation posture of the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Strict: validate, retry, insist on conforming output
    Deterministic,
    /// Loose: one attempt, output taken as-is
    Creative,
}

/// How the raw output is rendered into `formatted_output`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Compact JSON text
    Json,
    /// Raw string content (non-strings fall back to JSON text)
    Text,
}

/// Record of one try of the unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// 1-indexed attempt number
    pub number: u32,

    /// Wall time of this attempt
    pub duration_ms: u64,

    /// Failure message; `None` on the successful attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,

    /// Failure classification; `None` on the successful attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ExecutionErrorType>,
}

/// Outcome of one [`DeterministicExecutor::execute`] call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Opaque unique id for this call
    pub execution_id: String,

    /// Whether a validated value was produced
    pub success: bool,

    /// The raw output value on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// The output rendered per the configured [`OutputFormat`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_output: Option<String>,

    /// Total wall time including backoff sleeps
    pub duration_ms: u64,

    /// One record per try, in order
    pub attempts: Vec<Attempt>,

    /// The surfaced error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

/// Strict-retry wrapper around a unit of work
pub struct DeterministicExecutor {
    mode: ExecutionMode,
    max_attempts: u32,
    backoff: Duration,
    multiplier: f64,
    validate_input: bool,
    input_schema: Option<JSONSchema>,
    output_schema: Option<JSONSchema>,
    output_format: OutputFormat,
}

impl DeterministicExecutor {
    /// Deterministic executor: 3 attempts, 500ms initial backoff, x2
    pub fn new() -> Self {
        Self {
            mode: ExecutionMode::Deterministic,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            multiplier: 2.0,
            validate_input: true,
            input_schema: None,
            output_schema: None,
            output_format: OutputFormat::Json,
        }
    }

    /// Creative executor: one attempt, no output validation
    pub fn creative() -> Self {
        Self {
            mode: ExecutionMode::Creative,
            ..Self::new()
        }
    }

    /// Set the attempt bound (minimum 1)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the initial backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable input validation
    pub fn with_validate_input(mut self, validate: bool) -> Self {
        self.validate_input = validate;
        self
    }

    /// Set the output format
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Compile and install the input schema; fails closed on a bad schema
    pub fn with_input_schema(mut self, schema: &Value) -> Result<Self> {
        self.input_schema = Some(compile_schema(schema, "input")?);
        Ok(self)
    }

    /// Compile and install the output schema; fails closed on a bad schema
    pub fn with_output_schema(mut self, schema: &Value) -> Result<Self> {
        self.output_schema = Some(compile_schema(schema, "output")?);
        Ok(self)
    }

    /// Run the unit of work under the configured guarantees
    pub async fn execute<F, Fut>(&self, input: Value, work: F) -> ExecutionResult
    where
        F: Fn(Value) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, ExecutionError>>,
    {
        let execution_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut attempts: Vec<Attempt> = Vec::new();

        // Input validation fails fast with no retry
        if self.validate_input {
            if let Some(schema) = &self.input_schema {
                if let Some(detail) = validation_errors(schema, &input) {
                    let error = ExecutionError::validation(
                        "INPUT_SCHEMA_VIOLATION",
                        "input does not conform to the configured schema",
                    )
                    .with_component("deterministic-executor")
                    .with_detail("violations", json!(detail));
                    return self.failure(execution_id, started, attempts, error);
                }
            }
        }

        let max_attempts = match self.mode {
            ExecutionMode::Deterministic => self.max_attempts,
            ExecutionMode::Creative => 1,
        };

        let mut surfaced: Option<ExecutionError> = None;
        let mut attempt_number = 0u32;

        while attempt_number < max_attempts {
            attempt_number += 1;
            let attempt_started = Instant::now();

            let outcome = work(input.clone()).await;
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;

            // Output validation runs in deterministic mode only; a failure
            // there is retryable by definition of the mode.
            let failure: Option<ExecutionError> = match outcome {
                Ok(value) => match self.mode {
                    ExecutionMode::Deterministic => match &self.output_schema {
                        Some(schema) => match validation_errors(schema, &value) {
                            Some(detail) => Some(
                                ExecutionError::validation(
                                    "OUTPUT_SCHEMA_VIOLATION",
                                    "output does not conform to the configured schema",
                                )
                                .with_component("deterministic-executor")
                                .with_detail("violations", json!(detail)),
                            ),
                            None => {
                                attempts.push(Attempt {
                                    number: attempt_number,
                                    duration_ms: attempt_ms,
                                    failure: None,
                                    failure_kind: None,
                                });
                                return self.success(execution_id, started, attempts, value);
                            }
                        },
                        None => {
                            attempts.push(Attempt {
                                number: attempt_number,
                                duration_ms: attempt_ms,
                                failure: None,
                                failure_kind: None,
                            });
                            return self.success(execution_id, started, attempts, value);
                        }
                    },
                    ExecutionMode::Creative => {
                        attempts.push(Attempt {
                            number: attempt_number,
                            duration_ms: attempt_ms,
                            failure: None,
                            failure_kind: None,
                        });
                        return self.success(execution_id, started, attempts, value);
                    }
                },
                Err(error) => Some(error),
            };

            let error = match failure {
                Some(e) => e,
                None => continue,
            };

            attempts.push(Attempt {
                number: attempt_number,
                duration_ms: attempt_ms,
                failure: Some(error.message.clone()),
                failure_kind: Some(error.error_type),
            });

            let retryable = error.is_retryable() || error.code == "OUTPUT_SCHEMA_VIOLATION";
            if attempt_number < max_attempts && retryable {
                let delay = self.backoff_delay(attempt_number);
                tracing::warn!(
                    execution_id = %execution_id,
                    attempt = attempt_number,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying after backoff"
                );
                surfaced = Some(error);
                tokio::time::sleep(delay).await;
            } else {
                surfaced = Some(error);
                break;
            }
        }

        let last = surfaced.unwrap_or_else(|| {
            ExecutionError::new(
                ExecutionErrorType::Unknown,
                "NO_ATTEMPT_MADE",
                "executor loop ended without an attempt",
            )
        });

        let exhausted = attempts.len() as u32 >= max_attempts;
        let was_retryable = last.is_retryable() || last.code == "OUTPUT_SCHEMA_VIOLATION";
        let error = if exhausted && was_retryable {
            ExecutionError::execution(
                "RETRY_EXHAUSTED",
                format!("all {} attempts failed", max_attempts),
            )
            .with_component("deterministic-executor")
            .with_cause(&last)
            .with_detail("attempts", json!(attempts))
        } else {
            last
        };

        self.failure(execution_id, started, attempts, error)
    }

    /// Race [`DeterministicExecutor::execute`] against a deadline
    ///
    /// On expiry the result carries a TIMEOUT error; the in-flight work is
    /// dropped at the await point.
    pub async fn execute_with_timeout<F, Fut>(
        &self,
        input: Value,
        work: F,
        timeout: Duration,
    ) -> ExecutionResult
    where
        F: Fn(Value) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<Value, ExecutionError>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.execute(input, work)).await {
            Ok(result) => result,
            Err(_) => ExecutionResult {
                execution_id: Uuid::new_v4().to_string(),
                success: false,
                value: None,
                formatted_output: None,
                duration_ms: started.elapsed().as_millis() as u64,
                attempts: Vec::new(),
                error: Some(
                    ExecutionError::timeout(
                        "EXECUTION_TIMEOUT",
                        format!("execution exceeded {}ms", timeout.as_millis()),
                    )
                    .with_component("deterministic-executor"),
                ),
            },
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        Duration::from_secs_f64(self.backoff.as_secs_f64() * self.multiplier.powi(exp as i32))
    }

    fn success(
        &self,
        execution_id: String,
        started: Instant,
        attempts: Vec<Attempt>,
        value: Value,
    ) -> ExecutionResult {
        let formatted = match self.output_format {
            OutputFormat::Json => value.to_string(),
            OutputFormat::Text => match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        ExecutionResult {
            execution_id,
            success: true,
            value: Some(value),
            formatted_output: Some(formatted),
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            error: None,
        }
    }

    fn failure(
        &self,
        execution_id: String,
        started: Instant,
        attempts: Vec<Attempt>,
        error: ExecutionError,
    ) -> ExecutionResult {
        ExecutionResult {
            execution_id,
            success: false,
            value: None,
            formatted_output: None,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            error: Some(error),
        }
    }
}

impl Default for DeterministicExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_schema(schema: &Value, which: &str) -> Result<JSONSchema> {
    JSONSchema::compile(schema)
        .map_err(|e| FlowError::Configuration(format!("invalid {} schema: {}", which, e)))
}

fn validation_errors(schema: &JSONSchema, instance: &Value) -> Option<Vec<String>> {
    match schema.validate(instance) {
        Ok(()) => None,
        Err(errors) => Some(errors.map(|e| e.to_string()).collect()),
    }
}
