//! Deadline-bounded script execution.
//!
//! A script runs on its own OS thread while the caller races a timer. When
//! the deadline passes the engine is asked to interrupt itself and given a
//! short grace period to stop. An engine that ignores the request leaves the
//! thread running: the caller gets a forced timeout and the engine stays
//! poisoned, so it must be reset or discarded before reuse.
//!
//! Panics on the execution thread are caught and reported; they never reach
//! the host.

use rquickjs::{CatchResultExt, Context, Ctx, IntoJs, Object, Runtime, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::config::{DEFAULT_SCRIPT_TIMEOUT, INTERRUPT_GRACE};
use crate::error::{Error, Result};

const EXECUTION_THREAD_STACK: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Thrown by the script
    Script(String),
    /// Stopped by an interrupt request
    Interrupted,
    /// Refused: the engine is still interrupted from an earlier run
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Clean,
    Poisoned,
}

/// An embedded interpreter that supports cooperative interruption.
pub trait ScriptEngine: Send + Sync + 'static {
    fn eval(&self, source: &str) -> std::result::Result<serde_json::Value, EvalError>;

    /// Ask the running script to stop. Must be callable from any thread
    /// while `eval` is in progress.
    fn interrupt(&self);

    fn clear_interrupt(&self);

    fn is_interrupted(&self) -> bool;

    fn state(&self) -> EngineState {
        if self.is_interrupted() {
            EngineState::Poisoned
        } else {
            EngineState::Clean
        }
    }
}

/// QuickJS engine with an interrupt flag polled by the interpreter.
pub struct QuickJsEngine {
    context: Context,
    // Declared after the context so it is dropped last
    _runtime: Runtime,
    interrupted: Arc<AtomicBool>,
}

impl QuickJsEngine {
    pub fn new(memory_limit_mb: usize) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| Error::Script(format!("QuickJS runtime: {}", e)))?;
        if memory_limit_mb > 0 {
            runtime.set_memory_limit(memory_limit_mb * 1024 * 1024);
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::SeqCst))));

        let context =
            Context::full(&runtime).map_err(|e| Error::Script(format!("QuickJS context: {}", e)))?;

        Ok(Self {
            context,
            _runtime: runtime,
            interrupted,
        })
    }

    /// Run `f` inside the engine's context, e.g. to install globals.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R + Send,
        R: Send,
    {
        self.context.with(f)
    }
}

impl ScriptEngine for QuickJsEngine {
    fn eval(&self, source: &str) -> std::result::Result<serde_json::Value, EvalError> {
        if self.is_interrupted() {
            return Err(EvalError::Poisoned);
        }
        let interrupted = &self.interrupted;

        self.context.with(|ctx| {
            let outcome = ctx
                .eval::<Value, _>(source)
                .catch(&ctx)
                .map_err(|e| e.to_string())
                .and_then(|value| settle(&ctx, value, interrupted))
                .and_then(|value| js_to_json(&ctx, value).map_err(|e| e.to_string()));

            match outcome {
                Ok(json) => Ok(json),
                Err(_) if interrupted.load(Ordering::SeqCst) => Err(EvalError::Interrupted),
                Err(message) => Err(EvalError::Script(message)),
            }
        })
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Drain queued jobs and unwrap a returned promise.
fn settle<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    interrupted: &AtomicBool,
) -> std::result::Result<Value<'js>, String> {
    while !interrupted.load(Ordering::SeqCst) && ctx.execute_pending_job() {}

    let Some(promise) = value.as_promise() else {
        return Ok(value);
    };
    match promise.result::<Value>() {
        Some(result) => result.catch(ctx).map_err(|e| e.to_string()),
        None => Err("promise did not settle".to_string()),
    }
}

/// Runs scripts against an engine with a deadline.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    default_timeout: Duration,
    grace: Duration,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_TIMEOUT, INTERRUPT_GRACE)
    }
}

enum Outcome {
    Finished(std::result::Result<serde_json::Value, EvalError>),
    Panicked { message: String, interrupted: bool },
}

impl ScriptRunner {
    pub fn new(default_timeout: Duration, grace: Duration) -> Self {
        let default_timeout = if default_timeout.is_zero() {
            DEFAULT_SCRIPT_TIMEOUT
        } else {
            default_timeout
        };
        Self {
            default_timeout,
            grace,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Evaluate `script`, giving up after `timeout` (zero means the default).
    /// The interrupt is engine-wide, so callers sharing an engine must not
    /// overlap runs on it.
    pub async fn run(
        &self,
        engine: Arc<dyn ScriptEngine>,
        script: String,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let timeout = if timeout.is_zero() {
            self.default_timeout
        } else {
            timeout
        };

        let (tx, mut rx) = oneshot::channel();
        let worker = Arc::clone(&engine);
        std::thread::Builder::new()
            .name("script-exec".into())
            .stack_size(EXECUTION_THREAD_STACK)
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| worker.eval(&script)));
                let outcome = match result {
                    Ok(finished) => Outcome::Finished(finished),
                    Err(payload) => Outcome::Panicked {
                        message: panic_message(payload.as_ref()),
                        interrupted: worker.is_interrupted(),
                    },
                };
                // The caller may have given up already
                let _ = tx.send(outcome);
            })?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => classify(outcome),
            Ok(Err(_)) => Err(Error::PanicRecovered(
                "execution thread exited without a result".into(),
            )),
            Err(_) => {
                engine.interrupt();
                match tokio::time::timeout(self.grace, rx).await {
                    Ok(_) => {
                        log_debug!("[script] interrupted after {}ms", timeout.as_millis());
                        Err(Error::Timeout { forced: false })
                    }
                    Err(_) => {
                        log_warn!(
                            "[script] script ignored interrupt for {}ms; execution thread detached",
                            self.grace.as_millis()
                        );
                        Err(Error::Timeout { forced: true })
                    }
                }
            }
        }
    }

    /// Like [`run`](Self::run), then clears the interrupt so the engine can
    /// be reused. A forced timeout leaves the engine poisoned since its
    /// thread may still be executing.
    pub async fn run_with_recover(
        &self,
        engine: Arc<dyn ScriptEngine>,
        script: String,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let result = self.run(Arc::clone(&engine), script, timeout).await;
        if !matches!(result, Err(Error::Timeout { forced: true })) {
            engine.clear_interrupt();
        }
        result
    }
}

fn classify(outcome: Outcome) -> Result<serde_json::Value> {
    match outcome {
        Outcome::Finished(Ok(value)) => Ok(value),
        Outcome::Finished(Err(EvalError::Script(message))) => Err(Error::Script(message)),
        Outcome::Finished(Err(EvalError::Interrupted)) => Err(Error::Timeout { forced: false }),
        Outcome::Finished(Err(EvalError::Poisoned)) => Err(Error::Script(
            "engine was interrupted and must be reset before reuse".into(),
        )),
        Outcome::Panicked {
            interrupted: true, ..
        } => Err(Error::Timeout { forced: false }),
        Outcome::Panicked { message, .. } => {
            log_error!("[script] panic during execution: {}", message);
            Err(Error::PanicRecovered(message))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Convert a JSON value into a JS value.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(Value::new_int(ctx.clone(), i)),
            None => Ok(Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
        },
        serde_json::Value::String(s) => s.as_str().into_js(ctx),
        serde_json::Value::Array(arr) => {
            let js_arr = rquickjs::Array::new(ctx.clone())?;
            for (i, v) in arr.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, v)?)?;
            }
            Ok(js_arr.into_value())
        }
        serde_json::Value::Object(obj) => {
            let js_obj = Object::new(ctx.clone())?;
            for (k, v) in obj {
                js_obj.set(k.as_str(), json_to_js(ctx, v)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

/// Convert a JS value into JSON. Functions and symbols become null.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        // Whole numbers beyond i32 come back as floats
        if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            return Ok(serde_json::json!(f as i64));
        }
        return Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(arr) = value.as_array() {
        let mut result = Vec::with_capacity(arr.len());
        for i in 0..arr.len() {
            let v: Value<'js> = arr.get(i)?;
            result.push(js_to_json(ctx, v)?);
        }
        return Ok(serde_json::Value::Array(result));
    }
    if value.is_function() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(obj) = value.as_object() {
        let mut result = serde_json::Map::new();
        for item in obj.props::<String, Value<'js>>() {
            let (k, v) = item?;
            result.insert(k, js_to_json(ctx, v)?);
        }
        return Ok(serde_json::Value::Object(result));
    }
    Ok(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn returns_script_value() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(QuickJsEngine::new(16).unwrap());
        let runner = ScriptRunner::default();
        let value = runner
            .run(engine, "({ a: 1 + 1, b: [true, 'x', null], c: 2.5 })".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!({ "a": 2, "b": [true, "x", null], "c": 2.5 }));
    }

    #[tokio::test]
    async fn resolves_returned_promises() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(QuickJsEngine::new(16).unwrap());
        let value = ScriptRunner::default()
            .run(engine, "Promise.resolve(41).then(v => v + 1)".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn json_round_trips_through_context() {
        let engine = QuickJsEngine::new(16).unwrap();
        let input = json!({ "big": 5_000_000_000i64, "nested": { "s": "ü" } });
        let output = engine.with(|ctx| {
            let js = json_to_js(&ctx, &input).unwrap();
            js_to_json(&ctx, js).unwrap()
        });
        assert_eq!(output, input);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
    }
}
