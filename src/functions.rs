/// Function-call dispatch: streamed argument accumulation, registry lookup,
/// concurrent handler execution, hang-up triggers.
///
/// The model streams tool-call arguments as deltas keyed by `call_id`;
/// finalization parses the JSON (falling back to the accumulated buffer when
/// the done event carries an empty `arguments`), runs the registered handler
/// on its own task with a timeout, and answers with exactly one
/// `function_call_output` item followed by a response request. Handler
/// failures become `{"error": ...}` payloads so the model can recover
/// in-conversation.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::peer::BridgeHandle;
use crate::realtime_protocol::{ClientEvent, ConversationItem};
use crate::recorder::CallRecorder;

/// Function names that end the call after a successful result, even without
/// an explicit `next_action`.
const HANGUP_FUNCTION_NAMES: [&str; 3] = ["wrap_up", "transfer_to_human", "hang_up"];

/// A registered business-logic function. Handlers may block internally or
/// await; the dispatcher never runs them on the pump loops.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

struct ClosureHandler<F>(F);

#[async_trait]
impl<F, Fut> FunctionHandler for ClosureHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Process-lifecycle registry: `name → handler`, plus the tool schemas sent
/// to the model at session configuration. Read-only once a bridge exists.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
    schemas: Vec<Value>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: Arc<dyn FunctionHandler>,
    ) {
        let name = name.into();
        self.schemas.push(schema);
        self.handlers.insert(name, handler);
    }

    /// Register a plain async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, schema: Value, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, schema, Arc::new(ClosureHandler(f)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn schemas(&self) -> &[Value] {
        &self.schemas
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A tool call being streamed in.
#[derive(Debug, Default, Clone)]
pub struct PendingFunctionCall {
    pub name: Option<String>,
    pub args_buf: String,
    pub output_item_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub handler_timeout: Duration,
    pub hangup_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            handler_timeout: Duration::from_secs(30),
            hangup_delay: Duration::from_secs(8),
        }
    }
}

pub struct FunctionDispatcher {
    registry: Arc<FunctionRegistry>,
    config: DispatcherConfig,
    active: Mutex<HashMap<String, PendingFunctionCall>>,
    recorder: Option<Arc<CallRecorder>>,
}

impl FunctionDispatcher {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        config: DispatcherConfig,
        recorder: Option<Arc<CallRecorder>>,
    ) -> Arc<Self> {
        Arc::new(FunctionDispatcher {
            registry,
            config,
            active: Mutex::new(HashMap::new()),
            recorder,
        })
    }

    /// Number of tool calls currently streaming in.
    pub fn pending_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// `response.function_call_arguments.delta`: create-or-append. The name
    /// is recorded on first sight.
    pub fn on_arguments_delta(&self, call_id: &str, name: Option<&str>, delta: &str) {
        let mut active = self.active.lock().unwrap();
        let pending = active.entry(call_id.to_string()).or_default();
        if pending.name.is_none() {
            if let Some(n) = name {
                pending.name = Some(n.to_string());
            }
        }
        pending.args_buf.push_str(delta);
        debug!(
            call_id = call_id,
            buffered = pending.args_buf.len(),
            "function args delta buffered"
        );
    }

    /// `response.function_call_arguments.done`: finalize and run the handler
    /// on its own task. Exactly one `function_call_output` is produced per
    /// finalization.
    pub fn on_arguments_done(
        self: &Arc<Self>,
        handle: BridgeHandle,
        call_id: &str,
        name: Option<&str>,
        arguments: &str,
        output_item_id: Option<&str>,
    ) {
        let mut pending = self
            .active
            .lock()
            .unwrap()
            .remove(call_id)
            .unwrap_or_default();
        pending.output_item_id = output_item_id.map(String::from);

        let name = name
            .map(String::from)
            .or(pending.name)
            .unwrap_or_default();

        // Empty terminal arguments fall back to the accumulated buffer.
        let source = if arguments.is_empty() {
            pending.args_buf
        } else {
            arguments.to_string()
        };

        handle.stats().record_function_call();
        if let Some(rec) = &self.recorder {
            rec.log_event(
                "function_call",
                json!({"call_id": call_id, "name": &name, "arguments": &source}),
            );
        }

        let dispatcher = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            dispatcher.run_function(handle, call_id, name, source).await;
        });
    }

    async fn run_function(
        self: Arc<Self>,
        handle: BridgeHandle,
        call_id: String,
        name: String,
        args_json: String,
    ) {
        let parsed: Result<Value, _> = if args_json.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str(&args_json)
        };

        let (result, succeeded) = match parsed {
            Err(e) => {
                warn!(call_id = %call_id, name = %name, error = %e, "function arguments unparseable");
                (
                    json!({"error": format!("Invalid arguments for '{name}': {e}")}),
                    false,
                )
            }
            Ok(args) => match self.registry.get(&name) {
                None => {
                    warn!(call_id = %call_id, name = %name, "function not registered");
                    (
                        json!({"error": format!("Function '{name}' not implemented.")}),
                        false,
                    )
                }
                Some(handler) => {
                    info!(call_id = %call_id, name = %name, "🔧 invoking function handler");
                    let outcome = tokio::select! {
                        _ = handle.cancel_token().cancelled() => {
                            debug!(call_id = %call_id, "function handler cancelled by shutdown");
                            return;
                        }
                        outcome = tokio::time::timeout(self.config.handler_timeout, handler.call(args)) => outcome,
                    };
                    match outcome {
                        Err(_) => (
                            json!({"error": format!(
                                "Function '{}' timed out after {}s",
                                name,
                                self.config.handler_timeout.as_secs()
                            )}),
                            false,
                        ),
                        Ok(Err(e)) => (json!({"error": e.to_string()}), false),
                        Ok(Ok(value)) => (value, true),
                    }
                }
            },
        };

        let output = result.to_string();
        if let Some(rec) = &self.recorder {
            rec.log_event(
                "function_call_output",
                json!({"call_id": &call_id, "name": &name, "output": &output}),
            );
        }

        let item = ConversationItem::function_call_output(&call_id, output);
        if let Err(e) = handle
            .send_to_model(&ClientEvent::ConversationItemCreate { item })
            .await
        {
            warn!(call_id = %call_id, error = %e, "failed to send function output");
            return;
        }
        if let Err(e) = handle.request_response().await {
            warn!(call_id = %call_id, error = %e, "failed to request response after function output");
        }

        if succeeded {
            if let Some((reason_code, reason)) = hangup_trigger(&name, &result) {
                handle.schedule_hangup(reason_code, reason, self.config.hangup_delay);
            }
        }
    }
}

/// Post-result hang-up inspection: an explicit `next_action == "end_call"`
/// or a terminal function name ends the call.
fn hangup_trigger(name: &str, result: &Value) -> Option<(&'static str, &'static str)> {
    if result.get("next_action").and_then(Value::as_str) == Some("end_call") {
        return Some((
            "normal",
            "Call completed successfully - all tasks finished",
        ));
    }
    if !HANGUP_FUNCTION_NAMES.contains(&name) {
        return None;
    }
    match name {
        "transfer_to_human" => Some(("transfer", "Call transferred to a human agent")),
        _ => Some(("normal", "Call completed successfully - all tasks finished")),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
