use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gatehouse_contracts::{
    ActionRequest, ActionSpec, AuditEvent, CallerIdentity, Decision, Params,
};
use gatehouse_kernel::{now_epoch_ms, ActionRegistry, PolicyEnforcer, PolicyOutcome};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::audit::AuditLog;

pub const REASON_ACTION_NOT_REGISTERED: &str = "action_not_registered";
pub const REASON_TOOL_NOT_IMPLEMENTED: &str = "tool_not_implemented";
pub const REASON_TOOL_TIMEOUT: &str = "tool_timeout";
pub const REASON_TOOL_EXECUTION_FAILED: &str = "tool_execution_failed";

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(50);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Failure reported by an action implementation. Only `Transient` and
/// `Timeout` are eligible for retry, and only on idempotent actions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl ToolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Transient(_) | ToolError::Timeout(_))
    }

    fn reason(&self) -> String {
        match self {
            ToolError::Timeout(_) => REASON_TOOL_TIMEOUT.to_string(),
            other => format!("{REASON_TOOL_EXECUTION_FAILED}: {other}"),
        }
    }
}

/// Implementation behind one action id. Runs on the blocking pool and only
/// ever sees sanitized parameters.
pub trait ActionHandler: Send + Sync + 'static {
    fn invoke(&self, params: &Params) -> Result<Params, ToolError>;
}

impl<F> ActionHandler for F
where
    F: Fn(&Params) -> Result<Params, ToolError> + Send + Sync + 'static,
{
    fn invoke(&self, params: &Params) -> Result<Params, ToolError> {
        self(params)
    }
}

#[derive(Clone, Default)]
pub struct ToolMap {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ToolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action_id: impl Into<String>, handler: impl ActionHandler) -> Self {
        self.insert(action_id, handler);
        self
    }

    pub fn insert(&mut self, action_id: impl Into<String>, handler: impl ActionHandler) {
        self.handlers.insert(action_id.into(), Arc::new(handler));
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for ToolMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolMap").field("ids", &self.ids()).finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed {
        trace_id: String,
        action_id: String,
        result: Params,
    },
    Denied {
        trace_id: String,
        action_id: String,
        reason: String,
    },
    Failed {
        trace_id: String,
        action_id: String,
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn trace_id(&self) -> &str {
        match self {
            DispatchOutcome::Completed { trace_id, .. }
            | DispatchOutcome::Denied { trace_id, .. }
            | DispatchOutcome::Failed { trace_id, .. } => trace_id,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Completed { .. } => None,
            DispatchOutcome::Denied { reason, .. } | DispatchOutcome::Failed { reason, .. } => {
                Some(reason)
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Completed,
    Denied,
    Failed,
}

/// What a call resolved to, before it is audited.
struct Resolution {
    terminal: Terminal,
    decision: Decision,
    reason: Option<String>,
    params: Params,
    result: Option<Params>,
}

impl Resolution {
    fn denied(reason: impl Into<String>, params: Params) -> Self {
        Self {
            terminal: Terminal::Denied,
            decision: Decision::Deny,
            reason: Some(reason.into()),
            params,
            result: None,
        }
    }

    fn completed(params: Params, result: Params) -> Self {
        Self {
            terminal: Terminal::Completed,
            decision: Decision::Permit,
            reason: None,
            params,
            result: Some(result),
        }
    }

    fn failed(err: &ToolError, params: Params) -> Self {
        let mut result = Params::new();
        result.insert("error".to_string(), Value::String(err.to_string()));
        Self {
            terminal: Terminal::Failed,
            decision: Decision::Permit,
            reason: Some(err.reason()),
            params,
            result: Some(result),
        }
    }
}

/// Runs one call through lookup, enforcement and invocation, then writes
/// exactly one audit event for whatever the call resolved to.
pub struct ActionDispatcher {
    registry: Arc<ActionRegistry>,
    enforcer: PolicyEnforcer,
    audit: Arc<AuditLog>,
    tools: ToolMap,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<ActionRegistry>,
        enforcer: PolicyEnforcer,
        audit: Arc<AuditLog>,
        tools: ToolMap,
    ) -> Self {
        Self {
            registry,
            enforcer,
            audit,
            tools,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn enforcer(&self) -> &PolicyEnforcer {
        &self.enforcer
    }

    #[instrument(
        skip_all,
        fields(
            caller = %identity.id,
            action_id = %request.action_id,
            trace_id = tracing::field::Empty
        )
    )]
    pub async fn dispatch(
        &self,
        identity: &CallerIdentity,
        request: ActionRequest,
    ) -> DispatchOutcome {
        let ActionRequest {
            action_id,
            params,
            trace_id,
        } = request;
        let trace_id = trace_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(new_trace_id);
        tracing::Span::current().record("trace_id", trace_id.as_str());

        let Resolution {
            terminal,
            decision,
            reason,
            params,
            result,
        } = self.resolve(identity, &action_id, params).await;

        match terminal {
            Terminal::Completed => info!("action permitted and completed"),
            Terminal::Denied => warn!(reason = reason.as_deref(), "action denied"),
            Terminal::Failed => warn!(reason = reason.as_deref(), "action failed"),
        }

        self.audit
            .record(AuditEvent {
                ts: now_epoch_ms(),
                trace_id: trace_id.clone(),
                user_id: identity.id.clone(),
                action_id: action_id.clone(),
                decision,
                reason: reason.clone(),
                params,
                result: result.clone(),
            })
            .await;

        match terminal {
            Terminal::Completed => DispatchOutcome::Completed {
                trace_id,
                action_id,
                result: result.unwrap_or_default(),
            },
            Terminal::Denied => DispatchOutcome::Denied {
                trace_id,
                action_id,
                reason: reason.unwrap_or_default(),
            },
            Terminal::Failed => DispatchOutcome::Failed {
                trace_id,
                action_id,
                reason: reason.unwrap_or_default(),
            },
        }
    }

    async fn resolve(
        &self,
        identity: &CallerIdentity,
        action_id: &str,
        raw_params: Params,
    ) -> Resolution {
        let Some(spec) = self.registry.get(action_id) else {
            return Resolution::denied(REASON_ACTION_NOT_REGISTERED, raw_params);
        };

        let safe_params = match self.enforcer.enforce(identity, spec, &raw_params) {
            PolicyOutcome::Permit(safe) => safe,
            PolicyOutcome::Deny(reason) => {
                return Resolution::denied(reason.to_string(), raw_params);
            }
        };
        drop(raw_params);

        let Some(handler) = self.tools.get(action_id) else {
            return Resolution::denied(REASON_TOOL_NOT_IMPLEMENTED, safe_params);
        };

        match invoke_with_retry(spec, handler, &safe_params).await {
            Ok(result) => Resolution::completed(safe_params, result),
            Err(err) => Resolution::failed(&err, safe_params),
        }
    }
}

/// Idempotent actions get `retry` extra attempts on retryable failures,
/// spaced by [`retry_backoff`]; everything else runs once. A timed-out
/// attempt is abandoned, not cancelled, so it may still be running when the
/// next attempt starts.
async fn invoke_with_retry(
    spec: &ActionSpec,
    handler: Arc<dyn ActionHandler>,
    params: &Params,
) -> Result<Params, ToolError> {
    let attempts = if spec.idempotent {
        spec.retry.saturating_add(1)
    } else {
        1
    };
    let mut attempt = 1;
    loop {
        match invoke_once(Arc::clone(&handler), params.clone(), spec.timeout_ms).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = retry_backoff(attempt);
                if matches!(err, ToolError::Timeout(_)) {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying idempotent action while the timed-out attempt may still be running"
                    );
                } else {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying action"
                    );
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn invoke_once(
    handler: Arc<dyn ActionHandler>,
    params: Params,
    timeout_ms: u64,
) -> Result<Params, ToolError> {
    let task = tokio::task::spawn_blocking(move || handler.invoke(&params));
    match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ToolError::Permanent(format!(
            "action handler aborted: {join_err}"
        ))),
        Err(_) => Err(ToolError::Timeout(timeout_ms)),
    }
}

/// Exponential delay before attempt `failed_attempt + 1`, capped at two
/// seconds.
pub fn retry_backoff(failed_attempt: u32) -> Duration {
    let shift = failed_attempt.saturating_sub(1).min(16);
    RETRY_BACKOFF_BASE
        .saturating_mul(1u32 << shift)
        .min(RETRY_BACKOFF_MAX)
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Convenience for handlers returning a single JSON object.
pub fn object(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Params::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
