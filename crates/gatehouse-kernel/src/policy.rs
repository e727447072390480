use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use gatehouse_contracts::{ActionSpec, CallerIdentity, InputSchema, Params};
use serde_json::Value;

use crate::pii::sanitize_params;
use crate::rate_limit::RateLimiter;

/// Why a call was refused by [`PolicyEnforcer::enforce`].
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    RateLimitExceeded,
    MissingScopes {
        required: Vec<String>,
        missing: Vec<String>,
    },
    MissingRequiredField(String),
    ValueNotAllowed {
        key: String,
        value: Value,
        allowed: Vec<Value>,
    },
}

impl DenyReason {
    /// Stable machine-readable category.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::RateLimitExceeded => "rate_limit_exceeded",
            DenyReason::MissingScopes { .. } => "missing_scopes",
            DenyReason::MissingRequiredField(_) | DenyReason::ValueNotAllowed { .. } => {
                "schema_invalid"
            }
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RateLimitExceeded => f.write_str("rate_limit_exceeded"),
            DenyReason::MissingScopes { required, .. } => {
                write!(f, "missing_scopes: required=[{}]", required.join(", "))
            }
            DenyReason::MissingRequiredField(key) => {
                write!(f, "schema_invalid: missing_required_field: {key}")
            }
            DenyReason::ValueNotAllowed {
                key,
                value,
                allowed,
            } => write!(
                f,
                "schema_invalid: value_not_allowed: key={key}, value={}, allowed={}",
                render_value(value),
                Value::Array(allowed.clone())
            ),
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    /// Carries the sanitized parameters.
    Permit(Params),
    Deny(DenyReason),
}

impl PolicyOutcome {
    pub fn is_permit(&self) -> bool {
        matches!(self, PolicyOutcome::Permit(_))
    }
}

/// Runs the fixed check sequence: rate limit, scopes, schema/allowlist,
/// then sanitization. The limiter is consulted first, so calls later
/// refused for scope or schema reasons still occupy a window slot.
#[derive(Debug, Clone)]
pub struct PolicyEnforcer {
    limiter: Arc<RateLimiter>,
}

impl PolicyEnforcer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn enforce(
        &self,
        identity: &CallerIdentity,
        spec: &ActionSpec,
        raw_params: &Params,
    ) -> PolicyOutcome {
        self.enforce_at(identity, spec, raw_params, Instant::now())
    }

    pub fn enforce_at(
        &self,
        identity: &CallerIdentity,
        spec: &ActionSpec,
        raw_params: &Params,
        now: Instant,
    ) -> PolicyOutcome {
        if !self.limiter.allow_at(&identity.id, now) {
            return PolicyOutcome::Deny(DenyReason::RateLimitExceeded);
        }

        let missing: Vec<String> = spec
            .scopes_required
            .iter()
            .filter(|scope| !identity.scopes.contains(*scope))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return PolicyOutcome::Deny(DenyReason::MissingScopes {
                required: spec.scopes_required.iter().cloned().collect(),
                missing,
            });
        }

        if let Err(reason) = validate_schema_and_allowlist(raw_params, &spec.input_schema) {
            return PolicyOutcome::Deny(reason);
        }

        PolicyOutcome::Permit(sanitize_params(raw_params))
    }
}

/// Presence of `required` keys, then enum membership for every supplied key
/// whose property declares one. Types are not checked.
fn validate_schema_and_allowlist(params: &Params, schema: &InputSchema) -> Result<(), DenyReason> {
    if let Some(key) = schema.required.iter().find(|k| !params.contains_key(*k)) {
        return Err(DenyReason::MissingRequiredField(key.clone()));
    }

    for (key, value) in params {
        let Some(allowed) = schema
            .properties
            .get(key)
            .and_then(|prop| prop.allowed.as_ref())
        else {
            continue;
        };
        if !allowed.is_empty() && !allowed.contains(value) {
            return Err(DenyReason::ValueNotAllowed {
                key: key.clone(),
                value: value.clone(),
                allowed: allowed.clone(),
            });
        }
    }
    Ok(())
}
