//! Synchronous policy core: action catalog, admission control, enforcement,
//! PII masking and retrieval scoring. Nothing in this crate performs I/O
//! except [`ActionRegistry::load`].

pub mod pii;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod retrieval;

pub use pii::{mask_pii, mask_value, sanitize_params};
pub use policy::{DenyReason, PolicyEnforcer, PolicyOutcome};
pub use rate_limit::RateLimiter;
pub use registry::{ActionRegistry, RegistryError};
pub use retrieval::{RetrievalScorer, DEFAULT_MIN_SCORE, DEFAULT_STATUS};

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Parses a calendar date in `YYYY-MM-DD` form.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
