use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

pub const API_VERSION: &str = "1.0.0";

/// Parameter and result maps exchanged with actions.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct ContractSchemaManifest {
    pub name: &'static str,
    pub id: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<ContractSchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS
            .iter()
            .map(|(name, id, sha256, body)| ContractSchemaManifest {
                name,
                id,
                sha256,
                body,
            })
            .collect(),
    }
}

/// Body of an embedded `contracts/v1` schema, looked up by file name.
pub fn schema_body(name: &str) -> Option<&'static str> {
    GENERATED_CONTRACT_SCHEMAS
        .iter()
        .find(|(schema_name, _, _, _)| *schema_name == name)
        .map(|(_, _, _, body)| *body)
}

pub const ACTION_REGISTRY_SCHEMA: &str = "action-registry.schema.json";
pub const AUDIT_EVENT_SCHEMA: &str = "audit-event.schema.json";
pub const DISPATCH_REQUEST_SCHEMA: &str = "dispatch-request.schema.json";

/// Declarative description of one callable action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scopes_required: BTreeSet<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default = "default_audit_level")]
    pub audit_level: String,
    #[serde(default)]
    pub input_schema: InputSchema,
    #[serde(default = "default_object_schema")]
    pub output_schema: Value,
}

/// The subset of JSON Schema the policy layer understands: `required`
/// keys and per-property `enum` allowlists. Everything else is kept
/// verbatim and ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSchema {
    #[serde(rename = "type", default = "default_object_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            kind: default_object_type(),
            required: Vec::new(),
            properties: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PropertySchema {
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_idempotent() -> bool {
    true
}

fn default_audit_level() -> String {
    "BASIC".to_string()
}

fn default_object_type() -> String {
    "object".to_string()
}

fn default_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

/// Authenticated caller, supplied per call by the layer in front of the
/// gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CallerIdentity {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionRequest {
    pub action_id: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Permit,
    Deny,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Permit => "PERMIT",
            Decision::Deny => "DENY",
        }
    }
}

/// One record per dispatched call. The serialized field names are the
/// wire contract consumed by audit sinks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub ts: i64,
    pub trace_id: String,
    pub user_id: String,
    pub action_id: String,
    pub decision: Decision,
    pub reason: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(
        default,
        serialize_with = "serialize_result",
        deserialize_with = "deserialize_result"
    )]
    pub result: Option<Params>,
}

fn serialize_result<S: Serializer>(result: &Option<Params>, s: S) -> Result<S::Ok, S::Error> {
    match result {
        Some(map) => map.serialize(s),
        None => Params::new().serialize(s),
    }
}

fn deserialize_result<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Params>, D::Error> {
    let map = Option::<Params>::deserialize(d)?;
    Ok(map.filter(|m| !m.is_empty()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Parsed but not yet enforced by any filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Candidate document as produced by the search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "content")]
    pub snippet: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredDocument {
    #[serde(flatten)]
    pub document: Document,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchRequest {
    pub caller: CallerIdentity,
    pub request: ActionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RankRequest {
    pub query: String,
    pub documents: Vec<Document>,
    #[serde(default)]
    pub filters: RetrievalFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
