use std::path::Path;
use std::sync::Arc;

use gatehouse_contracts::{AuditEvent, Document, Params, RetrievalFilters};
use gatehouse_kernel::{mask_value, RetrievalScorer};
use serde_json::Value;
use tracing::debug;

use crate::audit::AuditLog;
use crate::dispatch::{ActionHandler, ToolError, ToolMap};
use crate::ServerError;

pub const DOC_SEARCH: &str = "doc.search";
pub const AUDIT_WRITE: &str = "audit.write";

/// Candidate supplier for `doc.search`. Similarity search lives behind
/// this trait; the gateway only filters and ranks what it returns.
pub trait DocumentSource: Send + Sync + 'static {
    fn candidates(&self, query: &str) -> Result<Vec<Document>, ToolError>;
}

/// Fixed document set loaded from a JSON array. Returns every document
/// as a candidate.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorpus {
    documents: Vec<Document>,
}

impl InMemoryCorpus {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Corpus(format!("{}: {e}", path.display())))?;
        let documents: Vec<Document> = serde_json::from_str(&text)
            .map_err(|e| ServerError::Corpus(format!("{}: {e}", path.display())))?;
        Ok(Self::new(documents))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentSource for InMemoryCorpus {
    fn candidates(&self, _query: &str) -> Result<Vec<Document>, ToolError> {
        Ok(self.documents.clone())
    }
}

/// `doc.search`: `query` (required), `top_k`, `filters`. Returns
/// `{"results": [...]}` ranked by [`RetrievalScorer::rank`].
pub struct DocSearchTool {
    source: Arc<dyn DocumentSource>,
    scorer: RetrievalScorer,
    default_top_k: usize,
}

impl DocSearchTool {
    pub fn new(source: Arc<dyn DocumentSource>, scorer: RetrievalScorer, default_top_k: usize) -> Self {
        Self {
            source,
            scorer,
            default_top_k,
        }
    }
}

impl ActionHandler for DocSearchTool {
    fn invoke(&self, params: &Params) -> Result<Params, ToolError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Permanent("query must be a string".to_string()))?;
        let top_k = match params.get("top_k") {
            None | Some(Value::Null) => self.default_top_k,
            Some(v) => v
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| ToolError::Permanent("top_k must be a non-negative integer".to_string()))?,
        };
        let filters: RetrievalFilters = match params.get("filters") {
            None | Some(Value::Null) => RetrievalFilters::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ToolError::Permanent(format!("filters are invalid: {e}")))?,
        };

        let candidates = self.source.candidates(query)?;
        let total = candidates.len();
        let mut ranked = self.scorer.rank(candidates, query, &filters);
        ranked.truncate(top_k);
        debug!(candidates = total, returned = ranked.len(), "doc.search ranked");

        let results =
            serde_json::to_value(ranked).map_err(|e| ToolError::Permanent(e.to_string()))?;
        let mut out = Params::new();
        out.insert("results".to_string(), results);
        Ok(out)
    }
}

/// `audit.write`: appends the caller-supplied `event` to the audit log and
/// returns `{"ok": true}`. Every string in the event is masked first, nested
/// ones included.
pub struct AuditWriteTool {
    audit: Arc<AuditLog>,
}

impl AuditWriteTool {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }
}

impl ActionHandler for AuditWriteTool {
    fn invoke(&self, params: &Params) -> Result<Params, ToolError> {
        let raw = params
            .get("event")
            .filter(|v| v.is_object())
            .ok_or_else(|| ToolError::Permanent("event must be an object".to_string()))?;
        let event: AuditEvent = serde_json::from_value(mask_value(raw))
            .map_err(|e| ToolError::Permanent(format!("event is not a valid audit event: {e}")))?;

        // Handlers run on the blocking pool, which keeps the runtime context.
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ToolError::Permanent(format!("no runtime for audit write: {e}")))?;
        runtime.block_on(self.audit.record(event));

        let mut out = Params::new();
        out.insert("ok".to_string(), Value::Bool(true));
        Ok(out)
    }
}

/// Implementations shipped with the server.
pub fn builtin_tools(
    source: Arc<dyn DocumentSource>,
    scorer: RetrievalScorer,
    default_top_k: usize,
    audit: Arc<AuditLog>,
) -> ToolMap {
    ToolMap::new()
        .with(DOC_SEARCH, DocSearchTool::new(source, scorer, default_top_k))
        .with(AUDIT_WRITE, AuditWriteTool::new(audit))
}
