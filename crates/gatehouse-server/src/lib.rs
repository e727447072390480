pub mod audit;
pub mod dispatch;
pub mod tools;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use gatehouse_config::Config;
use gatehouse_contracts::{
    ActionSpec, DispatchRequest, ErrorBody, ErrorResponse, RankRequest, ScoredDocument,
    API_VERSION,
};
use gatehouse_kernel::{ActionRegistry, PolicyEnforcer, RateLimiter, RegistryError, RetrievalScorer};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub use audit::{
    verify_audit_chain, AuditError, AuditHealthSnapshot, AuditLog, AuditSink, JsonlAuditSink,
    MemoryAuditSink, DEFAULT_MEMORY_CAPACITY,
};
pub use dispatch::{
    new_trace_id, object, retry_backoff, ActionDispatcher, ActionHandler, DispatchOutcome, ToolError, ToolMap,
    REASON_ACTION_NOT_REGISTERED, REASON_TOOL_EXECUTION_FAILED, REASON_TOOL_NOT_IMPLEMENTED,
    REASON_TOOL_TIMEOUT,
};
pub use tools::{
    builtin_tools, AuditWriteTool, DocSearchTool, DocumentSource, InMemoryCorpus, AUDIT_WRITE,
    DOC_SEARCH,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("corpus load failed: {0}")]
    Corpus(String),
    #[error("invalid listen_addr: {0}")]
    InvalidListenAddr(String),
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("serve failed: {0}")]
    Serve(String),
}

/// Everything a request needs, wired once at startup.
pub struct Gateway {
    dispatcher: ActionDispatcher,
    scorer: RetrievalScorer,
}

impl Gateway {
    pub fn new(dispatcher: ActionDispatcher, scorer: RetrievalScorer) -> Self {
        Self { dispatcher, scorer }
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn scorer(&self) -> &RetrievalScorer {
        &self.scorer
    }
}

pub async fn build_gateway(cfg: &Config) -> Result<Gateway, ServerError> {
    let registry = Arc::new(ActionRegistry::load(&cfg.registry.path)?);
    let limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit.limit,
        Duration::from_secs(cfg.rate_limit.window_sec),
    ));
    let audit = Arc::new(AuditLog::from_config(&cfg.audit).await?);
    let scorer = RetrievalScorer::new(
        cfg.retrieval.min_score_threshold,
        cfg.retrieval.default_status.clone(),
    );

    let corpus = match cfg.retrieval.corpus_path.as_deref() {
        Some(path) => InMemoryCorpus::load(path)?,
        None => InMemoryCorpus::default(),
    };
    info!(
        actions = registry.len(),
        documents = corpus.len(),
        audit_sink = audit.sink().name(),
        "gateway assembled"
    );

    if cfg.rate_limit.purge_interval_ms > 0 {
        spawn_limiter_sweeper(
            Arc::downgrade(&limiter),
            Duration::from_millis(cfg.rate_limit.purge_interval_ms),
        );
    }

    let tools = builtin_tools(
        Arc::new(corpus),
        scorer.clone(),
        cfg.retrieval.default_top_k,
        Arc::clone(&audit),
    );
    let dispatcher = ActionDispatcher::new(registry, PolicyEnforcer::new(limiter), audit, tools);
    Ok(Gateway::new(dispatcher, scorer))
}

/// Periodically drops rate-limit windows of callers that went idle. The task
/// ends once the limiter itself is dropped.
pub fn spawn_limiter_sweeper(
    limiter: Weak<RateLimiter>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            let removed = limiter.purge_idle(Instant::now());
            if removed > 0 {
                debug!(
                    removed,
                    remaining = limiter.tracked_callers(),
                    "pruned idle rate limit windows"
                );
            }
        }
    })
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/actions", get(actions))
        .route("/v1/dispatch", post(dispatch))
        .route("/v1/retrieval/rank", post(rank))
        .with_state(gateway)
}

pub async fn build_app(cfg: Config) -> Result<Router, ServerError> {
    let gateway = build_gateway(&cfg).await?;
    Ok(router(Arc::new(gateway)))
}

pub async fn serve(cfg: Config) -> Result<(), ServerError> {
    serve_with_shutdown(cfg, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(cfg: Config, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| ServerError::InvalidListenAddr(format!("{e}")))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(e.to_string()))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn validation_error(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: ErrorBody {
                code: "validation_error".to_string(),
                message: message.into(),
                details: None,
            },
        }),
    )
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    actions: usize,
    audit: AuditHealthSnapshot,
}

async fn healthz(State(gateway): State<Arc<Gateway>>) -> Json<Health> {
    let dispatcher = gateway.dispatcher();
    let audit = dispatcher.audit().health();
    let status = if audit.is_healthy() { "ok" } else { "degraded" };
    Json(Health {
        status,
        version: API_VERSION,
        actions: dispatcher.registry().len(),
        audit,
    })
}

#[derive(Debug, Serialize)]
struct ActionList {
    actions: Vec<ActionSpec>,
}

async fn actions(State(gateway): State<Arc<Gateway>>) -> Json<ActionList> {
    let actions = gateway.dispatcher().registry().specs().cloned().collect();
    Json(ActionList { actions })
}

async fn dispatch(
    State(gateway): State<Arc<Gateway>>,
    Json(input): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchOutcome>), ApiError> {
    // Without a caller there is no request to attribute. An empty action id
    // is dispatched and audited as unregistered.
    if input.caller.id.is_empty() {
        return Err(validation_error("caller.id is required"));
    }
    let outcome = gateway
        .dispatcher()
        .dispatch(&input.caller, input.request)
        .await;
    Ok((status_for(&outcome), Json(outcome)))
}

fn status_for(outcome: &DispatchOutcome) -> StatusCode {
    match outcome {
        DispatchOutcome::Completed { .. } => StatusCode::OK,
        DispatchOutcome::Denied { .. } => StatusCode::FORBIDDEN,
        DispatchOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
    }
}

#[derive(Debug, Serialize)]
struct RankResponse {
    results: Vec<ScoredDocument>,
}

async fn rank(
    State(gateway): State<Arc<Gateway>>,
    Json(input): Json<RankRequest>,
) -> Json<RankResponse> {
    let RankRequest {
        query,
        documents,
        filters,
    } = input;
    Json(RankResponse {
        results: gateway.scorer().rank(documents, &query, &filters),
    })
}
