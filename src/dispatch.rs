use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::analysis::{AnalysisReport, Analyzer, DocumentKind};
use crate::calc::formulas::Formula;
use crate::calc::CalcRunner;
use crate::llm::ImageInput;
use crate::state::AnalysisConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    DocumentAnalysis,
    DocumentGeneration,
    Calculation,
    InspectionChecklist,
    BmpReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    #[serde(default)]
    pub data: JsonValue,
}

impl Request {
    pub fn new(kind: RequestKind, data: JsonValue) -> Self {
        Self { kind, data }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {0:?}")]
    NoHandlerFound(RequestKind),
    #[error("handler `{handler}` timed out after {secs}s")]
    HandlerTimeout { handler: String, secs: u64 },
    #[error("handler `{handler}` failed: {message}")]
    HandlerFailed { handler: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
    Error(String),
}

impl Health {
    fn weight(&self) -> f64 {
        match self {
            Health::Healthy => 100.0,
            Health::Degraded => 50.0,
            Health::Error(_) => 0.0,
        }
    }
}

/// Self-reported, static resource figures used only for scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

pub enum Backend {
    /// Forwards to the analysis pipeline.
    Analysis {
        analyzer: Arc<Analyzer>,
        config: Arc<RwLock<AnalysisConfig>>,
    },
    /// Runs calculations; `calc_timeout_secs` is read per request.
    Calculator {
        runner: Arc<CalcRunner>,
        config: Arc<RwLock<AnalysisConfig>>,
    },
    /// Returns a fixed reference payload.
    Static(JsonValue),
}

/// Room left inside a dispatch timeout for building the reply.
const REPLY_HEADROOM: Duration = Duration::from_secs(1);

/// Time a backend may spend on its own work so that it finishes, with a
/// structured result, before the dispatcher gives up on it.
fn backend_budget(timeout: Duration) -> Duration {
    timeout - REPLY_HEADROOM.min(timeout / 2)
}

/// One document's outcome in a category review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub document: String,
    #[serde(default)]
    pub report: Option<AnalysisReport>,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct Handler {
    pub name: String,
    pub capabilities: Vec<RequestKind>,
    pub resources: ResourceUsage,
    backend: Backend,
    health: RwLock<Health>,
}

impl Handler {
    pub fn new(
        name: &str,
        capabilities: Vec<RequestKind>,
        resources: ResourceUsage,
        backend: Backend,
    ) -> Self {
        let health = match &backend {
            Backend::Analysis { analyzer, .. } if !analyzer.has_model() => Health::Degraded,
            _ => Health::Healthy,
        };
        Self {
            name: name.to_string(),
            capabilities,
            resources,
            backend,
            health: RwLock::new(health),
        }
    }

    pub fn can_handle(&self, request: &Request) -> bool {
        self.capabilities.contains(&request.kind)
    }

    pub async fn health(&self) -> Health {
        self.health.read().await.clone()
    }

    async fn score(&self) -> f64 {
        self.health.read().await.weight()
            - self.resources.cpu_percent * 0.5
            - self.resources.memory_mb / 100.0
    }

    async fn handle(&self, request: &Request, timeout: Duration) -> Result<JsonValue, DispatchError> {
        let budget = backend_budget(timeout);
        match &self.backend {
            Backend::Static(value) => Ok(value.clone()),
            Backend::Calculator { runner, config } => {
                let job = CalcJob::from_request(&request.data)?;
                let configured = Duration::from_secs(config.read().await.calc_timeout_secs);
                let result = runner
                    .run(&job.code, job.data.as_ref(), configured.min(budget))
                    .await
                    .map_err(|e| self.failed(e))?;
                Ok(json!({ "formula": job.label, "result": result }))
            }
            Backend::Analysis { analyzer, config } => {
                let mut config = config.read().await.clone();
                config.model_deadline = Some(Instant::now() + budget);
                match request.kind {
                    RequestKind::DocumentGeneration => {
                        let kind: DocumentKind = str_field(&request.data, "kind")?
                            .parse()
                            .map_err(DispatchError::InvalidRequest)?;
                        let instructions = opt_str_field(&request.data, "instructions");
                        let doc = analyzer
                            .generate_document(kind, instructions, &config)
                            .await
                            .map_err(|e| self.failed(e))?;
                        serde_json::to_value(doc).map_err(|e| self.failed(e.into()))
                    }
                    _ => self.analyze(analyzer, &request.data, &config).await,
                }
            }
        }
    }

    /// `{document_id, query?, image?}` analyzes one document;
    /// `{category, query?}` reviews a whole category.
    async fn analyze(
        &self,
        analyzer: &Analyzer,
        data: &JsonValue,
        config: &AnalysisConfig,
    ) -> Result<JsonValue, DispatchError> {
        let query = opt_str_field(data, "query");

        if let Some(category) = opt_str_field(data, "category") {
            let items: Vec<ReviewItem> = analyzer
                .analyze_category(category, query, config)
                .await
                .map_err(|e| self.failed(e))?
                .into_iter()
                .map(|(document, report)| match report {
                    Ok(report) => ReviewItem {
                        document,
                        report: Some(report),
                        error: None,
                    },
                    Err(e) => ReviewItem {
                        document,
                        report: None,
                        error: Some(format!("{:#}", e)),
                    },
                })
                .collect();
            return serde_json::to_value(items).map_err(|e| self.failed(e.into()));
        }

        let doc_id = str_field(data, "document_id")?;
        if !analyzer.has_document(doc_id).await.map_err(|e| self.failed(e))? {
            return Err(DispatchError::InvalidRequest(format!("unknown document `{}`", doc_id)));
        }
        let image = data.get("image").map(image_field).transpose()?;
        let report = analyzer
            .analyze(doc_id, query, image.as_ref(), config)
            .await
            .map_err(|e| self.failed(e))?;
        serde_json::to_value(report).map_err(|e| self.failed(e.into()))
    }

    fn failed(&self, e: anyhow::Error) -> DispatchError {
        DispatchError::HandlerFailed {
            handler: self.name.clone(),
            message: format!("{:#}", e),
        }
    }

    /// Re-check the backend and return the resulting health.
    async fn reinitialize(&self) -> Health {
        let health = match &self.backend {
            Backend::Static(_) => Health::Healthy,
            Backend::Analysis { analyzer, .. } => {
                if analyzer.has_model() {
                    Health::Healthy
                } else {
                    Health::Degraded
                }
            }
            Backend::Calculator { runner, .. } => {
                if runner.health_check().await {
                    Health::Healthy
                } else {
                    Health::Error(format!("interpreter `{}` unavailable", runner.interpreter()))
                }
            }
        };
        *self.health.write().await = health.clone();
        health
    }
}

/// A calculation request: a named formula, or raw code with an optional payload.
struct CalcJob {
    label: String,
    code: String,
    data: Option<JsonValue>,
}

impl CalcJob {
    fn from_request(data: &JsonValue) -> Result<Self, DispatchError> {
        if let Some(name) = data.get("formula").and_then(JsonValue::as_str) {
            let params = opt_str_field(data, "params").unwrap_or_default();
            let formula = Formula::from_params(name, params).map_err(DispatchError::InvalidRequest)?;
            return Ok(Self {
                label: formula.to_string(),
                code: formula.code().to_string(),
                data: Some(formula.input()),
            });
        }
        let code = str_field(data, "code")?;
        Ok(Self {
            label: "custom".to_string(),
            code: code.to_string(),
            data: data.get("data").cloned(),
        })
    }
}

fn str_field<'a>(data: &'a JsonValue, key: &str) -> Result<&'a str, DispatchError> {
    data.get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| DispatchError::InvalidRequest(format!("missing string field `{}`", key)))
}

/// `{media_type, data}` with base64 image bytes.
fn image_field(value: &JsonValue) -> Result<ImageInput, DispatchError> {
    let media_type = str_field(value, "media_type")?;
    if !media_type.starts_with("image/") {
        return Err(DispatchError::InvalidRequest(format!("`{}` is not an image type", media_type)));
    }
    let data = base64::engine::general_purpose::STANDARD
        .decode(str_field(value, "data")?)
        .map_err(|e| DispatchError::InvalidRequest(format!("image data is not base64: {}", e)))?;
    Ok(ImageInput {
        media_type: media_type.to_string(),
        data,
    })
}

fn opt_str_field<'a>(data: &'a JsonValue, key: &str) -> Option<&'a str> {
    data.get(key).and_then(JsonValue::as_str)
}

pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<Handler>>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Returns false if a handler with the same name is already registered.
    pub async fn register(&self, handler: Handler) -> bool {
        let mut handlers = self.handlers.write().await;
        if handlers.iter().any(|h| h.name == handler.name) {
            warn!(handler = %handler.name, "duplicate handler name, not registered");
            return false;
        }
        info!(handler = %handler.name, capabilities = ?handler.capabilities, "handler registered");
        handlers.push(Arc::new(handler));
        true
    }

    pub async fn dispatch(&self, request: Request) -> Result<JsonValue, DispatchError> {
        self.dispatch_with_timeout(request, self.timeout).await
    }

    pub async fn dispatch_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<JsonValue, DispatchError> {
        let handler = self
            .select(&request)
            .await
            .ok_or(DispatchError::NoHandlerFound(request.kind))?;

        info!(handler = %handler.name, kind = ?request.kind, "dispatching request");
        match tokio::time::timeout(timeout, handler.handle(&request, timeout)).await {
            Err(_) => {
                warn!(handler = %handler.name, timeout_secs = timeout.as_secs(), "handler timed out");
                Err(DispatchError::HandlerTimeout {
                    handler: handler.name.clone(),
                    secs: timeout.as_secs(),
                })
            }
            Ok(Err(DispatchError::HandlerFailed { handler: name, message })) => {
                warn!(handler = %name, error = %message, "handler failed, marking unhealthy");
                *handler.health.write().await = Health::Error(message.clone());
                Err(DispatchError::HandlerFailed { handler: name, message })
            }
            Ok(result) => result,
        }
    }

    /// Best-scoring capable handler; the first registered wins ties.
    async fn select(&self, request: &Request) -> Option<Arc<Handler>> {
        let handlers = self.handlers.read().await;
        let mut best: Option<(f64, &Arc<Handler>)> = None;
        for handler in handlers.iter().filter(|h| h.can_handle(request)) {
            let score = handler.score().await;
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, handler));
            }
        }
        best.map(|(_, h)| Arc::clone(h))
    }

    /// Re-initialise every handler currently in the error state. Returns the
    /// number that recovered.
    pub async fn health_sweep(&self) -> usize {
        let handlers: Vec<Arc<Handler>> = self.handlers.read().await.clone();
        let mut recovered = 0;
        for handler in handlers {
            if !matches!(handler.health().await, Health::Error(_)) {
                continue;
            }
            match handler.reinitialize().await {
                Health::Error(reason) => {
                    warn!(handler = %handler.name, reason = %reason, "handler still unhealthy")
                }
                health => {
                    info!(handler = %handler.name, health = ?health, "handler recovered");
                    recovered += 1;
                }
            }
        }
        recovered
    }

    /// Registered handler names with their current health, in registration order.
    pub async fn handlers(&self) -> Vec<(String, Vec<RequestKind>, Health)> {
        let handlers = self.handlers.read().await;
        let mut out = Vec::with_capacity(handlers.len());
        for h in handlers.iter() {
            out.push((h.name.clone(), h.capabilities.clone(), h.health().await));
        }
        out
    }
}

/// Fixed inspection checklist served by the static handler.
pub fn inspection_checklist() -> JsonValue {
    json!({
        "title": "Construction Site Stormwater Inspection Checklist",
        "sections": [
            {
                "name": "Perimeter Controls",
                "items": [
                    "Silt fence intact, trenched in and free of undercutting",
                    "Fiber rolls staked and in contact with the ground",
                    "Sediment accumulation below one third of barrier height",
                ]
            },
            {
                "name": "Stabilized Entrances",
                "items": [
                    "Rock or rumble plates in place at every exit",
                    "No visible track-out onto paved roads",
                ]
            },
            {
                "name": "Storm Drain Inlets",
                "items": [
                    "Inlet protection installed on all active inlets",
                    "Protection free of tears and sediment build-up",
                ]
            },
            {
                "name": "Good Housekeeping",
                "items": [
                    "Stockpiles covered or bermed",
                    "Concrete washout contained and below 75% capacity",
                    "Spill kits stocked and accessible",
                ]
            }
        ]
    })
}

/// Fixed best-management-practice reference served by the static handler.
pub fn bmp_reference() -> JsonValue {
    json!({
        "title": "Common Construction BMPs",
        "bmps": [
            { "code": "EC-2", "name": "Preservation of Existing Vegetation", "type": "erosion control" },
            { "code": "EC-4", "name": "Hydroseeding", "type": "erosion control" },
            { "code": "SE-1", "name": "Silt Fence", "type": "sediment control" },
            { "code": "SE-2", "name": "Sediment Basin", "type": "sediment control" },
            { "code": "SE-5", "name": "Fiber Rolls", "type": "sediment control" },
            { "code": "SE-10", "name": "Storm Drain Inlet Protection", "type": "sediment control" },
            { "code": "TC-1", "name": "Stabilized Construction Entrance/Exit", "type": "tracking control" },
            { "code": "WM-8", "name": "Concrete Waste Management", "type": "waste management" }
        ]
    })
}
