use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::analysis::citations::CitationStyle;
use crate::analysis::prompts::PromptLimits;
use crate::analysis::Analyzer;
use crate::dispatch::Dispatcher;
use crate::docs::DocumentStore;

/// Configurable analysis parameters (admins can modify at runtime).
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub target_excerpt_chars: usize,
    pub reference_excerpt_chars: usize,
    pub min_reference_chars: usize,
    pub max_reference_docs: usize,
    pub analysis_max_tokens: u32,
    pub document_max_tokens: u32,
    pub calc_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
    pub citation_style: CitationStyle,
    /// Per-request cutoff for model calls, set by the dispatcher. Not an
    /// admin parameter.
    pub model_deadline: Option<Instant>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let limits = PromptLimits::default();
        Self {
            target_excerpt_chars: limits.target_excerpt_chars,
            reference_excerpt_chars: limits.reference_excerpt_chars,
            min_reference_chars: limits.min_reference_chars,
            max_reference_docs: limits.max_reference_docs,
            analysis_max_tokens: 4000,
            document_max_tokens: 8000,
            calc_timeout_secs: 30,
            dispatch_timeout_secs: 30,
            citation_style: CitationStyle::default(),
            model_deadline: None,
        }
    }
}

impl AnalysisConfig {
    pub const PARAMS: [&'static str; 9] = [
        "target_excerpt_chars",
        "reference_excerpt_chars",
        "min_reference_chars",
        "max_reference_docs",
        "analysis_max_tokens",
        "document_max_tokens",
        "calc_timeout_secs",
        "dispatch_timeout_secs",
        "citation_style",
    ];

    /// Defaults overridden by env vars named after each parameter, upper-cased.
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for param in Self::PARAMS {
            if let Ok(value) = dotenv::var(param.to_uppercase()) {
                if let Err(e) = config.set(param, &value) {
                    tracing::warn!(param, value = %value, "Ignoring config override: {}", e);
                }
            }
        }
        config
    }

    /// Set one parameter by name from its string form.
    pub fn set(&mut self, param: &str, value: &str) -> Result<(), String> {
        fn num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| format!("`{}` is not a valid number", value))
        }

        match param {
            "target_excerpt_chars" => self.target_excerpt_chars = num(value)?,
            "reference_excerpt_chars" => self.reference_excerpt_chars = num(value)?,
            "min_reference_chars" => self.min_reference_chars = num(value)?,
            "max_reference_docs" => self.max_reference_docs = num(value)?,
            "analysis_max_tokens" => self.analysis_max_tokens = num(value)?,
            "document_max_tokens" => self.document_max_tokens = num(value)?,
            "calc_timeout_secs" => self.calc_timeout_secs = num::<u64>(value)?.max(1),
            "dispatch_timeout_secs" => self.dispatch_timeout_secs = num::<u64>(value)?.max(1),
            "citation_style" => self.citation_style = value.parse()?,
            other => {
                return Err(format!(
                    "Unknown param `{}`. Valid: {}",
                    other,
                    Self::PARAMS.join(", ")
                ))
            }
        }
        Ok(())
    }

    pub fn limits(&self) -> PromptLimits {
        PromptLimits {
            target_excerpt_chars: self.target_excerpt_chars,
            reference_excerpt_chars: self.reference_excerpt_chars,
            min_reference_chars: self.min_reference_chars,
            max_reference_docs: self.max_reference_docs,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "`target_excerpt_chars`: {}\n\
             `reference_excerpt_chars`: {}\n\
             `min_reference_chars`: {}\n\
             `max_reference_docs`: {}\n\
             `analysis_max_tokens`: {}\n\
             `document_max_tokens`: {}\n\
             `calc_timeout_secs`: {}\n\
             `dispatch_timeout_secs`: {}\n\
             `citation_style`: {}",
            self.target_excerpt_chars,
            self.reference_excerpt_chars,
            self.min_reference_chars,
            self.max_reference_docs,
            self.analysis_max_tokens,
            self.document_max_tokens,
            self.calc_timeout_secs,
            self.dispatch_timeout_secs,
            self.citation_style,
        )
    }
}

pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub analyzer: Arc<Analyzer>,
    pub dispatcher: Arc<Dispatcher>,
    pub admin_ids: HashSet<u64>,
    pub config: Arc<RwLock<AnalysisConfig>>,
}

impl AppState {
    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

pub type Context<'a> = poise::Context<'a, AppState, anyhow::Error>;
