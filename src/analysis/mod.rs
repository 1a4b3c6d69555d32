pub mod citations;
pub mod parse;
pub mod prompts;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::docs::types::{AnalysisMode, AnalysisRecord, SourceDocument, StoredRecommendation};
use crate::docs::DocumentStore;
use crate::llm::{GatewayError, ImageInput, LlmClient};
use crate::state::AnalysisConfig;

use parse::AnalysisResult;

/// Reason recorded when no model client is configured.
const NO_CLIENT: &str = "no API credential configured";
/// Reason recorded when a model call runs past the request deadline.
const MODEL_TIMED_OUT: &str = "timed out";

/// Await a model call, giving up at `deadline`. Errors become the short
/// reason recorded in fallback output.
async fn bounded<F>(deadline: Option<Instant>, call: F) -> Result<String, String>
where
    F: std::future::Future<Output = Result<String, GatewayError>>,
{
    let reply = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
            Ok(reply) => reply,
            Err(_) => return Err(MODEL_TIMED_OUT.to_string()),
        },
        None => call.await,
    };
    reply.map_err(|e| e.reason().to_string())
}

/// Kinds of documents the generator can draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Swppp,
    InspectionReport,
    CorrectiveAction,
    SamplingPlan,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Swppp,
        DocumentKind::InspectionReport,
        DocumentKind::CorrectiveAction,
        DocumentKind::SamplingPlan,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            DocumentKind::Swppp => "Stormwater Pollution Prevention Plan (SWPPP)",
            DocumentKind::InspectionReport => "Stormwater Inspection Report",
            DocumentKind::CorrectiveAction => "Corrective Action Report",
            DocumentKind::SamplingPlan => "Construction Site Sampling and Analysis Plan",
        }
    }

    pub fn outline(&self) -> &'static [&'static str] {
        match self {
            DocumentKind::Swppp => &[
                "Project Information",
                "Site Description and Drainage",
                "Erosion and Sediment Control BMPs",
                "Non-Stormwater Management",
                "Inspection and Maintenance",
                "Training and Responsible Parties",
            ],
            DocumentKind::InspectionReport => &[
                "Inspection Details",
                "Weather and Site Conditions",
                "BMP Observations",
                "Deficiencies Found",
                "Required Corrective Actions",
            ],
            DocumentKind::CorrectiveAction => &[
                "Deficiency Description",
                "Root Cause",
                "Corrective Measures",
                "Completion Schedule",
                "Verification",
            ],
            DocumentKind::SamplingPlan => &[
                "Sampling Triggers",
                "Sampling Locations",
                "Parameters and Methods",
                "Quality Assurance",
                "Reporting",
            ],
        }
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "swppp" => Ok(DocumentKind::Swppp),
            "inspection" | "inspection-report" => Ok(DocumentKind::InspectionReport),
            "corrective-action" | "corrective" => Ok(DocumentKind::CorrectiveAction),
            "sampling" | "sampling-plan" => Ok(DocumentKind::SamplingPlan),
            other => Err(format!("unknown document kind `{}`", other)),
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Swppp => "swppp",
            DocumentKind::InspectionReport => "inspection-report",
            DocumentKind::CorrectiveAction => "corrective-action",
            DocumentKind::SamplingPlan => "sampling-plan",
        };
        f.write_str(name)
    }
}

/// Result of one pass through the pipeline, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub mode: AnalysisMode,
}

/// An analysis after it has been stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub analysis_id: String,
    pub document_name: String,
    pub outcome: AnalysisOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub kind: DocumentKind,
    pub title: String,
    pub content: String,
    pub fallback: bool,
}

/// Reply text in the parser's section format, used when the model is unavailable.
pub fn fallback_reply(doc: &SourceDocument, reason: &str) -> String {
    let chars = doc.char_count();
    format!(
        "ANALYSIS: Document \"{name}\" ({chars} characters, category {category}) was received and stored. \
         Automated model analysis is unavailable ({reason}), so this summary was generated locally.\n\n\
         INSIGHTS:\n\
         - \"{name}\" contains {chars} characters of extracted text\n\
         - Automated review could not be completed; findings require engineer confirmation\n\n\
         RECOMMENDATIONS:\n\
         STORMWATER: Document Review Required - Review \"{name}\" manually against the SWPPP and permit conditions\n\
         QSD: Confirm site BMPs - Have the QSD/QSP verify BMP status described in \"{name}\"",
        name = doc.original_name,
        chars = chars,
        category = doc.category,
        reason = reason,
    )
}

/// Document text used when drafting cannot reach the model.
pub fn fallback_document(kind: DocumentKind, library: &[SourceDocument], reason: &str) -> String {
    let mut content = format!(
        "{}\n\nDRAFT TEMPLATE (generated locally: {}).\n",
        kind.title(),
        reason
    );
    for (i, section) in kind.outline().iter().enumerate() {
        content.push_str(&format!(
            "\n{}. {}\n[TO BE COMPLETED BY QSD]\n",
            i + 1,
            section
        ));
    }
    if library.is_empty() {
        content.push_str("\nReference documents: none on file.\n");
    } else {
        content.push_str("\nReference documents on file:\n");
        for doc in library {
            content.push_str(&format!("- {} ({})\n", doc.original_name, doc.category));
        }
    }
    content
}

pub struct Analyzer {
    llm: Option<Arc<LlmClient>>,
    store: Arc<DocumentStore>,
}

impl Analyzer {
    pub fn new(llm: Option<Arc<LlmClient>>, store: Arc<DocumentStore>) -> Self {
        Self { llm, store }
    }

    pub fn has_model(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn has_document(&self, doc_id: &str) -> Result<bool> {
        self.store.contains(doc_id).await
    }

    /// Assemble, call, parse. Never fails: any gateway failure is replaced by
    /// a locally generated reply run through the same parser.
    pub async fn run(
        &self,
        target: &SourceDocument,
        library: &[SourceDocument],
        query: Option<&str>,
        image: Option<&ImageInput>,
        config: &AnalysisConfig,
    ) -> AnalysisOutcome {
        let prompt = prompts::build_prompt(target, library, query, &config.limits());
        debug!(doc_id = %target.id, prompt_len = prompt.len(), "analysis prompt assembled");

        let reply = match &self.llm {
            None => Err(NO_CLIENT.to_string()),
            Some(llm) => {
                let system = prompts::ANALYSIS_SYSTEM_PROMPT;
                let max_tokens = config.analysis_max_tokens;
                let call = match image {
                    Some(image) => {
                        bounded(
                            config.model_deadline,
                            llm.complete_with_image(&prompt, image, system, max_tokens),
                        )
                        .await
                    }
                    None => {
                        bounded(config.model_deadline, llm.complete(&prompt, system, max_tokens))
                            .await
                    }
                };
                call.map_err(|reason| {
                    warn!(doc_id = %target.id, reason = %reason, "model call failed, using fallback");
                    reason
                })
            }
        };

        let (raw, mode) = match reply {
            Ok(text) => (text, AnalysisMode::Model),
            Err(reason) => (fallback_reply(target, &reason), AnalysisMode::Fallback(reason)),
        };

        let result = parse::parse(&raw, Some(&target.original_name), config.citation_style);
        debug!(
            doc_id = %target.id,
            insights = result.insights.len(),
            recommendations = result.recommendations.len(),
            fallback = mode.is_fallback(),
            "reply parsed"
        );
        AnalysisOutcome { result, mode }
    }

    /// Analyze a stored document against the rest of the library and persist the result.
    pub async fn analyze(
        &self,
        doc_id: &str,
        query: Option<&str>,
        image: Option<&ImageInput>,
        config: &AnalysisConfig,
    ) -> Result<AnalysisReport> {
        let target = self.store.get_document(doc_id).await?;
        let library = self.store.library().await?;

        info!(doc_id, name = %target.original_name, library = library.len(), "analysis started");
        let outcome = self.run(&target, &library, query, image, config).await;

        let analysis_id = uuid::Uuid::now_v7().to_string();
        let now = chrono::Utc::now().timestamp();
        let record = AnalysisRecord {
            id: analysis_id.clone(),
            document_id: target.id.clone(),
            query: query.map(|q| q.to_string()),
            analysis: outcome.result.analysis.clone(),
            insights: outcome.result.insights.clone(),
            mode: outcome.mode.clone(),
            created_at: now,
        };
        let recommendations: Vec<StoredRecommendation> = outcome
            .result
            .recommendations
            .iter()
            .map(|r| StoredRecommendation {
                document_id: target.id.clone(),
                analysis_id: analysis_id.clone(),
                title: r.title.clone(),
                content: r.content.clone(),
                category: r.category.clone(),
                subcategory: r.subcategory.clone(),
                citation: r.citation.clone(),
                created_at: now,
            })
            .collect();
        self.store.store_analysis(&record, &recommendations).await?;

        info!(
            doc_id,
            analysis_id = %analysis_id,
            fallback = outcome.mode.is_fallback(),
            recommendations = recommendations.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            analysis_id,
            document_name: target.original_name,
            outcome,
        })
    }

    /// Analyze every document in `category` concurrently. Concurrency is
    /// bounded by the model client's request limit.
    pub async fn analyze_category(
        &self,
        category: &str,
        query: Option<&str>,
        config: &AnalysisConfig,
    ) -> Result<Vec<(String, Result<AnalysisReport>)>> {
        let docs = self.store.list_by_category(category).await?;
        info!(category, count = docs.len(), "category review started");

        let runs = docs.iter().map(|meta| async move {
            let report = self.analyze(&meta.id, query, None, config).await;
            (meta.original_name.clone(), report)
        });
        Ok(futures::future::join_all(runs).await)
    }

    /// Record a calculation result against a document as an analysis entry.
    pub async fn attach_calculation(
        &self,
        doc_id: &str,
        label: &str,
        summary: String,
        insights: Vec<String>,
    ) -> Result<String> {
        // Fail early on unknown documents.
        self.store.get_meta(doc_id).await?;
        let id = uuid::Uuid::now_v7().to_string();
        let record = AnalysisRecord {
            id: id.clone(),
            document_id: doc_id.to_string(),
            query: Some(label.to_string()),
            analysis: summary,
            insights: insights.into_iter().take(parse::MAX_INSIGHTS).collect(),
            mode: AnalysisMode::Calculation,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.store_analysis(&record, &[]).await?;
        Ok(id)
    }

    /// Draft a document from the library. Falls back to a section template.
    pub async fn generate_document(
        &self,
        kind: DocumentKind,
        instructions: Option<&str>,
        config: &AnalysisConfig,
    ) -> Result<GeneratedDocument> {
        let library = self.store.library().await?;
        Ok(self.draft(kind, &library, instructions, config).await)
    }

    async fn draft(
        &self,
        kind: DocumentKind,
        library: &[SourceDocument],
        instructions: Option<&str>,
        config: &AnalysisConfig,
    ) -> GeneratedDocument {
        let prompt = prompts::build_generation_prompt(kind, library, instructions, &config.limits());

        let reply = match &self.llm {
            None => Err(NO_CLIENT.to_string()),
            Some(llm) => bounded(
                config.model_deadline,
                llm.complete(&prompt, prompts::GENERATION_SYSTEM_PROMPT, config.document_max_tokens),
            )
            .await
            .map_err(|reason| {
                warn!(kind = %kind, reason = %reason, "document generation failed, using template");
                reason
            }),
        };

        match reply {
            Ok(content) if !content.trim().is_empty() => GeneratedDocument {
                kind,
                title: kind.title().to_string(),
                content,
                fallback: false,
            },
            Ok(_) => GeneratedDocument {
                kind,
                title: kind.title().to_string(),
                content: fallback_document(kind, library, "empty reply"),
                fallback: true,
            },
            Err(reason) => GeneratedDocument {
                kind,
                title: kind.title().to_string(),
                content: fallback_document(kind, library, &reason),
                fallback: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc(name: &str, content: &str) -> SourceDocument {
        SourceDocument {
            id: blake3::hash(content.as_bytes()).to_hex().to_string(),
            original_name: name.to_string(),
            content: content.to_string(),
            category: "site".to_string(),
            description: None,
            uploaded_at: 0,
            file_size: content.len(),
        }
    }

    async fn analyzer(llm: Option<LlmClient>) -> (Analyzer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path()).await.unwrap());
        (Analyzer::new(llm.map(Arc::new), store), dir)
    }

    fn client(base: &str) -> LlmClient {
        LlmClient::new(base, "test-model", "key", Duration::from_secs(5), 2).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limit_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let (analyzer, _dir) = analyzer(Some(client(&server.uri()))).await;
        let target = doc("grading-plan.txt", "Slopes exceed 2:1 near the north swale.");
        let outcome = analyzer
            .run(&target, &[], None, None, &AnalysisConfig::default())
            .await;

        assert_eq!(outcome.mode, AnalysisMode::Fallback("rate limited".to_string()));
        assert!(outcome.result.analysis.contains("grading-plan.txt"));
        assert!(outcome.result.analysis.contains(&format!("{} characters", target.char_count())));
        assert_eq!(outcome.result.insights.len(), 2);
        assert_eq!(outcome.result.recommendations[0].title, "Document Review Required");
        assert_eq!(outcome.result.recommendations[0].citation, "grading-plan.txt, Section 1");
    }

    #[tokio::test]
    async fn test_missing_client_falls_back() {
        let (analyzer, _dir) = analyzer(None).await;
        let target = doc("notes.txt", "Inlet protection missing at Lot 4.");
        let outcome = analyzer
            .run(&target, &[], None, None, &AnalysisConfig::default())
            .await;
        assert_eq!(outcome.mode, AnalysisMode::Fallback(NO_CLIENT.to_string()));
        assert!(outcome.result.analysis.contains("notes.txt"));
    }

    #[tokio::test]
    async fn test_model_reply_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "ANALYSIS: Basin undersized.\nINSIGHTS:\n- Volume short by 20%\nRECOMMENDATIONS:\nSWPPP: Resize basin - Add 400 cubic yards"}]
            })))
            .mount(&server)
            .await;

        let (analyzer, _dir) = analyzer(Some(client(&server.uri()))).await;
        let target = doc("basin.txt", "Sediment basin sized for 2-year storm.");
        let outcome = analyzer
            .run(&target, &[], Some("Is the basin big enough?"), None, &AnalysisConfig::default())
            .await;

        assert_eq!(outcome.mode, AnalysisMode::Model);
        assert_eq!(outcome.result.analysis, "Basin undersized.");
        assert_eq!(outcome.result.recommendations[0].title, "Resize basin");
        assert_eq!(outcome.result.recommendations[0].subcategory.as_deref(), Some("SWPPP"));
    }

    #[tokio::test]
    async fn test_analyze_persists_record_and_recommendations() {
        let (analyzer, _dir) = analyzer(None).await;
        let id = analyzer
            .store
            .store(
                "Construction entrance lacks rumble plates.",
                42,
                crate::docs::NewDocument {
                    original_name: "entrance.txt",
                    source: "upload:entrance.txt",
                    category: "site",
                    description: None,
                    content_type: Some("text/plain"),
                },
            )
            .await
            .unwrap();

        let report = analyzer
            .analyze(&id, None, None, &AnalysisConfig::default())
            .await
            .unwrap();
        assert!(report.outcome.mode.is_fallback());
        assert_eq!(report.document_name, "entrance.txt");

        let recs = analyzer.store.list_recommendations(&id).await.unwrap();
        assert_eq!(recs.len(), report.outcome.result.recommendations.len());
        assert!(recs.iter().all(|r| r.citation.starts_with("entrance.txt")));
        let analyses = analyzer.store.list_analyses(&id, 5).await.unwrap();
        assert_eq!(analyses[0].id, report.analysis_id);
    }

    fn upload<'a>(name: &'a str, category: &'a str) -> crate::docs::NewDocument<'a> {
        crate::docs::NewDocument {
            original_name: name,
            source: "upload:test",
            category,
            description: None,
            content_type: Some("text/plain"),
        }
    }

    #[tokio::test]
    async fn test_service_error_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let (analyzer, _dir) = analyzer(Some(client(&server.uri()))).await;
        let target = doc("swppp-rev2.txt", "Revision 2 adds a concrete washout at the north gate.");
        let outcome = analyzer
            .run(&target, &[], None, None, &AnalysisConfig::default())
            .await;

        assert_eq!(outcome.mode, AnalysisMode::Fallback("service error".to_string()));
        assert!(outcome.result.analysis.contains("swppp-rev2.txt"));
        assert!(outcome.result.analysis.contains(&format!("{} characters", target.char_count())));
    }

    #[tokio::test]
    async fn test_unreachable_service_falls_back() {
        // Nothing listens on the discard port.
        let (analyzer, _dir) = analyzer(Some(client("http://127.0.0.1:9"))).await;
        let target = doc("notes.txt", "Wattles missing at the toe of slope.");
        let outcome = analyzer
            .run(&target, &[], None, None, &AnalysisConfig::default())
            .await;
        assert_eq!(outcome.mode, AnalysisMode::Fallback("service unreachable".to_string()));
    }

    #[tokio::test]
    async fn test_model_deadline_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(serde_json::json!({
                        "content": [{"type": "text", "text": "ANALYSIS: late"}]
                    })),
            )
            .mount(&server)
            .await;

        let (analyzer, _dir) = analyzer(Some(client(&server.uri()))).await;
        let config = AnalysisConfig {
            model_deadline: Some(Instant::now() + Duration::from_millis(300)),
            ..AnalysisConfig::default()
        };
        let target = doc("late.txt", "Sampling event after the 0.5 inch storm.");
        let started = std::time::Instant::now();
        let outcome = analyzer.run(&target, &[], None, None, &config).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.mode, AnalysisMode::Fallback(MODEL_TIMED_OUT.to_string()));

        let generated = analyzer
            .draft(DocumentKind::SamplingPlan, &[], None, &config)
            .await;
        assert!(generated.fallback);
        assert!(generated.content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_analyze_category_reports_each_document() {
        let (analyzer, _dir) = analyzer(None).await;
        let north = analyzer
            .store
            .store("North basin riser clogged with debris.", 38, upload("north.txt", "inspection"))
            .await
            .unwrap();
        let south = analyzer
            .store
            .store("South swale lined and vegetated.", 32, upload("south.txt", "inspection"))
            .await
            .unwrap();
        analyzer
            .store
            .store("General permit order 2022-0057.", 31, upload("permit.txt", "permit"))
            .await
            .unwrap();

        let results = analyzer
            .analyze_category("inspection", Some("Any maintenance due?"), &AnalysisConfig::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let mut names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["north.txt", "south.txt"]);
        for (name, report) in &results {
            let report = report.as_ref().unwrap();
            assert_eq!(&report.document_name, name);
            assert!(report.outcome.mode.is_fallback());
        }

        for id in [&north, &south] {
            let analyses = analyzer.store.list_analyses(id, 5).await.unwrap();
            assert_eq!(analyses.len(), 1);
            assert_eq!(analyses[0].query.as_deref(), Some("Any maintenance due?"));
        }
        assert!(analyzer
            .analyze_category("monitoring", None, &AnalysisConfig::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_attach_calculation_records_capped_insights() {
        let (analyzer, _dir) = analyzer(None).await;
        let err = analyzer
            .attach_calculation("unknown", "rational", "Q = 2.70 cfs".to_string(), vec![])
            .await;
        assert!(err.is_err());

        let id = analyzer
            .store
            .store("Drainage area A1 is 1.2 acres.", 30, upload("drainage.txt", "site"))
            .await
            .unwrap();
        let insights: Vec<String> = (1..=7).map(|i| format!("insight {}", i)).collect();
        let analysis_id = analyzer
            .attach_calculation(&id, "rational", "Q = 2.70 cfs".to_string(), insights)
            .await
            .unwrap();

        let analyses = analyzer.store.list_analyses(&id, 5).await.unwrap();
        assert_eq!(analyses.len(), 1);
        let record = &analyses[0];
        assert_eq!(record.id, analysis_id);
        assert_eq!(record.mode, AnalysisMode::Calculation);
        assert_eq!(record.query.as_deref(), Some("rational"));
        assert_eq!(record.analysis, "Q = 2.70 cfs");
        assert_eq!(record.insights.len(), parse::MAX_INSIGHTS);
        assert_eq!(record.insights[4], "insight 5");
        assert!(analyzer.store.list_recommendations(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_falls_back_to_template() {
        let (analyzer, _dir) = analyzer(None).await;
        let library = vec![doc("permit.txt", "General permit coverage, WDID 5S00000.")];
        let generated = analyzer
            .draft(DocumentKind::InspectionReport, &library, None, &AnalysisConfig::default())
            .await;
        assert!(generated.fallback);
        assert!(generated.content.contains("BMP Observations"));
        assert!(generated.content.contains("permit.txt"));
    }

    #[test]
    fn test_document_kind_parse() {
        assert_eq!("inspection".parse::<DocumentKind>().unwrap(), DocumentKind::InspectionReport);
        assert_eq!("Sampling Plan".parse::<DocumentKind>().unwrap(), DocumentKind::SamplingPlan);
        assert!("memo".parse::<DocumentKind>().is_err());
        for kind in DocumentKind::ALL {
            assert_eq!(kind.to_string().parse::<DocumentKind>().unwrap(), kind);
        }
    }
}
