use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::citations::{cite, CitationStyle};

pub const MAX_INSIGHTS: usize = 5;
pub const MAX_RECOMMENDATIONS: usize = 10;
/// Longest header-less reply kept verbatim as the analysis text.
const MAX_UNSTRUCTURED_ANALYSIS: usize = 2000;

pub const FALLBACK_ANALYSIS: &str =
    "Document processed. The reply did not include a structured analysis section.";
const FALLBACK_INSIGHTS: [&str; 2] = [
    "Document content was received and processed",
    "Engineering review is recommended to confirm site conditions",
];
pub const REVIEW_REQUIRED_TITLE: &str = "Document Review Required";
const REVIEW_REQUIRED_CONTENT: &str =
    "No actionable recommendations were extracted; review the document manually against the SWPPP and permit requirements.";

/// Category markers recognised on recommendation lines, with the subcategory each maps to.
pub const RECOMMENDATION_MARKERS: [(&str, &str); 4] = [
    ("STORMWATER:", "General"),
    ("QSD:", "QSD"),
    ("SWPPP:", "SWPPP"),
    ("EROSION:", "Erosion Control"),
];

const BULLETS: [char; 3] = ['-', '•', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub content: String,
    /// Always "stormwater".
    pub category: String,
    pub subcategory: Option<String>,
    pub citation: String,
}

/// Structured view of a model reply. Every field is always populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Analysis,
    Insights,
    Recommendations,
}

/// Section labels, matched case-insensitively at the start of a line.
fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^[ \t]*(ANALYSIS|INSIGHTS|RECOMMENDATIONS)[ \t]*:").expect("label regex")
    })
}

/// A following section boundary: a line starting with an upper-case `WORD:`.
fn boundary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*[A-Z][A-Z_ ]*[A-Z][ \t]*:").expect("boundary regex"))
}

/// Byte offset just past the first header of `section`, if present.
fn header_end(raw: &str, section: Section) -> Option<usize> {
    label_regex().captures_iter(raw).find_map(|caps| {
        let label = caps.get(1)?.as_str().to_ascii_uppercase();
        let matched = match label.as_str() {
            "ANALYSIS" => Section::Analysis,
            "INSIGHTS" => Section::Insights,
            _ => Section::Recommendations,
        };
        (matched == section).then(|| caps.get(0).map(|m| m.end())).flatten()
    })
}

/// Body of a section: everything after its header up to the next upper-case
/// header line (never the header's own line), trimmed.
fn section_body(raw: &str, section: Section) -> Option<&str> {
    let start = header_end(raw, section)?;
    let rest = &raw[start..];
    let next_line = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
    let end = boundary_regex()
        .find(&rest[next_line..])
        .map(|m| next_line + m.start())
        .unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Parse a model reply into an [`AnalysisResult`].
///
/// Never fails: missing or malformed sections degrade to fixed fallback
/// values. `source` is the name of the analyzed document and is used for
/// recommendation citations.
pub fn parse(raw: &str, source: Option<&str>, style: CitationStyle) -> AnalysisResult {
    AnalysisResult {
        analysis: extract_analysis(raw),
        insights: extract_insights(raw),
        recommendations: extract_recommendations(raw, source, style),
    }
}

fn extract_analysis(raw: &str) -> String {
    if let Some(body) = section_body(raw, Section::Analysis).filter(|b| !b.is_empty()) {
        return body.to_string();
    }

    let trimmed = raw.trim();
    let has_headers = label_regex().is_match(raw);
    if !has_headers && !trimmed.is_empty() {
        return trimmed.chars().take(MAX_UNSTRUCTURED_ANALYSIS).collect();
    }

    FALLBACK_ANALYSIS.to_string()
}

fn extract_insights(raw: &str) -> Vec<String> {
    let insights: Vec<String> = section_body(raw, Section::Insights)
        .map(|body| {
            body.lines()
                .filter_map(|line| {
                    let line = line.trim();
                    line.strip_prefix(BULLETS)
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(str::to_string)
                })
                .take(MAX_INSIGHTS)
                .collect()
        })
        .unwrap_or_default();

    if insights.is_empty() {
        FALLBACK_INSIGHTS.iter().map(|s| s.to_string()).collect()
    } else {
        insights
    }
}

/// Earliest category marker on a line, with its subcategory and the text after it.
fn match_marker(line: &str) -> Option<(&'static str, &str)> {
    RECOMMENDATION_MARKERS
        .iter()
        .filter_map(|(marker, sub)| line.find(marker).map(|pos| (pos, *marker, *sub)))
        .min_by_key(|(pos, _, _)| *pos)
        .map(|(pos, marker, sub)| (sub, line[pos + marker.len()..].trim()))
}

fn extract_recommendations(
    raw: &str,
    source: Option<&str>,
    style: CitationStyle,
) -> Vec<Recommendation> {
    // Marker lines are themselves upper-case headers, so scan from the
    // RECOMMENDATIONS header to the end rather than using its section body.
    let region = header_end(raw, Section::Recommendations)
        .map(|start| &raw[start..])
        .unwrap_or(raw);

    let mut recommendations = Vec::new();
    for line in region.lines() {
        if recommendations.len() >= MAX_RECOMMENDATIONS {
            break;
        }
        let Some((subcategory, text)) = match_marker(line) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let (title, content) = match text.split_once(" - ") {
            Some((title, content)) => (title.trim(), content.trim()),
            None => (text, text),
        };
        let ordinal = recommendations.len() + 1;
        recommendations.push(Recommendation {
            title: title.to_string(),
            content: content.to_string(),
            category: "stormwater".to_string(),
            subcategory: Some(subcategory.to_string()),
            citation: cite(source, ordinal, style),
        });
    }

    if recommendations.is_empty() {
        recommendations.push(Recommendation {
            title: REVIEW_REQUIRED_TITLE.to_string(),
            content: REVIEW_REQUIRED_CONTENT.to_string(),
            category: "stormwater".to_string(),
            subcategory: Some("General".to_string()),
            citation: cite(source, 1, style),
        });
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::citations::NO_SOURCE;

    const DOC: Option<&str> = Some("site-plan.pdf");

    #[test]
    fn test_parse_full_reply() {
        let raw = "ANALYSIS: Site has erosion.\n\nINSIGHTS:\n- Soil loose\n- Slope steep\n\nRECOMMENDATIONS:\nSTORMWATER: Add silt fence - Install per spec X";
        let result = parse(raw, DOC, CitationStyle::Sectioned);

        assert_eq!(result.analysis, "Site has erosion.");
        assert_eq!(result.insights, vec!["Soil loose", "Slope steep"]);
        assert_eq!(
            result.recommendations,
            vec![Recommendation {
                title: "Add silt fence".to_string(),
                content: "Install per spec X".to_string(),
                category: "stormwater".to_string(),
                subcategory: Some("General".to_string()),
                citation: "site-plan.pdf, Section 1".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_headerless_reply() {
        let result = parse("just some text", DOC, CitationStyle::Sectioned);
        assert_eq!(result.analysis, "just some text");
        assert_eq!(result.insights.len(), 2);
        assert_eq!(result.recommendations.len(), 1);
        assert_eq!(result.recommendations[0].title, REVIEW_REQUIRED_TITLE);
        assert_eq!(result.recommendations[0].citation, "site-plan.pdf, Section 1");
    }

    #[test]
    fn test_parse_empty_reply_populates_every_field() {
        let result = parse("", None, CitationStyle::Sectioned);
        assert_eq!(result.analysis, FALLBACK_ANALYSIS);
        assert_eq!(result.insights.len(), 2);
        assert!(result.insights.iter().all(|i| !i.is_empty()));
        assert_eq!(result.recommendations.len(), 1);
        assert_eq!(result.recommendations[0].citation, NO_SOURCE);
    }

    #[test]
    fn test_parse_is_pure() {
        let raw = "ANALYSIS: Ponding at inlet.\nINSIGHTS:\n* Clogged grate\nRECOMMENDATIONS:\nQSD: Inspect weekly - Log findings";
        assert_eq!(
            parse(raw, DOC, CitationStyle::Sectioned),
            parse(raw, DOC, CitationStyle::Sectioned)
        );
    }

    #[test]
    fn test_parse_caps_lengths() {
        let mut raw = String::from("ANALYSIS: Large site.\nINSIGHTS:\n");
        for i in 0..12 {
            raw.push_str(&format!("- insight {}\n", i));
        }
        raw.push_str("RECOMMENDATIONS:\n");
        for i in 0..15 {
            raw.push_str(&format!("SWPPP: Item {} - detail {}\n", i, i));
        }

        let result = parse(&raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.insights.len(), MAX_INSIGHTS);
        assert_eq!(result.recommendations.len(), MAX_RECOMMENDATIONS);
        assert_eq!(result.recommendations[9].citation, "site-plan.pdf, Section 10");
    }

    #[test]
    fn test_mixed_case_content_does_not_end_section() {
        let raw = "ANALYSIS: Drainage area A.\nNote: outlet is undersized.\nRunoff: high\nINSIGHTS:\n- one";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(
            result.analysis,
            "Drainage area A.\nNote: outlet is undersized.\nRunoff: high"
        );
    }

    #[test]
    fn test_labels_match_case_insensitively() {
        let raw = "Analysis: Basin is full.\n\nINSIGHTS:\n• Sediment buildup";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.analysis, "Basin is full.");
        assert_eq!(result.insights, vec!["Sediment buildup"]);
    }

    #[test]
    fn test_mixed_case_label_is_not_a_boundary() {
        let raw = "ANALYSIS: Basin is full.\n\nInsights:\n• Sediment buildup";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.analysis, "Basin is full.\n\nInsights:\n• Sediment buildup");
        assert_eq!(result.insights, vec!["Sediment buildup"]);
    }

    #[test]
    fn test_label_words_in_prose_are_not_headers() {
        let raw = "ANALYSIS: The walk turned up several insights: mostly minor.\n\
                   INSIGHTS:\n- Fence sagging at station 2\n- Inlet grates clear\n\
                   RECOMMENDATIONS:\nQSD: Re-stake fence - Before the next storm";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.analysis, "The walk turned up several insights: mostly minor.");
        assert_eq!(result.insights, vec!["Fence sagging at station 2", "Inlet grates clear"]);
        assert_eq!(result.recommendations[0].title, "Re-stake fence");

        // Label words mid-line alone do not make a structured reply.
        let prose = "Our analysis: the basin needs cleaning.";
        assert_eq!(parse(prose, DOC, CitationStyle::Sectioned).analysis, prose);
    }

    #[test]
    fn test_uppercase_header_ends_section() {
        let raw = "ANALYSIS: Basin is full.\nSUMMARY: unrelated\nINSIGHTS:\n- a";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.analysis, "Basin is full.");
    }

    #[test]
    fn test_insights_without_bullets_fall_back() {
        let raw = "ANALYSIS: ok\nINSIGHTS:\nThe soil is sandy.\nRECOMMENDATIONS:\nEROSION: Hydroseed";
        let result = parse(raw, DOC, CitationStyle::Sectioned);
        assert_eq!(result.insights, FALLBACK_INSIGHTS.to_vec());
    }

    #[test]
    fn test_recommendation_subcategories_and_separator() {
        let raw = "RECOMMENDATIONS:\n- EROSION: Hydroseed slopes\n- QSD: Certify plan - Sign and date\n- plain line\n- SWPPP: Update map - Show new inlets";
        let result = parse(raw, DOC, CitationStyle::SourceOnly);
        let recs = &result.recommendations;
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].subcategory.as_deref(), Some("Erosion Control"));
        assert_eq!(recs[0].title, "Hydroseed slopes");
        assert_eq!(recs[0].content, "Hydroseed slopes");
        assert_eq!(recs[1].subcategory.as_deref(), Some("QSD"));
        assert_eq!(recs[1].content, "Sign and date");
        assert_eq!(recs[2].title, "Update map");
        assert!(recs.iter().all(|r| r.citation == "source: site-plan.pdf"));
    }

    #[test]
    fn test_recommendations_without_header_scan_whole_reply() {
        let raw = "Some preamble\nSTORMWATER: Sweep streets - Daily during grading";
        let result = parse(raw, None, CitationStyle::Sectioned);
        assert_eq!(result.recommendations[0].title, "Sweep streets");
        assert_eq!(result.recommendations[0].citation, NO_SOURCE);
    }
}
