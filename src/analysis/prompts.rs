use crate::docs::types::SourceDocument;

use super::DocumentKind;

/// Appended to every excerpt that was cut at its character budget.
pub const TRUNCATION_MARKER: &str = "...[more available]";

/// Emitted in place of the reference block when no document qualifies.
pub const NO_REFERENCES: &str = "No reference documents available.";

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a stormwater compliance engineer reviewing construction and industrial site documents.
You work from the provided document text and the reference library excerpts only.
Cite reference material by its [DOC-k] tag. Do not invent permit numbers, sampling results, or regulations that are not in the material.
Always answer in plain text using exactly the section headers you are asked for."#;

pub const GENERATION_SYSTEM_PROMPT: &str = r#"You are a stormwater compliance engineer drafting project documents.
Base every statement on the reference library excerpts and cite them by their [DOC-k] tag.
Where the references do not supply a required fact, leave a clearly marked placeholder such as [TO BE COMPLETED BY QSD] instead of guessing."#;

const ANALYSIS_TASK: &str = r#"TASK:
Analyze the target document in the context of the reference library. Reply with exactly three sections:

ANALYSIS:
A concise technical assessment of the document (site conditions, compliance status, risks).

INSIGHTS:
- Up to five key findings, one per line, each starting with "- "

RECOMMENDATIONS:
Up to ten actionable items, one per line, each starting with one of the category markers
STORMWATER:, QSD:, SWPPP: or EROSION: and written as "MARKER: short title - details".
"#;

/// Per-call character budgets for prompt assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub target_excerpt_chars: usize,
    pub reference_excerpt_chars: usize,
    pub min_reference_chars: usize,
    pub max_reference_docs: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            target_excerpt_chars: 3000,
            reference_excerpt_chars: 1200,
            min_reference_chars: 50,
            max_reference_docs: 20,
        }
    }
}

/// Cut `content` to at most `cap` characters, marking the cut. Counted on
/// the stored text as-is, so the cut agrees with `SourceDocument::char_count`.
pub fn excerpt(content: &str, cap: usize) -> String {
    match content.char_indices().nth(cap) {
        Some((byte_end, _)) => format!("{}{}", &content[..byte_end], TRUNCATION_MARKER),
        None => content.to_string(),
    }
}

/// Reference documents in citation order: the target itself and short
/// documents are dropped, the rest sorted longest first. The sort is stable,
/// so equal-length documents keep their library order.
pub fn select_references<'a>(
    target_id: Option<&str>,
    library: &'a [SourceDocument],
    limits: &PromptLimits,
) -> Vec<&'a SourceDocument> {
    let mut refs: Vec<(usize, &SourceDocument)> = library
        .iter()
        .filter(|d| Some(d.id.as_str()) != target_id)
        .map(|d| (d.char_count(), d))
        .filter(|(len, _)| *len >= limits.min_reference_chars)
        .collect();
    refs.sort_by(|a, b| b.0.cmp(&a.0));
    refs.truncate(limits.max_reference_docs);
    refs.into_iter().map(|(_, d)| d).collect()
}

/// Render the reference library with positional `[DOC-k]` tags.
pub fn reference_block(refs: &[&SourceDocument], limits: &PromptLimits) -> String {
    if refs.is_empty() {
        return NO_REFERENCES.to_string();
    }

    refs.iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "[DOC-{}] {} ({}, {} chars)\n{}",
                i + 1,
                doc.original_name,
                doc.category,
                doc.char_count(),
                excerpt(&doc.content, limits.reference_excerpt_chars)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Assemble the analysis prompt for `target`.
pub fn build_prompt(
    target: &SourceDocument,
    library: &[SourceDocument],
    query: Option<&str>,
    limits: &PromptLimits,
) -> String {
    let refs = select_references(Some(&target.id), library, limits);

    let mut prompt = format!(
        "TARGET DOCUMENT: {} (category: {}, {} chars)\n",
        target.original_name,
        target.category,
        target.char_count()
    );
    if let Some(desc) = target.description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str(&format!("Description: {}\n", desc.trim()));
    }
    prompt.push_str(&format!(
        "\n{}\n\nREFERENCE LIBRARY:\n{}\n\n",
        excerpt(&target.content, limits.target_excerpt_chars),
        reference_block(&refs, limits)
    ));
    if let Some(q) = query.map(str::trim).filter(|q| !q.is_empty()) {
        prompt.push_str(&format!("USER QUESTION:\n{}\n\n", q));
    }
    prompt.push_str(ANALYSIS_TASK);
    prompt
}

/// Assemble the prompt for drafting a new document of `kind`.
pub fn build_generation_prompt(
    kind: DocumentKind,
    library: &[SourceDocument],
    instructions: Option<&str>,
    limits: &PromptLimits,
) -> String {
    let refs = select_references(None, library, limits);

    let mut prompt = format!(
        "Draft a {} for the project described in the reference library.\n\nREFERENCE LIBRARY:\n{}\n\n",
        kind.title(),
        reference_block(&refs, limits)
    );
    if let Some(extra) = instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("ADDITIONAL INSTRUCTIONS:\n{}\n\n", extra));
    }
    prompt.push_str(&format!(
        "Use these section headings in order:\n{}\n",
        kind.outline()
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n")
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, name: &str, len: usize) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            original_name: name.to_string(),
            content: "x".repeat(len),
            category: "reference".to_string(),
            description: None,
            uploaded_at: 0,
            file_size: len,
        }
    }

    fn tag_line<'a>(prompt: &'a str, tag: &str) -> &'a str {
        prompt
            .lines()
            .find(|l| l.starts_with(tag))
            .unwrap_or_else(|| panic!("missing {tag}"))
    }

    #[test]
    fn test_references_filtered_and_sorted() {
        let library = vec![doc("b", "short.txt", 100), doc("c", "tiny.txt", 40), doc("a", "long.txt", 2000)];
        let refs = select_references(None, &library, &PromptLimits::default());
        let names: Vec<&str> = refs.iter().map(|d| d.original_name.as_str()).collect();
        assert_eq!(names, vec!["long.txt", "short.txt"]);

        let block = reference_block(&refs, &PromptLimits::default());
        assert!(tag_line(&block, "[DOC-1]").contains("long.txt"));
        assert!(tag_line(&block, "[DOC-2]").contains("short.txt"));
        assert!(!block.contains("[DOC-3]"));
    }

    #[test]
    fn test_tags_stable_across_calls_and_ties() {
        let library = vec![doc("a", "first.txt", 500), doc("b", "second.txt", 500), doc("c", "third.txt", 500)];
        let target = doc("t", "target.txt", 60);
        let limits = PromptLimits::default();
        let one = build_prompt(&target, &library, None, &limits);
        let two = build_prompt(&target, &library, None, &limits);
        assert_eq!(one, two);
        assert!(tag_line(&one, "[DOC-1]").contains("first.txt"));
        assert!(tag_line(&one, "[DOC-2]").contains("second.txt"));
        assert!(tag_line(&one, "[DOC-3]").contains("third.txt"));
    }

    #[test]
    fn test_truncation_marker_only_when_truncated() {
        let limits = PromptLimits {
            reference_excerpt_chars: 100,
            ..PromptLimits::default()
        };
        let library = vec![doc("a", "long.txt", 150), doc("b", "fits.txt", 80)];
        let refs = select_references(None, &library, &limits);
        let block = reference_block(&refs, &limits);
        let sections: Vec<&str> = block.split("\n\n").collect();

        assert_eq!(sections.len(), 2);
        assert!(sections[0].ends_with(TRUNCATION_MARKER));
        assert!(sections[0].contains(&format!("{}{}", "x".repeat(100), TRUNCATION_MARKER)));
        assert!(!sections[1].ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_excerpt_counts_chars_not_bytes() {
        let text = "é".repeat(10);
        assert_eq!(excerpt(&text, 10), text);
        assert_eq!(excerpt(&text, 4), format!("éééé{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_excerpt_agrees_with_reported_length() {
        let mut padded = doc("a", "padded.txt", 98);
        padded.content.push_str("  \n\n\n");
        assert_eq!(padded.char_count(), 103);

        let limits = PromptLimits {
            reference_excerpt_chars: 100,
            ..PromptLimits::default()
        };
        let block = reference_block(&[&padded], &limits);
        assert!(block.contains("103 chars"));
        assert!(block.ends_with(TRUNCATION_MARKER));

        // Exactly at the cap: no marker.
        assert_eq!(excerpt(&padded.content, 103), padded.content);
    }

    #[test]
    fn test_empty_library_sentinel() {
        let target = doc("t", "target.txt", 60);
        let prompt = build_prompt(&target, &[], None, &PromptLimits::default());
        assert!(prompt.contains(NO_REFERENCES));
        assert!(!prompt.contains("[DOC-1]"));

        // Library holding only the target also has no references.
        let prompt = build_prompt(&target, &[target.clone()], None, &PromptLimits::default());
        assert!(prompt.contains(NO_REFERENCES));
    }

    #[test]
    fn test_prompt_includes_query_and_task() {
        let target = doc("t", "inspection.txt", 60);
        let prompt = build_prompt(&target, &[], Some("Is the basin compliant?"), &PromptLimits::default());
        assert!(prompt.contains("USER QUESTION:\nIs the basin compliant?"));
        assert!(prompt.contains("ANALYSIS:"));
        assert!(prompt.contains("INSIGHTS:"));
        assert!(prompt.contains("RECOMMENDATIONS:"));
    }

    #[test]
    fn test_target_excerpt_capped() {
        let target = doc("t", "huge.txt", 5000);
        let limits = PromptLimits {
            target_excerpt_chars: 1000,
            ..PromptLimits::default()
        };
        let prompt = build_prompt(&target, &[], None, &limits);
        assert!(prompt.contains(&format!("{}{}", "x".repeat(1000), TRUNCATION_MARKER)));
        assert!(!prompt.contains(&"x".repeat(1001)));
    }

    #[test]
    fn test_generation_prompt_lists_outline() {
        let library = vec![doc("a", "permit.txt", 300)];
        let prompt = build_generation_prompt(
            DocumentKind::InspectionReport,
            &library,
            Some("Weekly inspection"),
            &PromptLimits::default(),
        );
        assert!(prompt.contains("[DOC-1] permit.txt"));
        assert!(prompt.contains("ADDITIONAL INSTRUCTIONS:\nWeekly inspection"));
        assert!(prompt.contains("1. "));
    }
}
