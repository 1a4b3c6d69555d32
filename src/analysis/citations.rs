use std::fmt;
use std::str::FromStr;

/// Citation text used when a recommendation has no backing document.
pub const NO_SOURCE: &str = "no source available";

/// How recommendation citations are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CitationStyle {
    /// `"<document>, Section <n>"` where `n` is the recommendation's ordinal
    /// in the reply. The section number does not refer to the document's own
    /// structure; kept for compatibility with existing stored records.
    #[default]
    Sectioned,
    /// `"source: <document>"`, stating only what is known.
    SourceOnly,
}

impl FromStr for CitationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sectioned" | "section" => Ok(CitationStyle::Sectioned),
            "source" | "source_only" | "source-only" => Ok(CitationStyle::SourceOnly),
            other => Err(format!(
                "unknown citation style `{}` (expected `sectioned` or `source`)",
                other
            )),
        }
    }
}

impl fmt::Display for CitationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CitationStyle::Sectioned => f.write_str("sectioned"),
            CitationStyle::SourceOnly => f.write_str("source"),
        }
    }
}

/// Build the citation for the `ordinal`-th (1-based) recommendation taken
/// from a reply about `source`.
pub fn cite(source: Option<&str>, ordinal: usize, style: CitationStyle) -> String {
    let Some(name) = source.map(str::trim).filter(|s| !s.is_empty()) else {
        return NO_SOURCE.to_string();
    };
    match style {
        CitationStyle::Sectioned => format!("{}, Section {}", name, ordinal),
        CitationStyle::SourceOnly => format!("source: {}", name),
    }
}
