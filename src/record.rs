// 📄 Record Parser - OSV malicious-package records
// Loads one JSON record and extracts the fields the object graph needs

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Placeholder used when a record has neither `summary` nor `details`
pub const DEFAULT_SUMMARY: &str = "Malicious package";

/// Default key under `database_specific` holding the origin list
pub const DEFAULT_ORIGIN_KEY: &str = "malicious-packages-origins";

// ============================================================================
// CORE TYPES
// ============================================================================

/// Record - validated output of RecordParser
///
/// `id` and `content_hash` are guaranteed non-blank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub summary: String,
    pub content_hash: String,
}

/// Why a record was dropped from the run
#[derive(Debug, Error)]
pub enum RecordRejection {
    #[error("failed to read record: {0}")]
    Unreadable(#[from] std::io::Error),

    #[error("failed to parse record JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("record has no 'id'")]
    MissingId,

    #[error("record {id} has no sha256 in its first origin entry")]
    MissingHash { id: String },
}

impl RecordRejection {
    /// Short code for counters and logs
    pub fn code(&self) -> &'static str {
        match self {
            RecordRejection::Unreadable(_) => "unreadable",
            RecordRejection::Malformed(_) => "malformed",
            RecordRejection::MissingId => "missing_id",
            RecordRejection::MissingHash { .. } => "missing_hash",
        }
    }
}

// Only the fields we read; everything else in the OSV document is ignored.
#[derive(Debug, Deserialize)]
struct OsvDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    database_specific: Option<serde_json::Map<String, serde_json::Value>>,
}

// ============================================================================
// RECORD PARSER
// ============================================================================

pub struct RecordParser {
    origin_key: String,
}

impl RecordParser {
    pub fn new(origin_key: impl Into<String>) -> Self {
        RecordParser {
            origin_key: origin_key.into(),
        }
    }

    pub fn origin_key(&self) -> &str {
        &self.origin_key
    }

    /// Parse a record file, logging and swallowing any rejection
    pub fn parse(&self, path: &Path) -> Option<Record> {
        match self.try_parse(path) {
            Ok(record) => Some(record),
            Err(rejection) => {
                warn!(path = %path.display(), reason = rejection.code(), "skipping record: {}", rejection);
                None
            }
        }
    }

    /// Parse a record file, returning the rejection reason on failure
    pub fn try_parse(&self, path: &Path) -> Result<Record, RecordRejection> {
        let text = std::fs::read_to_string(path)?;
        self.parse_str(&text)
    }

    /// Parse record JSON already in memory
    pub fn parse_str(&self, text: &str) -> Result<Record, RecordRejection> {
        let doc: OsvDocument = serde_json::from_str(text)?;

        let id = non_blank(doc.id).ok_or(RecordRejection::MissingId)?;

        let summary = non_blank(doc.summary)
            .or_else(|| non_blank(doc.details))
            .unwrap_or_else(|| DEFAULT_SUMMARY.to_string());

        let content_hash = doc
            .database_specific
            .as_ref()
            .and_then(|db_spec| self.first_origin_hash(db_spec))
            .ok_or_else(|| RecordRejection::MissingHash { id: id.clone() })?;

        Ok(Record {
            id,
            summary,
            content_hash,
        })
    }

    /// sha256 of the first origin entry; later entries are not consulted
    fn first_origin_hash(
        &self,
        db_spec: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<String> {
        let alt_key = self.origin_key.replace('-', "_");
        let origins = db_spec
            .get(&self.origin_key)
            .or_else(|| db_spec.get(&alt_key))?
            .as_array()?;

        let first = origins.first()?;
        let sha256 = first.get("sha256")?.as_str()?;
        non_blank(Some(sha256.to_string()))
    }
}

impl Default for RecordParser {
    fn default() -> Self {
        RecordParser::new(DEFAULT_ORIGIN_KEY)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_record() {
        let parser = RecordParser::default();
        let record = parser
            .parse_str(
                r#"{
                    "id": "MAL-2024-1",
                    "summary": "Malicious code in evil-pkg (npm)",
                    "details": "ignored because summary exists",
                    "database_specific": {
                        "malicious-packages-origins": [
                            {"source": "ossf", "sha256": "deadbeef"},
                            {"source": "other", "sha256": "cafebabe"}
                        ]
                    }
                }"#,
            )
            .unwrap();

        assert_eq!(record.id, "MAL-2024-1");
        assert_eq!(record.summary, "Malicious code in evil-pkg (npm)");
        assert_eq!(record.content_hash, "deadbeef");
    }

    #[test]
    fn test_summary_fallback_chain() {
        let parser = RecordParser::new("origins");

        let from_details = parser
            .parse_str(r#"{"id":"A","details":"from details","database_specific":{"origins":[{"sha256":"h"}]}}"#)
            .unwrap();
        assert_eq!(from_details.summary, "from details");

        let blank_summary = parser
            .parse_str(r#"{"id":"A","summary":"  ","details":"d","database_specific":{"origins":[{"sha256":"h"}]}}"#)
            .unwrap();
        assert_eq!(blank_summary.summary, "d");

        let placeholder = parser
            .parse_str(r#"{"id":"A","database_specific":{"origins":[{"sha256":"h"}]}}"#)
            .unwrap();
        assert_eq!(placeholder.summary, DEFAULT_SUMMARY);
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let parser = RecordParser::new("origins");
        let result = parser.parse_str(r#"{"summary":"x","database_specific":{"origins":[{"sha256":"h"}]}}"#);
        assert!(matches!(result, Err(RecordRejection::MissingId)));

        let blank = parser.parse_str(r#"{"id":"","database_specific":{"origins":[{"sha256":"h"}]}}"#);
        assert!(matches!(blank, Err(RecordRejection::MissingId)));
    }

    #[test]
    fn test_missing_hash_variants_are_rejected() {
        let parser = RecordParser::new("origins");
        let cases = [
            r#"{"id":"A"}"#,
            r#"{"id":"A","database_specific":{}}"#,
            r#"{"id":"A","database_specific":{"origins":[]}}"#,
            r#"{"id":"A","database_specific":{"origins":[{"source":"x"}]}}"#,
            r#"{"id":"A","database_specific":{"origins":[{"sha256":""}]}}"#,
            r#"{"id":"A","database_specific":{"origins":"not-a-list"}}"#,
        ];

        for case in cases {
            let result = parser.parse_str(case);
            assert!(
                matches!(result, Err(RecordRejection::MissingHash { ref id }) if id == "A"),
                "expected MissingHash for {}",
                case
            );
        }
    }

    #[test]
    fn test_only_first_origin_is_used() {
        let parser = RecordParser::new("origins");
        let result = parser.parse_str(
            r#"{"id":"A","database_specific":{"origins":[{"source":"x"},{"sha256":"second"}]}}"#,
        );
        assert!(matches!(result, Err(RecordRejection::MissingHash { .. })));
    }

    #[test]
    fn test_underscore_origin_key_is_accepted() {
        let parser = RecordParser::default();
        let record = parser
            .parse_str(r#"{"id":"A","database_specific":{"malicious_packages_origins":[{"sha256":"h"}]}}"#)
            .unwrap();
        assert_eq!(record.content_hash, "h");
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let parser = RecordParser::default();
        let result = parser.parse_str("{ not json");
        assert!(matches!(result, Err(RecordRejection::Malformed(_))));
        assert_eq!(result.unwrap_err().code(), "malformed");
    }

    #[test]
    fn test_parse_file_swallows_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(
            &good,
            r#"{"id":"MAL-1","summary":"bad pkg","database_specific":{"malicious-packages-origins":[{"sha256":"abc123"}]}}"#,
        )
        .unwrap();
        std::fs::write(&bad, "]]").unwrap();

        let parser = RecordParser::default();
        assert_eq!(parser.parse(&good).unwrap().content_hash, "abc123");
        assert!(parser.parse(&bad).is_none());
        assert!(parser.parse(&dir.path().join("missing.json")).is_none());
    }
}
