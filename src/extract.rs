//! Statement Extractor
//!
//! Splits a model reply into a human-readable explanation and the SQL
//! statement following the last `SQL:` marker. Marker-based on purpose: the
//! model is not guaranteed to produce well-formed output.

use crate::prompt::SQL_MARKER;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub explanation: String,
    pub statement: Option<String>,
}

pub trait StatementExtractor: Send + Sync {
    /// Must not fail; unparseable input yields `statement: None`.
    fn extract(&self, reply: &str) -> Extraction;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerExtractor;

impl StatementExtractor for MarkerExtractor {
    fn extract(&self, reply: &str) -> Extraction {
        match reply.rfind(SQL_MARKER) {
            Some(idx) => {
                let statement = strip_fences(&reply[idx + SQL_MARKER.len()..]);
                Extraction {
                    explanation: reply[..idx].trim().to_string(),
                    statement: (!statement.is_empty()).then_some(statement),
                }
            }
            None => Extraction {
                explanation: reply.to_string(),
                statement: None,
            },
        }
    }
}

/// Fence language tags removed along with the fence. Any other word after a
/// fence is statement text.
const FENCE_TAGS: [&str; 5] = ["sql", "postgresql", "postgres", "psql", "pgsql"];

/// Remove markdown code-fence tokens (with or without a language tag) and trim.
pub fn strip_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 3..];
        // Language tag directly after the fence, e.g. ```sql
        let tag_len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
            .unwrap_or(rest.len());
        let (tag, after) = rest.split_at(tag_len);
        if FENCE_TAGS.iter().any(|t| tag.eq_ignore_ascii_case(t)) {
            rest = after;
        }
    }
    out.push_str(rest);

    out.trim().to_string()
}
