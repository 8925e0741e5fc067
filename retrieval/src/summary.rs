//! Retrieval results and their human-readable summary.

use serde::{Deserialize, Serialize};

/// A chunk that passed the similarity threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevantChunk {
    pub content: String,
    pub source_id: String,
    pub similarity: f32,
}

/// Context handed to prompt construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedContext {
    /// Relevant chunks, most similar first.
    pub relevant_chunks: Vec<RelevantChunk>,

    /// Distinct sources of `relevant_chunks`, in first-seen order.
    pub related_sources: Vec<String>,

    /// One-paragraph description of the above.
    pub summary: String,
}

impl EnhancedContext {
    /// Assemble the context from ranked chunks.
    pub fn new(
        relevant_chunks: Vec<RelevantChunk>,
        current_document: Option<&str>,
        diagnostic_count: usize,
    ) -> Self {
        let related_sources = related_sources(&relevant_chunks);
        let summary = summarize(
            current_document,
            diagnostic_count,
            relevant_chunks.len(),
            &related_sources,
        );
        Self {
            relevant_chunks,
            related_sources,
            summary,
        }
    }
}

fn related_sources(chunks: &[RelevantChunk]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for chunk in chunks {
        if !sources.contains(&chunk.source_id) {
            sources.push(chunk.source_id.clone());
        }
    }
    sources
}

/// Describe a retrieval result in one line, e.g.
/// `Current file: main.rs. Found 2 relevant code chunks. Related files: lib.rs, util.rs.`
///
/// Never returns an empty string.
pub fn summarize(
    current_document: Option<&str>,
    diagnostic_count: usize,
    chunk_count: usize,
    related_sources: &[String],
) -> String {
    let mut parts = Vec::new();

    if let Some(document) = current_document.filter(|d| !d.trim().is_empty()) {
        parts.push(format!("Current file: {}.", display_name(document)));
    }

    if diagnostic_count > 0 {
        parts.push(format!(
            "{diagnostic_count} {} in scope.",
            plural(diagnostic_count, "diagnostic", "diagnostics")
        ));
    }

    parts.push(format!(
        "Found {chunk_count} relevant code {}.",
        plural(chunk_count, "chunk", "chunks")
    ));

    if !related_sources.is_empty() {
        let names: Vec<&str> = related_sources
            .iter()
            .map(|source| display_name(source))
            .collect();
        parts.push(format!("Related files: {}.", names.join(", ")));
    }

    parts.join(" ")
}

/// Final path segment of a URI or path.
fn display_name(uri: &str) -> &str {
    let trimmed = uri.trim_end_matches(['/', '\\']);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(uri)
}

fn plural<'a>(count: usize, one: &'a str, many: &'a str) -> &'a str {
    if count == 1 { one } else { many }
}
