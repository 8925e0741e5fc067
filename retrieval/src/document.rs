//! Inbound types handed to the engine by the editor integration.

use serde::{Deserialize, Serialize};

/// Maximum length, in characters, of a derived or explicit query.
pub const MAX_QUERY_CHARS: usize = 500;

/// An open document that can be indexed.
pub trait SourceDocument: Send + Sync {
    /// URI or path identifying the document.
    fn uri(&self) -> &str;

    /// Language identifier, e.g. `rust` or `typescript`.
    fn language_id(&self) -> &str;

    /// Current text of the document.
    fn text(&self) -> anyhow::Result<String>;

    /// Whether the document lives on the local file system.
    ///
    /// `file:` URIs and plain paths are local; `untitled:`, `git:` and any
    /// other scheme are not.
    fn is_local(&self) -> bool {
        is_local_uri(self.uri())
    }
}

/// An in-memory document snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDocument {
    pub uri: String,
    pub language_id: String,
    pub text: String,
}

impl OpenDocument {
    pub fn new(
        uri: impl Into<String>,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            language_id: language_id.into(),
            text: text.into(),
        }
    }
}

impl SourceDocument for OpenDocument {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn language_id(&self) -> &str {
        &self.language_id
    }

    fn text(&self) -> anyhow::Result<String> {
        Ok(self.text.clone())
    }
}

impl<T: SourceDocument + ?Sized> SourceDocument for Box<T> {
    fn uri(&self) -> &str {
        (**self).uri()
    }

    fn language_id(&self) -> &str {
        (**self).language_id()
    }

    fn text(&self) -> anyhow::Result<String> {
        (**self).text()
    }

    fn is_local(&self) -> bool {
        (**self).is_local()
    }
}

impl<T: SourceDocument + ?Sized> SourceDocument for std::sync::Arc<T> {
    fn uri(&self) -> &str {
        (**self).uri()
    }

    fn language_id(&self) -> &str {
        (**self).language_id()
    }

    fn text(&self) -> anyhow::Result<String> {
        (**self).text()
    }

    fn is_local(&self) -> bool {
        (**self).is_local()
    }
}

/// Whether `uri` refers to a local file.
pub fn is_local_uri(uri: &str) -> bool {
    match uri.split_once(':') {
        Some((scheme, rest)) => {
            if scheme.eq_ignore_ascii_case("file") {
                return true;
            }
            // `C:\src\main.rs` and `C:/src/main.rs` are drive letters, not schemes.
            scheme.len() == 1
                && scheme.chars().all(|c| c.is_ascii_alphabetic())
                && (rest.starts_with('\\') || rest.starts_with('/'))
        }
        None => !uri.trim().is_empty(),
    }
}

/// A diagnostic reported for the current document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the user is editing when a suggestion is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionContext {
    /// URI of the document being edited.
    pub current_document: Option<String>,

    /// Text of the line holding the cursor or selection.
    pub selection: Option<String>,

    /// Label of the syntax node under the cursor, e.g. `function_item`.
    pub syntax_node_label: Option<String>,

    /// Diagnostics for the current document.
    pub diagnostics: Vec<Diagnostic>,
}

impl SuggestionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current_document(mut self, uri: impl Into<String>) -> Self {
        self.current_document = Some(uri.into());
        self
    }

    pub fn with_selection(mut self, line: impl Into<String>) -> Self {
        self.selection = Some(line.into());
        self
    }

    pub fn with_syntax_node_label(mut self, label: impl Into<String>) -> Self {
        self.syntax_node_label = Some(label.into());
        self
    }

    pub fn with_diagnostic(mut self, message: impl Into<String>) -> Self {
        self.diagnostics.push(Diagnostic::new(message));
        self
    }

    /// Build the query text for this context.
    ///
    /// Joins the selection line, the syntax node label and the diagnostic
    /// messages, in that order, and truncates the result to
    /// [`MAX_QUERY_CHARS`]. Returns `None` when nothing usable remains.
    pub fn query_text(&self) -> Option<String> {
        let parts = self
            .selection
            .iter()
            .chain(self.syntax_node_label.iter())
            .chain(self.diagnostics.iter().map(|d| &d.message))
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();

        normalize_query(&parts.join(" "))
    }
}

/// Truncate `query` to [`MAX_QUERY_CHARS`] characters and trim it.
///
/// Returns `None` for a blank query.
pub fn normalize_query(query: &str) -> Option<String> {
    let truncated: String = query.trim().chars().take(MAX_QUERY_CHARS).collect();
    let trimmed = truncated.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_local_uris() {
        assert!(is_local_uri("file:///home/me/src/main.rs"));
        assert!(is_local_uri("/home/me/src/main.rs"));
        assert!(is_local_uri("src/lib.rs"));
        assert!(is_local_uri("C:\\src\\main.rs"));
        assert!(is_local_uri("C:/src/main.rs"));
        assert!(!is_local_uri("untitled:Untitled-1"));
        assert!(!is_local_uri("git:/repo/src/main.rs"));
        assert!(!is_local_uri("output:extension-output"));
        assert!(!is_local_uri(""));
    }

    #[test]
    fn test_query_text_joins_context_elements() {
        let context = SuggestionContext::new()
            .with_current_document("file:///src/lib.rs")
            .with_selection("    let total = items.len();")
            .with_syntax_node_label("let_declaration")
            .with_diagnostic("unused variable: `total`");

        assert_eq!(
            context.query_text().as_deref(),
            Some("let total = items.len(); let_declaration unused variable: `total`")
        );
    }

    #[test]
    fn test_query_text_empty_context() {
        assert_eq!(SuggestionContext::new().query_text(), None);

        let blank = SuggestionContext::new()
            .with_selection("   ")
            .with_diagnostic("");
        assert_eq!(blank.query_text(), None);
    }

    #[test]
    fn test_query_text_is_truncated() {
        let context = SuggestionContext::new().with_selection("é".repeat(2 * MAX_QUERY_CHARS));
        let query = context.query_text().unwrap();
        assert_eq!(query.chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  find me  ").as_deref(), Some("find me"));
        assert_eq!(normalize_query(" \n "), None);
    }
}
