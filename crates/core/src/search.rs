//! Page text cache fill and case/whitespace-insensitive search across pages.

use crate::security::sanitize_text;
use doc_model::{PageTextContent, SearchResult, TextRun};
use pdf_engine::PdfEngineError;
use std::sync::Arc;
use viewer_core::StateStore;

/// Characters of context kept on each side of a match.
pub const CONTEXT_CHARS: usize = 50;
/// Queries longer than this fall back to single-word matching.
pub const FALLBACK_QUERY_CHARS: usize = 20;
const FALLBACK_MIN_WORD_CHARS: usize = 4;

/// Supplies raw text runs for 1-based page numbers.
pub trait PageTextSource {
    fn page_count(&self) -> u32;
    fn page_runs(&self, page: u32) -> Result<Vec<TextRun>, PdfEngineError>;
}

/// Returns the cached text for `page`, fetching and caching it on a miss.
pub fn get_page_text(
    state: &StateStore,
    source: &dyn PageTextSource,
    page: u32,
) -> Result<Arc<PageTextContent>, PdfEngineError> {
    if let Some(hit) = state.with_text_cache(|cache| cache.get(&page).cloned()) {
        return Ok(hit);
    }

    let content = Arc::new(PageTextContent::from_runs(source.page_runs(page)?));
    let evicted = state.with_text_cache(|cache| cache.insert(page, content.clone()));
    if let Some(evicted) = evicted {
        tracing::debug!(page, evicted, "page text cache full; evicted oldest entry");
    }

    Ok(content)
}

/// Lower-cases, straightens curly quotes, and collapses whitespace runs.
pub fn normalize_text(text: &str) -> String {
    let straightened: String = text
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            other => other,
        })
        .collect();

    straightened.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn char_offset(haystack: &str, needle: &str) -> Option<usize> {
    haystack.find(needle).map(|byte| haystack[..byte].chars().count())
}

/// Searches every page in order and returns one result per matching page.
///
/// The context window is located in normalized text and sliced from the original
/// text at the same character offsets, so it may drift slightly where the original
/// had runs of whitespace.
pub fn perform_search(
    state: &StateStore,
    source: &dyn PageTextSource,
    query: &str,
) -> Vec<SearchResult> {
    let needle = normalize_text(query);
    if needle.is_empty() {
        return Vec::new();
    }
    let needle_chars = needle.chars().count();
    let fallback_words: Vec<&str> = if needle_chars > FALLBACK_QUERY_CHARS {
        needle.split(' ').filter(|word| word.chars().count() >= FALLBACK_MIN_WORD_CHARS).collect()
    } else {
        Vec::new()
    };

    let mut results = Vec::new();
    for page in 1..=source.page_count() {
        let content = match get_page_text(state, source, page) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(page, error = %err, "skipping page that failed to load text");
                continue;
            }
        };

        let haystack = normalize_text(&content.full_text);
        let Some(offset) = char_offset(&haystack, &needle)
            .or_else(|| fallback_words.iter().find_map(|word| char_offset(&haystack, word)))
        else {
            continue;
        };

        let start = offset.saturating_sub(CONTEXT_CHARS);
        let end = (offset + needle_chars + CONTEXT_CHARS).min(haystack.chars().count());
        let context: String =
            content.full_text.chars().skip(start).take(end.saturating_sub(start)).collect();

        results.push(SearchResult {
            page,
            context: sanitize_text(&context),
            text_items: content.items.clone(),
        });
    }

    tracing::debug!(query = %needle, matches = results.len(), "search finished");
    results
}

/// Search results with a cursor that wraps in both directions.
#[derive(Debug, Clone, Default)]
pub struct SearchSession {
    query: Option<String>,
    results: Vec<SearchResult>,
    selected: Option<usize>,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a search and replaces the current results. Returns the match count.
    pub fn search(&mut self, state: &StateStore, source: &dyn PageTextSource, query: &str) -> usize {
        self.results = perform_search(state, source, query);
        self.query = Some(query.to_owned());
        self.selected = None;
        self.results.len()
    }

    pub fn next_result(&mut self) -> Option<&SearchResult> {
        if self.results.is_empty() {
            return None;
        }

        let next = match self.selected {
            Some(index) => (index + 1) % self.results.len(),
            None => 0,
        };
        self.selected = Some(next);
        self.results.get(next)
    }

    pub fn previous_result(&mut self) -> Option<&SearchResult> {
        if self.results.is_empty() {
            return None;
        }

        let previous = match self.selected {
            Some(0) | None => self.results.len() - 1,
            Some(index) => index - 1,
        };
        self.selected = Some(previous);
        self.results.get(previous)
    }

    pub fn active_result(&self) -> Option<&SearchResult> {
        self.selected.and_then(|index| self.results.get(index))
    }

    pub fn results(&self) -> &[SearchResult] {
        &self.results
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn clear(&mut self) {
        self.query = None;
        self.results.clear();
        self.selected = None;
    }
}
