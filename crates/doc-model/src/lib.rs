use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in page-rendering coordinates at the current zoom scale.
///
/// Origin is the top-left corner of the rendered page, y grows downward.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Coordinates {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionMethod {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "markdown-search")]
    MarkdownSearch,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::MarkdownSearch => "markdown-search",
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the extraction tracker, before sanitization and id assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExtraction {
    pub field_name: String,
    pub text: String,
    pub page: u32,
    pub coordinates: Coordinates,
    pub method: ExtractionMethod,
    pub document_name: String,
}

/// A user-confirmed binding of page text and its bounding box to a form field.
///
/// Records are append-only: a correction is a new record for the same field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub field_name: String,
    pub text: String,
    pub page: u32,
    pub coordinates: Coordinates,
    pub method: ExtractionMethod,
    pub document_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Number,
}

/// One text run as reported by the PDF backend.
///
/// `transform` is the run's text rendering matrix `[a, b, c, d, e, f]` in PDF user
/// space; `width`/`height` are in the same units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub transform: [f64; 6],
    pub width: f64,
    pub height: f64,
}

/// Cached text of one page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTextContent {
    pub full_text: String,
    pub items: Vec<TextRun>,
}

impl PageTextContent {
    pub fn from_runs(items: Vec<TextRun>) -> Self {
        let mut full_text = String::new();
        for item in &items {
            full_text.push_str(&item.text);
            full_text.push(' ');
        }

        Self { full_text, items }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub page: u32,
    pub context: String,
    pub text_items: Vec<TextRun>,
}
