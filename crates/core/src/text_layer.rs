//! Positioned text spans for a rendered page
//!
//! Converts the backend's text runs into spans in rendered-page coordinates so a
//! pointer position can be mapped to text for drag selection.

use doc_model::{Coordinates, TextRun};
use pdf_engine::{transform_multiply, Viewport};

/// A positioned span of page text
///
/// Coordinates are in rendered-page pixels at the viewport's scale, origin at the
/// top-left corner, y growing downward.
#[derive(Debug, Clone, PartialEq)]
pub struct TextLayerItem {
    /// Position among the page's spans, in content order
    pub index: usize,

    /// Left edge
    pub x: f64,

    /// Top edge
    pub y: f64,

    /// Width in pixels
    pub width: f64,

    /// Height in pixels
    pub height: f64,

    /// The text content
    pub text: String,
}

impl TextLayerItem {
    /// Create a new span
    pub fn new(index: usize, x: f64, y: f64, width: f64, height: f64, text: impl Into<String>) -> Self {
        Self { index, x, y, width, height, text: text.into() }
    }

    /// Bounding box of this span
    pub fn bounds(&self) -> Coordinates {
        Coordinates::new(self.x, self.y, self.width, self.height)
    }

    /// Check if this span contains a point
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        self.bounds().contains_point(x, y)
    }
}

/// Build the text layer for one page
///
/// Whitespace-only runs are skipped. Each span's top edge is the run's baseline
/// minus its font height after the viewport transform.
pub fn build_text_layer(runs: &[TextRun], viewport: &Viewport) -> Vec<TextLayerItem> {
    runs.iter()
        .filter(|run| !run.text.trim().is_empty())
        .enumerate()
        .map(|(index, run)| {
            let placed = transform_multiply(&viewport.transform, &run.transform);
            let font_height = placed[2].hypot(placed[3]);

            TextLayerItem::new(
                index,
                placed[4],
                placed[5] - font_height,
                run.width * viewport.scale,
                run.height * viewport.scale,
                run.text.clone(),
            )
        })
        .collect()
}

/// Find the topmost span under a point
///
/// Later spans are drawn over earlier ones, so the last match wins.
pub fn item_at(items: &[TextLayerItem], x: f64, y: f64) -> Option<&TextLayerItem> {
    items.iter().rev().find(|item| item.contains_point(x, y))
}

/// Minimal box covering every span
///
/// The result is rounded outward to whole pixels and its origin is clamped to be
/// non-negative. Returns `None` for an empty selection.
pub fn bounding_box<'a, I>(items: I) -> Option<Coordinates>
where
    I: IntoIterator<Item = &'a TextLayerItem>,
{
    let mut items = items.into_iter();
    let first = items.next()?;
    let (mut min_x, mut min_y) = (first.x, first.y);
    let (mut max_x, mut max_y) = (first.x + first.width, first.y + first.height);

    for item in items {
        min_x = min_x.min(item.x);
        min_y = min_y.min(item.y);
        max_x = max_x.max(item.x + item.width);
        max_y = max_y.max(item.y + item.height);
    }

    let x = min_x.floor().max(0.0);
    let y = min_y.floor().max(0.0);
    Some(Coordinates::new(x, y, (max_x.ceil() - x).max(0.0), (max_y.ceil() - y).max(0.0)))
}
