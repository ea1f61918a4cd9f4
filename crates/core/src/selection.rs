//! Drag-to-extract selection over a page's text layer.
//!
//! `Idle` → `Selecting` on press (only while a form field is active) → `Idle` on
//! release. The highlight is always the contiguous run of spans between the anchor
//! and the span under the pointer, inclusive, in either direction.

use crate::extraction::ExtractionTracker;
use crate::form::ExtractionForm;
use crate::security::sanitize_text;
use crate::text_layer::{bounding_box, item_at, TextLayerItem};
use doc_model::{Coordinates, Extraction, ExtractionMethod, NewExtraction};
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use viewer_core::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    Idle,
    Selecting { anchor: usize, current: usize },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Please select a form field first")]
    NoActiveField,
    #[error("no text span at index {0}")]
    NoSpan(usize),
}

/// Persistent box drawn over an extracted region.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub extraction_id: String,
    pub field_name: String,
    pub page: u32,
    pub coordinates: Coordinates,
}

impl From<&Extraction> for Marker {
    fn from(extraction: &Extraction) -> Self {
        Self {
            extraction_id: extraction.id.clone(),
            field_name: extraction.field_name.clone(),
            page: extraction.page,
            coordinates: extraction.coordinates,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    /// Release without an active drag.
    NotSelecting,
    /// The selected text was empty after sanitizing.
    Empty,
    /// The tracker refused the extraction.
    Rejected,
    Extracted {
        extraction: Extraction,
        /// Value written into the form field.
        value: String,
        marker: Marker,
        /// Field that became active after the extraction.
        next_field: Option<String>,
    },
}

pub struct TextSelection {
    state: Arc<StateStore>,
    page: u32,
    items: Vec<TextLayerItem>,
    selection: SelectionState,
    extracted: BTreeSet<usize>,
    markers: Vec<Marker>,
}

impl std::fmt::Debug for TextSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextSelection")
            .field("page", &self.page)
            .field("items", &self.items.len())
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

impl TextSelection {
    pub fn new(state: Arc<StateStore>) -> Self {
        Self {
            state,
            page: 1,
            items: Vec::new(),
            selection: SelectionState::Idle,
            extracted: BTreeSet::new(),
            markers: Vec::new(),
        }
    }

    /// Attaches to a freshly rendered page, dropping any in-progress drag.
    pub fn enable(&mut self, page: u32, items: Vec<TextLayerItem>) {
        self.page = page;
        self.items = items;
        self.selection = SelectionState::Idle;
        self.extracted.clear();
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn items(&self) -> &[TextLayerItem] {
        &self.items
    }

    pub fn state(&self) -> SelectionState {
        self.selection
    }

    pub fn press(&mut self, index: usize) -> Result<(), SelectionError> {
        if self.state.snapshot().active_field.is_none() {
            tracing::warn!("selection started without an active field");
            return Err(SelectionError::NoActiveField);
        }
        if index >= self.items.len() {
            return Err(SelectionError::NoSpan(index));
        }

        self.selection = SelectionState::Selecting { anchor: index, current: index };
        Ok(())
    }

    /// Presses on the span under a point. Returns `Ok(false)` when no span is there.
    pub fn press_at(&mut self, x: f64, y: f64) -> Result<bool, SelectionError> {
        if self.state.snapshot().active_field.is_none() {
            tracing::warn!("selection started without an active field");
            return Err(SelectionError::NoActiveField);
        }

        match item_at(&self.items, x, y).map(|item| item.index) {
            Some(index) => self.press(index).map(|()| true),
            None => Ok(false),
        }
    }

    /// Extends the drag to span `index`. Ignored while idle.
    pub fn drag_to(&mut self, index: usize) {
        if let SelectionState::Selecting { anchor, .. } = self.selection {
            if index < self.items.len() {
                self.selection = SelectionState::Selecting { anchor, current: index };
            }
        }
    }

    pub fn drag_to_point(&mut self, x: f64, y: f64) {
        if let Some(index) = item_at(&self.items, x, y).map(|item| item.index) {
            self.drag_to(index);
        }
    }

    /// Indices currently highlighted, in page order.
    pub fn highlighted(&self) -> Option<RangeInclusive<usize>> {
        match self.selection {
            SelectionState::Idle => None,
            SelectionState::Selecting { anchor, current } => {
                Some(anchor.min(current)..=anchor.max(current))
            }
        }
    }

    pub fn is_extracted(&self, index: usize) -> bool {
        self.extracted.contains(&index)
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Ends the drag and, for a non-empty selection, extracts it into the active field.
    pub fn release(
        &mut self,
        tracker: &mut ExtractionTracker,
        form: &mut ExtractionForm,
    ) -> SelectionOutcome {
        let Some(range) = self.highlighted() else {
            return SelectionOutcome::NotSelecting;
        };
        self.selection = SelectionState::Idle;

        let snapshot = self.state.snapshot();
        let Some(field_name) = snapshot.active_field_name() else {
            return SelectionOutcome::NotSelecting;
        };

        let selected = &self.items[range.clone()];
        let joined = selected.iter().map(|item| item.text.as_str()).collect::<Vec<_>>().join(" ");
        let text = sanitize_text(&joined);
        let Some(coordinates) = bounding_box(selected).filter(|_| !text.is_empty()) else {
            return SelectionOutcome::Empty;
        };

        let request = NewExtraction {
            field_name: field_name.to_owned(),
            text,
            page: self.page,
            coordinates,
            method: ExtractionMethod::Manual,
            document_name: snapshot.document_name.clone(),
        };
        let Some(extraction) = tracker.add_extraction(request) else {
            return SelectionOutcome::Rejected;
        };

        let value = match form.apply_extraction(&extraction.field_name, &extraction.text) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(error = %err, "extracted into a field outside the form");
                extraction.text.clone()
            }
        };

        self.extracted.extend(range);
        let marker = Marker::from(&extraction);
        self.markers.push(marker.clone());
        let next_field = form.advance_focus();

        tracing::info!(field = %extraction.field_name, page = extraction.page, "extracted selection");
        SelectionOutcome::Extracted { extraction, value, marker, next_field }
    }
}
