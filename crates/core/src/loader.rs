//! Document session: busy-gated loading, page rendering, and stale-render checks
//!
//! Wraps a [`PdfEngine`] and keeps the shared state in step with the open
//! document. Page numbers are 1-based here and converted to the engine's
//! 0-based indices at the boundary.

use crate::search::{self, PageTextSource};
use crate::security::sanitize_text;
use crate::selection::Marker;
use crate::text_layer::{build_text_layer, TextLayerItem};
use doc_model::TextRun;
use image::Rgba;
use pdf_engine::{
    DocumentHandle, OpenSource, PdfEngine, PdfEngineError, RenderRequest, RgbaImage, Viewport,
};
use std::io;
use std::sync::Arc;
use viewer_core::{clamp_scale, StateStore};

const MARKER_FILL: [u8; 3] = [255, 235, 59];
const MARKER_BORDER: Rgba<u8> = Rgba([255, 152, 0, 255]);
const MARKER_ALPHA: f32 = 0.35;

/// User-facing classification of backend failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdfFailure {
    #[error("Invalid or corrupted PDF file")]
    Invalid,
    #[error("PDF file not found")]
    NotFound,
    #[error("PDF is password protected")]
    PasswordProtected,
    #[error("PDF error: {0}")]
    Other(String),
}

impl From<&PdfEngineError> for PdfFailure {
    fn from(err: &PdfEngineError) -> Self {
        match err {
            PdfEngineError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => Self::NotFound,
            PdfEngineError::Parse(_) => Self::Invalid,
            PdfEngineError::EncryptedUnsupported => Self::PasswordProtected,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("another PDF operation is in progress")]
    Busy,
    #[error("no document is open")]
    NoDocument,
    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },
    #[error(transparent)]
    Pdf(#[from] PdfFailure),
}

impl From<PdfEngineError> for LoadError {
    fn from(err: PdfEngineError) -> Self {
        tracing::error!(error = %err, "PDF backend failure");
        Self::Pdf(PdfFailure::from(&err))
    }
}

/// Output of one page render, tagged with the render generation it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub page: u32,
    pub generation: u64,
    pub viewport: Viewport,
    pub items: Vec<TextLayerItem>,
    pub markers: Vec<Marker>,
}

pub struct DocumentSession<E: PdfEngine> {
    engine: E,
    state: Arc<StateStore>,
    handle: Option<DocumentHandle>,
}

impl<E: PdfEngine> std::fmt::Debug for DocumentSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl<E: PdfEngine> DocumentSession<E> {
    pub fn new(engine: E, state: Arc<StateStore>) -> Self {
        Self { engine, state, handle: None }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Opens a document and publishes its name and page count.
    ///
    /// Fails with [`LoadError::Busy`] while another load is running. The busy flag
    /// is cleared on every exit path.
    pub fn load(&mut self, source: impl Into<OpenSource>, name: &str) -> Result<u32, LoadError> {
        let state = self.state.clone();
        let _busy = state.try_begin_processing().map_err(|_| {
            tracing::warn!("rejected document load while another is in progress");
            LoadError::Busy
        })?;

        if let Some(previous) = self.handle.take() {
            if let Err(err) = self.engine.close(previous) {
                tracing::warn!(error = %err, "failed to close previous document");
            }
        }

        let total_pages = match self.open_document(source.into()) {
            Ok(total_pages) => total_pages,
            Err(err) => {
                self.clear_document_state();
                return Err(err);
            }
        };

        state.with_text_cache(|cache| cache.clear());
        state.begin_render();
        let document_name = sanitize_text(name);
        tracing::info!(document = %document_name, pages = total_pages, "document loaded");
        state.update(move |snapshot| {
            snapshot.document_name = document_name;
            snapshot.document_open = true;
            snapshot.total_pages = total_pages;
            snapshot.current_page = 1;
        });

        Ok(total_pages)
    }

    fn open_document(&mut self, source: OpenSource) -> Result<u32, LoadError> {
        let handle = self.engine.open(source)?;
        match self.engine.page_count(handle) {
            Ok(count) => {
                self.handle = Some(handle);
                Ok(count)
            }
            Err(err) => {
                if let Err(close_err) = self.engine.close(handle) {
                    tracing::warn!(error = %close_err, "failed to close unreadable document");
                }
                Err(err.into())
            }
        }
    }

    /// Closes the open document, if any, and clears document fields.
    pub fn unload(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.engine.close(handle) {
                tracing::warn!(error = %err, "failed to close document");
            }
        }
        self.clear_document_state();
    }

    fn clear_document_state(&self) {
        self.state.with_text_cache(|cache| cache.clear());
        self.state.begin_render();
        self.state.update(|snapshot| {
            snapshot.document_name.clear();
            snapshot.document_open = false;
            snapshot.total_pages = 0;
            snapshot.current_page = 1;
        });
    }

    fn open_handle(&self) -> Result<DocumentHandle, LoadError> {
        self.handle.ok_or(LoadError::NoDocument)
    }

    fn check_page(&self, page: u32) -> Result<DocumentHandle, LoadError> {
        let handle = self.open_handle()?;
        let total = self.engine.page_count(handle)?;
        if page == 0 || page > total {
            return Err(LoadError::PageOutOfRange { page, total });
        }
        Ok(handle)
    }

    /// Builds the text layer and markers for `page` at the current scale.
    ///
    /// Starting a render makes every earlier render stale.
    pub fn render_page(&self, page: u32) -> Result<RenderedPage, LoadError> {
        let handle = self.check_page(page)?;
        let generation = self.state.begin_render();
        let snapshot = self.state.snapshot();

        let viewport = self.engine.viewport(handle, page - 1, f64::from(snapshot.scale))?;
        let content = search::get_page_text(&self.state, self, page)?;
        let items = build_text_layer(&content.items, &viewport);
        let markers = snapshot
            .extractions
            .iter()
            .filter(|extraction| extraction.page == page)
            .map(Marker::from)
            .collect();

        tracing::debug!(page, generation, items = items.len(), "rendered page");
        Ok(RenderedPage { page, generation, viewport, items, markers })
    }

    /// Publishes `rendered` as the current page unless a newer render has started.
    pub fn apply_render(&self, rendered: &RenderedPage) -> bool {
        if !self.state.is_current_render(rendered.generation) {
            tracing::debug!(
                page = rendered.page,
                generation = rendered.generation,
                "discarding stale render"
            );
            return false;
        }

        let page = rendered.page;
        self.state.update(|snapshot| snapshot.current_page = page);
        true
    }

    pub fn go_to_page(&self, page: u32) -> Result<RenderedPage, LoadError> {
        let rendered = self.render_page(page)?;
        self.apply_render(&rendered);
        Ok(rendered)
    }

    /// Rasterizes `page` at the current scale with extraction markers drawn over it.
    pub fn render_image(&self, page: u32) -> Result<RgbaImage, LoadError> {
        let handle = self.check_page(page)?;
        let snapshot = self.state.snapshot();
        let mut image = self
            .engine
            .render_page(handle, RenderRequest { page_index: page - 1, scale: snapshot.scale })?;

        for extraction in snapshot.extractions.iter().filter(|extraction| extraction.page == page) {
            draw_marker(&mut image, &Marker::from(extraction));
        }

        Ok(image)
    }

    /// Clamps and publishes the zoom level, returning the value applied.
    pub fn set_scale(&self, scale: f32) -> f32 {
        let scale = clamp_scale(scale);
        self.state.update(|snapshot| snapshot.scale = scale);
        scale
    }
}

impl<E: PdfEngine> PageTextSource for DocumentSession<E> {
    fn page_count(&self) -> u32 {
        self.handle.and_then(|handle| self.engine.page_count(handle).ok()).unwrap_or(0)
    }

    fn page_runs(&self, page: u32) -> Result<Vec<TextRun>, PdfEngineError> {
        let handle = self
            .handle
            .ok_or_else(|| PdfEngineError::Backend("no document is open".to_owned()))?;
        let index = page.checked_sub(1).ok_or(PdfEngineError::PageOutOfRange {
            page,
            page_count: self.page_count(),
        })?;
        self.engine.text_content(handle, index)
    }
}

fn draw_marker(image: &mut RgbaImage, marker: &Marker) {
    let bounds = marker.coordinates;
    let x0 = bounds.x.max(0.0) as u32;
    let y0 = bounds.y.max(0.0) as u32;
    let x1 = (bounds.right().max(0.0) as u32).min(image.width());
    let y1 = (bounds.bottom().max(0.0) as u32).min(image.height());
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    for y in y0..y1 {
        for x in x0..x1 {
            let edge = x == x0 || x + 1 == x1 || y == y0 || y + 1 == y1;
            let pixel = image.get_pixel_mut(x, y);
            if edge {
                *pixel = MARKER_BORDER;
                continue;
            }
            for (channel, tint) in pixel.0.iter_mut().zip(MARKER_FILL) {
                let blended = f32::from(*channel) * (1.0 - MARKER_ALPHA) + f32::from(tint) * MARKER_ALPHA;
                *channel = blended.round() as u8;
            }
        }
    }
}
