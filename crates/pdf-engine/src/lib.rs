mod text;

use doc_model::TextRun;
use image::{ImageBuffer, Rgba};
use lopdf::{Document, ObjectId};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use text::multiply as transform_multiply;

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

const PAGE_BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const PAGE_BORDER: Rgba<u8> = Rgba([220, 220, 220, 255]);
const TEXT_PLACEHOLDER: Rgba<u8> = Rgba([200, 200, 200, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    /// For engines layered over another backend's handle space.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

/// Maps PDF user space (origin bottom-left) to device pixels (origin top-left).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub scale: f64,
    pub transform: [f64; 6],
}

impl Viewport {
    pub fn new(page: PageSize, scale: f64) -> Self {
        let width = f64::from(page.width_pt) * scale;
        let height = f64::from(page.height_pt) * scale;

        Self { width, height, scale, transform: [scale, 0.0, 0.0, -scale, 0.0, height] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    /// Zero-based.
    pub page_index: u32,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self { page_index: 0, scale: 1.0 }
    }
}

#[derive(Debug, Clone)]
pub enum OpenSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl From<PathBuf> for OpenSource {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for OpenSource {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<Vec<u8>> for OpenSource {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PdfEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parse error: {0}")]
    Parse(#[from] lopdf::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("encrypted PDFs are not supported in the default backend")]
    EncryptedUnsupported,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Page indices are zero-based throughout this trait.
pub trait PdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError>;
    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError>;
    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError>;
    fn viewport(
        &self,
        handle: DocumentHandle,
        page_index: u32,
        scale: f64,
    ) -> Result<Viewport, PdfEngineError> {
        Ok(Viewport::new(self.page_size(handle, page_index)?, scale))
    }
    /// Positioned text runs in content-stream order.
    fn text_content(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<Vec<TextRun>, PdfEngineError>;
    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError>;
    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError>;
}

#[derive(Debug)]
struct DocumentRecord {
    document: Document,
    page_ids: Vec<ObjectId>,
    page_sizes: Vec<PageSize>,
}

#[derive(Debug, Default)]
pub struct LopdfEngine {
    next_handle: u64,
    docs: HashMap<DocumentHandle, DocumentRecord>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(bytes: &[u8]) -> Result<DocumentRecord, PdfEngineError> {
        if bytes.windows("/Encrypt".len()).any(|window| window == b"/Encrypt") {
            return Err(PdfEngineError::EncryptedUnsupported);
        }

        let document = Document::load_mem(bytes)?;
        let pages = document.get_pages();
        let mut page_ids = Vec::with_capacity(pages.len());
        let mut page_sizes = Vec::with_capacity(pages.len());

        for (_, object_id) in pages {
            let size = Self::media_box(&document, object_id)
                .unwrap_or(PageSize { width_pt: 612.0, height_pt: 792.0 });

            page_ids.push(object_id);
            page_sizes.push(size);
        }

        if page_ids.is_empty() {
            return Err(PdfEngineError::Backend("document has no pages".to_owned()));
        }

        Ok(DocumentRecord { document, page_ids, page_sizes })
    }

    fn media_box(document: &Document, page_id: ObjectId) -> Option<PageSize> {
        let dict = document.get_dictionary(page_id).ok()?;
        let array = dict.get(b"MediaBox").ok()?.as_array().ok()?;
        if array.len() != 4 {
            return None;
        }

        let x0 = array[0].as_float().ok()?;
        let y0 = array[1].as_float().ok()?;
        let x1 = array[2].as_float().ok()?;
        let y1 = array[3].as_float().ok()?;
        Some(PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
    }

    fn record(&self, handle: DocumentHandle) -> Result<&DocumentRecord, PdfEngineError> {
        self.docs.get(&handle).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }

    fn page_id(&self, handle: DocumentHandle, page_index: u32) -> Result<ObjectId, PdfEngineError> {
        let record = self.record(handle)?;
        record.page_ids.get(page_index as usize).copied().ok_or(PdfEngineError::PageOutOfRange {
            page: page_index,
            page_count: record.page_ids.len() as u32,
        })
    }
}

impl PdfEngine for LopdfEngine {
    fn open(&mut self, source: OpenSource) -> Result<DocumentHandle, PdfEngineError> {
        let bytes = match source {
            OpenSource::Path(path) => fs::read(path)?,
            OpenSource::Bytes(bytes) => bytes,
        };

        let record = Self::parse(&bytes)?;
        tracing::debug!(pages = record.page_ids.len(), bytes = bytes.len(), "opened document");

        self.next_handle += 1;
        let handle = DocumentHandle(self.next_handle);
        self.docs.insert(handle, record);

        Ok(handle)
    }

    fn page_count(&self, handle: DocumentHandle) -> Result<u32, PdfEngineError> {
        Ok(self.record(handle)?.page_sizes.len() as u32)
    }

    fn page_size(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<PageSize, PdfEngineError> {
        let record = self.record(handle)?;
        record.page_sizes.get(page_index as usize).copied().ok_or(PdfEngineError::PageOutOfRange {
            page: page_index,
            page_count: record.page_sizes.len() as u32,
        })
    }

    fn text_content(
        &self,
        handle: DocumentHandle,
        page_index: u32,
    ) -> Result<Vec<TextRun>, PdfEngineError> {
        let page_id = self.page_id(handle, page_index)?;
        text::extract_runs(&self.record(handle)?.document, page_id)
    }

    /// Draws a blank page with a border and a grey bar where each text run sits.
    fn render_page(
        &self,
        handle: DocumentHandle,
        request: RenderRequest,
    ) -> Result<RgbaImage, PdfEngineError> {
        let scale = if request.scale <= 0.0 { 1.0 } else { request.scale };
        let viewport = self.viewport(handle, request.page_index, f64::from(scale))?;

        let width = viewport.width.round().max(1.0) as u32;
        let height = viewport.height.round().max(1.0) as u32;
        let mut image = RgbaImage::from_pixel(width, height, PAGE_BACKGROUND);

        for run in self.text_content(handle, request.page_index)? {
            let placed = text::multiply(&viewport.transform, &run.transform);
            let left = placed[4];
            let top = placed[5] - run.height * viewport.scale;
            fill_rect(&mut image, left, top, run.width * viewport.scale, run.height * viewport.scale);
        }

        if width >= 4 && height >= 4 {
            for x in 0..width {
                image.put_pixel(x, 0, PAGE_BORDER);
                image.put_pixel(x, height - 1, PAGE_BORDER);
            }
            for y in 0..height {
                image.put_pixel(0, y, PAGE_BORDER);
                image.put_pixel(width - 1, y, PAGE_BORDER);
            }
        }

        Ok(image)
    }

    fn close(&mut self, handle: DocumentHandle) -> Result<(), PdfEngineError> {
        self.docs.remove(&handle).map(|_| ()).ok_or(PdfEngineError::InvalidHandle(handle.raw()))
    }
}

fn fill_rect(image: &mut RgbaImage, left: f64, top: f64, width: f64, height: f64) {
    let x0 = left.max(0.0).floor() as u32;
    let y0 = top.max(0.0).floor() as u32;
    let x1 = ((left + width).ceil().max(0.0) as u32).min(image.width());
    let y1 = ((top + height).ceil().max(0.0) as u32).min(image.height());

    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x, y, TEXT_PLACEHOLDER);
        }
    }
}

pub fn default_engine() -> LopdfEngine {
    LopdfEngine::new()
}
