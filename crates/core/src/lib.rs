//! Clinical extraction core library
//!
//! Extraction ledger, drag selection, page-text search, document session, exports,
//! remote sync, and job status for clinical-study PDF data extraction.

pub mod config;
pub mod export;
pub mod extraction;
pub mod form;
pub mod jobs;
pub mod loader;
pub mod search;
pub mod security;
pub mod selection;
pub mod sync;
pub mod text_layer;

pub use config::{AppConfig, ConfigError, SupabaseConfig};
pub use export::{ExportData, ExportError, ExportFormat};
pub use extraction::{ExtractionStats, ExtractionTracker, NavigationTarget, TraceEntry};
pub use form::{ExtractionForm, FieldIssue, FormError, FormField, FormStep};
pub use jobs::{
    health_payload, validate_session_id, HealthPayload, JobError, JobRecord, JobRegistry,
    JobStatus, JobStatusResponse,
};
pub use loader::{DocumentSession, LoadError, PdfFailure, RenderedPage};
pub use search::{get_page_text, normalize_text, perform_search, PageTextSource, SearchSession};
pub use security::{
    decode_data, encode_data, escape_html, sanitize_text, validate_extraction, validate_input,
    EncodingError, ValidationResult,
};
pub use selection::{Marker, SelectionError, SelectionOutcome, SelectionState, TextSelection};
pub use sync::{
    DataSyncService, RemoteError, RemoteStore, SessionPayload, StoredCoordinate, SubmissionRecord,
    SubmissionRow, SupabaseStore, SyncError,
};
pub use text_layer::{build_text_layer, TextLayerItem};
