//! Remote persistence of a finished extraction session.
//!
//! The submission row and its coordinate rows are written in a single RPC call so
//! the remote side can keep them in one transaction. Saved submissions can be read
//! back by id for auditing.

use crate::config::SupabaseConfig;
use chrono::{DateTime, Utc};
use doc_model::{Extraction, ExtractionMethod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use viewer_core::StateStore;

pub const EXTRACTION_SOURCE: &str = "pdf-manual-selection";
pub const SUBMISSION_RPC: &str = "save_submission_with_coordinates";
pub const SUBMISSIONS_TABLE: &str = "form_submissions";
pub const COORDINATES_TABLE: &str = "extraction_coordinates";
const UNKNOWN_DOCUMENT: &str = "unknown-document";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error reported by the remote store, in PostgREST's shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), details: None, hint: None }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [Some(self.message.as_str()), self.details.as_deref(), self.hint.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() {
            f.write_str("Unknown error")
        } else {
            f.write_str(&parts.join(" | "))
        }
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Supabase configuration is missing")]
    NotConfigured,

    #[error("Failed to persist submission: {0}")]
    Remote(#[from] RemoteError),

    #[error("remote store did not return a submission ID after saving")]
    MissingSubmissionId,

    #[error("submission ID is required")]
    EmptySubmissionId,

    #[error("Failed to fetch submission: {0}")]
    Fetch(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub extraction_step_count: usize,
    pub active_field: Option<String>,
    pub extraction_source: String,
}

/// One extraction as stored next to the submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRow {
    pub field_name: String,
    pub page: u32,
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub selection_method: ExtractionMethod,
    pub document_name: String,
}

impl CoordinateRow {
    fn from_extraction(extraction: &Extraction, document_name: &str) -> Self {
        let bounds = extraction.coordinates;
        Self {
            field_name: extraction.field_name.clone(),
            page: extraction.page,
            text: extraction.text.clone(),
            x: bounds.x,
            y: bounds.y,
            width: bounds.width,
            height: bounds.height,
            selection_method: extraction.method,
            document_name: document_name.to_owned(),
        }
    }
}

/// Request body of the submission RPC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionPayload {
    pub document_name: String,
    pub form_payload: BTreeMap<String, String>,
    pub total_pages: Option<u32>,
    pub metadata: SessionMetadata,
    pub coordinates: Vec<CoordinateRow>,
}

/// A `form_submissions` row as the remote store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub id: String,
    pub document_name: String,
    pub total_pages: Option<u32>,
    pub extraction_count: usize,
    pub form_payload: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
}

/// An `extraction_coordinates` row: the saved coordinate plus its keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCoordinate {
    pub id: String,
    pub submission_id: String,
    #[serde(flatten)]
    pub row: CoordinateRow,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRecord {
    pub submission: SubmissionRow,
    pub coordinates: Vec<StoredCoordinate>,
}

pub trait RemoteStore: Send + Sync {
    /// Saves the session atomically and returns the new submission id.
    fn save_extraction_session(&self, payload: &SessionPayload) -> Result<String, RemoteError>;

    /// Reads a saved submission and its coordinate rows.
    fn fetch_submission(&self, submission_id: &str) -> Result<SubmissionRecord, RemoteError>;
}

/// Supabase/PostgREST implementation over blocking HTTP.
pub struct SupabaseStore {
    agent: ureq::Agent,
    url: String,
    anon_key: String,
    schema: String,
}

impl fmt::Debug for SupabaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseStore")
            .field("url", &self.url)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SupabaseStore {
    /// Returns `None` unless both the URL and the key are set.
    pub fn from_config(config: &SupabaseConfig) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        let url = config.url.as_deref()?.trim().trim_end_matches('/').to_owned();
        let anon_key = config.anon_key.as_deref()?.trim().to_owned();

        Some(Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            url,
            anon_key,
            schema: config.schema.clone(),
        })
    }

    pub fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{SUBMISSION_RPC}", self.url)
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.url)
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("apikey", &self.anon_key)
            .set("Authorization", &format!("Bearer {}", self.anon_key))
            .set("Content-Profile", &self.schema)
            .set("Accept-Profile", &self.schema)
    }

    /// Rows of `table` whose `column` equals `value`, as the raw JSON body.
    fn select_eq(&self, table: &str, column: &str, value: &str) -> Result<String, RemoteError> {
        let request = self
            .agent
            .get(&self.table_url(table))
            .query("select", "*")
            .query(column, &format!("eq.{value}"));
        read_body(self.authorize(request).call())
    }
}

fn read_body(response: Result<ureq::Response, ureq::Error>) -> Result<String, RemoteError> {
    match response {
        Ok(response) => response
            .into_string()
            .map_err(|err| RemoteError::new(format!("failed to read response: {err}"))),
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(parse_error_body(status, &body))
        }
        Err(err) => Err(RemoteError::new(err.to_string())),
    }
}

impl RemoteStore for SupabaseStore {
    fn save_extraction_session(&self, payload: &SessionPayload) -> Result<String, RemoteError> {
        let body = serde_json::to_string(payload)
            .map_err(|err| RemoteError::new(format!("failed to encode payload: {err}")))?;

        let request = self.agent.post(&self.rpc_url()).set("Content-Type", "application/json");
        let body = read_body(self.authorize(request).send_string(&body))?;
        parse_submission_id(&body)
    }

    fn fetch_submission(&self, submission_id: &str) -> Result<SubmissionRecord, RemoteError> {
        let submission = self.select_eq(SUBMISSIONS_TABLE, "id", submission_id)?;
        let coordinates = self.select_eq(COORDINATES_TABLE, "submission_id", submission_id)?;
        parse_submission_record(submission_id, &submission, &coordinates)
    }
}

/// The RPC returns the new id as a bare JSON string.
fn parse_submission_id(body: &str) -> Result<String, RemoteError> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(id)) if !id.trim().is_empty() => Ok(id),
        _ => Err(RemoteError::new("Supabase did not return a submission ID after saving.")),
    }
}

fn parse_submission_record(
    submission_id: &str,
    submission_body: &str,
    coordinates_body: &str,
) -> Result<SubmissionRecord, RemoteError> {
    let submission = serde_json::from_str::<Vec<SubmissionRow>>(submission_body)
        .map_err(|err| RemoteError::new(format!("unreadable submission row: {err}")))?
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::new(format!("no submission with ID {submission_id}")))?;
    let coordinates = serde_json::from_str(coordinates_body)
        .map_err(|err| RemoteError::new(format!("unreadable coordinate rows: {err}")))?;

    Ok(SubmissionRecord { submission, coordinates })
}

fn parse_error_body(status: u16, body: &str) -> RemoteError {
    match serde_json::from_str::<RemoteError>(body) {
        Ok(error) if !error.message.is_empty() => error,
        _ => RemoteError::new(format!("HTTP {status}: {}", body.trim())),
    }
}

/// Sends the current store contents to the remote store.
pub struct DataSyncService {
    state: Arc<StateStore>,
    remote: Option<Box<dyn RemoteStore>>,
}

impl fmt::Debug for DataSyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSyncService")
            .field("configured", &self.is_configured())
            .finish_non_exhaustive()
    }
}

impl DataSyncService {
    pub fn new(state: Arc<StateStore>, remote: Option<Box<dyn RemoteStore>>) -> Self {
        Self { state, remote }
    }

    pub fn from_config(state: Arc<StateStore>, config: &SupabaseConfig) -> Self {
        let remote = SupabaseStore::from_config(config).map(|store| Box::new(store) as Box<dyn RemoteStore>);
        Self::new(state, remote)
    }

    pub fn is_configured(&self) -> bool {
        self.remote.is_some()
    }

    /// Builds the payload from the current snapshot.
    pub fn build_payload(&self, form_data: &BTreeMap<String, String>) -> SessionPayload {
        let snapshot = self.state.snapshot();
        let document_name = [Some(snapshot.document_name.as_str()), form_data.get("study_id").map(String::as_str)]
            .into_iter()
            .flatten()
            .find(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_DOCUMENT)
            .to_owned();

        SessionPayload {
            coordinates: snapshot
                .extractions
                .iter()
                .map(|extraction| CoordinateRow::from_extraction(extraction, &document_name))
                .collect(),
            document_name,
            form_payload: form_data.clone(),
            total_pages: Some(snapshot.total_pages).filter(|pages| *pages > 0),
            metadata: SessionMetadata {
                extraction_step_count: snapshot.total_steps,
                active_field: snapshot.active_field_name().map(str::to_owned),
                extraction_source: EXTRACTION_SOURCE.to_owned(),
            },
        }
    }

    /// Saves the session remotely and records the submission id in the store.
    ///
    /// Local extractions are untouched whatever the outcome.
    pub fn persist_current_session(
        &self,
        form_data: &BTreeMap<String, String>,
    ) -> Result<String, SyncError> {
        let Some(remote) = self.remote.as_deref() else {
            tracing::warn!("sync requested without remote configuration");
            return Err(SyncError::NotConfigured);
        };

        let payload = self.build_payload(form_data);
        let submission_id = remote.save_extraction_session(&payload).map_err(|err| {
            tracing::error!(error = %err, "failed to persist submission");
            SyncError::from(err)
        })?;
        if submission_id.trim().is_empty() {
            return Err(SyncError::MissingSubmissionId);
        }

        self.state.update(|snapshot| snapshot.last_submission_id = Some(submission_id.clone()));
        tracing::info!(
            submission = %submission_id,
            coordinates = payload.coordinates.len(),
            "persisted extraction session"
        );
        Ok(submission_id)
    }

    /// Reads a saved submission back from the remote store.
    pub fn fetch_submission(&self, submission_id: &str) -> Result<SubmissionRecord, SyncError> {
        let Some(remote) = self.remote.as_deref() else {
            return Err(SyncError::NotConfigured);
        };
        let submission_id = submission_id.trim();
        if submission_id.is_empty() {
            return Err(SyncError::EmptySubmissionId);
        }

        let record = remote.fetch_submission(submission_id).map_err(|err| {
            tracing::error!(submission = %submission_id, error = %err, "failed to fetch submission");
            SyncError::Fetch(err)
        })?;
        tracing::debug!(
            submission = %submission_id,
            coordinates = record.coordinates.len(),
            "fetched submission"
        );
        Ok(record)
    }

    /// Reads back the submission saved by the last successful sync.
    pub fn fetch_last_submission(&self) -> Result<Option<SubmissionRecord>, SyncError> {
        match self.state.snapshot().last_submission_id.clone() {
            Some(submission_id) => self.fetch_submission(&submission_id).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use doc_model::{Coordinates, FieldKind};
    use std::sync::Mutex;
    use viewer_core::ActiveField;

    const SUBMISSION_BODY: &str = r#"[{
        "id": "sub-1",
        "document_name": "trial.pdf",
        "total_pages": 12,
        "extraction_count": 1,
        "form_payload": {"totalN": "120"},
        "metadata": {"extractionSource": "pdf-manual-selection"},
        "submitted_at": "2024-05-01T10:00:00.123456+00:00"
    }]"#;

    const COORDINATES_BODY: &str = r#"[{
        "id": "coord-1",
        "submission_id": "sub-1",
        "field_name": "totalN",
        "page": 3,
        "text": "120",
        "x": 10.0,
        "y": 20.0,
        "width": 30.0,
        "height": 40.0,
        "selection_method": "manual",
        "document_name": "trial.pdf",
        "created_at": "2024-05-01T10:00:00+00:00"
    }]"#;

    #[derive(Default)]
    struct RecordingRemote {
        payloads: Mutex<Vec<SessionPayload>>,
        fetched: Mutex<Vec<String>>,
        reply: Option<Result<String, RemoteError>>,
    }

    impl RemoteStore for Arc<RecordingRemote> {
        fn save_extraction_session(&self, payload: &SessionPayload) -> Result<String, RemoteError> {
            self.payloads.lock().unwrap().push(payload.clone());
            self.reply.clone().unwrap_or_else(|| Ok("sub-1".to_owned()))
        }

        fn fetch_submission(&self, submission_id: &str) -> Result<SubmissionRecord, RemoteError> {
            self.fetched.lock().unwrap().push(submission_id.to_owned());
            parse_submission_record(submission_id, SUBMISSION_BODY, COORDINATES_BODY)
        }
    }

    fn extraction(field: &str, text: &str) -> Extraction {
        Extraction {
            id: format!("ext_{field}"),
            timestamp: Utc::now(),
            field_name: field.to_owned(),
            text: text.to_owned(),
            page: 3,
            coordinates: Coordinates::new(10.0, 20.0, 30.0, 40.0),
            method: ExtractionMethod::Manual,
            document_name: "trial.pdf".to_owned(),
        }
    }

    fn service(reply: Option<Result<String, RemoteError>>) -> (Arc<StateStore>, Arc<RecordingRemote>, DataSyncService) {
        let state = Arc::new(StateStore::new());
        let remote = Arc::new(RecordingRemote { reply, ..RecordingRemote::default() });
        let service = DataSyncService::new(state.clone(), Some(Box::new(remote.clone())));
        (state, remote, service)
    }

    #[test]
    fn persists_payload_and_records_submission_id() {
        let (state, remote, service) = service(None);
        state.update(|snapshot| {
            snapshot.document_name = "trial.pdf".to_owned();
            snapshot.total_pages = 12;
            snapshot.active_field = Some(ActiveField { name: "totalN".to_owned(), kind: FieldKind::Number });
            snapshot.extractions = vec![extraction("totalN", "120")];
        });
        let form = BTreeMap::from([("totalN".to_owned(), "120".to_owned())]);

        let id = service.persist_current_session(&form).unwrap();

        assert_eq!(id, "sub-1");
        assert_eq!(state.snapshot().last_submission_id.as_deref(), Some("sub-1"));
        let payloads = remote.payloads.lock().unwrap();
        let payload = &payloads[0];
        assert_eq!(payload.document_name, "trial.pdf");
        assert_eq!(payload.total_pages, Some(12));
        assert_eq!(payload.metadata.extraction_step_count, 8);
        assert_eq!(payload.metadata.active_field.as_deref(), Some("totalN"));
        assert_eq!(payload.coordinates.len(), 1);
        assert_eq!(payload.coordinates[0].selection_method, ExtractionMethod::Manual);
    }

    #[test]
    fn document_name_falls_back_to_study_id_then_placeholder() {
        let (_state, _remote, service) = service(None);

        let with_study = BTreeMap::from([("study_id".to_owned(), "NCT0042".to_owned())]);
        assert_eq!(service.build_payload(&with_study).document_name, "NCT0042");
        assert_eq!(service.build_payload(&BTreeMap::new()).document_name, "unknown-document");
    }

    #[test]
    fn payload_serializes_with_rpc_field_names() {
        let (state, _remote, service) = service(None);
        state.update(|snapshot| snapshot.extractions = vec![extraction("doi", "10.1/x")]);

        let value = serde_json::to_value(service.build_payload(&BTreeMap::new())).unwrap();

        assert_eq!(value["metadata"]["extractionSource"], "pdf-manual-selection");
        assert_eq!(value["metadata"]["extractionStepCount"], 8);
        assert!(value["total_pages"].is_null());
        assert_eq!(value["coordinates"][0]["selection_method"], "manual");
        assert_eq!(value["coordinates"][0]["document_name"], "unknown-document");
    }

    #[test]
    fn unconfigured_service_leaves_state_untouched() {
        let state = Arc::new(StateStore::new());
        state.update(|snapshot| snapshot.extractions = vec![extraction("doi", "10.1/x")]);
        let service = DataSyncService::from_config(state.clone(), &SupabaseConfig::default());

        let result = service.persist_current_session(&BTreeMap::new());

        assert!(matches!(result, Err(SyncError::NotConfigured)));
        assert_eq!(state.snapshot().extractions.len(), 1);
        assert_eq!(state.snapshot().last_submission_id, None);
    }

    #[test]
    fn remote_failure_is_reported_with_details() {
        let failure = RemoteError {
            message: "insert failed".to_owned(),
            details: Some("duplicate key".to_owned()),
            hint: None,
        };
        let (state, _remote, service) = service(Some(Err(failure)));

        let err = service.persist_current_session(&BTreeMap::new()).unwrap_err();

        assert_eq!(err.to_string(), "Failed to persist submission: insert failed | duplicate key");
        assert_eq!(state.snapshot().last_submission_id, None);
    }

    #[test]
    fn blank_submission_id_is_an_error() {
        let (_state, _remote, service) = service(Some(Ok(" ".to_owned())));

        let result = service.persist_current_session(&BTreeMap::new());

        assert!(matches!(result, Err(SyncError::MissingSubmissionId)));
    }

    #[test]
    fn parses_rpc_responses() {
        assert_eq!(parse_submission_id("\"4b1c\"").unwrap(), "4b1c");
        assert!(parse_submission_id("null").is_err());
        assert!(parse_submission_id("").is_err());

        let err = parse_error_body(400, r#"{"message":"bad","details":null,"hint":"check schema","code":"P0001"}"#);
        assert_eq!(err.to_string(), "bad | check schema");
        assert_eq!(parse_error_body(502, "gateway down").to_string(), "HTTP 502: gateway down");
    }

    #[test]
    fn parses_submission_read_back() {
        let record = parse_submission_record("sub-1", SUBMISSION_BODY, COORDINATES_BODY).unwrap();

        assert_eq!(record.submission.id, "sub-1");
        assert_eq!(record.submission.total_pages, Some(12));
        assert_eq!(record.submission.form_payload["totalN"], "120");
        assert_eq!(record.coordinates.len(), 1);
        assert_eq!(record.coordinates[0].submission_id, "sub-1");
        assert_eq!(record.coordinates[0].row.field_name, "totalN");
        assert_eq!(record.coordinates[0].row.selection_method, ExtractionMethod::Manual);

        let empty = parse_submission_record("sub-9", "[]", "[]").unwrap_err();
        assert_eq!(empty.to_string(), "no submission with ID sub-9");
        assert!(parse_submission_record("sub-1", SUBMISSION_BODY, "{}").is_err());
    }

    #[test]
    fn fetches_last_saved_submission() {
        let (_state, remote, service) = service(None);
        assert_eq!(service.fetch_last_submission().unwrap(), None);

        service.persist_current_session(&BTreeMap::new()).unwrap();
        let record = service.fetch_last_submission().unwrap().expect("saved submission");

        assert_eq!(record.submission.document_name, "trial.pdf");
        assert_eq!(*remote.fetched.lock().unwrap(), vec!["sub-1".to_owned()]);
    }

    #[test]
    fn fetch_requires_configuration_and_id() {
        let (_state, _remote, service) = service(None);
        assert!(matches!(service.fetch_submission("  "), Err(SyncError::EmptySubmissionId)));

        let unconfigured =
            DataSyncService::from_config(Arc::new(StateStore::new()), &SupabaseConfig::default());
        assert!(matches!(unconfigured.fetch_submission("sub-1"), Err(SyncError::NotConfigured)));
    }

    #[test]
    fn store_requires_url_and_key() {
        let mut config = SupabaseConfig { url: Some("https://db.example.org/".to_owned()), ..SupabaseConfig::default() };
        assert!(SupabaseStore::from_config(&config).is_none());

        config.anon_key = Some("anon".to_owned());
        let store = SupabaseStore::from_config(&config).unwrap();
        assert_eq!(
            store.rpc_url(),
            "https://db.example.org/rest/v1/rpc/save_submission_with_coordinates"
        );
        assert_eq!(
            store.table_url(COORDINATES_TABLE),
            "https://db.example.org/rest/v1/extraction_coordinates"
        );
    }
}
