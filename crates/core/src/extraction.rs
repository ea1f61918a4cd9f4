//! Append-only extraction ledger with local persistence and a trace log.

use crate::security::{self, decode_data, encode_data, sanitize_text};
use chrono::{DateTime, Utc};
use doc_model::{Coordinates, Extraction, ExtractionMethod, NewExtraction};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use storage::KeyValueStore;
use uuid::Uuid;
use viewer_core::StateStore;

/// Key holding the encoded extraction list.
pub const STORAGE_KEY: &str = "clinical_extractions_secure";
/// Plain-JSON key written by older releases; read once and migrated.
pub const LEGACY_STORAGE_KEY: &str = "clinical_extractions";

const TRACE_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub extraction_id: String,
    pub field_name: String,
    pub preview: String,
    pub page: u32,
    pub method: ExtractionMethod,
    pub timestamp: DateTime<Utc>,
}

impl TraceEntry {
    fn from_extraction(extraction: &Extraction) -> Self {
        let preview = if extraction.text.chars().count() > TRACE_PREVIEW_CHARS {
            let head: String = extraction.text.chars().take(TRACE_PREVIEW_CHARS).collect();
            format!("{head}...")
        } else {
            extraction.text.clone()
        };

        Self {
            extraction_id: extraction.id.clone(),
            field_name: extraction.field_name.clone(),
            preview,
            page: extraction.page,
            method: extraction.method,
            timestamp: extraction.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractionStats {
    pub extractions: usize,
    pub pages_with_data: usize,
}

/// Where a host should go to show an extraction again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavigationTarget {
    pub page: u32,
    pub coordinates: Coordinates,
}

pub struct ExtractionTracker {
    storage: Arc<dyn KeyValueStore>,
    state: Arc<StateStore>,
    extractions: Vec<Extraction>,
    /// Field name to index of the latest extraction for it.
    by_field: HashMap<String, usize>,
    /// Newest first.
    trace: Vec<TraceEntry>,
    last_persist_error: Option<String>,
}

impl std::fmt::Debug for ExtractionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionTracker")
            .field("extractions", &self.extractions.len())
            .field("fields", &self.by_field.len())
            .field("last_persist_error", &self.last_persist_error)
            .finish_non_exhaustive()
    }
}

impl ExtractionTracker {
    /// Creates a tracker and loads any persisted extractions.
    pub fn new(storage: Arc<dyn KeyValueStore>, state: Arc<StateStore>) -> Self {
        let mut tracker = Self {
            storage,
            state,
            extractions: Vec::new(),
            by_field: HashMap::new(),
            trace: Vec::new(),
            last_persist_error: None,
        };
        tracker.load();
        tracker
    }

    /// Replaces the in-memory list with the persisted one and returns how many
    /// records were accepted.
    pub fn load(&mut self) -> usize {
        let records = self.read_persisted();

        self.by_field.clear();
        for (index, record) in records.iter().enumerate() {
            self.by_field.insert(record.field_name.clone(), index);
        }
        self.trace = records.iter().rev().map(TraceEntry::from_extraction).collect();
        self.extractions = records;
        self.publish();

        tracing::debug!(count = self.extractions.len(), "loaded extractions");
        self.extractions.len()
    }

    /// Sanitizes, validates, and appends an extraction.
    ///
    /// Invalid input yields `None` and leaves the ledger untouched.
    pub fn add_extraction(&mut self, data: NewExtraction) -> Option<Extraction> {
        let candidate = NewExtraction {
            field_name: sanitize_text(&data.field_name),
            text: sanitize_text(&data.text),
            document_name: sanitize_text(&data.document_name),
            ..data
        };

        if !security::validate_extraction(&candidate) {
            tracing::warn!(
                field = %candidate.field_name,
                page = candidate.page,
                "rejected invalid extraction"
            );
            return None;
        }

        let timestamp = Utc::now();
        let extraction = Extraction {
            id: generate_id(timestamp),
            timestamp,
            field_name: candidate.field_name,
            text: candidate.text,
            page: candidate.page,
            coordinates: candidate.coordinates,
            method: candidate.method,
            document_name: candidate.document_name,
        };

        self.by_field.insert(extraction.field_name.clone(), self.extractions.len());
        self.trace.insert(0, TraceEntry::from_extraction(&extraction));
        self.extractions.push(extraction.clone());

        self.persist();
        self.publish();

        tracing::debug!(id = %extraction.id, field = %extraction.field_name, "added extraction");
        Some(extraction)
    }

    pub fn extractions(&self) -> Vec<Extraction> {
        self.extractions.clone()
    }

    pub fn len(&self) -> usize {
        self.extractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractions.is_empty()
    }

    pub fn extraction_for_field(&self, field_name: &str) -> Option<&Extraction> {
        self.by_field.get(field_name).and_then(|&index| self.extractions.get(index))
    }

    /// Latest extracted text per field.
    pub fn field_values(&self) -> BTreeMap<String, String> {
        self.by_field
            .iter()
            .filter_map(|(field, &index)| {
                self.extractions.get(index).map(|record| (field.clone(), record.text.clone()))
            })
            .collect()
    }

    pub fn extractions_on_page(&self, page: u32) -> impl Iterator<Item = &Extraction> {
        self.extractions.iter().filter(move |record| record.page == page)
    }

    /// Empties the ledger and removes the persisted record. Idempotent.
    pub fn clear_all(&mut self) {
        self.extractions.clear();
        self.by_field.clear();
        self.trace.clear();
        self.last_persist_error = None;

        for key in [STORAGE_KEY, LEGACY_STORAGE_KEY] {
            if let Err(err) = self.storage.remove(key) {
                tracing::error!(key, error = %err, "failed to remove persisted extractions");
                self.last_persist_error = Some(err.to_string());
            }
        }

        self.publish();
    }

    pub fn trace_log(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn stats(&self) -> ExtractionStats {
        let pages: BTreeSet<u32> = self.extractions.iter().map(|record| record.page).collect();
        ExtractionStats { extractions: self.extractions.len(), pages_with_data: pages.len() }
    }

    pub fn navigate_to(&self, extraction_id: &str) -> Option<NavigationTarget> {
        self.extractions
            .iter()
            .find(|record| record.id == extraction_id)
            .map(|record| NavigationTarget { page: record.page, coordinates: record.coordinates })
    }

    /// Error from the most recent failed write, cleared by the next successful one.
    pub fn last_persist_error(&self) -> Option<&str> {
        self.last_persist_error.as_deref()
    }

    fn publish(&self) {
        let snapshot = self.extractions.clone();
        self.state.update(move |state| state.extractions = snapshot);
    }

    fn persist(&mut self) {
        let result = encode_data(&self.extractions)
            .map_err(|err| err.to_string())
            .and_then(|blob| self.storage.set(STORAGE_KEY, &blob).map_err(|err| err.to_string()));

        match result {
            Ok(()) => self.last_persist_error = None,
            Err(err) => {
                tracing::error!(error = %err, "failed to persist extractions");
                self.last_persist_error = Some(err);
            }
        }
    }

    fn read_persisted(&mut self) -> Vec<Extraction> {
        match self.storage.get(STORAGE_KEY) {
            Ok(Some(blob)) => {
                return match decode_data::<Vec<Value>>(&blob) {
                    Ok(entries) => accept_valid(entries),
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding undecodable extraction record");
                        self.discard(STORAGE_KEY);
                        Vec::new()
                    }
                };
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(error = %err, "failed to read persisted extractions");
                return Vec::new();
            }
        }

        self.migrate_legacy()
    }

    fn migrate_legacy(&mut self) -> Vec<Extraction> {
        let raw = match self.storage.get(LEGACY_STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::error!(error = %err, "failed to read legacy extractions");
                return Vec::new();
            }
        };

        let entries = match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable legacy extraction record");
                self.discard(LEGACY_STORAGE_KEY);
                return Vec::new();
            }
        };

        let records = accept_valid(entries);
        let written = encode_data(&records)
            .map_err(|err| err.to_string())
            .and_then(|blob| self.storage.set(STORAGE_KEY, &blob).map_err(|err| err.to_string()));

        match written {
            Ok(()) => {
                self.discard(LEGACY_STORAGE_KEY);
                tracing::info!(count = records.len(), "migrated legacy extractions");
            }
            Err(err) => {
                tracing::error!(error = %err, "legacy migration failed; keeping legacy record");
                self.last_persist_error = Some(err);
            }
        }

        records
    }

    fn discard(&mut self, key: &str) {
        if let Err(err) = self.storage.remove(key) {
            tracing::error!(key, error = %err, "failed to remove record");
            self.last_persist_error = Some(err.to_string());
        }
    }
}

/// Keeps entries that parse and pass structural validation, dropping the rest one by one.
fn accept_valid(entries: Vec<Value>) -> Vec<Extraction> {
    let total = entries.len();
    let records: Vec<Extraction> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<Extraction>(entry).ok())
        .filter(security::validate_record)
        .collect();

    if records.len() < total {
        tracing::warn!(dropped = total - records.len(), "dropped invalid persisted extractions");
    }
    records
}

fn generate_id(timestamp: DateTime<Utc>) -> String {
    format!("ext_{}_{}", timestamp.timestamp_millis(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storage::{MemoryStore, StorageError};

    fn valid_input(field: &str, page: u32) -> NewExtraction {
        NewExtraction {
            field_name: field.to_owned(),
            text: "120 patients enrolled".to_owned(),
            page,
            coordinates: Coordinates::new(12.0, 40.0, 180.0, 14.0),
            method: ExtractionMethod::Manual,
            document_name: "trial.pdf".to_owned(),
        }
    }

    fn tracker_with(store: Arc<MemoryStore>) -> (ExtractionTracker, Arc<StateStore>) {
        let state = Arc::new(StateStore::new());
        (ExtractionTracker::new(store, state.clone()), state)
    }

    /// Store whose writes always fail.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn valid_extraction_gets_fresh_id_and_timestamp() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        let before = Utc::now();

        let first = tracker.add_extraction(valid_input("sample_size", 2)).expect("valid input");
        let second = tracker.add_extraction(valid_input("sample_size", 2)).expect("valid input");

        assert!(first.id.starts_with("ext_"));
        assert_ne!(first.id, second.id);
        assert!(first.timestamp >= before);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn invalid_extraction_is_rejected_without_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let (mut tracker, state) = tracker_with(store.clone());

        let mut bad = valid_input("sample_size", 0);
        assert!(tracker.add_extraction(bad.clone()).is_none());

        bad.page = 1;
        bad.text = "  <>  ".to_owned();
        assert!(tracker.add_extraction(bad).is_none());

        assert!(tracker.is_empty());
        assert!(state.snapshot().extractions.is_empty());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn inputs_are_sanitized_before_storage() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        let mut input = valid_input(" <b>age</b> ", 1);
        input.text = "  <i>54.2</i> years ".to_owned();

        let record = tracker.add_extraction(input).expect("valid input");

        assert_eq!(record.field_name, "bage/b");
        assert_eq!(record.text, "i54.2/i years");
    }

    #[test]
    fn field_lookup_is_last_write_wins() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        tracker.add_extraction(valid_input("age_mean", 1)).expect("valid input");
        let mut correction = valid_input("age_mean", 4);
        correction.text = "54.1".to_owned();
        let latest = tracker.add_extraction(correction).expect("valid input");

        assert_eq!(tracker.extraction_for_field("age_mean"), Some(&latest));
        assert_eq!(tracker.field_values().get("age_mean").map(String::as_str), Some("54.1"));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn snapshot_copies_do_not_alias_the_ledger() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        tracker.add_extraction(valid_input("totalN", 1)).expect("valid input");

        let mut copy = tracker.extractions();
        copy.clear();

        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn mutations_are_mirrored_to_state() {
        let (mut tracker, state) = tracker_with(Arc::new(MemoryStore::new()));

        tracker.add_extraction(valid_input("totalN", 1)).expect("valid input");
        assert_eq!(state.snapshot().extractions.len(), 1);

        tracker.clear_all();
        assert!(state.snapshot().extractions.is_empty());
    }

    #[test]
    fn persisted_list_survives_a_new_tracker() {
        let store = Arc::new(MemoryStore::new());
        let (mut tracker, _) = tracker_with(store.clone());
        let record = tracker.add_extraction(valid_input("totalN", 3)).expect("valid input");

        let (reloaded, state) = tracker_with(store);

        assert_eq!(reloaded.extractions(), vec![record.clone()]);
        assert_eq!(reloaded.extraction_for_field("totalN"), Some(&record));
        assert_eq!(state.snapshot().extractions.len(), 1);
    }

    #[test]
    fn clear_all_twice_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        let (mut tracker, _) = tracker_with(store.clone());
        tracker.add_extraction(valid_input("totalN", 1)).expect("valid input");

        tracker.clear_all();
        assert!(tracker.is_empty());
        assert_eq!(store.get(STORAGE_KEY).expect("read"), None);

        tracker.clear_all();
        assert!(tracker.is_empty());
        assert!(tracker.trace_log().is_empty());
        assert_eq!(store.get(STORAGE_KEY).expect("read"), None);
    }

    #[test]
    fn legacy_record_is_migrated_then_removed() {
        let store = Arc::new(MemoryStore::new());
        let legacy = json!([{
            "id": "ext_1700000000000_abc123def",
            "timestamp": "2023-11-14T22:13:20.000Z",
            "fieldName": "citation",
            "text": "Smith et al. 2021",
            "page": 1,
            "coordinates": { "x": 10, "y": 12, "width": 200, "height": 14 },
            "method": "manual",
            "documentName": "smith.pdf"
        }]);
        store.set(LEGACY_STORAGE_KEY, &legacy.to_string()).expect("seed legacy");

        let (tracker, _) = tracker_with(store.clone());

        assert_eq!(tracker.len(), 1);
        assert_eq!(store.get(LEGACY_STORAGE_KEY).expect("read"), None);
        let blob = store.get(STORAGE_KEY).expect("read").expect("secure key written");
        let decoded: Vec<Extraction> = decode_data(&blob).expect("decodes");
        assert_eq!(decoded[0].field_name, "citation");
    }

    #[test]
    fn legacy_record_is_kept_when_migration_write_fails() {
        let store = Arc::new(ReadOnlyStore::default());
        let legacy = json!([{
            "id": "ext_1",
            "timestamp": "2023-11-14T22:13:20Z",
            "fieldName": "citation",
            "text": "Smith et al. 2021",
            "page": 1,
            "coordinates": { "x": 10, "y": 12, "width": 200, "height": 14 },
            "method": "manual",
            "documentName": "smith.pdf"
        }]);
        store.inner.set(LEGACY_STORAGE_KEY, &legacy.to_string()).expect("seed legacy");

        let tracker = ExtractionTracker::new(store.clone(), Arc::new(StateStore::new()));

        assert_eq!(tracker.len(), 1);
        assert!(tracker.last_persist_error().is_some());
        assert!(store.get(LEGACY_STORAGE_KEY).expect("read").is_some());
    }

    #[test]
    fn invalid_persisted_entries_are_dropped_individually() {
        let store = Arc::new(MemoryStore::new());
        let entries = json!([
            {
                "id": "ext_good",
                "timestamp": "2024-02-01T09:00:00Z",
                "fieldName": "totalN",
                "text": "120",
                "page": 2,
                "coordinates": { "x": 0, "y": 0, "width": 20, "height": 10 },
                "method": "manual",
                "documentName": "trial.pdf"
            },
            {
                "id": "ext_zero_width",
                "timestamp": "2024-02-01T09:00:00Z",
                "fieldName": "totalN",
                "text": "120",
                "page": 2,
                "coordinates": { "x": 0, "y": 0, "width": 0, "height": 10 },
                "method": "manual",
                "documentName": "trial.pdf"
            },
            { "id": "ext_garbage" }
        ]);
        store.set(STORAGE_KEY, &encode_data(&entries).expect("encode")).expect("seed");

        let (tracker, _) = tracker_with(store);

        let ids: Vec<String> = tracker.extractions().into_iter().map(|record| record.id).collect();
        assert_eq!(ids, vec!["ext_good".to_owned()]);
    }

    #[test]
    fn undecodable_blob_is_removed() {
        let store = Arc::new(MemoryStore::new());
        store.set(STORAGE_KEY, "%%% definitely not base64").expect("seed");

        let (tracker, _) = tracker_with(store.clone());

        assert!(tracker.is_empty());
        assert_eq!(store.get(STORAGE_KEY).expect("read"), None);
    }

    #[test]
    fn persist_failure_is_surfaced_but_ledger_keeps_record() {
        let state = Arc::new(StateStore::new());
        let mut tracker = ExtractionTracker::new(Arc::new(ReadOnlyStore::default()), state);

        let record = tracker.add_extraction(valid_input("totalN", 1));

        assert!(record.is_some());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.last_persist_error().is_some_and(|err| err.contains("read-only")));
    }

    #[test]
    fn trace_log_is_newest_first_with_truncated_previews() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        tracker.add_extraction(valid_input("citation", 1)).expect("valid input");
        let mut long = valid_input("population_description", 5);
        long.text = "x".repeat(100);
        tracker.add_extraction(long).expect("valid input");

        let trace = tracker.trace_log();

        assert_eq!(trace[0].field_name, "population_description");
        assert_eq!(trace[0].preview, format!("{}...", "x".repeat(80)));
        assert_eq!(trace[1].preview, "120 patients enrolled");
    }

    #[test]
    fn stats_count_distinct_pages() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        for (field, page) in [("a", 1), ("b", 1), ("c", 3)] {
            tracker.add_extraction(valid_input(field, page)).expect("valid input");
        }

        assert_eq!(tracker.stats(), ExtractionStats { extractions: 3, pages_with_data: 2 });
    }

    #[test]
    fn navigate_to_finds_page_and_box() {
        let (mut tracker, _) = tracker_with(Arc::new(MemoryStore::new()));
        let record = tracker.add_extraction(valid_input("totalN", 7)).expect("valid input");

        let target = tracker.navigate_to(&record.id).expect("known id");

        assert_eq!(target.page, 7);
        assert_eq!(target.coordinates, record.coordinates);
        assert!(tracker.navigate_to("ext_missing").is_none());
    }
}
