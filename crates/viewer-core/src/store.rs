//! Shared application state with immutable snapshots and change subscriptions.
//!
//! A single owner drives mutations through [`StateStore::update`]; every mutation
//! publishes a fresh `Arc<AppSnapshot>` to subscribers. Readers never observe a
//! half-applied update.

use crate::cache::{PageTextCache, DEFAULT_TEXT_CACHE_PAGES};
use doc_model::{Extraction, FieldKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

pub const DEFAULT_TOTAL_STEPS: usize = 8;
pub const MIN_SCALE: f32 = 0.25;
pub const MAX_SCALE: f32 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveField {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSnapshot {
    pub document_name: String,
    pub document_open: bool,
    pub current_page: u32,
    pub total_pages: u32,
    pub scale: f32,
    pub active_field: Option<ActiveField>,
    pub extractions: Vec<Extraction>,
    pub current_step: usize,
    pub total_steps: usize,
    pub is_processing: bool,
    pub last_submission_id: Option<String>,
}

impl Default for AppSnapshot {
    fn default() -> Self {
        Self {
            document_name: String::new(),
            document_open: false,
            current_page: 1,
            total_pages: 0,
            scale: 1.0,
            active_field: None,
            extractions: Vec::new(),
            current_step: 0,
            total_steps: DEFAULT_TOTAL_STEPS,
            is_processing: false,
            last_submission_id: None,
        }
    }
}

impl AppSnapshot {
    pub fn active_field_name(&self) -> Option<&str> {
        self.active_field.as_ref().map(|field| field.name.as_str())
    }
}

pub fn clamp_scale(scale: f32) -> f32 {
    if !scale.is_finite() {
        return 1.0;
    }
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Subscriber = Arc<dyn Fn(&Arc<AppSnapshot>) + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("another operation is in progress")]
    Busy,
}

pub struct StateStore {
    state: RwLock<Arc<AppSnapshot>>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
    text_cache: Mutex<PageTextCache>,
    render_generation: AtomicU64,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("state", &self.snapshot())
            .field("render_generation", &self.render_generation())
            .finish_non_exhaustive()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_TEXT_CACHE_PAGES)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(Arc::new(AppSnapshot::default())),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            text_cache: Mutex::new(PageTextCache::new(capacity)),
            render_generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<AppSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Applies `mutate` to a copy of the current state, publishes the result, and
    /// notifies subscribers after the write lock is released.
    pub fn update<F>(&self, mutate: F) -> Arc<AppSnapshot>
    where
        F: FnOnce(&mut AppSnapshot),
    {
        let next = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let mut draft = AppSnapshot::clone(&guard);
            mutate(&mut draft);
            let next = Arc::new(draft);
            *guard = next.clone();
            next
        };

        self.notify(&next);
        next
    }

    /// Restores the initial state and drops cached page text. Subscriptions survive.
    pub fn reset(&self) {
        tracing::debug!("resetting application state");
        self.lock_cache().clear();
        self.render_generation.fetch_add(1, Ordering::SeqCst);
        self.update(|state| *state = AppSnapshot::default());
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<AppSnapshot>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Sets the busy flag, failing if it is already set.
    ///
    /// The flag is cleared when the returned guard drops, on every exit path.
    pub fn try_begin_processing(&self) -> Result<ProcessingGuard<'_>, StateError> {
        let next = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if guard.is_processing {
                tracing::debug!("busy flag already set");
                return Err(StateError::Busy);
            }
            let mut draft = AppSnapshot::clone(&guard);
            draft.is_processing = true;
            let next = Arc::new(draft);
            *guard = next.clone();
            next
        };

        self.notify(&next);
        Ok(ProcessingGuard { store: self })
    }

    pub fn with_text_cache<R>(&self, f: impl FnOnce(&mut PageTextCache) -> R) -> R {
        f(&mut self.lock_cache())
    }

    /// Starts a new render and returns its generation. Older generations become stale.
    pub fn begin_render(&self) -> u64 {
        self.render_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn render_generation(&self) -> u64 {
        self.render_generation.load(Ordering::SeqCst)
    }

    pub fn is_current_render(&self, generation: u64) -> bool {
        self.render_generation() == generation
    }

    fn notify(&self, snapshot: &Arc<AppSnapshot>) {
        let subscribers: Vec<Subscriber> =
            self.lock_subscribers().iter().map(|(_, callback)| callback.clone()).collect();

        for callback in subscribers {
            callback(snapshot);
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Subscriber)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, PageTextCache> {
        self.text_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[must_use = "the busy flag is cleared as soon as the guard is dropped"]
pub struct ProcessingGuard<'a> {
    store: &'a StateStore,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.store.update(|state| state.is_processing = false);
    }
}
