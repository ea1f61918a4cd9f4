pub mod cache;
pub mod store;

pub use cache::{BoundedCache, PageTextCache, DEFAULT_TEXT_CACHE_PAGES};
pub use store::{
    clamp_scale, ActiveField, AppSnapshot, ProcessingGuard, StateError, StateStore,
    SubscriptionId, DEFAULT_TOTAL_STEPS, MAX_SCALE, MIN_SCALE,
};
