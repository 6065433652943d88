//! Portal Schedule Core Library
//!
//! Synchronizes per-user Portal and Canvas calendar feeds, reconciles remote
//! class names through aliases, and merges the cached events with the
//! rotating block-schedule templates into a single daily schedule.

pub mod alias;
pub mod cache;
pub mod composer;
pub mod config;
pub mod error;
pub mod feed_cache;
pub mod fetcher;
pub mod ics;
pub mod queue;
pub mod rotation;
pub mod service;
pub mod store;
pub mod template;
pub mod types;

// Re-export core types and error handling
pub use error::{Error, Result};
pub use types::*;

/// Commonly used items
pub mod prelude {
    pub use crate::{
        alias::AliasResolver,
        cache::*,
        composer::{ScheduleComposer, ScheduleRequest, merge_day},
        config::SyncConfig,
        feed_cache::FeedCache,
        fetcher::{FeedFetcher, FeedFetcherBuilder, FeedSource},
        ics::FeedParser,
        queue::{EnqueueOutcome, RefreshOutcome, RefreshQueue, RefreshReport},
        rotation::{DayInfo, RotationCalendar},
        service::{DaySchedule, ScheduleService, load_calendar, load_templates},
        store::{FeedStore, KvStore},
        template::TemplateSet,
        types::*,
    };
}
