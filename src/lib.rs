//! Travel journal backend: conversation entries, per-day journal bundles and
//! geo filtering, served over HTTP.

pub mod bus;
pub mod config;
pub mod entry;
pub mod geo;
pub mod journal;
pub mod photo;
pub mod server;
pub mod store;

pub use entry::{ConversationEntry, EntryEdit};
pub use journal::{DailyAggregator, DailyBundle, DayDigest, DayDigests, DayKey, EntryOrder};
pub use photo::PhotoResolver;
