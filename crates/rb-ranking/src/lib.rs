//! Article ranking on top of a [`rb_storage::RankStore`]: posting, one vote
//! per user inside the vote window, score/time listings and cached
//! per-group views.

mod article;
pub mod config;
mod groups;
pub mod pagination;
mod ranker;

pub use config::RankConfig;
pub use pagination::page_bounds;
pub use ranker::Ranker;
