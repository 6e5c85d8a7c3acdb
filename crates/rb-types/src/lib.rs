mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

pub type ArticleId = u64;

/// Seconds since the Unix epoch. Scores share the same unit.
pub type Timestamp = f64;

/// A hydrated article as returned by listing and lookup operations.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub title: String,
    pub link: String,
    pub poster: String,
    pub created_at: Timestamp,
    pub votes: u64,
}

/// Which base index a listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBasis {
    #[default]
    Score,
    Time,
}

/// Result of a vote attempt. Rejections are ordinary values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VoteOutcome {
    Accepted,
    WindowExpired,
    DuplicateVoter,
    NotFound,
}

impl VoteOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, VoteOutcome::Accepted)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RankError {
    #[error("article {0} not found")]
    NotFound(ArticleId),
    #[error("article id allocator exhausted")]
    AllocatorExhausted,
    /// Raised by a store that cannot apply a transaction atomically and
    /// stopped after writing some of it; `key` is the first key left
    /// unwritten. The in-memory store never raises it.
    #[error("partial write on '{key}': transaction applied only in part")]
    PartialWrite { key: String },
    #[error("wrong type for key '{key}': expected {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
}
