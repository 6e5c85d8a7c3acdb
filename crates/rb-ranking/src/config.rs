use rb_types::RankError;

/// Score bonus per vote: a day's worth of seconds spread over 200 votes.
pub const VOTE_SCORE: f64 = 432.0;
pub const PAGE_SIZE: usize = 25;
pub const VOTE_WINDOW_SECS: f64 = 7.0 * 86_400.0;
pub const GROUP_CACHE_TTL_SECS: f64 = 60.0;

/// Fixed ranking parameters. Loaded once at start-up; never renegotiated.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct RankConfig {
    pub vote_score: f64,
    pub page_size: usize,
    pub vote_window_secs: f64,
    pub group_cache_ttl_secs: f64,
}

impl Default for RankConfig {
    fn default() -> Self {
        RankConfig {
            vote_score: VOTE_SCORE,
            page_size: PAGE_SIZE,
            vote_window_secs: VOTE_WINDOW_SECS,
            group_cache_ttl_secs: GROUP_CACHE_TTL_SECS,
        }
    }
}

impl RankConfig {
    pub fn validate(&self) -> Result<(), RankError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(RankError::InvalidArgument(format!("{name} must be positive, got {v}")))
            }
        };
        positive("vote_score", self.vote_score)?;
        positive("vote_window_secs", self.vote_window_secs)?;
        positive("group_cache_ttl_secs", self.group_cache_ttl_secs)?;
        if self.page_size == 0 {
            return Err(RankError::InvalidArgument("page_size must be at least 1".into()));
        }
        Ok(())
    }
}
