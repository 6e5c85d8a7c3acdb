use rb_types::{ArticleId, OrderBasis};

/// Counter key for the article id allocator.
pub const ARTICLE_COUNTER: &str = "article:";

/// Ordered index: `article:<id>` → `created_at + VOTE_SCORE * votes`.
pub const SCORE_INDEX: &str = "score:";

/// Ordered index: `article:<id>` → `created_at`.
pub const TIME_INDEX: &str = "time:";

const ARTICLE_PREFIX: &str = "article:";
const VOTED_PREFIX: &str = "voted:";
const GROUP_PREFIX: &str = "group:";

/// Hash holding the article record. Also used as the member name inside
/// both indices and all group sets.
pub fn article_key(id: ArticleId) -> String {
    format!("{ARTICLE_PREFIX}{id}")
}

/// Inverse of [`article_key`]. `None` for anything that is not `article:<u64>`.
pub fn parse_article_key(key: &str) -> Option<ArticleId> {
    key.strip_prefix(ARTICLE_PREFIX)?.parse().ok()
}

/// Vote ledger set for one article.
pub fn voted_key(id: ArticleId) -> String {
    format!("{VOTED_PREFIX}{id}")
}

/// Membership set for a named group.
pub fn group_key(group: &str) -> String {
    format!("{GROUP_PREFIX}{group}")
}

/// Base ordered index for a listing basis.
pub fn index_key(basis: OrderBasis) -> &'static str {
    match basis {
        OrderBasis::Score => SCORE_INDEX,
        OrderBasis::Time => TIME_INDEX,
    }
}

/// Derived group view: `score:<group>` or `time:<group>`.
///
/// The base index name ends in `:`, so the view key is the base key with the
/// group name appended.
pub fn group_view_key(basis: OrderBasis, group: &str) -> String {
    format!("{}{group}", index_key(basis))
}
