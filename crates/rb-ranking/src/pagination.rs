use rb_storage::keys::parse_article_key;
use rb_storage::RankStore;
use rb_types::{Article, RankError};

use crate::article;
use crate::ranker::Ranker;

/// Inclusive rank bounds `[start, end]` of a 1-based page.
///
/// Pages far past the end saturate instead of overflowing and simply come
/// back empty.
pub fn page_bounds(page: usize, page_size: usize) -> Result<(usize, usize), RankError> {
    if page == 0 {
        return Err(RankError::InvalidArgument("page numbers start at 1".into()));
    }
    if page_size == 0 {
        return Err(RankError::InvalidArgument("page size must be at least 1".into()));
    }
    let start = (page - 1).saturating_mul(page_size);
    let end = start.saturating_add(page_size - 1);
    Ok((start, end))
}

impl<S: RankStore> Ranker<S> {
    /// One descending page of `index`, hydrated into articles.
    ///
    /// Members whose record is gone (deleted between the range read and the
    /// lookup) are skipped, so a page may come back short.
    pub(crate) async fn page_of(&self, index: &str, page: usize) -> Result<Vec<Article>, RankError> {
        let (start, end) = page_bounds(page, self.config().page_size)?;
        let members = self.store().range_desc(index, start, end).await?;

        let mut articles = Vec::with_capacity(members.len());
        for member in members {
            let Some(id) = parse_article_key(&member) else {
                tracing::warn!(index, member = %member, "non-article member in index");
                continue;
            };
            match self.store().hash_fields(&member).await? {
                Some(fields) => articles.push(article::from_record(id, &fields)?),
                None => tracing::debug!(index, article_id = id, "skipping vanished article"),
            }
        }
        Ok(articles)
    }
}
