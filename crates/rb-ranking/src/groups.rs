use rb_storage::keys::{article_key, group_key, group_view_key, index_key};
use rb_storage::{Aggregate, CommandResult, Guard, RankStore, StoreCommand, Transaction};
use rb_types::{Article, ArticleId, OrderBasis, RankError};

use crate::ranker::Ranker;

fn validate_group(group: &str) -> Result<(), RankError> {
    // An empty name would make the view key collide with the base index.
    if group.is_empty() {
        return Err(RankError::InvalidArgument("group name must not be empty".into()));
    }
    Ok(())
}

impl<S: RankStore> Ranker<S> {
    /// Add `id` to each named group. Idempotent; does not check that the
    /// article exists and does not touch cached views.
    pub async fn add_to_groups<G: AsRef<str>>(&self, id: ArticleId, groups: &[G]) -> Result<(), RankError> {
        self.mutate_groups(id, groups, true).await
    }

    /// Remove `id` from each named group. Cached views keep showing it until
    /// their TTL runs out.
    pub async fn remove_from_groups<G: AsRef<str>>(&self, id: ArticleId, groups: &[G]) -> Result<(), RankError> {
        self.mutate_groups(id, groups, false).await
    }

    async fn mutate_groups<G: AsRef<str>>(&self, id: ArticleId, groups: &[G], add: bool) -> Result<(), RankError> {
        if groups.is_empty() {
            return Ok(());
        }
        let member = article_key(id);
        let mut commands = Vec::with_capacity(groups.len());
        for group in groups {
            let group = group.as_ref();
            validate_group(group)?;
            let key = group_key(group);
            let member = member.clone();
            commands.push(if add {
                StoreCommand::SetAdd { key, member }
            } else {
                StoreCommand::SetRemove { key, member }
            });
        }
        self.store().apply(Transaction::new(commands)).await?;
        tracing::debug!(article_id = id, groups = groups.len(), add, "group membership updated");
        Ok(())
    }

    /// One page of a group's articles ordered by `basis`.
    ///
    /// The derived view is rebuilt only when its key is absent or expired;
    /// the fill is guarded on that, so concurrent misses build it once and
    /// any loser reads the winner's view.
    pub async fn list_group_articles(
        &self,
        group: &str,
        page: usize,
        basis: OrderBasis,
    ) -> Result<Vec<Article>, RankError> {
        validate_group(group)?;
        let view = group_view_key(basis, group);
        let fill = Transaction::guarded(
            Guard::KeyAbsent { key: view.clone() },
            vec![
                StoreCommand::ZInterStore {
                    dest: view.clone(),
                    sources: vec![group_key(group), index_key(basis).to_string()],
                    aggregate: Aggregate::Max,
                },
                StoreCommand::Expire {
                    key: view.clone(),
                    ttl_secs: self.config().group_cache_ttl_secs,
                },
            ],
        );

        let outcome = self.store().apply(fill).await?;
        if outcome.committed {
            let members = match outcome.results.first() {
                Some(CommandResult::Count(n)) => *n,
                _ => 0,
            };
            tracing::debug!(group, ?basis, members, "group view rebuilt");
        }
        self.page_of(&view, page).await
    }
}
