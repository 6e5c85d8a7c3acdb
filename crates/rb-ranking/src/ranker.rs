use std::sync::Arc;

use rb_storage::keys::{article_key, index_key, voted_key, ARTICLE_COUNTER, SCORE_INDEX, TIME_INDEX};
use rb_storage::{Guard, RankStore, StoreCommand, Transaction};
use rb_types::{Article, ArticleId, Clock, OrderBasis, RankError, VoteOutcome};

use crate::article;
use crate::config::RankConfig;

/// How many times a torn vote is repaired before the error is surfaced.
const MAX_REPAIR_ATTEMPTS: usize = 5;

/// Scores drift by float rounding, so the invariant is checked with slack.
const SCORE_TOLERANCE: f64 = 1e-3;

/// Ranking operations over a [`RankStore`].
///
/// Cheap to share behind an `Arc`; all state lives in the store.
pub struct Ranker<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: RankConfig,
}

impl<S: RankStore> Ranker<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: RankConfig) -> Self {
        Ranker { store, clock, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RankConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Allocate the next article id. Ids are never reused, even when the
    /// transaction that was meant to use one fails.
    pub async fn next_id(&self) -> Result<ArticleId, RankError> {
        self.store.incr(ARTICLE_COUNTER).await
    }

    /// Post a new article. The poster's own vote is recorded, so the article
    /// starts with one vote and `score = now + vote_score`.
    pub async fn create_article(&self, poster: &str, title: &str, link: &str) -> Result<ArticleId, RankError> {
        let id = self.next_id().await?;
        let now = self.now();
        let member = article_key(id);
        let voted = voted_key(id);

        let txn = Transaction::new(vec![
            StoreCommand::SetAdd { key: voted.clone(), member: poster.to_string() },
            StoreCommand::Expire { key: voted, ttl_secs: self.config.vote_window_secs },
            StoreCommand::HashSet {
                key: member.clone(),
                fields: article::new_record(poster, title, link, now),
            },
            StoreCommand::ZAdd {
                key: SCORE_INDEX.to_string(),
                member: member.clone(),
                score: now + self.config.vote_score,
            },
            StoreCommand::ZAdd { key: TIME_INDEX.to_string(), member, score: now },
        ]);
        self.store.apply(txn).await?;

        tracing::debug!(article_id = id, poster, "article created");
        Ok(id)
    }

    /// Cast `voter`'s vote on `id`.
    ///
    /// The ledger insert and both increments are one guarded transaction,
    /// which also re-checks that the article still exists and that its
    /// ledger is still live. The ledger expires with the vote window, so the
    /// window is enforced against the store's clock as well as this one.
    pub async fn vote(&self, voter: &str, id: ArticleId) -> Result<VoteOutcome, RankError> {
        let member = article_key(id);
        let Some(created_at) = self.store.score(TIME_INDEX, &member).await? else {
            return Ok(VoteOutcome::NotFound);
        };
        let cutoff = self.now() - self.config.vote_window_secs;
        if created_at < cutoff {
            tracing::debug!(article_id = id, voter, "vote window expired");
            return Ok(VoteOutcome::WindowExpired);
        }

        let voted = voted_key(id);
        let txn = Transaction::with_guards(
            vec![
                Guard::MemberPresent { key: TIME_INDEX.to_string(), member: member.clone() },
                Guard::KeyPresent { key: voted.clone() },
                Guard::SetInsertNew { key: voted, member: voter.to_string() },
            ],
            vec![
                StoreCommand::ZIncr {
                    key: SCORE_INDEX.to_string(),
                    member: member.clone(),
                    by: self.config.vote_score,
                },
                StoreCommand::HashIncr {
                    key: member,
                    field: article::FIELD_VOTES.to_string(),
                    by: 1,
                },
            ],
        );

        let outcome = match self.store.apply(txn).await {
            Ok(out) if out.committed => VoteOutcome::Accepted,
            Ok(out) => match out.failed_guard {
                Some(0) => VoteOutcome::NotFound,
                Some(1) => VoteOutcome::WindowExpired,
                _ => VoteOutcome::DuplicateVoter,
            },
            Err(RankError::PartialWrite { key }) => {
                tracing::warn!(article_id = id, voter, key = %key, "vote applied partially; repairing");
                self.repair_with_retry(id).await?;
                VoteOutcome::Accepted
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(article_id = id, voter, ?outcome, "vote");
        Ok(outcome)
    }

    pub async fn get_article(&self, id: ArticleId) -> Result<Article, RankError> {
        match self.store.hash_fields(&article_key(id)).await? {
            Some(fields) => article::from_record(id, &fields),
            None => Err(RankError::NotFound(id)),
        }
    }

    /// One page of all articles, highest first.
    pub async fn list_articles(&self, page: usize, basis: OrderBasis) -> Result<Vec<Article>, RankError> {
        self.page_of(index_key(basis), page).await
    }

    /// Out-of-band removal of an article from the record store, its ledger
    /// and both indices. Group sets keep the member; views never surface it
    /// because they intersect with a base index.
    ///
    /// Returns `false` if the article did not exist.
    pub async fn delete_article(&self, id: ArticleId) -> Result<bool, RankError> {
        let member = article_key(id);
        let txn = Transaction::guarded(
            Guard::MemberPresent { key: TIME_INDEX.to_string(), member: member.clone() },
            vec![
                StoreCommand::Delete { key: member.clone() },
                StoreCommand::Delete { key: voted_key(id) },
                StoreCommand::ZRemove { key: SCORE_INDEX.to_string(), member: member.clone() },
                StoreCommand::ZRemove { key: TIME_INDEX.to_string(), member },
            ],
        );
        let deleted = self.store.apply(txn).await?.committed;
        if deleted {
            tracing::info!(article_id = id, "article deleted");
        }
        Ok(deleted)
    }

    /// Restore `score == created_at + vote_score * votes` for one article.
    ///
    /// While the ledger is live its cardinality is the vote count, since the
    /// ledger insert is what gates a vote. Once it has expired the stored
    /// count can no longer change and is taken as is.
    ///
    /// Returns `true` if anything had to be rewritten.
    pub async fn repair_article(&self, id: ArticleId) -> Result<bool, RankError> {
        let member = article_key(id);
        let Some(created_at) = self.store.score(TIME_INDEX, &member).await? else {
            return Err(RankError::NotFound(id));
        };
        let Some(fields) = self.store.hash_fields(&member).await? else {
            return Err(RankError::NotFound(id));
        };
        let recorded = article::parse_votes(id, &fields).ok();
        let voters = self.store.set_len(&voted_key(id)).await? as u64;
        let votes = match (voters, recorded) {
            (0, Some(n)) => n,
            (0, None) => 1,
            (n, _) => n,
        };

        let expected = created_at + self.config.vote_score * votes as f64;
        let score = self.store.score(SCORE_INDEX, &member).await?;
        let score_ok = score.is_some_and(|s| (s - expected).abs() <= SCORE_TOLERANCE);
        if score_ok && recorded == Some(votes) {
            return Ok(false);
        }

        tracing::warn!(article_id = id, votes, ?score, expected, "repairing article score");
        let txn = Transaction::guarded(
            Guard::MemberPresent { key: TIME_INDEX.to_string(), member: member.clone() },
            vec![
                StoreCommand::HashSet {
                    key: member.clone(),
                    fields: vec![(article::FIELD_VOTES.to_string(), votes.to_string())],
                },
                StoreCommand::ZAdd { key: SCORE_INDEX.to_string(), member, score: expected },
            ],
        );
        Ok(self.store.apply(txn).await?.committed)
    }

    async fn repair_with_retry(&self, id: ArticleId) -> Result<(), RankError> {
        let mut attempt = 1;
        loop {
            match self.repair_article(id).await {
                Ok(_) => return Ok(()),
                Err(e @ (RankError::PartialWrite { .. } | RankError::Storage(_)))
                    if attempt < MAX_REPAIR_ATTEMPTS =>
                {
                    tracing::warn!(article_id = id, attempt, error = %e, "repair failed; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use rb_storage::{MemStore, TxnOutcome};
    use rb_types::ManualClock;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::{VOTE_SCORE, VOTE_WINDOW_SECS};

    const T0: f64 = 1_700_000_000.0;

    fn ranker() -> (Ranker<MemStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemStore::with_clock(clock.clone()));
        (Ranker::new(store, clock.clone(), RankConfig::default()), clock)
    }

    async fn score_of<S: RankStore>(r: &Ranker<S>, id: ArticleId) -> Option<f64> {
        r.store().score(SCORE_INDEX, &article_key(id)).await.unwrap()
    }

    #[tokio::test]
    async fn create_article_seeds_both_indices() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "A_title", "www.example.com").await.unwrap();
        assert_eq!(id, 1);

        let article = r.get_article(id).await.unwrap();
        assert_eq!(article.votes, 1);
        assert_eq!(article.created_at, T0);
        assert_eq!(score_of(&r, id).await, Some(T0 + VOTE_SCORE));
        assert_eq!(r.store().score(TIME_INDEX, &article_key(id)).await.unwrap(), Some(T0));
        assert_eq!(r.store().set_len(&voted_key(id)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ids_increase() {
        let (r, _) = ranker();
        let a = r.create_article("a", "t", "l").await.unwrap();
        let b = r.create_article("b", "t", "l").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn vote_then_duplicate() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "A_title", "l").await.unwrap();

        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::Accepted);
        assert_eq!(r.get_article(id).await.unwrap().votes, 2);
        assert_eq!(score_of(&r, id).await, Some(T0 + 2.0 * VOTE_SCORE));

        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::DuplicateVoter);
        assert_eq!(r.get_article(id).await.unwrap().votes, 2);
        assert_eq!(score_of(&r, id).await, Some(T0 + 2.0 * VOTE_SCORE));
    }

    #[tokio::test]
    async fn poster_cannot_vote_on_own_article() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "t", "l").await.unwrap();
        assert_eq!(r.vote("alice", id).await.unwrap(), VoteOutcome::DuplicateVoter);
    }

    #[tokio::test]
    async fn vote_on_missing_article() {
        let (r, _) = ranker();
        assert_eq!(r.vote("bob", 99).await.unwrap(), VoteOutcome::NotFound);
        assert!(!r.store().exists(&voted_key(99)).await.unwrap());
    }

    #[tokio::test]
    async fn vote_window_boundary() {
        let (r, clock) = ranker();
        let id = r.create_article("alice", "t", "l").await.unwrap();

        clock.advance(VOTE_WINDOW_SECS);
        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::Accepted);

        clock.advance(1.0);
        assert_eq!(r.vote("carol", id).await.unwrap(), VoteOutcome::WindowExpired);
        assert_eq!(r.get_article(id).await.unwrap().votes, 2);
        assert_eq!(score_of(&r, id).await, Some(T0 + 2.0 * VOTE_SCORE));
        // The ledger has expired with the window.
        assert!(!r.store().exists(&voted_key(id)).await.unwrap());
    }

    #[tokio::test]
    async fn vote_after_ledger_expiry_in_store_is_rejected() {
        // The store's clock runs slightly ahead of the ranker's, as two reads
        // of a real clock would.
        let ranker_clock = Arc::new(ManualClock::new(T0));
        let store_clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemStore::with_clock(store_clock.clone()));
        let r = Ranker::new(store, ranker_clock.clone(), RankConfig::default());
        let id = r.create_article("alice", "t", "l").await.unwrap();

        ranker_clock.advance(VOTE_WINDOW_SECS);
        store_clock.advance(VOTE_WINDOW_SECS + 0.001);

        assert_eq!(r.vote("alice", id).await.unwrap(), VoteOutcome::WindowExpired);
        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::WindowExpired);
        assert_eq!(r.get_article(id).await.unwrap().votes, 1);
        assert_eq!(score_of(&r, id).await, Some(T0 + VOTE_SCORE));
        assert!(!r.store().exists(&voted_key(id)).await.unwrap());

        store_clock.advance(1_000_000.0);
        assert!(!r.store().exists(&voted_key(id)).await.unwrap());
        assert!(!r.repair_article(id).await.unwrap());
        assert_eq!(r.get_article(id).await.unwrap().votes, 1);
    }

    #[tokio::test]
    async fn list_articles_by_score_and_time() {
        let (r, clock) = ranker();
        let first = r.create_article("a", "first", "l").await.unwrap();
        clock.advance(10.0);
        let second = r.create_article("b", "second", "l").await.unwrap();
        r.vote("c", first).await.unwrap();

        let by_score: Vec<_> = r.list_articles(1, OrderBasis::Score).await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(by_score, vec![first, second]);

        let by_time: Vec<_> = r.list_articles(1, OrderBasis::Time).await.unwrap().iter().map(|a| a.id).collect();
        assert_eq!(by_time, vec![second, first]);
    }

    #[tokio::test]
    async fn pages_are_disjoint_and_descending() {
        let (r, clock) = ranker();
        for i in 0..60 {
            r.create_article("poster", &format!("t{i}"), "l").await.unwrap();
            clock.advance(1.0);
        }

        let mut seen = Vec::new();
        for page in 1..=3 {
            let articles = r.list_articles(page, OrderBasis::Score).await.unwrap();
            assert!(articles.len() <= r.config().page_size);
            seen.extend(articles.into_iter().map(|a| a.id));
        }
        assert_eq!(seen.len(), 60);
        assert_eq!(seen, (1..=60).rev().collect::<Vec<_>>());

        assert!(r.list_articles(4, OrderBasis::Score).await.unwrap().is_empty());
        assert!(matches!(r.list_articles(0, OrderBasis::Score).await, Err(RankError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn delete_article_clears_indices() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "t", "l").await.unwrap();
        assert!(r.delete_article(id).await.unwrap());
        assert!(!r.delete_article(id).await.unwrap());

        assert!(matches!(r.get_article(id).await, Err(RankError::NotFound(1))));
        assert_eq!(score_of(&r, id).await, None);
        assert!(r.list_articles(1, OrderBasis::Time).await.unwrap().is_empty());
        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::NotFound);
    }

    #[tokio::test]
    async fn repair_is_noop_on_consistent_article() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "t", "l").await.unwrap();
        r.vote("bob", id).await.unwrap();
        assert!(!r.repair_article(id).await.unwrap());
        assert!(matches!(r.repair_article(42).await, Err(RankError::NotFound(42))));
    }

    #[tokio::test]
    async fn repair_restores_drifted_score() {
        let (r, _) = ranker();
        let id = r.create_article("alice", "t", "l").await.unwrap();
        r.vote("bob", id).await.unwrap();
        r.store()
            .apply(Transaction::new(vec![StoreCommand::ZAdd {
                key: SCORE_INDEX.into(),
                member: article_key(id),
                score: 0.0,
            }]))
            .await
            .unwrap();

        assert!(r.repair_article(id).await.unwrap());
        assert_eq!(score_of(&r, id).await, Some(T0 + 2.0 * VOTE_SCORE));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_votes_count_once_per_voter() {
        let (r, _) = ranker();
        let r = Arc::new(r);
        let id = r.create_article("alice", "t", "l").await.unwrap();

        let (send, mut recv) = mpsc::unbounded_channel();
        for n in 0..100 {
            // Every voter tries twice; only one of each pair may land.
            for _ in 0..2 {
                let send = send.clone();
                let r = r.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(rand::random::<u64>() % 20)).await;
                    let outcome = r.vote(&format!("user{n}"), id).await.unwrap();
                    let _ = send.send((n, outcome));
                });
            }
        }
        drop(send);

        let mut accepted: HashMap<u32, usize> = HashMap::new();
        while let Some((n, outcome)) = recv.recv().await {
            if outcome == VoteOutcome::Accepted {
                *accepted.entry(n).or_default() += 1;
            } else {
                assert_eq!(outcome, VoteOutcome::DuplicateVoter);
            }
        }
        assert_eq!(accepted.len(), 100);
        assert!(accepted.values().all(|&c| c == 1));

        assert_eq!(r.get_article(id).await.unwrap().votes, 101);
        assert_eq!(score_of(&r, id).await, Some(T0 + 101.0 * VOTE_SCORE));
    }

    /// Store that applies only the first command of the first vote it sees,
    /// then reports the tear.
    struct TornStore {
        inner: MemStore,
        torn: AtomicBool,
    }

    impl RankStore for TornStore {
        async fn incr(&self, key: &str) -> Result<u64, RankError> {
            self.inner.incr(key).await
        }

        async fn apply(&self, mut txn: Transaction) -> Result<TxnOutcome, RankError> {
            let is_vote = txn.guards.iter().any(|g| matches!(g, Guard::SetInsertNew { .. }));
            if is_vote && !self.torn.swap(true, Ordering::SeqCst) {
                let key = txn.commands[1].target().to_string();
                txn.commands.truncate(1);
                let out = self.inner.apply(txn).await?;
                if out.committed {
                    return Err(RankError::PartialWrite { key });
                }
                return Ok(out);
            }
            self.inner.apply(txn).await
        }

        async fn hash_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>, RankError> {
            self.inner.hash_fields(key).await
        }

        async fn set_len(&self, key: &str) -> Result<usize, RankError> {
            self.inner.set_len(key).await
        }

        async fn score(&self, key: &str, member: &str) -> Result<Option<f64>, RankError> {
            self.inner.score(key, member).await
        }

        async fn range_desc(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, RankError> {
            self.inner.range_desc(key, start, stop).await
        }

        async fn exists(&self, key: &str) -> Result<bool, RankError> {
            self.inner.exists(key).await
        }

        async fn purge_expired(&self) -> Result<usize, RankError> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn torn_vote_is_repaired() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(TornStore {
            inner: MemStore::with_clock(clock.clone()),
            torn: AtomicBool::new(false),
        });
        let r = Ranker::new(store, clock, RankConfig::default());
        let id = r.create_article("alice", "t", "l").await.unwrap();

        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::Accepted);
        assert_eq!(r.get_article(id).await.unwrap().votes, 2);
        assert_eq!(score_of(&r, id).await, Some(T0 + 2.0 * VOTE_SCORE));

        assert_eq!(r.vote("bob", id).await.unwrap(), VoteOutcome::DuplicateVoter);
        assert_eq!(r.vote("carol", id).await.unwrap(), VoteOutcome::Accepted);
        assert_eq!(r.get_article(id).await.unwrap().votes, 3);
    }
}
