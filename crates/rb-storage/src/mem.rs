use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use rb_types::{Clock, RankError, SystemClock, Timestamp};

use crate::traits::RankStore;
use crate::types::{Aggregate, CommandResult, Guard, StoreCommand, Transaction, TxnOutcome};

fn wrong_type(key: &str, expected: &'static str) -> RankError {
    RankError::WrongType { key: key.to_string(), expected }
}

fn parse_int(key: &str, field: &str, raw: Option<&str>) -> Result<i64, RankError> {
    match raw {
        None => Ok(0),
        Some(s) => s.parse().map_err(|_| {
            RankError::InvalidArgument(format!("hash field '{field}' of '{key}' is not an integer"))
        }),
    }
}

fn checked_incr(key: &str, field: &str, base: i64, by: i64) -> Result<i64, RankError> {
    base.checked_add(by).ok_or_else(|| {
        RankError::InvalidArgument(format!("hash field '{field}' of '{key}' would overflow"))
    })
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// `f64` with a total order so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct OrdScore(f64);

impl PartialEq for OrdScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrdScore {}

impl PartialOrd for OrdScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordered index: member lookup by hash, rank queries by `(score, member)`.
#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(OrdScore, String)>,
}

impl SortedSet {
    /// Returns `true` if `member` was not present before.
    fn insert(&mut self, member: String, score: f64) -> bool {
        let is_new = match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.order.remove(&(OrdScore(old), member.clone()));
                false
            }
            None => true,
        };
        self.order.insert((OrdScore(score), member));
        is_new
    }

    fn incr(&mut self, member: &str, by: f64) -> f64 {
        let next = self.scores.get(member).copied().unwrap_or(0.0) + by;
        self.insert(member.to_string(), next);
        next
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(OrdScore(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn get(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn range_desc(&self, start: usize, stop: usize) -> Vec<String> {
        if start > stop {
            return Vec::new();
        }
        self.order
            .iter()
            .rev()
            .skip(start)
            .take((stop - start).saturating_add(1))
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Hash,
    Set,
    Sorted,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Hash => "hash",
            Kind::Set => "set",
            Kind::Sorted => "sorted set",
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Sorted(SortedSet),
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::Counter(_) => Kind::Counter,
            Value::Hash(_) => Kind::Hash,
            Value::Set(_) => Kind::Set,
            Value::Sorted(_) => Kind::Sorted,
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Set(s) => s.is_empty(),
            Value::Sorted(z) => z.len() == 0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Timestamp>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Slot { value, expires_at: None }
    }

    /// A key stays live up to and including its expiry instant.
    fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expires_at, Some(t) if now > t)
    }
}

/// Borrowed view of one `ZInterStore` source.
enum Source<'a> {
    Set(&'a HashSet<String>),
    Sorted(&'a SortedSet),
}

impl Source<'_> {
    fn len(&self) -> usize {
        match self {
            Source::Set(s) => s.len(),
            Source::Sorted(z) => z.len(),
        }
    }

    fn members(&self) -> Vec<&String> {
        match self {
            Source::Set(s) => s.iter().collect(),
            Source::Sorted(z) => z.scores.keys().collect(),
        }
    }

    /// `None` if not a member; `Some(None)` for a member of a plain set.
    fn lookup(&self, member: &str) -> Option<Option<f64>> {
        match self {
            Source::Set(s) => s.contains(member).then_some(None),
            Source::Sorted(z) => z.get(member).map(Some),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction planning
// ---------------------------------------------------------------------------

/// Dry run of a transaction against key types only. Every command that can
/// fail is rejected here, so the apply phase never stops half way.
struct Plan<'a> {
    inner: &'a MemInner,
    now: Timestamp,
    kinds: HashMap<String, Option<Kind>>,
    fields: HashMap<(String, String), String>,
    cleared: HashSet<String>,
}

impl<'a> Plan<'a> {
    fn new(inner: &'a MemInner, now: Timestamp) -> Self {
        Plan {
            inner,
            now,
            kinds: HashMap::new(),
            fields: HashMap::new(),
            cleared: HashSet::new(),
        }
    }

    fn kind(&self, key: &str) -> Option<Kind> {
        match self.kinds.get(key) {
            Some(k) => *k,
            None => self.inner.live(key, self.now).map(|s| s.value.kind()),
        }
    }

    fn require(&mut self, key: &str, want: Kind) -> Result<(), RankError> {
        match self.kind(key) {
            None => {
                self.kinds.insert(key.to_string(), Some(want));
                Ok(())
            }
            Some(k) if k == want => Ok(()),
            Some(_) => Err(wrong_type(key, want.name())),
        }
    }

    fn clear(&mut self, key: &str, becomes: Option<Kind>) {
        self.cleared.insert(key.to_string());
        self.fields.retain(|(k, _), _| k != key);
        self.kinds.insert(key.to_string(), becomes);
    }

    fn field(&self, key: &str, field: &str) -> Option<String> {
        if let Some(v) = self.fields.get(&(key.to_string(), field.to_string())) {
            return Some(v.clone());
        }
        if self.cleared.contains(key) {
            return None;
        }
        match self.inner.live(key, self.now).map(|s| &s.value) {
            Some(Value::Hash(h)) => h.get(field).cloned(),
            _ => None,
        }
    }

    fn check_guard(&mut self, guard: &Guard) -> Result<(), RankError> {
        match guard {
            Guard::SetInsertNew { key, .. } => self.require(key, Kind::Set),
            Guard::KeyAbsent { .. } | Guard::KeyPresent { .. } => Ok(()),
            Guard::MemberPresent { key, .. } => match self.kind(key) {
                None | Some(Kind::Set) | Some(Kind::Sorted) => Ok(()),
                Some(_) => Err(wrong_type(key, "set or sorted set")),
            },
        }
    }

    fn check(&mut self, cmd: &StoreCommand) -> Result<(), RankError> {
        match cmd {
            StoreCommand::HashSet { key, fields } => {
                self.require(key, Kind::Hash)?;
                for (f, v) in fields {
                    self.fields.insert((key.clone(), f.clone()), v.clone());
                }
            }
            StoreCommand::HashIncr { key, field, by } => {
                self.require(key, Kind::Hash)?;
                let current = self.field(key, field);
                let base = parse_int(key, field, current.as_deref())?;
                let next = checked_incr(key, field, base, *by)?;
                self.fields.insert((key.clone(), field.clone()), next.to_string());
            }
            StoreCommand::SetAdd { key, .. } | StoreCommand::SetRemove { key, .. } => {
                self.require(key, Kind::Set)?;
            }
            StoreCommand::ZAdd { key, .. }
            | StoreCommand::ZIncr { key, .. }
            | StoreCommand::ZRemove { key, .. } => {
                self.require(key, Kind::Sorted)?;
            }
            StoreCommand::ZInterStore { dest, sources, .. } => {
                if sources.is_empty() {
                    return Err(RankError::InvalidArgument(
                        "intersection needs at least one source".into(),
                    ));
                }
                let mut any_missing = false;
                let mut any_sorted = false;
                for src in sources {
                    match self.kind(src) {
                        None => any_missing = true,
                        Some(Kind::Set) => {}
                        Some(Kind::Sorted) => any_sorted = true,
                        Some(_) => return Err(wrong_type(src, "set or sorted set")),
                    }
                }
                if !any_missing && !any_sorted {
                    return Err(RankError::InvalidArgument(
                        "intersection needs at least one ordered source".into(),
                    ));
                }
                self.clear(dest, Some(Kind::Sorted));
            }
            StoreCommand::Expire { .. } => {}
            StoreCommand::Delete { key } => self.clear(key, None),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemInner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    data: HashMap<String, Slot>,
}

impl MemInner {
    fn live(&self, key: &str, now: Timestamp) -> Option<&Slot> {
        self.data.get(key).filter(|s| !s.is_expired(now))
    }

    fn evict_if_expired(&mut self, key: &str, now: Timestamp) {
        if self.data.get(key).is_some_and(|s| s.is_expired(now)) {
            self.data.remove(key);
        }
    }

    fn live_mut(&mut self, key: &str, now: Timestamp) -> Option<&mut Slot> {
        self.evict_if_expired(key, now);
        self.data.get_mut(key)
    }

    fn slot_or_insert(&mut self, key: &str, now: Timestamp, empty: Value) -> &mut Slot {
        self.evict_if_expired(key, now);
        self.data.entry(key.to_string()).or_insert_with(|| Slot::new(empty))
    }

    fn hash_mut(&mut self, key: &str, now: Timestamp) -> Result<&mut HashMap<String, String>, RankError> {
        match &mut self.slot_or_insert(key, now, Value::Hash(HashMap::new())).value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key, "hash")),
        }
    }

    fn set_mut(&mut self, key: &str, now: Timestamp) -> Result<&mut HashSet<String>, RankError> {
        match &mut self.slot_or_insert(key, now, Value::Set(HashSet::new())).value {
            Value::Set(s) => Ok(s),
            _ => Err(wrong_type(key, "set")),
        }
    }

    fn sorted_mut(&mut self, key: &str, now: Timestamp) -> Result<&mut SortedSet, RankError> {
        match &mut self.slot_or_insert(key, now, Value::Sorted(SortedSet::default())).value {
            Value::Sorted(z) => Ok(z),
            _ => Err(wrong_type(key, "sorted set")),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.data.get(key).is_some_and(|s| s.value.is_empty_collection()) {
            self.data.remove(key);
        }
    }

    fn intersect(
        &self,
        sources: &[String],
        aggregate: Aggregate,
        now: Timestamp,
    ) -> Result<SortedSet, RankError> {
        let mut refs = Vec::with_capacity(sources.len());
        for src in sources {
            match self.live(src, now).map(|s| &s.value) {
                None => return Ok(SortedSet::default()),
                Some(Value::Set(s)) => refs.push(Source::Set(s)),
                Some(Value::Sorted(z)) => refs.push(Source::Sorted(z)),
                Some(_) => return Err(wrong_type(src, "set or sorted set")),
            }
        }

        let mut out = SortedSet::default();
        let Some(smallest) = refs.iter().min_by_key(|r| r.len()) else {
            return Ok(out);
        };
        'members: for member in smallest.members() {
            let mut value: Option<f64> = None;
            for r in &refs {
                match r.lookup(member) {
                    None => continue 'members,
                    Some(None) => {}
                    Some(Some(v)) => {
                        value = Some(value.map_or(v, |acc| aggregate.combine(acc, v)));
                    }
                }
            }
            if let Some(v) = value {
                out.insert(member.clone(), v);
            }
        }
        Ok(out)
    }

    fn apply_command(&mut self, cmd: StoreCommand, now: Timestamp) -> Result<CommandResult, RankError> {
        let result = match cmd {
            StoreCommand::HashSet { key, fields } => {
                self.hash_mut(&key, now)?.extend(fields);
                CommandResult::Done
            }
            StoreCommand::HashIncr { key, field, by } => {
                let h = self.hash_mut(&key, now)?;
                let base = parse_int(&key, &field, h.get(&field).map(String::as_str))?;
                let next = checked_incr(&key, &field, base, by)?;
                h.insert(field, next.to_string());
                CommandResult::Int(next)
            }
            StoreCommand::SetAdd { key, member } => {
                CommandResult::Changed(self.set_mut(&key, now)?.insert(member))
            }
            StoreCommand::SetRemove { key, member } => {
                let removed = match self.live_mut(&key, now) {
                    Some(Slot { value: Value::Set(s), .. }) => s.remove(&member),
                    Some(_) => return Err(wrong_type(&key, "set")),
                    None => false,
                };
                self.drop_if_empty(&key);
                CommandResult::Changed(removed)
            }
            StoreCommand::ZAdd { key, member, score } => {
                CommandResult::Changed(self.sorted_mut(&key, now)?.insert(member, score))
            }
            StoreCommand::ZIncr { key, member, by } => {
                CommandResult::Score(self.sorted_mut(&key, now)?.incr(&member, by))
            }
            StoreCommand::ZRemove { key, member } => {
                let removed = match self.live_mut(&key, now) {
                    Some(Slot { value: Value::Sorted(z), .. }) => z.remove(&member),
                    Some(_) => return Err(wrong_type(&key, "sorted set")),
                    None => false,
                };
                self.drop_if_empty(&key);
                CommandResult::Changed(removed)
            }
            StoreCommand::ZInterStore { dest, sources, aggregate } => {
                let out = self.intersect(&sources, aggregate, now)?;
                let count = out.len();
                if count == 0 {
                    self.data.remove(&dest);
                } else {
                    self.data.insert(dest, Slot::new(Value::Sorted(out)));
                }
                CommandResult::Count(count)
            }
            StoreCommand::Expire { key, ttl_secs } => match self.live_mut(&key, now) {
                Some(slot) => {
                    slot.expires_at = Some(now + ttl_secs);
                    CommandResult::Changed(true)
                }
                None => CommandResult::Changed(false),
            },
            StoreCommand::Delete { key } => {
                let was_live = self.live(&key, now).is_some();
                self.data.remove(&key);
                CommandResult::Changed(was_live)
            }
        };
        Ok(result)
    }

    fn execute(&mut self, txn: Transaction, now: Timestamp) -> Result<TxnOutcome, RankError> {
        {
            let mut plan = Plan::new(self, now);
            for guard in &txn.guards {
                plan.check_guard(guard)?;
            }
            for cmd in &txn.commands {
                plan.check(cmd)?;
            }
        }

        for (i, guard) in txn.guards.iter().enumerate() {
            if !self.guard_holds(guard, now) {
                return Ok(TxnOutcome::rejected(i));
            }
        }
        for guard in txn.guards {
            if let Guard::SetInsertNew { key, member } = guard {
                self.set_mut(&key, now)?.insert(member);
            }
        }

        let results = txn
            .commands
            .into_iter()
            .map(|cmd| self.apply_command(cmd, now))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TxnOutcome::committed(results))
    }

    fn guard_holds(&self, guard: &Guard, now: Timestamp) -> bool {
        let contains = |key: &str, member: &str| match self.live(key, now).map(|s| &s.value) {
            Some(Value::Set(s)) => s.contains(member),
            Some(Value::Sorted(z)) => z.get(member).is_some(),
            _ => false,
        };
        match guard {
            Guard::SetInsertNew { key, member } => !contains(key, member),
            Guard::KeyAbsent { key } => self.live(key, now).is_none(),
            Guard::KeyPresent { key } => self.live(key, now).is_some(),
            Guard::MemberPresent { key, member } => contains(key, member),
        }
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory `RankStore`.
///
/// One `RwLock` covers the whole keyspace, so every transaction is a single
/// critical section. Expiry is lazy on access; `purge_expired` reclaims the
/// memory.
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
    clock: Arc<dyn Clock>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemStore {
            inner: Arc::new(RwLock::new(MemInner::default())),
            clock,
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RankStore for MemStore {
    async fn incr(&self, key: &str) -> Result<u64, RankError> {
        let mut g = self.inner.write().await;
        let now = self.clock.now();
        match &mut g.slot_or_insert(key, now, Value::Counter(0)).value {
            Value::Counter(n) => {
                *n = n.checked_add(1).ok_or(RankError::AllocatorExhausted)?;
                Ok(*n)
            }
            _ => Err(wrong_type(key, "counter")),
        }
    }

    async fn apply(&self, txn: Transaction) -> Result<TxnOutcome, RankError> {
        let mut g = self.inner.write().await;
        let now = self.clock.now();
        g.execute(txn, now)
    }

    async fn hash_fields(&self, key: &str) -> Result<Option<HashMap<String, String>>, RankError> {
        let g = self.inner.read().await;
        match g.live(key, self.clock.now()).map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(Some(h.clone())),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn set_len(&self, key: &str) -> Result<usize, RankError> {
        let g = self.inner.read().await;
        match g.live(key, self.clock.now()).map(|s| &s.value) {
            None => Ok(0),
            Some(Value::Set(s)) => Ok(s.len()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn score(&self, key: &str, member: &str) -> Result<Option<f64>, RankError> {
        let g = self.inner.read().await;
        match g.live(key, self.clock.now()).map(|s| &s.value) {
            None => Ok(None),
            Some(Value::Sorted(z)) => Ok(z.get(member)),
            Some(_) => Err(wrong_type(key, "sorted set")),
        }
    }

    async fn range_desc(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, RankError> {
        let g = self.inner.read().await;
        match g.live(key, self.clock.now()).map(|s| &s.value) {
            None => Ok(Vec::new()),
            Some(Value::Sorted(z)) => Ok(z.range_desc(start, stop)),
            Some(_) => Err(wrong_type(key, "sorted set")),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, RankError> {
        Ok(self.inner.read().await.live(key, self.clock.now()).is_some())
    }

    async fn purge_expired(&self) -> Result<usize, RankError> {
        let mut g = self.inner.write().await;
        let now = self.clock.now();
        let before = g.data.len();
        g.data.retain(|_, slot| !slot.is_expired(now));
        let purged = before - g.data.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired keys");
        }
        Ok(purged)
    }
}
