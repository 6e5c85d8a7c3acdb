/// How values are combined when a member appears in several ordered sources
/// of an intersection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Aggregate {
    #[default]
    Max,
}

impl Aggregate {
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Aggregate::Max => a.max(b),
        }
    }
}

/// A single write applied inside a [`Transaction`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StoreCommand {
    /// Set hash fields, creating the hash if needed.
    HashSet { key: String, fields: Vec<(String, String)> },
    /// Add `by` to an integer hash field (missing field counts as 0).
    HashIncr { key: String, field: String, by: i64 },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    /// Insert or overwrite a member's value in an ordered index.
    ZAdd { key: String, member: String, score: f64 },
    /// Add `by` to a member's value (missing member counts as 0).
    ZIncr { key: String, member: String, by: f64 },
    ZRemove { key: String, member: String },
    /// Replace `dest` with the intersection of `sources`.
    ///
    /// Plain sets restrict membership only. Ordered sources contribute values,
    /// combined with `aggregate` when more than one carries the member. At
    /// least one source must be ordered. An empty result deletes `dest`.
    ZInterStore { dest: String, sources: Vec<String>, aggregate: Aggregate },
    /// Expire `key` `ttl_secs` from now. No-op on a missing key.
    Expire { key: String, ttl_secs: f64 },
    Delete { key: String },
}

impl StoreCommand {
    /// The key this command writes.
    pub fn target(&self) -> &str {
        match self {
            StoreCommand::HashSet { key, .. }
            | StoreCommand::HashIncr { key, .. }
            | StoreCommand::SetAdd { key, .. }
            | StoreCommand::SetRemove { key, .. }
            | StoreCommand::ZAdd { key, .. }
            | StoreCommand::ZIncr { key, .. }
            | StoreCommand::ZRemove { key, .. }
            | StoreCommand::Expire { key, .. }
            | StoreCommand::Delete { key } => key,
            StoreCommand::ZInterStore { dest, .. } => dest,
        }
    }
}

/// Condition evaluated atomically before a transaction's commands.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Guard {
    /// Insert `member` into the set at `key`; holds only if it was not
    /// already present. The insert is part of the transaction.
    SetInsertNew { key: String, member: String },
    /// Holds only if `key` does not exist (or has expired).
    KeyAbsent { key: String },
    /// Holds only if `key` exists and has not expired.
    KeyPresent { key: String },
    /// Holds only if `member` belongs to the set or ordered index at `key`.
    MemberPresent { key: String, member: String },
}

/// An all-or-nothing batch of writes, gated by zero or more [`Guard`]s.
///
/// Every guard is evaluated before anything is written; the inserts implied
/// by `SetInsertNew` happen only once all guards hold.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub guards: Vec<Guard>,
    pub commands: Vec<StoreCommand>,
}

impl Transaction {
    pub fn new(commands: Vec<StoreCommand>) -> Self {
        Transaction { guards: Vec::new(), commands }
    }

    pub fn guarded(guard: Guard, commands: Vec<StoreCommand>) -> Self {
        Transaction { guards: vec![guard], commands }
    }

    pub fn with_guards(guards: Vec<Guard>, commands: Vec<StoreCommand>) -> Self {
        Transaction { guards, commands }
    }
}

/// Per-command result, in command order.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Whether the command changed anything (set/zset membership, deletes,
    /// expiry on an existing key).
    Changed(bool),
    /// New integer value after `HashIncr`.
    Int(i64),
    /// New value after `ZIncr`.
    Score(f64),
    /// Cardinality of the `ZInterStore` destination.
    Count(usize),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxnOutcome {
    /// `false` when a guard did not hold; nothing was written.
    pub committed: bool,
    /// Index of the first guard that did not hold.
    pub failed_guard: Option<usize>,
    pub results: Vec<CommandResult>,
}

impl TxnOutcome {
    pub fn committed(results: Vec<CommandResult>) -> Self {
        TxnOutcome { committed: true, failed_guard: None, results }
    }

    pub fn rejected(guard: usize) -> Self {
        TxnOutcome { committed: false, failed_guard: Some(guard), results: Vec::new() }
    }
}
