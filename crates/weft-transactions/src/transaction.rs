//! The transaction entity: state machine, nesting protocol, hooks and
//! staging.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use weft_records::{IsolationLevel, RecordStore};
use weft_results::{ResultRef, ResultSettings};

tokio::task_local! {
    static CURRENT_TRANSACTION: Transaction;
}

/// The innermost ambient transaction, if code is running inside a scope.
pub fn current_transaction() -> Option<Transaction> {
    CURRENT_TRANSACTION.try_with(|txn| txn.clone()).ok()
}

fn lock(mutex: &Mutex<TxInner>) -> MutexGuard<'_, TxInner> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//─────────────────────────────
//  Enums and error codes
//─────────────────────────────

/// Policy for when a transaction writes its staged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMode {
    /// Commit at scope exit, always - even inside a lazy parent.
    Eager,
    /// Commit at scope exit only when top-level; nested scopes defer.
    Lazy,
    /// Never commit; the scope rolls back unless someone committed it.
    Off,
}

/// Lifecycle state of a transaction.
///
/// Advances monotonically `PENDING → ACTIVE → (STAGED?) → {COMMITTED,
/// ROLLED_BACK}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Created but not yet entered.
    Pending,
    /// Entered; the body is running.
    Active,
    /// A value has been staged for commit.
    Staged,
    /// Terminal: the staged value (if any) was written.
    Committed,
    /// Terminal: the scope was abandoned.
    RolledBack,
}

/// Errors raised by the transaction protocol itself.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The store cannot honor the requested isolation level.
    #[error("isolation level {level} is not supported by record store type {store}")]
    UnsupportedIsolation {
        /// The level that was requested.
        level: IsolationLevel,
        /// Name of the offending store driver.
        store: &'static str,
    },
    /// `get` without a default for a name that was never set.
    #[error("could not retrieve value for unknown key: {0}")]
    UnknownKey(String),
    /// The scope was entered twice.
    #[error("transaction already entered; enter calls cannot be nested")]
    AlreadyEntered,
    /// Scope exit without a matching enter.
    #[error("transaction exit called without a matching enter")]
    NotEntered,
}

/// A callback invoked with the transaction on commit or rollback.
pub type TransactionHook = Arc<dyn Fn(&Transaction) -> anyhow::Result<()> + Send + Sync>;

//─────────────────────────────
//  Construction options
//─────────────────────────────

/// Options for opening a transaction scope.
#[derive(Clone, Default)]
pub struct TransactionOptions {
    /// Identifier for the transacted record; absence means no persistence
    /// and no locking.
    pub key: Option<String>,
    /// Store records are read from and written through.
    pub store: Option<Arc<dyn RecordStore>>,
    /// When the staged value is committed; unset inherits the parent, else
    /// LAZY.
    pub commit_mode: Option<CommitMode>,
    /// Isolation against concurrent scopes on the same key; unset inherits
    /// the parent, else READ_COMMITTED.
    pub isolation_level: Option<IsolationLevel>,
    /// When true, an existing committed record does not short-circuit the
    /// scope.
    pub overwrite: bool,
    /// Settings consulted when the scope helper synthesizes a default store;
    /// unset falls back to the environment.
    pub settings: Option<ResultSettings>,
}

struct TxInner {
    key: Option<String>,
    store: Option<Arc<dyn RecordStore>>,
    state: TransactionState,
    commit_mode: Option<CommitMode>,
    isolation_level: Option<IsolationLevel>,
    overwrite: bool,
    children: Vec<Transaction>,
    on_commit_hooks: Vec<TransactionHook>,
    on_rollback_hooks: Vec<TransactionHook>,
    staged_value: Option<ResultRef>,
    stored_values: HashMap<String, Value>,
    parent: Option<Transaction>,
    entered: bool,
    holds_lock: bool,
}

impl Drop for TxInner {
    fn drop(&mut self) {
        // Backstop for cancelled scopes: a held per-key lock must not
        // outlive the transaction that took it.
        if self.holds_lock {
            if let (Some(store), Some(key)) = (&self.store, &self.key) {
                store.release_lock(key);
            }
        }
    }
}

//─────────────────────────────
//  Transaction handle
//─────────────────────────────

/// A nested transactional execution context.
///
/// Cheap cloneable handle; clones share state, and equality is identity. A
/// transaction is created per scope, entered once, exited once. Use
/// [`run`](Self::run) (or the [`transaction()`](fn@crate::transaction)
/// helper) to drive the scope: it installs the transaction as the ambient
/// one for the body and guarantees the exit protocol on every path.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<TxInner>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(TransactionOptions::default())
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tx = lock(&self.inner);
        f.debug_struct("Transaction")
            .field("key", &tx.key)
            .field("state", &tx.state)
            .field("commit_mode", &tx.commit_mode)
            .field("isolation_level", &tx.isolation_level)
            .field("children", &tx.children.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Create a transaction in the PENDING state.
    pub fn new(options: TransactionOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TxInner {
                key: options.key,
                store: options.store,
                state: TransactionState::Pending,
                commit_mode: options.commit_mode,
                isolation_level: options.isolation_level,
                overwrite: options.overwrite,
                children: Vec::new(),
                on_commit_hooks: Vec::new(),
                on_rollback_hooks: Vec::new(),
                staged_value: None,
                stored_values: HashMap::new(),
                parent: None,
                entered: false,
                holds_lock: false,
            })),
        }
    }

    //──────────── accessors ────────────

    /// The record key, if this scope persists anything.
    pub fn key(&self) -> Option<String> {
        lock(&self.inner).key.clone()
    }

    /// The record store, if one was attached.
    pub fn store(&self) -> Option<Arc<dyn RecordStore>> {
        lock(&self.inner).store.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        lock(&self.inner).state
    }

    /// The commit mode; `None` until defaulted at enter.
    pub fn commit_mode(&self) -> Option<CommitMode> {
        lock(&self.inner).commit_mode
    }

    /// The isolation level; `None` until defaulted at enter.
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        lock(&self.inner).isolation_level
    }

    /// Child transactions, in the order they completed.
    pub fn children(&self) -> Vec<Transaction> {
        lock(&self.inner).children.clone()
    }

    /// The parent captured at enter, if this scope is nested.
    pub fn parent(&self) -> Option<Transaction> {
        lock(&self.inner).parent.clone()
    }

    /// The value staged for commit, if any.
    pub fn staged_value(&self) -> Option<ResultRef> {
        lock(&self.inner).staged_value.clone()
    }

    /// Whether the state is PENDING.
    pub fn is_pending(&self) -> bool {
        self.state() == TransactionState::Pending
    }

    /// Whether the state is ACTIVE.
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Whether the state is STAGED.
    pub fn is_staged(&self) -> bool {
        self.state() == TransactionState::Staged
    }

    /// Whether the state is COMMITTED.
    pub fn is_committed(&self) -> bool {
        self.state() == TransactionState::Committed
    }

    /// Whether the state is ROLLED_BACK.
    pub fn is_rolled_back(&self) -> bool {
        self.state() == TransactionState::RolledBack
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            TransactionState::Committed | TransactionState::RolledBack
        )
    }

    //──────────── scope protocol ────────────

    /// Enter the scope: capture the ambient parent, inherit stored values
    /// and unset modes, verify isolation support, then begin.
    ///
    /// Exposed for drivers that manage scoping themselves; most callers use
    /// [`run`](Self::run), which also installs the ambient frame.
    pub async fn enter(&self) -> Result<(), TransactionError> {
        let parent = current_transaction();
        let inherited = parent.as_ref().map(|parent| {
            let tx = lock(&parent.inner);
            (tx.stored_values.clone(), tx.commit_mode, tx.isolation_level)
        });

        let (store, key, isolation_level, overwrite) = {
            let mut tx = lock(&self.inner);
            if tx.entered {
                return Err(TransactionError::AlreadyEntered);
            }
            if let Some((stored_values, commit_mode, isolation_level)) = inherited {
                tx.stored_values = stored_values;
                if tx.commit_mode.is_none() {
                    tx.commit_mode = commit_mode;
                }
                if tx.isolation_level.is_none() {
                    tx.isolation_level = isolation_level;
                }
            }
            if tx.commit_mode.is_none() {
                tx.commit_mode = Some(CommitMode::Lazy);
            }
            let isolation_level = match tx.isolation_level {
                Some(level) => level,
                None => {
                    tx.isolation_level = Some(IsolationLevel::ReadCommitted);
                    IsolationLevel::ReadCommitted
                }
            };

            if let (Some(store), Some(_)) = (&tx.store, &tx.key) {
                if !store.supports_isolation_level(isolation_level) {
                    return Err(TransactionError::UnsupportedIsolation {
                        level: isolation_level,
                        store: store.name(),
                    });
                }
            }

            tx.parent = parent;
            tx.entered = true;
            // before begin, which may move the state straight to COMMITTED
            tx.state = TransactionState::Active;
            (tx.store.clone(), tx.key.clone(), isolation_level, tx.overwrite)
        };

        if let (Some(store), Some(key)) = (store, key) {
            if isolation_level == IsolationLevel::Serializable {
                debug!(key = %key, "acquiring lock for transaction");
                store.acquire_lock(&key).await;
                lock(&self.inner).holds_lock = true;
            }
            // the read-through short-circuit: re-executing a committed step
            // is a no-op
            if !overwrite && store.exists(&key).await {
                lock(&self.inner).state = TransactionState::Committed;
            }
        }
        Ok(())
    }

    /// Exit the scope without an error in flight.
    ///
    /// EAGER commits here; a nested scope then defers everything else to its
    /// parent, a top-level OFF scope rolls back and a top-level LAZY scope
    /// commits. `reset` runs on every path.
    pub async fn exit(&self) -> Result<(), TransactionError> {
        let (entered, commit_mode, has_parent) = {
            let tx = lock(&self.inner);
            (tx.entered, tx.commit_mode, tx.parent.is_some())
        };
        if !entered {
            return Err(TransactionError::NotEntered);
        }

        if commit_mode == Some(CommitMode::Eager) {
            self.commit().await;
        }

        // with a parent, let it take responsibility
        if has_parent {
            self.reset();
            return Ok(());
        }

        match commit_mode {
            Some(CommitMode::Off) => {
                // nobody took responsibility to commit; rollback returns
                // early if someone already did
                self.rollback();
            }
            Some(CommitMode::Lazy) => {
                self.commit().await;
            }
            _ => {}
        }

        self.reset();
        Ok(())
    }

    /// Drive a full scope around `body`.
    ///
    /// The transaction is entered, installed as the ambient transaction for
    /// the body future, and exited when the body completes. A body error
    /// rolls the scope back, resets it and propagates.
    pub async fn run<F, Fut, T>(&self, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.enter().await?;
        let outcome = CURRENT_TRANSACTION
            .scope(self.clone(), body(self.clone()))
            .await;
        match outcome {
            Ok(value) => {
                self.exit().await?;
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                self.reset();
                Err(err)
            }
        }
    }

    /// Detach from the ambient stack: attach self to the parent's children
    /// and cascade a rollback upward after the ambient frame is restored.
    pub fn reset(&self) {
        let (parent, rolled_back) = {
            let tx = lock(&self.inner);
            (tx.parent.clone(), tx.state == TransactionState::RolledBack)
        };
        if let Some(parent) = parent {
            parent.add_child(self.clone());
            // after the pop, so the ambient transaction during the cascade
            // is the parent
            if rolled_back {
                parent.rollback();
            }
        }
    }

    /// Record `child` as completed under this transaction.
    pub fn add_child(&self, child: Transaction) {
        lock(&self.inner).children.push(child);
    }

    //──────────── commit / rollback ────────────

    /// Commit this transaction: children first, then commit hooks in
    /// insertion order, then the store write.
    ///
    /// Returns false without re-transitioning when already terminal, and on
    /// any failure after rolling back. The per-key lock is released on every
    /// path.
    pub fn commit(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if self.is_terminal() {
                self.release_lock_if_held();
                return false;
            }
            match self.commit_inner().await {
                Ok(()) => true,
                Err(err) => {
                    error!(key = ?self.key(), error = %err, "error encountered while committing transaction");
                    self.rollback();
                    false
                }
            }
        })
    }

    fn commit_child(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            if self.is_terminal() {
                self.release_lock_if_held();
                return Ok(());
            }
            self.commit_inner().await
        })
    }

    async fn commit_inner(&self) -> anyhow::Result<()> {
        let children = lock(&self.inner).children.clone();
        for child in &children {
            child.commit_child().await?;
        }

        let hooks = lock(&self.inner).on_commit_hooks.clone();
        for hook in &hooks {
            self.run_hook(hook, "commit")?;
        }

        let (store, key, staged_value) = {
            let tx = lock(&self.inner);
            (tx.store.clone(), tx.key.clone(), tx.staged_value.clone())
        };
        if let (Some(store), Some(key)) = (store, key) {
            store.write(&key, staged_value).await?;
        }

        lock(&self.inner).state = TransactionState::Committed;
        self.release_lock_if_held();
        Ok(())
    }

    /// Roll this transaction back: rollback hooks in reverse insertion
    /// order, then the transition, then children in reverse order.
    ///
    /// Returns false when already terminal or when one of this scope's own
    /// hooks failed; hook failures are logged and swallowed, and the
    /// ROLLED_BACK transition happens regardless.
    pub fn rollback(&self) -> bool {
        {
            let tx = lock(&self.inner);
            if matches!(
                tx.state,
                TransactionState::Committed | TransactionState::RolledBack
            ) {
                return false;
            }
        }

        let hooks = lock(&self.inner).on_rollback_hooks.clone();
        let mut hook_failed = false;
        for hook in hooks.iter().rev() {
            if self.run_hook(hook, "rollback").is_err() {
                hook_failed = true;
            }
        }

        let children = {
            let mut tx = lock(&self.inner);
            tx.state = TransactionState::RolledBack;
            tx.children.clone()
        };
        for child in children.iter().rev() {
            child.rollback();
        }

        self.release_lock_if_held();
        !hook_failed
    }

    fn run_hook(&self, hook: &TransactionHook, hook_type: &str) -> anyhow::Result<()> {
        info!(hook_type, "running transaction hook");
        match hook(self) {
            Ok(()) => {
                info!(hook_type, "transaction hook finished successfully");
                Ok(())
            }
            Err(err) => {
                error!(hook_type, error = %err, "error encountered while running transaction hook");
                Err(err)
            }
        }
    }

    fn release_lock_if_held(&self) {
        let release = {
            let mut tx = lock(&self.inner);
            if tx.holds_lock {
                tx.holds_lock = false;
                match (&tx.store, &tx.key) {
                    (Some(store), Some(key)) => Some((store.clone(), key.clone())),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some((store, key)) = release {
            debug!(key = %key, "releasing lock for transaction");
            store.release_lock(&key);
        }
    }

    //──────────── staging and data ────────────

    /// Stage `value` to be committed later, appending any hooks.
    ///
    /// On an already-committed transaction (set by the read-through
    /// short-circuit) this is a silent no-op: the committed value wins and
    /// user stages are dropped.
    pub fn stage(
        &self,
        value: ResultRef,
        on_rollback_hooks: Vec<TransactionHook>,
        on_commit_hooks: Vec<TransactionHook>,
    ) {
        let mut tx = lock(&self.inner);
        if tx.state != TransactionState::Committed {
            tx.staged_value = Some(value);
            tx.on_rollback_hooks.extend(on_rollback_hooks);
            tx.on_commit_hooks.extend(on_commit_hooks);
            tx.state = TransactionState::Staged;
        }
    }

    /// Stage `value` with no additional hooks.
    pub fn stage_value(&self, value: ResultRef) {
        self.stage(value, Vec::new(), Vec::new());
    }

    /// Register a commit hook.
    pub fn on_commit(&self, hook: TransactionHook) {
        lock(&self.inner).on_commit_hooks.push(hook);
    }

    /// Register a rollback hook.
    pub fn on_rollback(&self, hook: TransactionHook) {
        lock(&self.inner).on_rollback_hooks.push(hook);
    }

    /// Read the committed record's result for this key, if any.
    pub async fn read(&self) -> Option<ResultRef> {
        let (store, key) = {
            let tx = lock(&self.inner);
            (tx.store.clone(), tx.key.clone())
        };
        match (store, key) {
            (Some(store), Some(key)) => store.read(&key).await.and_then(|record| record.result),
            _ => None,
        }
    }

    /// Store a scope-local value, visible to children entered afterwards.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        lock(&self.inner).stored_values.insert(name.into(), value);
    }

    /// Retrieve a stored value; unknown names fail.
    pub fn get(&self, name: &str) -> Result<Value, TransactionError> {
        lock(&self.inner)
            .stored_values
            .get(name)
            .cloned()
            .ok_or_else(|| TransactionError::UnknownKey(name.to_string()))
    }

    /// Retrieve a stored value, falling back to `default`.
    pub fn get_or(&self, name: &str, default: Value) -> Value {
        lock(&self.inner)
            .stored_values
            .get(name)
            .cloned()
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_init() {
        let txn = Transaction::default();
        assert!(txn.store().is_none());
        assert_eq!(txn.state(), TransactionState::Pending);
        assert!(txn.is_pending());
        assert!(txn.commit_mode().is_none());
    }

    #[test]
    fn test_handle_equality_is_identity() {
        let txn1 = Transaction::default();
        let txn2 = Transaction::default();
        let alias = txn1.clone();
        assert_ne!(txn1, txn2);
        assert_eq!(txn1, alias);
    }

    #[test]
    fn test_state_predicates_are_consistent() {
        let states = [
            TransactionState::Pending,
            TransactionState::Active,
            TransactionState::Staged,
            TransactionState::Committed,
            TransactionState::RolledBack,
        ];
        for state in states {
            let txn = Transaction::default();
            lock(&txn.inner).state = state;
            assert_eq!(txn.is_pending(), state == TransactionState::Pending);
            assert_eq!(txn.is_active(), state == TransactionState::Active);
            assert_eq!(txn.is_staged(), state == TransactionState::Staged);
            assert_eq!(txn.is_committed(), state == TransactionState::Committed);
            assert_eq!(txn.is_rolled_back(), state == TransactionState::RolledBack);
        }
    }

    #[tokio::test]
    async fn test_terminal_transitions_are_final() {
        let txn = Transaction::default();
        txn.enter().await.unwrap();
        assert!(txn.rollback());
        assert!(!txn.rollback());
        assert!(!txn.commit().await);
        assert!(txn.is_rolled_back());
    }

    #[tokio::test]
    async fn test_enter_cannot_be_nested() {
        let txn = Transaction::default();
        txn.enter().await.unwrap();
        assert!(matches!(
            txn.enter().await,
            Err(TransactionError::AlreadyEntered)
        ));
    }

    #[tokio::test]
    async fn test_exit_requires_enter() {
        let txn = Transaction::default();
        assert!(matches!(
            txn.exit().await,
            Err(TransactionError::NotEntered)
        ));
    }

    #[tokio::test]
    async fn test_get_and_set_data() {
        let txn = Transaction::default();
        txn.set("x", json!(42));
        assert_eq!(txn.get("x").unwrap(), json!(42));
        assert!(matches!(
            txn.get("missing"),
            Err(TransactionError::UnknownKey(name)) if name == "missing"
        ));
        assert_eq!(txn.get_or("missing", Value::Null), Value::Null);
        assert_eq!(txn.get_or("missing", json!("s")), json!("s"));
    }
}
