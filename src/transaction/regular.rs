use std::any::Any;
cfg_if::cfg_if! {
    if #[cfg(feature = "hash-registers")] {
        use std::collections::hash_map::Entry;
    } else {
        use std::collections::{btree_map::Entry, BTreeMap};
    }
}
use std::mem;
use std::sync::Arc;

use crate::clock;
use crate::result::{StmClosureResult, StmError};
use crate::tvar::TVar;
use crate::{TransactionClosureResult, TransactionControl, TransactionError, TransactionResult};

#[cfg(feature = "wait-on-retry")]
use super::control_block::ControlBlock;
use super::log_var::{observe_eq, LogVar, Observed};
use super::RegisterType;
use super::TransactionGuard;

/// Run a function atomically by using Software Transactional Memory.
/// It calls to `Transaction::with` internally, but is more explicit.
pub fn atomically<T, F>(f: F) -> T
where
    F: Fn(&mut Transaction) -> StmClosureResult<T>,
{
    Transaction::with(f)
}

/// Run a function atomically by using Software Transactional Memory.
/// It calls to `Transaction::with_err` internally, but is more explicit.
pub fn atomically_with_err<T, E, F>(f: F) -> Result<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    Transaction::with_err(f)
}

/// Transaction tracks all the read and written variables.
///
/// It is used for checking vars, to ensure atomicity.
pub struct Transaction {
    /// Map of all vars that map the `VarControlBlock` of a var to a `LogVar`.
    /// The `VarControlBlock` is unique because it uses it's address for comparing.
    ///
    /// The logs need to be accessed in a order to prevend dead-locks on locking.
    vars: RegisterType,
}

impl Transaction {
    /// Create a new log.
    ///
    /// Normally you don't need to call this directly.
    /// Use `atomically` instead.
    fn new() -> Transaction {
        Transaction {
            #[cfg(not(feature = "hash-registers"))]
            vars: BTreeMap::new(),
            #[cfg(feature = "hash-registers")]
            vars: rustc_hash::FxHashMap::default(),
        }
    }

    /// Run a function with a transaction.
    ///
    /// It is equivalent to `atomically`.
    pub fn with<T, F>(f: F) -> T
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        match Transaction::with_control(|_| TransactionControl::Retry, f) {
            Some(t) => t,
            None => unreachable!(),
        }
    }

    /// Run a function with a transaction.
    ///
    /// `with_control` takes another control function, that
    /// can steer the control flow and possible terminate early.
    ///
    /// `control` can react to counters, timeouts or external inputs.
    ///
    /// It allows the user to fall back to another strategy, like a global lock
    /// in the case of too much contention.
    ///
    /// Please note that the transaction may still infinitely wait for changes when `retry` is
    /// called and `control` does not abort.
    /// If you need a timeout, another thread should signal this through a [`TVar`].
    pub fn with_control<T, F, C>(mut control: C, f: F) -> Option<T>
    where
        F: Fn(&mut Transaction) -> StmClosureResult<T>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();

        // create a log guard for initializing and cleaning up
        // the log
        let mut transaction = Transaction::new();

        // loop until success
        loop {
            // run the computation
            match f(&mut transaction) {
                // on success exit loop
                Ok(t) => {
                    if transaction.commit() {
                        return Some(t);
                    }
                }

                Err(e) => {
                    // Check if the user wants to abort the transaction.
                    if let TransactionControl::Abort = control(e) {
                        return None;
                    }

                    // on retry wait for changes
                    #[cfg(feature = "wait-on-retry")]
                    if let StmError::Retry = e {
                        transaction.wait_for_change();
                    }
                }
            }

            // clear log before retrying computation
            transaction.clear();
        }
    }

    /// Run a function with a transaction.
    ///
    /// The transaction will be retried until it is validated, or it is
    /// explicitly aborted from the function with [`crate::abort`].
    pub fn with_err<T, F, E>(f: F) -> Result<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        let _guard = TransactionGuard::new();

        let mut transaction = Transaction::new();

        loop {
            match f(&mut transaction) {
                Ok(t) => {
                    if transaction.commit() {
                        return Ok(t);
                    }
                }
                Err(e) => match e {
                    TransactionError::Abort(err) => return Err(err),
                    TransactionError::Stm(_) => {
                        #[cfg(feature = "wait-on-retry")]
                        transaction.wait_for_change();
                    }
                },
            }

            transaction.clear();
        }
    }

    /// Run a function with a transaction.
    ///
    /// `with_control` takes another control function, that
    /// can steer the control flow and possible terminate early.
    ///
    /// `control` can react to counters, timeouts or external inputs.
    ///
    /// It allows the user to fall back to another strategy, like a global lock
    /// in the case of too much contention.
    ///
    /// Please note that the transaction may still infinitely wait for changes when `retry` is
    /// called and `control` does not abort.
    /// If you need a timeout, another thread should signal this through a [`TVar`].
    pub fn with_control_and_err<T, F, C, E>(mut control: C, f: F) -> TransactionResult<T, E>
    where
        F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
        C: FnMut(StmError) -> TransactionControl,
    {
        let _guard = TransactionGuard::new();

        let mut transaction = Transaction::new();

        loop {
            match f(&mut transaction) {
                Ok(t) => {
                    if transaction.commit() {
                        return TransactionResult::Validated(t);
                    }
                }

                Err(e) => match e {
                    TransactionError::Abort(err) => {
                        return TransactionResult::Cancelled(err);
                    }
                    TransactionError::Stm(err) => {
                        if let TransactionControl::Abort = control(err) {
                            return TransactionResult::Abandoned;
                        }

                        #[cfg(feature = "wait-on-retry")]
                        if let StmError::Retry = err {
                            transaction.wait_for_change();
                        }
                    }
                },
            }

            transaction.clear();
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    /// Perform a downcast on a var.
    fn downcast<T: Any + Clone>(var: Arc<dyn Any + Send + Sync>) -> T {
        match var.downcast_ref::<T>() {
            Some(s) => s.clone(),
            None => unreachable!("TVar has wrong type"),
        }
    }

    /// Read a variable and return the value.
    ///
    /// The returned value is not always consistent with the current value of the var,
    /// but may be an outdated or or not yet commited value.
    ///
    /// The used code should be capable of handling inconsistent states
    /// without running into infinite loops.
    /// Just the commit of wrong values is prevented by STM.
    pub fn read<T: Send + Sync + Any + Clone + PartialEq>(
        &mut self,
        var: &TVar<T>,
    ) -> StmClosureResult<T> {
        let ctrl = var.control_block().clone();
        #[cfg(not(feature = "hash-registers"))]
        let key = ctrl;
        #[cfg(feature = "hash-registers")]
        let key = Arc::as_ptr(&ctrl);
        let value = match self.vars.entry(key) {
            // If the variable has been accessed before, then load that value.
            #[cfg(feature = "early-conflict-detection")]
            Entry::Occupied(mut entry) => {
                let log = entry.get_mut();
                // if we previously read the var, check for value change
                if let LogVar::Read(observed) = log {
                    let (crt_v, crt_version) = var.read_ref_version_atomic();
                    let stale = crt_version != observed.version
                        && !(observed.eq)(&observed.value, &crt_v);
                    if stale {
                        return Err(StmError::Failure);
                    }
                }
                log.read()
            }
            #[cfg(not(feature = "early-conflict-detection"))]
            Entry::Occupied(mut entry) => entry.get_mut().read(),

            // Else load the variable statically.
            Entry::Vacant(entry) => {
                let (value, version) = var.read_ref_version_atomic();
                let observed = Observed {
                    value: value.clone(),
                    version,
                    eq: observe_eq::<T>,
                };
                entry.insert(LogVar::Read(observed));
                value
            }
        };

        Ok(Transaction::downcast(value))
    }

    /// Write a variable.
    ///
    /// The write is not immediately visible to other threads,
    /// but atomically commited at the end of the computation.
    pub fn write<T: Any + Send + Sync + Clone + PartialEq>(
        &mut self,
        var: &TVar<T>,
        value: T,
    ) -> StmClosureResult<()> {
        let boxed = Arc::new(value);

        let ctrl = var.control_block().clone();
        #[cfg(not(feature = "hash-registers"))]
        let key = ctrl;
        #[cfg(feature = "hash-registers")]
        let key = Arc::as_ptr(&ctrl);
        match self.vars.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().write(boxed),
            Entry::Vacant(entry) => {
                entry.insert(LogVar::Write(boxed));
            }
        }

        Ok(())
    }

    /// Combine two calculations. When one blocks with `retry`,
    /// run the other, but don't commit the changes in the first.
    ///
    /// If both block, `Transaction::or` still waits for `TVar`s in both functions.
    /// Use `Transaction::or` instead of handling errors directly with the `Result::or`.
    /// The later does not handle all the blocking correctly.
    pub fn or<T, F1, F2>(&mut self, first: F1, second: F2) -> StmClosureResult<T>
    where
        F1: Fn(&mut Transaction) -> StmClosureResult<T>,
        F2: Fn(&mut Transaction) -> StmClosureResult<T>,
    {
        // Create a backup of the log.
        let mut copy = Transaction {
            vars: self.vars.clone(),
        };

        // Run the first computation.
        let f = first(self);

        match f {
            // Run other on manual retry call.
            Err(StmError::Retry) => {
                // swap, so that self is the current run
                mem::swap(self, &mut copy);

                // Run other action.
                let s = second(self);

                // If both called retry then exit.
                match s {
                    Err(StmError::Failure) => Err(StmError::Failure),
                    s => {
                        self.combine(copy);
                        s
                    }
                }
            }

            // Return success and failure directly
            x => x,
        }
    }

    /// Combine two logs into a single log, to allow waiting for all reads.
    ///
    /// Used by `or`, and by the `select` combinator, to merge a discarded
    /// alternative's reads into the surviving log so the eventual `retry`
    /// blocks on the union of everything tried.
    pub(crate) fn combine(&mut self, other: Transaction) {
        for (var, value) in other.vars {
            if let Some(value) = value.obsolete() {
                self.vars.entry(var).or_insert(value);
            }
        }
    }

    /// A fresh copy of this log's contents, for combinators that need to
    /// try an alternative against an unperturbed snapshot.
    pub(crate) fn snapshot(&self) -> Transaction {
        Transaction {
            vars: self.vars.clone(),
        }
    }

    /// Clear the log's data.
    ///
    /// This should be used before redoing a computation, but
    /// nowhere else.
    fn clear(&mut self) {
        self.vars.clear();
    }

    /// Wait for any variable to change,
    /// because the change may lead to a new calculation result.
    #[cfg(feature = "wait-on-retry")]
    fn wait_for_change(&mut self) {
        // Create control block for waiting.
        let ctrl = Arc::new(ControlBlock::new());

        #[allow(clippy::mutable_key_type)]
        let vars = std::mem::take(&mut self.vars);
        let mut reads = Vec::with_capacity(vars.len());

        let blocking = vars
            .into_iter()
            .filter_map(|(a, b)| b.into_observed().map(|b| (a, b)))
            // Register for wakeup, then check for consistency: a write may
            // have happened between the observation and the registration.
            .all(|(var, observed)| {
                #[cfg(feature = "hash-registers")]
                let var = unsafe { var.as_ref() }.expect("E: unreachable");
                var.register_waiter(&ctrl);
                let still_consistent = {
                    let guard = var.value.read();
                    let crt_version = var.version();
                    crt_version == observed.version || (observed.eq)(&observed.value, &guard)
                };
                reads.push(var);
                still_consistent
            });

        // If no var has changed, then block.
        if blocking {
            ctrl.wait();
        }

        // Prune dead waiters opportunistically; harmless if we prune too
        // eagerly or too little.
        for var in &reads {
            var.prune_waiters();
        }
    }

    /// Write the log back to the variables.
    ///
    /// Return true for success and false, if a read var has changed
    fn commit(&mut self) -> bool {
        // Use two phase locking for safely writing data back to the vars.

        // First phase: acquire locks. Check for consistency of all the
        // reads and perform an early return if something is not
        // consistent. A read is consistent if either its version matches
        // (the cheap, common case) or, failing that, its value still
        // compares equal under the var's equality function (the
        // authoritative check, catching payloads mutated in place without
        // a version bump — see the design note on value-based validation).
        let mut read_vec = Vec::with_capacity(self.vars.len());
        let mut write_vec = Vec::with_capacity(self.vars.len());

        #[cfg(feature = "hash-registers")]
        let records = {
            let mut recs: Vec<_> = self.vars.iter().collect();
            recs.sort_by(|(k1, _), (k2, _)| k1.cmp(k2));
            recs
        };
        #[cfg(not(feature = "hash-registers"))]
        let records = &self.vars;

        for (var, value) in records {
            #[cfg(feature = "hash-registers")]
            let var = unsafe { var.as_ref() }.expect("E: unreachable");

            match *value {
                LogVar::Write(ref w) | LogVar::ReadObsoleteWrite(_, ref w) => {
                    let lock = var.value.write();
                    write_vec.push((var, w, lock));
                }

                LogVar::ReadWrite(ref observed, ref w) => {
                    let lock = var.value.write();

                    if !Transaction::still_valid(observed, &lock, var.version()) {
                        return false;
                    }
                    write_vec.push((var, w, lock));
                }

                // Nothing to do. ReadObsolete is only needed for blocking,
                // not for consistency checks.
                LogVar::ReadObsolete(_) => {}

                LogVar::Read(ref observed) => {
                    let lock = var.value.read();

                    if !Transaction::still_valid(observed, &lock, var.version()) {
                        return false;
                    }

                    read_vec.push(lock);
                }
            }
        }

        // Second phase: write back and release.

        // Release the reads first so other threads can continue quickly.
        drop(read_vec);

        if !write_vec.is_empty() {
            // One tick shared by every Var this commit writes. Stamp the
            // version while still holding that var's own write lock, so
            // value and version move together and no concurrent validator
            // can observe the new value under the stale version.
            let tick = clock::tick();
            #[cfg(feature = "wait-on-retry")]
            let written: Vec<_> = write_vec.iter().map(|(var, ..)| *var).collect();
            for (var, value, mut lock) in write_vec {
                *lock = value.clone();
                var.set_version(tick);
                drop(lock);
            }

            #[cfg(feature = "wait-on-retry")]
            for var in written {
                var.wake_all();
            }
        }

        true
    }

    /// Authoritative validity check for one read: version match is the
    /// fast path, structural equality (via the observed `eq` function) is
    /// what makes validation correct when a value mutated in place without
    /// a version bump.
    fn still_valid(
        observed: &Observed,
        current: &Arc<dyn Any + Send + Sync>,
        current_version: u64,
    ) -> bool {
        current_version == observed.version || (observed.eq)(&observed.value, current)
    }
}
