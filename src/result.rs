#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum StmError {
    /// The call failed, because a variable, the computation
    /// depends on, has changed.
    #[error("Transaction failure signal")]
    Failure,

    /// `retry` was called.
    ///
    /// It may block until at least one read variable has changed.
    #[error("Transaction retry signal")]
    Retry,
}

/// `StmClosureResult` is the result of a single step of a STM calculation.
///
/// It informs of success or the type of failure. Normally you should not use
/// it directly. Especially recovering from an error, e.g. by using `action1.or(action2)`
/// can break the semantics of stm, and cause delayed wakeups or deadlocks.
///
/// For the later case, there is `select`/`Transaction::or`, which is safe to use.
pub type StmClosureResult<T> = Result<T, StmError>;

#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum TransactionError<E> {
    /// Failed due to [`StmError`].
    #[error(transparent)]
    Stm(#[from] StmError),
    /// `abort` was called.
    ///
    /// The transaction will be aborted and the error returned.
    #[error("transaction aborted")]
    Abort(E),
}

/// Result type of a fallible transaction body.
pub type TransactionClosureResult<T, E> = Result<T, TransactionError<E>>;

/// Outcome of a transaction run with a control function that may abandon it.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum TransactionResult<T, E> {
    /// The transaction committed successfully.
    Validated(T),
    /// The transaction called `abort` with a user error.
    Cancelled(E),
    /// The control function chose to stop retrying.
    Abandoned,
}
