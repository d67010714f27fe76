//! N-ary generalizations of [`Transaction::or`](crate::Transaction::or).
//!
//! `Transaction::or` only combines two alternatives. `select` and `compose`
//! build on the same snapshot/retry/combine machinery to run a whole slice
//! of alternatives or sub-procedures without the caller having to fold
//! manually.

use crate::result::{StmClosureResult, StmError};
use crate::transaction::Transaction;

/// Try each alternative in `fs`, in order, against the same starting state.
///
/// The first alternative that does not call `retry()` wins; its writes are
/// the ones that end up in `tx`. Every alternative that did call `retry()`
/// contributes its reads to `tx`, so that if all of them retry, the whole
/// `select` blocks on the union of everything it tried.
///
/// `select(tx, &[])` itself always retries: selecting from nothing never
/// succeeds. `select(tx, &[f])` is equivalent to `f(tx)`.
pub fn select<T>(
    tx: &mut Transaction,
    fs: &[&dyn Fn(&mut Transaction) -> StmClosureResult<T>],
) -> StmClosureResult<T> {
    let mut fs = fs.iter();
    let Some(first) = fs.next() else {
        return Err(StmError::Retry);
    };

    // Snapshot the state every alternative starts from, before `first`
    // appends anything to it.
    let baseline = tx.snapshot();
    let mut result = first(tx);

    for f in fs {
        let Err(StmError::Retry) = result else {
            break;
        };

        // Pull out the retried attempt's log and reset tx to the pristine
        // baseline so the next alternative runs unaffected by it.
        let attempt = std::mem::replace(tx, baseline.snapshot());
        result = f(tx);

        if let Err(StmError::Failure) = result {
            return Err(StmError::Failure);
        }

        // Merge the discarded attempt's reads (not its writes) so that a
        // retry at this level still blocks on everything that was tried.
        tx.combine(attempt);
    }

    result
}

/// Run every procedure in `fs` against the same transaction, in order,
/// threading failures through immediately.
///
/// Unlike `select`, `compose` does not treat `retry()` from one element as a
/// signal to try the next: every element must succeed (or the whole
/// transaction retries/fails) for `compose` to return `Ok`. This is the
/// "run all of these atomically, as one transaction" combinator, useful for
/// batches such as writing every element of an array in one commit.
pub fn compose<T>(
    tx: &mut Transaction,
    fs: &[&dyn Fn(&mut Transaction) -> StmClosureResult<T>],
) -> StmClosureResult<Vec<T>> {
    fs.iter().map(|f| f(tx)).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{atomically, retry, TVar};

    #[test]
    fn select_of_nothing_always_retries() {
        let terminated = crate::test_support::terminates(100, || {
            let _: i32 = atomically(|tx| select(tx, &[]));
        });
        assert!(!terminated);
    }

    #[test]
    fn select_single_equals_running_it_directly() {
        let var = TVar::new(42);
        let x = atomically(|tx| select(tx, &[&|tx: &mut Transaction| var.read(tx)]));
        assert_eq!(x, 42);
    }

    #[test]
    fn select_picks_first_non_retrying_alternative() {
        let var = TVar::new(7);

        let x = atomically(|tx| {
            select(
                tx,
                &[
                    &|_: &mut Transaction| retry(),
                    &|tx: &mut Transaction| var.read(tx),
                    &|_: &mut Transaction| Ok(999),
                ],
            )
        });

        assert_eq!(x, 7);
    }

    #[test]
    fn select_permutation_reaches_same_result() {
        let var = TVar::new(7);

        let a = atomically(|tx| {
            select(
                tx,
                &[
                    &|tx: &mut Transaction| var.read(tx),
                    &|_: &mut Transaction| retry(),
                ],
            )
        });
        let b = atomically(|tx| {
            select(
                tx,
                &[
                    &|_: &mut Transaction| retry(),
                    &|tx: &mut Transaction| var.read(tx),
                ],
            )
        });

        assert_eq!(a, b);
    }

    #[test]
    fn select_does_not_commit_the_losing_branch() {
        let var = TVar::new(42);

        let x = atomically(|tx| {
            select(
                tx,
                &[
                    &|tx: &mut Transaction| {
                        var.write(tx, 23)?;
                        retry()
                    },
                    &|tx: &mut Transaction| var.read(tx),
                ],
            )
        });

        assert_eq!(x, 42);
        assert_eq!(var.read_atomic(), 42);
    }

    #[test]
    fn compose_runs_every_procedure_in_one_transaction() {
        let vars: Vec<TVar<i32>> = (0..100).map(TVar::new).collect();

        let fns: Vec<Box<dyn Fn(&mut Transaction) -> StmClosureResult<i32>>> = vars
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, var)| -> Box<dyn Fn(&mut Transaction) -> StmClosureResult<i32>> {
                Box::new(move |tx: &mut Transaction| {
                    var.write(tx, i as i32)?;
                    Ok(i as i32)
                })
            })
            .collect();
        let refs: Vec<&dyn Fn(&mut Transaction) -> StmClosureResult<i32>> =
            fns.iter().map(std::convert::AsRef::as_ref).collect();

        let results = atomically(|tx| compose(tx, &refs));

        assert_eq!(results, (0..100).collect::<Vec<_>>());
        for (i, var) in vars.iter().enumerate() {
            assert_eq!(var.read_atomic(), i as i32);
        }
    }
}
