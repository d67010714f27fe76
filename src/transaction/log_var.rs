use std::any::Any;
use std::sync::Arc;

pub type ArcAny = Arc<dyn Any + Send + Sync>;

/// Compares two type-erased snapshots for conflict detection.
///
/// Monomorphized per `TVar<T>` at the call site that produces an
/// `Observed` (`Transaction::read`/`write`), since `LogVar` itself has
/// erased the concrete `T`.
pub type EqFn = fn(&ArcAny, &ArcAny) -> bool;

/// Snapshot a read attempt needs in order to validate later: the value as
/// observed, the `Var`'s version at the moment of the read, and the
/// equality function to fall back on if the version (or the `Arc` behind
/// it) has since changed.
#[derive(Clone)]
pub struct Observed {
    pub value: ArcAny,
    pub version: u64,
    pub eq: EqFn,
}

/// Pointer-identity fast path, structural fallback.
///
/// Two snapshots are "the same" for validation purposes if they are the
/// same `Arc` (the overwhelmingly common case: nothing wrote the `Var`, or
/// the one write that happened produced a byte-identical value) or,
/// failing that, if the downcast values compare equal. The fallback is
/// what catches a payload that mutated in place behind a reference the
/// pointer check alone would consider unchanged.
pub fn observe_eq<T: PartialEq + 'static>(a: &ArcAny, b: &ArcAny) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// `LogVar` is used by `Transaction` to track whether a `Var` was read,
/// written, or both during the current attempt.
#[derive(Clone)]
pub enum LogVar {
    /// Var has been read.
    Read(Observed),

    /// Var has been written and no dependency on the original exists.
    ///
    /// There is no need to check for consistency.
    Write(ArcAny),

    /// Var has been read first and then written.
    ///
    /// It needs to be checked for consistency against the read `Observed`.
    ReadWrite(Observed, ArcAny),

    /// Var has been read on a blocked (retried-and-discarded) path.
    ///
    /// Don't check for consistency, but block on the `Var` so the thread
    /// wakes up when it changes.
    ReadObsolete(Observed),

    /// Var has been read on a blocked path and then written to.
    ///
    /// Don't check for consistency, but block on the `Var` so the thread
    /// wakes up when it changes.
    ReadObsoleteWrite(Observed, ArcAny),
    // Here would be WriteObsolete, but write-onlies can be discarded
    // immediately and don't need a representation in the log.
}

impl LogVar {
    /// Read a value and potentially upgrade the state.
    pub fn read(&mut self) -> ArcAny {
        let this;
        let val;
        match &*self {
            Self::Read(observed) | Self::ReadWrite(observed, _) => {
                return observed.value.clone();
            }
            Self::Write(v) => {
                return v.clone();
            }

            Self::ReadObsoleteWrite(observed, v) => {
                val = v.clone();
                this = Self::ReadWrite(observed.clone(), v.clone());
            }

            // Upgrade to a real Read
            Self::ReadObsolete(observed) => {
                val = observed.value.clone();
                this = Self::Read(observed.clone());
            }
        };
        *self = this;
        val
    }

    /// Write a value and potentially upgrade the state.
    pub fn write(&mut self, w: ArcAny) {
        let this = self.clone();

        *self = match this {
            Self::Write(_) => Self::Write(w),

            // Register write
            Self::ReadObsolete(r) | Self::ReadObsoleteWrite(r, _) => Self::ReadObsoleteWrite(r, w),

            // Register write
            Self::Read(r) | Self::ReadWrite(r, _) => Self::ReadWrite(r, w),
        };
    }

    /// Turn `self` into an obsolete version, dropping any pending write.
    pub fn obsolete(self) -> Option<LogVar> {
        self.into_observed().map(LogVar::ReadObsolete)
    }

    /// Ignore all Write... and get the original `Observed` of a Var, if any.
    pub fn into_observed(self) -> Option<Observed> {
        match self {
            LogVar::Read(o)
            | LogVar::ReadWrite(o, _)
            | LogVar::ReadObsolete(o)
            | LogVar::ReadObsoleteWrite(o, _) => Some(o),
            LogVar::Write(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn observed(value: i32, version: u64) -> Observed {
        Observed {
            value: Arc::new(value),
            version,
            eq: observe_eq::<i32>,
        }
    }

    #[test]
    fn test_write_obsolete_ignore() {
        let t = LogVar::Write(Arc::new(42)).obsolete();
        assert!(t.is_none());
    }

    #[test]
    fn read_obsolete_upgrades_to_read() {
        let mut log = LogVar::ReadObsolete(observed(1, 0));
        let v = log.read();
        assert_eq!(*v.downcast_ref::<i32>().unwrap(), 1);
        assert!(matches!(log, LogVar::Read(_)));
    }

    #[test]
    fn write_after_read_becomes_readwrite() {
        let mut log = LogVar::Read(observed(1, 0));
        log.write(Arc::new(2));
        match &log {
            LogVar::ReadWrite(o, w) => {
                assert_eq!(*o.value.downcast_ref::<i32>().unwrap(), 1);
                assert_eq!(*w.downcast_ref::<i32>().unwrap(), 2);
            }
            _ => panic!("expected ReadWrite"),
        }
    }

    #[test]
    fn observe_eq_catches_equal_values_behind_distinct_pointers() {
        // Distinct Arcs holding equal values are still "equal" under the
        // structural fallback, as required when the pointer check alone
        // would miss that nothing meaningfully changed.
        let a: ArcAny = Arc::new(3);
        let b: ArcAny = Arc::new(3);
        assert!(observe_eq::<i32>(&a, &b));

        let c: ArcAny = Arc::new(7);
        assert!(!observe_eq::<i32>(&a, &c));
    }
}
