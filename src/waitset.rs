//! Per-`Var` list of sleepers.
//!
//! A retrying attempt allocates one [`ControlBlock`](crate::transaction::control_block::ControlBlock)
//! and registers it, weakly, into the `Waitset` of every `Var` it read. The
//! first write to any of those `Var`s fires the control block; a fired
//! handle may be fired again (it is idempotent), and dead handles are
//! pruned lazily the next time a writer visits the `Var`.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::transaction::control_block::ControlBlock;

#[derive(Default)]
pub struct Waitset {
    sleepers: Mutex<Vec<Weak<ControlBlock>>>,
}

impl Waitset {
    pub const fn new() -> Waitset {
        Waitset {
            sleepers: Mutex::new(Vec::new()),
        }
    }

    /// Register a control block as waiting on this `Var`.
    pub fn register(&self, ctrl: &Arc<ControlBlock>) {
        self.sleepers.lock().push(Arc::downgrade(ctrl));
    }

    /// Wake every sleeper currently registered and drop the list.
    ///
    /// Called on every successful write to the `Var`, including
    /// `TVar::write_atomic`'s unconditional write.
    pub fn wake_all(&self) {
        let sleepers = std::mem::take(&mut *self.sleepers.lock());
        for sleeper in sleepers {
            if let Some(ctrl) = sleeper.upgrade() {
                ctrl.set_changed();
            }
        }
    }

    /// Drop sleepers whose owning attempt has already woken and moved on.
    ///
    /// Cheap opportunistic cleanup; never required for correctness since
    /// `wake_all` tolerates dead weak references.
    pub fn prune(&self) {
        self.sleepers.lock().retain(|w| w.upgrade().is_some());
    }
}
