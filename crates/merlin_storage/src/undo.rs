//! Per-transaction undo log. Actions accumulate in a quantum in registration
//! order; abort runs them in reverse and rolls the DR stream back to each
//! action's mark, release finalizes deferred work.

use merlin_common::datum::OwnedRow;

use crate::block::TupleAddress;
use crate::table::PersistentTable;

/// Where an operation left the DR stream, so undo can truncate back to it.
#[derive(Debug, Clone, Copy)]
pub struct DrMark {
    pub mark: u64,
    pub row_cost: i64,
    /// Which of the two per-partition streams the operation advanced.
    pub replicated: bool,
}

/// A reversible storage action. Row images are pooled copies taken at
/// registration time; addresses refer to pinned in-table slots.
pub enum UndoAction {
    Insert {
        table_handle: i64,
        image: OwnedRow,
        dr_mark: Option<DrMark>,
    },
    Delete {
        table_handle: i64,
        addr: TupleAddress,
        dr_mark: Option<DrMark>,
    },
    Update {
        table_handle: i64,
        before: OwnedRow,
        after: OwnedRow,
        indexes_updated: bool,
        dr_mark: Option<DrMark>,
    },
    Truncate {
        table_handle: i64,
        /// The pre-truncate table, pinned until undo restores it or release
        /// drops it.
        old_table: Box<PersistentTable>,
        dr_mark: Option<DrMark>,
    },
}

impl UndoAction {
    pub fn dr_mark(&self) -> Option<DrMark> {
        match self {
            UndoAction::Insert { dr_mark, .. }
            | UndoAction::Delete { dr_mark, .. }
            | UndoAction::Update { dr_mark, .. }
            | UndoAction::Truncate { dr_mark, .. } => *dr_mark,
        }
    }
}

/// A bounded scope of undo actions, released on commit or run in reverse on
/// abort.
pub struct UndoQuantum {
    pub token: i64,
    pub actions: Vec<UndoAction>,
}

/// Token-ordered quanta of the current partition.
#[derive(Default)]
pub struct UndoLog {
    quanta: Vec<UndoQuantum>,
}

impl UndoLog {
    pub fn new() -> UndoLog {
        UndoLog::default()
    }

    /// Open a quantum for `token`. Tokens must be handed out in increasing
    /// order.
    pub fn generate_quantum(&mut self, token: i64) {
        if let Some(last) = self.quanta.last() {
            assert!(last.token < token, "undo tokens must increase");
        }
        self.quanta.push(UndoQuantum {
            token,
            actions: Vec::new(),
        });
    }

    pub fn has_active_quantum(&self) -> bool {
        !self.quanta.is_empty()
    }

    /// Register an action with the current quantum. Callers check
    /// `has_active_quantum` first; registering without one is a logic error.
    pub fn register(&mut self, action: UndoAction) {
        self.quanta
            .last_mut()
            .expect("no active undo quantum")
            .actions.push(action);
    }

    /// Detach every action with token ≥ `token`, newest quantum first and in
    /// reverse registration order within each, for the abort path.
    pub fn take_for_undo(&mut self, token: i64) -> Vec<UndoAction> {
        let mut undone = Vec::new();
        while let Some(last) = self.quanta.last() {
            if last.token < token {
                break;
            }
            let quantum = self.quanta.pop().expect("checked non-empty");
            undone.extend(quantum.actions.into_iter().rev());
        }
        undone
    }

    /// Detach every action with token ≤ `token` in commit order, for the
    /// release path.
    pub fn take_for_release(&mut self, token: i64) -> Vec<UndoAction> {
        let split = self.quanta.partition_point(|q| q.token <= token);
        let released: Vec<UndoQuantum> = self.quanta.drain(..split).collect();
        released.into_iter().flat_map(|q| q.actions).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_action(handle: i64) -> UndoAction {
        UndoAction::Insert {
            table_handle: handle,
            image: OwnedRow::new(vec![]),
            dr_mark: None,
        }
    }

    fn handle_of(action: &UndoAction) -> i64 {
        match action {
            UndoAction::Insert { table_handle, .. }
            | UndoAction::Delete { table_handle, .. }
            | UndoAction::Update { table_handle, .. }
            | UndoAction::Truncate { table_handle, .. } => *table_handle,
        }
    }

    #[test]
    fn test_undo_runs_in_reverse() {
        let mut log = UndoLog::new();
        log.generate_quantum(1);
        log.register(insert_action(1));
        log.register(insert_action(2));
        log.generate_quantum(2);
        log.register(insert_action(3));

        let undone = log.take_for_undo(1);
        let handles: Vec<_> = undone.iter().map(handle_of).collect();
        assert_eq!(handles, vec![3, 2, 1]);
        assert!(!log.has_active_quantum());
    }

    #[test]
    fn test_release_keeps_newer_quanta() {
        let mut log = UndoLog::new();
        log.generate_quantum(1);
        log.register(insert_action(1));
        log.generate_quantum(2);
        log.register(insert_action(2));

        let released = log.take_for_release(1);
        assert_eq!(released.iter().map(handle_of).collect::<Vec<_>>(), vec![1]);
        assert!(log.has_active_quantum());

        let undone = log.take_for_undo(2);
        assert_eq!(undone.iter().map(handle_of).collect::<Vec<_>>(), vec![2]);
    }
}
