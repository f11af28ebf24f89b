//! Executor context: the per-partition ambient state a DML operation reads.
//! Holds the transaction identifiers the executor set up, the DR stream
//! singletons, the undo log, and the active-active flag.

use std::sync::Arc;

use parking_lot::Mutex;

use merlin_common::types::{ClusterId, DrTimestamp, SpHandle, TxnId, UniqueId};
use merlin_dr::DrTupleStream;

use crate::undo::UndoLog;

pub struct ExecContext {
    pub current_txn_id: TxnId,
    pub current_sp_handle: SpHandle,
    pub last_committed_sp_handle: SpHandle,
    pub current_unique_id: UniqueId,
    pub cluster_id: ClusterId,
    /// Active-active DR streams full row images for conflict detection
    /// instead of compact index keys.
    pub active_active_dr: bool,
    pub dr_stream: Arc<Mutex<DrTupleStream>>,
    /// The distinct stream replicated tables write to, when configured.
    pub dr_replicated_stream: Option<Arc<Mutex<DrTupleStream>>>,
    pub undo: UndoLog,
}

impl ExecContext {
    pub fn new(
        cluster_id: ClusterId,
        dr_stream: Arc<Mutex<DrTupleStream>>,
        dr_replicated_stream: Option<Arc<Mutex<DrTupleStream>>>,
    ) -> ExecContext {
        ExecContext {
            current_txn_id: TxnId(0),
            current_sp_handle: SpHandle(0),
            last_committed_sp_handle: SpHandle(0),
            current_unique_id: UniqueId(0),
            cluster_id,
            active_active_dr: false,
            dr_stream,
            dr_replicated_stream,
            undo: UndoLog::new(),
        }
    }

    /// Install the identifiers of the transaction about to execute and open
    /// its undo quantum.
    pub fn setup_for_txn(
        &mut self,
        txn_id: TxnId,
        sp_handle: SpHandle,
        last_committed_sp: SpHandle,
        unique_id: UniqueId,
        undo_token: i64,
    ) {
        self.current_txn_id = txn_id;
        self.current_sp_handle = sp_handle;
        self.last_committed_sp_handle = last_committed_sp;
        self.current_unique_id = unique_id;
        self.undo.generate_quantum(undo_token);
    }

    /// The hidden-column timestamp stamped on rows written by this txn.
    pub fn current_dr_timestamp(&self) -> DrTimestamp {
        DrTimestamp::new(self.cluster_id, self.current_unique_id)
    }

    /// The stream a table writes to: replicated tables use the replicated
    /// stream, partitioned tables the partition stream.
    pub fn stream_for(&self, replicated_table: bool) -> Option<Arc<Mutex<DrTupleStream>>> {
        if replicated_table {
            self.dr_replicated_stream.clone()
        } else {
            Some(self.dr_stream.clone())
        }
    }
}

/// Scoped disable of both DR streams. The sink holds one while applying a
/// remote log so local writes do not loop back; prior enablement is restored
/// on every exit path.
pub struct DrStreamDisableGuard {
    stream: Arc<Mutex<DrTupleStream>>,
    replicated: Option<Arc<Mutex<DrTupleStream>>>,
    stream_was_enabled: bool,
    replicated_was_enabled: bool,
}

impl DrStreamDisableGuard {
    pub fn new(ctx: &ExecContext) -> DrStreamDisableGuard {
        let stream = ctx.dr_stream.clone();
        let replicated = ctx.dr_replicated_stream.clone();
        let stream_was_enabled = {
            let mut s = stream.lock();
            let was = s.enabled;
            s.enabled = false;
            was
        };
        let replicated_was_enabled = match &replicated {
            Some(r) => {
                let mut r = r.lock();
                let was = r.enabled;
                r.enabled = false;
                was
            }
            None => false,
        };
        DrStreamDisableGuard {
            stream,
            replicated,
            stream_was_enabled,
            replicated_was_enabled,
        }
    }
}

impl Drop for DrStreamDisableGuard {
    fn drop(&mut self) {
        self.stream.lock().enabled = self.stream_was_enabled;
        if let Some(r) = &self.replicated {
            r.lock().enabled = self.replicated_was_enabled;
        }
    }
}
