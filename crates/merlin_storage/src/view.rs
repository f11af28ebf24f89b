//! Materialized views are opaque observers of their source table. The table
//! owns its view handles and notifies them of row arrivals and departures;
//! the view computation itself lives outside this crate.

use std::sync::Arc;

use parking_lot::Mutex;

use merlin_common::datum::OwnedRow;

/// Callback surface a materialized view presents to its source table.
/// Notifications carry the visible row image.
pub trait MaterializedViewTrigger: Send {
    fn on_tuple_insert(&mut self, row: &OwnedRow);
    fn on_tuple_delete(&mut self, row: &OwnedRow);
    /// The source table was truncated and this view now observes the fresh
    /// empty table.
    fn on_source_truncated(&mut self) {}
}

pub type ViewHandle = Arc<Mutex<dyn MaterializedViewTrigger>>;
