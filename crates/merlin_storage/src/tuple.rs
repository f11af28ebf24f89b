//! Tuple storage representation: a header flag byte plus the datum vector,
//! hidden columns appended after the visible columns.

use merlin_common::datum::{Datum, OwnedRow};

pub const FLAG_ACTIVE: u8 = 0x01;
pub const FLAG_DIRTY: u8 = 0x02;
pub const FLAG_PENDING_DELETE: u8 = 0x04;
pub const FLAG_PENDING_DELETE_ON_UNDO_RELEASE: u8 = 0x08;

/// One stored tuple. A non-active tuple occupies a freelist slot and holds
/// no values, so its out-of-line allocations are released.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    flags: u8,
    values: Vec<Datum>,
}

impl Tuple {
    pub fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0
    }

    pub fn set_active(&mut self, active: bool) {
        if active {
            self.flags |= FLAG_ACTIVE;
        } else {
            self.flags &= !FLAG_ACTIVE;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        if dirty {
            self.flags |= FLAG_DIRTY;
        } else {
            self.flags &= !FLAG_DIRTY;
        }
    }

    pub fn is_pending_delete(&self) -> bool {
        self.flags & FLAG_PENDING_DELETE != 0
    }

    pub fn set_pending_delete(&mut self, pending: bool) {
        if pending {
            self.flags |= FLAG_PENDING_DELETE;
        } else {
            self.flags &= !FLAG_PENDING_DELETE;
        }
    }

    pub fn is_pending_delete_on_undo_release(&self) -> bool {
        self.flags & FLAG_PENDING_DELETE_ON_UNDO_RELEASE != 0
    }

    pub fn set_pending_delete_on_undo_release(&mut self, pending: bool) {
        if pending {
            self.flags |= FLAG_PENDING_DELETE_ON_UNDO_RELEASE;
        } else {
            self.flags &= !FLAG_PENDING_DELETE_ON_UNDO_RELEASE;
        }
    }

    /// Visible to scans: active and not hidden by either pending-delete flag.
    pub fn is_visible(&self) -> bool {
        self.is_active() && !self.is_pending_delete() && !self.is_pending_delete_on_undo_release()
    }

    /// Install a full storage image (visible + hidden columns).
    pub fn set_values(&mut self, values: Vec<Datum>) {
        self.values = values;
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> &Datum {
        &self.values[idx]
    }

    pub fn set_value(&mut self, idx: usize, value: Datum) {
        self.values[idx] = value;
    }

    /// The full storage image as a row, hidden columns included.
    pub fn image(&self) -> OwnedRow {
        OwnedRow::new(self.values.clone())
    }

    /// The visible columns only.
    pub fn visible_row(&self, column_count: usize) -> OwnedRow {
        OwnedRow::new(self.values[..column_count.min(self.values.len())].to_vec())
    }

    /// Free the slot contents. Both pending flags must have been cleared
    /// before the slot is returned to the freelist.
    pub fn clear(&mut self) {
        debug_assert!(!self.is_pending_delete());
        debug_assert!(!self.is_pending_delete_on_undo_release());
        self.flags = 0;
        self.values = Vec::new();
    }

    /// Equality over the first `column_count` columns, ignoring hidden ones.
    pub fn equals_by_values(&self, other: &OwnedRow, column_count: usize) -> bool {
        self.values.len() >= column_count
            && other.values.len() >= column_count
            && self.values[..column_count] == other.values[..column_count]
    }

    /// Full-image equality, hidden columns included.
    pub fn equals_including_hidden(&self, other: &OwnedRow) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let mut t = Tuple::default();
        t.set_active(true);
        t.set_pending_delete(true);
        t.set_pending_delete_on_undo_release(true);
        assert!(t.is_active());
        assert!(t.is_pending_delete());
        assert!(t.is_pending_delete_on_undo_release());
        assert!(!t.is_visible());
        t.set_pending_delete(false);
        assert!(t.is_pending_delete_on_undo_release());
        t.set_pending_delete_on_undo_release(false);
        assert!(t.is_visible());
    }

    #[test]
    fn test_clear_releases_values() {
        let mut t = Tuple::default();
        t.set_active(true);
        t.set_values(vec![Datum::VarChar("out of line".into())]);
        t.clear();
        assert!(!t.is_active());
        assert!(t.values().is_empty());
    }

    #[test]
    fn test_equality_modes() {
        let mut t = Tuple::default();
        t.set_values(vec![Datum::TinyInt(1), Datum::BigInt(2), Datum::BigInt(99)]);
        let visible = OwnedRow::new(vec![Datum::TinyInt(1), Datum::BigInt(2)]);
        let full_match = OwnedRow::new(vec![Datum::TinyInt(1), Datum::BigInt(2), Datum::BigInt(99)]);
        let full_miss = OwnedRow::new(vec![Datum::TinyInt(1), Datum::BigInt(2), Datum::BigInt(98)]);
        assert!(t.equals_by_values(&visible, 2));
        assert!(t.equals_by_values(&full_miss, 2));
        assert!(t.equals_including_hidden(&full_match));
        assert!(!t.equals_including_hidden(&full_miss));
    }
}
