//! Store selection strategies.

use std::sync::Arc;

use relay_core::WorkQueue;

/// How the coordinator walks the store list.
///
/// Selection is a pure function of `(stores, last_store, last_count)` so
/// tests can pin the tick order; the `(last_store, last_count)` pair itself
/// is owned by the coordinator. A store list change implicitly resets both
/// strategies: a vanished `last_store` no longer resolves and selection
/// starts from the front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Advance to the next store every tick, regardless of outcome.
    RoundRobin,
    /// Keep polling the same store while it yields work; move on once it
    /// returns an empty batch.
    DrainFirst,
}

impl SelectionStrategy {
    pub(crate) fn select(
        &self,
        stores: &[Arc<dyn WorkQueue>],
        last: Option<(&str, usize)>,
    ) -> usize {
        debug_assert!(!stores.is_empty());
        let last_index = last.and_then(|(id, _)| {
            stores.iter().position(|store| store.identifier() == id)
        });
        match (self, last_index, last) {
            (Self::DrainFirst, Some(index), Some((_, count))) if count > 0 => index,
            (_, Some(index), _) => (index + 1) % stores.len(),
            (_, None, _) => 0,
        }
    }
}
