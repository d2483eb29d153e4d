//! Routing-key → store dispatch for producers.

use std::collections::HashMap;

use relay_core::{Error, Result};

/// Maps routing keys (tenant ids, database aliases) to store-bound handles.
///
/// Built once at startup from the host's store wiring; `T` is typically an
/// `Arc<dyn OutboxStore>`, an `Arc<dyn InboxStore>`, or a bundle of both.
#[derive(Default)]
pub struct StoreRouter<T> {
    routes: HashMap<String, T>,
}

impl<T: Clone> StoreRouter<T> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, target: T) -> &mut Self {
        self.routes.insert(key.into(), target);
        self
    }

    /// Resolve `key`. Unknown keys are an error, not a silent default;
    /// misrouted messages must never land in an arbitrary store.
    pub fn get(&self, key: &str) -> Result<T> {
        self.routes
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no store routed for key {key:?}")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T> FromIterator<(String, T)> for StoreRouter<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            routes: iter.into_iter().collect(),
        }
    }
}
