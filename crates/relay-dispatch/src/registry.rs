//! Handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::message::validate_topic;
use relay_core::{Error, Handler, Result};

/// Immutable `topic → handler` map, built once at startup.
///
/// Resolution is exact and case-sensitive. The map never changes after
/// [`build`](HandlerRegistryBuilder::build), so it can be shared freely
/// across dispatchers without locking.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, topic: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistryBuilder {
    /// Register a handler under its own topic. Duplicate topics are a
    /// startup error rather than a silent override.
    pub fn register(mut self, handler: Arc<dyn Handler>) -> Result<Self> {
        let topic = handler.topic().to_string();
        validate_topic(&topic)?;
        if self.handlers.contains_key(&topic) {
            return Err(Error::invalid(format!(
                "a handler for topic {topic:?} is already registered"
            )));
        }
        self.handlers.insert(topic, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
