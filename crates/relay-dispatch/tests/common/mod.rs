#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use relay_core::{Delivery, Handler, HandlerError};
use relay_dispatch::{HandlerRegistry, HandlerRegistryBuilder};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub fn registry(handlers: Vec<Arc<dyn Handler>>) -> Arc<HandlerRegistry> {
    let mut builder = HandlerRegistryBuilder::default();
    for handler in handlers {
        builder = builder.register(handler).expect("register handler");
    }
    Arc::new(builder.build())
}

enum Behavior {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
    /// Permanent failure for one specific payload, success otherwise.
    FailOnPayload(&'static str, &'static str),
}

/// Test handler with a fixed outcome and an invocation counter.
pub struct ScriptedHandler {
    topic: String,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn succeeding(topic: &str) -> Arc<Self> {
        Self::with_behavior(topic, Behavior::Succeed)
    }

    pub fn transient(topic: &str, error: &'static str) -> Arc<Self> {
        Self::with_behavior(topic, Behavior::Transient(error))
    }

    pub fn permanent(topic: &str, error: &'static str) -> Arc<Self> {
        Self::with_behavior(topic, Behavior::Permanent(error))
    }

    pub fn fail_on_payload(topic: &str, payload: &'static str, error: &'static str) -> Arc<Self> {
        Self::with_behavior(topic, Behavior::FailOnPayload(payload, error))
    }

    fn with_behavior(topic: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(
        &self,
        delivery: &Delivery,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Transient(error) => Err(HandlerError::transient(*error)),
            Behavior::Permanent(error) => Err(HandlerError::permanent(*error)),
            Behavior::FailOnPayload(payload, error) => {
                if delivery.payload == *payload {
                    Err(HandlerError::permanent(*error))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Blocks until the dispatch scope is cancelled, then reports a transient
/// error; succeeds only if nothing cancels it for ten seconds.
pub struct CooperativeHandler {
    topic: String,
    calls: AtomicUsize,
}

impl CooperativeHandler {
    pub fn new(topic: &str) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for CooperativeHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn handle(
        &self,
        _delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => Err(HandlerError::transient("dispatch scope cancelled")),
            _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
        }
    }
}
