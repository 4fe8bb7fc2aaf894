/*!
 * Event system for camremote.
 *
 * A typed publish/subscribe bus. Each event type gets its own broadcast
 * channel, created lazily on first publish or subscribe. Publishing never
 * blocks, which makes the bus safe to call from vendor callback threads.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event severity, used to pick the log level when an event is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Severity {
    /// Expected transitions
    #[default]
    Notice,
    /// Degraded but continuing
    Warning,
    /// Failures
    Error,
}

type EventSender<T> = broadcast::Sender<T>;
type EventReceiver<T> = broadcast::Receiver<T>;

/// Event bus for publishing and subscribing to events
#[derive(Debug)]
pub struct EventBus {
    channels: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            channel_capacity: capacity,
        }
    }

    fn sender<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventSender<T>> {
        let type_id = TypeId::of::<T>();
        let existing = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .map(|sender| sender.downcast_ref::<EventSender<T>>().cloned());
        if let Some(sender) = existing {
            return sender.ok_or_else(|| Error::event("Failed to downcast sender"));
        }

        // another thread may have created the channel in between
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(type_id)
            .or_insert_with(|| Box::new(broadcast::channel::<T>(self.channel_capacity).0))
            .downcast_ref::<EventSender<T>>()
            .cloned()
            .ok_or_else(|| Error::event("Failed to downcast sender"))
    }

    /// Publish an event, returning the number of receivers it reached
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        let sender = self.sender::<T>()?;

        if sender.receiver_count() == 0 {
            debug!("No receivers for event {:?}", event);
            return Ok(0);
        }

        match sender.send(event) {
            Ok(n) => {
                trace!("Published event to {} receivers", n);
                Ok(n)
            }
            Err(e) => {
                warn!("Failed to publish event: {}", e);
                Err(Error::event(format!("Failed to publish event: {}", e)))
            }
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        Ok(self.sender::<T>()?.subscribe())
    }

    /// Number of live receivers for an event type
    pub fn receiver_count<T: Clone + Debug + Send + Sync + 'static>(&self) -> usize {
        self.sender::<T>().map(|s| s.receiver_count()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event
    pub fn publish<T: Clone + Debug + Send + Sync + 'static>(&self, event: T) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<T: Clone + Debug + Send + Sync + 'static>(&self) -> Result<EventReceiver<T>> {
        self.0.subscribe()
    }

    /// Number of live receivers for an event type
    pub fn receiver_count<T: Clone + Debug + Send + Sync + 'static>(&self) -> usize {
        self.0.receiver_count::<T>()
    }
}

impl Default for SharedEventBus {
    fn default() -> Self {
        Self::new()
    }
}
