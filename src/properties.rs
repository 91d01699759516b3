//! Retained-value property notification bus
//!
//! Every node owns one [`PropertyBus`]. Components call
//! [`PropertyBus::notify`] when a property changes; the bus keeps the last
//! value and fans it out to subscribers. A subscriber may ask for an
//! immediate replay of everything retained so far.
//!
//! Subscribers run synchronously under the bus lock, which is what makes
//! replay and live delivery seamless: no change can slip in between the
//! replay and the registration. Subscribers must therefore be cheap and
//! must not call back into the same bus; bridges forward into a channel.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::Result;
use crate::nodes::{Property, PropertyValue};

/// Subscriber callback
pub type Subscriber = Box<dyn Fn(Property, PropertyValue) -> Result<()> + Send + Sync>;

/// Handle for removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Inner {
    retained: HashMap<Property, PropertyValue>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

/// Per-node property bus with retained values
#[derive(Default)]
pub struct PropertyBus {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PropertyBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PropertyBus")
            .field("retained", &inner.retained)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl PropertyBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a property change and fan it out
    ///
    /// Setting a property to its current retained value is a no-op.
    /// Returns whether subscribers were notified.
    pub fn notify(&self, property: Property, value: impl Into<PropertyValue>) -> bool {
        let value = value.into();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.retained.get(&property) == Some(&value) {
            tracing::trace!(%property, ?value, "unchanged property, not notifying");
            return false;
        }
        inner.retained.insert(property, value);

        for (id, subscriber) in &inner.subscribers {
            if let Err(e) = subscriber(property, value) {
                tracing::warn!(
                    subscriber = id.0,
                    %property,
                    error = %e,
                    "property subscriber failed"
                );
            }
        }

        true
    }

    /// Register a subscriber
    ///
    /// With `replay`, the subscriber is called once per retained property
    /// before this returns.
    pub fn subscribe<F>(&self, subscriber: F, replay: bool) -> SubscriptionId
    where
        F: Fn(Property, PropertyValue) -> Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;

        if replay {
            for (&property, &value) in &inner.retained {
                if let Err(e) = subscriber(property, value) {
                    tracing::warn!(
                        subscriber = id.0,
                        %property,
                        error = %e,
                        "property subscriber failed during replay"
                    );
                }
            }
        }

        inner.subscribers.push((id, Box::new(subscriber)));
        tracing::debug!(subscriber = id.0, replay, "property subscriber registered");
        id
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    /// Last value of a property
    #[must_use]
    pub fn retained(&self, property: Property) -> Option<PropertyValue> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.retained.get(&property).copied()
    }

    /// Copy of all retained values
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Property, PropertyValue> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.retained.clone()
    }

    /// Number of registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.subscribers.len()
    }
}
