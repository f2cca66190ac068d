//! Event-driven communication system for inter-service messaging.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::config::Level;

/// Type of configuration change detected on disk.
#[derive(Debug, Clone)]
pub enum ConfigChangeType {
    /// Changes the control loop can pick up without restart
    HotReload,
    /// Changes that only take effect after a daemon restart
    ColdRestart {
        /// Top-level sections that changed
        changed_sections: Vec<String>,
    },
}

/// Application events for inter-service communication.
#[derive(Debug, Clone)]
pub enum Event {
    /// The config file changed or a reload was requested.
    ConfigChangeDetected(ConfigChangeType),
    /// `ConfigManager` now holds a freshly loaded configuration.
    ConfigReloaded,
    SystemShutdown,
    /// Sensor readings of the last completed tick.
    TemperatureChanged(HashMap<String, f64>),
    /// A group's effective mode changed.
    ModeChanged {
        group: String,
        from: Level,
        to: Level,
    },
}

/// Event bus for publish-subscribe messaging between services.
///
/// # Example
///
/// ```no_run
/// use fanctld::event::{Event, EventBus};
///
/// let event_bus = EventBus::new();
/// let mut subscriber = event_bus.subscribe();
///
/// event_bus.publish(Event::ConfigReloaded).ok();
/// // In async context: subscriber.recv().await
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new EventBus with default capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns an error if there are no active subscribers.
    pub fn publish(&self, event: Event) -> Result<()> {
        self.sender.send(event)?;
        Ok(())
    }

    /// Creates a new subscriber that receives events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
