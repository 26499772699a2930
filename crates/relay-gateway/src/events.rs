/// Event bus: a tokio broadcast channel carrying one component's events.
///
/// Components publish here; callers subscribe and receive every event
/// published after they subscribed, in publish order.

use tokio::sync::broadcast;

pub(crate) const BUS_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct EventBus<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to receive future events.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    /// Silently drops the event if there are no subscribers.
    pub fn send(&self, event: T) {
        let _ = self.sender.send(event);
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
