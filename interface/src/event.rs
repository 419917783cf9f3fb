//! Typed observer fan-out
//!
//! Components publish their state changes as typed events; any number of
//! subscribers receive every event through an unbounded [flume] channel.
//! A lagging or dropped subscriber never blocks the publisher.

use std::sync::Mutex;

/// Typed event publisher
///
/// Cloning shares the subscriber list.
#[derive(Debug, Default)]
pub struct Notifier<E> {
    subscribers: Mutex<Vec<flume::Sender<E>>>,
}

impl<E: Clone> Notifier<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
    /// Registers a new subscriber, returning its receiving end
    pub fn subscribe(&self) -> flume::Receiver<E> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
    /// Publishes an event to every live subscriber
    ///
    /// Subscribers whose receiver has been dropped are pruned.
    pub fn notify(&self, event: E) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out() {
        let notifier = Notifier::new();
        let rx1 = notifier.subscribe();
        let rx2 = notifier.subscribe();
        notifier.notify(1u32);
        assert_eq!(rx1.recv().unwrap(), 1);
        assert_eq!(rx2.recv().unwrap(), 1);
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        drop(notifier.subscribe());
        notifier.notify(1u32);
        assert_eq!(notifier.len(), 1);
        assert_eq!(rx.recv().unwrap(), 1);
    }
}
